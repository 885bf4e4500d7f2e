//! Storage for elections, ballots, the voter-ballot ledger and voter identities.
//!
//! Each concern is an async trait. The three writes that make up a vote
//! (ledger insert, ballot append, counter increment) are not available on the
//! stores directly: they can only be performed through a [`VoteTransaction`]
//! opened with [`VoteStore::begin`], so they always commit or roll back
//! together.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use log::{info, warn};
use thiserror::Error;

use crate::model::{
    db::{
        audit::AuditEntry,
        ballot::{NewBallot, RegionTally},
        election::{Candidate, Election, ElectionDetails, NewElection, Phase},
        voter::Voter,
    },
    mongodb::{is_transient_error, Id},
};

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared handle on whichever backend is configured.
pub type DynStore = Arc<dyn VoteStore>;

/// Shared handle on the audit log.
pub type DynAudit = Arc<dyn AuditSink>;

/// Named points at which the in-memory store can be told to fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    LedgerInsert,
    BallotAppend,
    CounterIncrement,
    Commit,
    /// The commit is applied, but its acknowledgement is lost.
    CommitOutcome,
}

impl Display for FailPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailPoint::Begin => "begin",
            FailPoint::LedgerInsert => "ledger insert",
            FailPoint::BallotAppend => "ballot append",
            FailPoint::CounterIncrement => "counter increment",
            FailPoint::Commit => "commit",
            FailPoint::CommitOutcome => "commit acknowledgement",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] mongodb::error::Error),
    #[error("Malformed record: {0}")]
    Decode(#[from] mongodb::bson::de::Error),
    #[error("Injected failure at {0}")]
    Injected(FailPoint),
    #[error("Injected permanent failure at {0}")]
    InjectedPermanent(FailPoint),
    /// The commit may or may not have been applied.
    #[error("Transaction commit outcome unknown: {0}")]
    CommitOutcomeUnknown(String),
    #[error("Transaction already committed or aborted")]
    TransactionFinished,
}

impl StoreError {
    /// Could retrying the whole operation succeed without writing twice?
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Db(e) => is_transient_error(e),
            Self::Injected(_) => true,
            Self::InjectedPermanent(_)
            | Self::CommitOutcomeUnknown(_)
            | Self::Decode(_)
            | Self::TransactionFinished => false,
        }
    }
}

/// Outcome of the ledger's atomic check-and-insert.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LedgerInsert {
    Inserted,
    AlreadyExists,
}

/// Outcome of a candidate counter increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterUpdate {
    /// Applied; carries every candidate of the election as of this write.
    Incremented(Vec<Candidate>),
    CandidateNotFound,
    /// The election is missing or no longer `ongoing`.
    ElectionNotActive,
}

/// Outcome of a phase transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseChange {
    Changed(Election),
    /// The election is already at or beyond the requested phase.
    Rejected(Phase),
    NotFound,
}

#[rocket::async_trait]
pub trait ElectionStore: Send + Sync {
    async fn election(&self, id: Id) -> StoreResult<Option<Election>>;

    async fn elections(&self) -> StoreResult<Vec<Election>>;

    async fn create_election(&self, election: NewElection) -> StoreResult<Election>;

    /// Move an election forwards to `phase`. Never moves backwards.
    async fn set_phase(&self, id: Id, phase: Phase) -> StoreResult<PhaseChange>;

    /// Replace an election's details, provided it is still in
    /// `expected_phase`. Returns `None` if it is missing or has moved on.
    async fn update_details(
        &self,
        id: Id,
        expected_phase: Phase,
        details: ElectionDetails,
    ) -> StoreResult<Option<Election>>;
}

/// Read access to anonymous ballots. Nothing here accepts a voter ID.
#[rocket::async_trait]
pub trait BallotStore: Send + Sync {
    async fn ballot_count(&self, election_id: Id) -> StoreResult<u64>;

    async fn region_tallies(&self, election_id: Id) -> StoreResult<Vec<RegionTally>>;
}

/// Read access to the voter-ballot ledger.
#[rocket::async_trait]
pub trait VoterLedger: Send + Sync {
    async fn has_voted(&self, voter_id: Id, election_id: Id) -> StoreResult<bool>;
}

/// The identity service's view of voters.
#[rocket::async_trait]
pub trait VoterDirectory: Send + Sync {
    async fn voter(&self, id: Id) -> StoreResult<Option<Voter>>;

    async fn voters(&self) -> StoreResult<Vec<Voter>>;

    async fn pending_voters(&self) -> StoreResult<Vec<Voter>>;

    /// Approve a voter. Returns false if no such voter exists.
    async fn approve_voter(&self, id: Id) -> StoreResult<bool>;
}

/// Compliance log sink.
#[rocket::async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> StoreResult<()>;
}

/// A backend able to run vote transactions.
#[rocket::async_trait]
pub trait VoteStore: ElectionStore + BallotStore + VoterLedger + VoterDirectory {
    /// Open a transaction. Dropping it without committing rolls it back.
    async fn begin(&self) -> StoreResult<Box<dyn VoteTransaction>>;
}

/// The atomic unit of a vote. Nothing written through a transaction is
/// visible to anyone else until [`commit`](VoteTransaction::commit) succeeds.
#[rocket::async_trait]
pub trait VoteTransaction: Send {
    /// Insert the `(voter, election)` ledger entry unless one already exists.
    async fn record_if_absent(&mut self, voter_id: Id, election_id: Id)
        -> StoreResult<LedgerInsert>;

    async fn append_ballot(&mut self, ballot: NewBallot) -> StoreResult<Id>;

    /// Increment one candidate's counter, provided the election is ongoing.
    async fn increment_candidate_count(
        &mut self,
        election_id: Id,
        candidate_id: Id,
    ) -> StoreResult<CounterUpdate>;

    async fn commit(&mut self) -> StoreResult<()>;

    async fn abort(&mut self) -> StoreResult<()>;
}

/// Record an audit entry, logging rather than propagating any failure.
pub async fn audit(sink: &dyn AuditSink, entry: AuditEntry) {
    info!(target: "audit", "{entry:?}");
    if let Err(e) = sink.record(entry).await {
        warn!("Failed to write audit entry: {e}");
    }
}
