use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::model::{
    db::{
        audit::{AuditAction, AuditEntry},
        ballot::NewBallot,
        election::Candidate,
    },
    mongodb::Id,
};
use crate::notifier::{NotifyError, ResultNotifier, ResultUpdate};
use crate::store::{
    audit, CounterUpdate, DynAudit, DynStore, ElectionStore, LedgerInsert, StoreError,
    VoteTransaction, VoterDirectory,
};

/// Why a vote was not recorded.
#[derive(Debug, Error)]
pub enum VoteError {
    #[error("Voter {0} is not approved to vote")]
    NotAuthorized(Id),
    #[error("Election {0} is not accepting votes")]
    ElectionNotActive(Id),
    #[error("Candidate {candidate_id} does not stand in election {election_id}")]
    CandidateNotFound { election_id: Id, candidate_id: Id },
    #[error("Already voted in election {0}")]
    AlreadyVoted(Id),
    #[error("Vote could not be recorded, please try again: {0}")]
    TransientStoreFailure(#[source] StoreError),
    /// The commit was sent but never acknowledged, so the vote may have landed.
    #[error("Vote outcome unknown: {0}")]
    CommitOutcomeUnknown(#[source] StoreError),
    #[error("Vote could not be recorded: {0}")]
    Store(#[source] StoreError),
}

impl From<StoreError> for VoteError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CommitOutcomeUnknown(_) => Self::CommitOutcomeUnknown(e),
            e if e.is_transient() => Self::TransientStoreFailure(e),
            e => Self::Store(e),
        }
    }
}

impl VoteError {
    /// A short code for the audit log and logs. Never names the candidate.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotAuthorized(_) => "NOT_AUTHORIZED",
            Self::ElectionNotActive(_) => "ELECTION_NOT_ACTIVE",
            Self::CandidateNotFound { .. } => "CANDIDATE_NOT_FOUND",
            Self::AlreadyVoted(_) => "ALREADY_VOTED",
            Self::TransientStoreFailure(_) => "TRANSIENT_STORE_FAILURE",
            Self::CommitOutcomeUnknown(_) => "COMMIT_OUTCOME_UNKNOWN",
            Self::Store(_) => "STORE_FAILURE",
        }
    }
}

/// Runs the vote-casting transaction.
///
/// A vote is three writes: the voter's ledger entry, an anonymous ballot and
/// the candidate's counter. They are made through one [`VoteTransaction`], so
/// either all three become visible or none do. Once committed, the new counts
/// are handed to the notifier and the outcome is audited; neither of those
/// can fail the vote.
pub struct VoteCoordinator {
    store: DynStore,
    audit: DynAudit,
    notifier: Arc<dyn ResultNotifier>,
    /// Total tries for the transaction body, including the first.
    attempts: u32,
}

impl VoteCoordinator {
    pub fn new(
        store: DynStore,
        audit: DynAudit,
        notifier: Arc<dyn ResultNotifier>,
        attempts: u32,
    ) -> Self {
        Self {
            store,
            audit,
            notifier,
            attempts: attempts.max(1),
        }
    }

    /// Cast `voter_id`'s vote for `candidate_id` in `election_id`.
    /// On success, returns the election's counts as of this vote.
    pub async fn cast_vote(
        &self,
        voter_id: Id,
        election_id: Id,
        candidate_id: Id,
    ) -> Result<ResultUpdate, VoteError> {
        match self.record_vote(voter_id, election_id, candidate_id).await {
            Ok(candidates) => {
                let update = ResultUpdate::new(election_id, &candidates);
                info!(
                    "Vote committed in election {election_id}, {} votes total",
                    update.total_votes
                );
                self.notify(update.clone());
                audit(
                    self.audit.as_ref(),
                    AuditEntry::by_voter(voter_id, AuditAction::VoteCast { election_id }),
                )
                .await;
                Ok(update)
            }
            Err(e) => {
                match e {
                    VoteError::TransientStoreFailure(ref cause)
                    | VoteError::CommitOutcomeUnknown(ref cause)
                    | VoteError::Store(ref cause) => {
                        error!("Vote by {voter_id} in election {election_id} failed: {cause}")
                    }
                    _ => warn!(
                        "Vote by {voter_id} in election {election_id} rejected: {}",
                        e.reason()
                    ),
                }
                let action = AuditAction::VoteRejected {
                    election_id,
                    reason: e.reason().to_string(),
                };
                audit(self.audit.as_ref(), AuditEntry::by_voter(voter_id, action)).await;
                Err(e)
            }
        }
    }

    /// Check preconditions, then run the transaction, retrying transient
    /// failures. Nothing is written if a precondition fails.
    async fn record_vote(
        &self,
        voter_id: Id,
        election_id: Id,
        candidate_id: Id,
    ) -> Result<Vec<Candidate>, VoteError> {
        let voter = match self.store.voter(voter_id).await {
            Ok(Some(voter)) if voter.approved => voter,
            Ok(_) => return Err(VoteError::NotAuthorized(voter_id)),
            Err(e) => return Err(e.into()),
        };
        let election = match self.store.election(election_id).await {
            Ok(Some(election)) if election.phase.accepts_votes() => election,
            Ok(_) => return Err(VoteError::ElectionNotActive(election_id)),
            Err(e) => return Err(e.into()),
        };
        if election.candidate(candidate_id).is_none() {
            return Err(VoteError::CandidateNotFound {
                election_id,
                candidate_id,
            });
        }

        let mut attempt = 1;
        loop {
            match self
                .attempt(voter_id, election_id, candidate_id, &voter.region)
                .await
            {
                // Only failures that rolled back cleanly are retried.
                Err(VoteError::TransientStoreFailure(e)) if attempt < self.attempts => {
                    warn!(
                        "Vote transaction attempt {attempt}/{} rolled back, retrying: {e}",
                        self.attempts
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// One try at the transaction. Any failure before commit aborts it.
    async fn attempt(
        &self,
        voter_id: Id,
        election_id: Id,
        candidate_id: Id,
        region: &str,
    ) -> Result<Vec<Candidate>, VoteError> {
        let mut tx = self.store.begin().await?;
        match Self::apply(tx.as_mut(), voter_id, election_id, candidate_id, region).await {
            Ok(candidates) => {
                tx.commit().await?;
                Ok(candidates)
            }
            Err(e) => {
                if let Err(abort) = tx.abort().await {
                    // Dropping the transaction still rolls it back.
                    warn!("Failed to abort vote transaction cleanly: {abort}");
                }
                Err(e)
            }
        }
    }

    /// The transaction body: ledger, then ballot, then counter.
    async fn apply(
        tx: &mut dyn VoteTransaction,
        voter_id: Id,
        election_id: Id,
        candidate_id: Id,
        region: &str,
    ) -> Result<Vec<Candidate>, VoteError> {
        let inserted = tx.record_if_absent(voter_id, election_id).await?;
        if inserted == LedgerInsert::AlreadyExists {
            return Err(VoteError::AlreadyVoted(election_id));
        }

        tx.append_ballot(NewBallot::new(election_id, candidate_id, region.to_string()))
            .await?;

        // The phase may have changed since the precondition check.
        let update = tx
            .increment_candidate_count(election_id, candidate_id)
            .await?;
        match update {
            CounterUpdate::Incremented(candidates) => Ok(candidates),
            CounterUpdate::CandidateNotFound => Err(VoteError::CandidateNotFound {
                election_id,
                candidate_id,
            }),
            CounterUpdate::ElectionNotActive => Err(VoteError::ElectionNotActive(election_id)),
        }
    }

    fn notify(&self, update: ResultUpdate) {
        match self.notifier.publish(update) {
            Ok(reached) => debug!("Result update delivered to {reached} observers"),
            Err(NotifyError::NoSubscribers) => trace!("No observers for result update"),
        }
    }
}
