use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as SyncMutex};

use rocket::tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{
    db::{
        audit::AuditEntry,
        ballot::{Ballot, NewBallot, RegionTally},
        election::{Election, ElectionDetails, NewElection, Phase},
        ledger::LedgerEntry,
        voter::{NewVoter, Voter},
    },
    mongodb::Id,
};

use super::{
    AuditSink, BallotStore, CounterUpdate, ElectionStore, FailPoint, LedgerInsert, PhaseChange,
    StoreError, StoreResult, VoteStore, VoteTransaction, VoterDirectory, VoterLedger,
};

#[derive(Debug, Default)]
struct MemoryState {
    elections: BTreeMap<Id, Election>,
    ballots: Vec<Ballot>,
    ledger: HashMap<(Id, Id), LedgerEntry>,
    voters: BTreeMap<Id, Voter>,
    audit: Vec<AuditEntry>,
}

/// Whether an injected failure is worth retrying.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
enum Fault {
    Transient,
    Permanent,
}

/// Remaining injected failures per fail point.
type Faults = Arc<SyncMutex<HashMap<(FailPoint, Fault), usize>>>;

/// A process-local store. All state sits behind one async mutex; a vote
/// transaction holds that mutex from `begin` until commit, abort or drop,
/// which makes it the single writer.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    faults: Faults,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a voter, as the identity service would.
    pub async fn insert_voter(&self, voter: NewVoter) -> Voter {
        let voter = Voter {
            id: Id::new(),
            voter,
        };
        self.state
            .lock()
            .await
            .voters
            .insert(voter.id, voter.clone());
        voter
    }

    /// Insert an election exactly as given, counters and phase included.
    pub async fn insert_election(&self, election: NewElection) -> Election {
        let election = Election {
            id: Id::new(),
            election,
        };
        self.state
            .lock()
            .await
            .elections
            .insert(election.id, election.clone());
        election
    }

    /// Make the next `times` operations reaching `point` fail with a
    /// transient error.
    pub fn inject_failure(&self, point: FailPoint, times: usize) {
        self.inject(point, Fault::Transient, times);
    }

    /// Make the next `times` operations reaching `point` fail with an error
    /// that retrying will not fix.
    pub fn inject_permanent_failure(&self, point: FailPoint, times: usize) {
        self.inject(point, Fault::Permanent, times);
    }

    fn inject(&self, point: FailPoint, fault: Fault, times: usize) {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        *faults.entry((point, fault)).or_default() += times;
    }

    /// Everything written to the audit log so far.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    /// Number of ledger entries for an election.
    pub async fn ledger_len(&self, election_id: Id) -> usize {
        self.state
            .lock()
            .await
            .ledger
            .keys()
            .filter(|(_, e)| *e == election_id)
            .count()
    }
}

fn trip(faults: &Faults, point: FailPoint) -> StoreResult<()> {
    let mut faults = faults.lock().unwrap_or_else(|e| e.into_inner());
    for fault in [Fault::Permanent, Fault::Transient] {
        if let Some(remaining) = faults.get_mut(&(point, fault)) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(match fault {
                    Fault::Transient => StoreError::Injected(point),
                    Fault::Permanent => StoreError::InjectedPermanent(point),
                });
            }
        }
    }
    Ok(())
}

#[rocket::async_trait]
impl ElectionStore for MemoryStore {
    async fn election(&self, id: Id) -> StoreResult<Option<Election>> {
        Ok(self.state.lock().await.elections.get(&id).cloned())
    }

    async fn elections(&self) -> StoreResult<Vec<Election>> {
        Ok(self.state.lock().await.elections.values().cloned().collect())
    }

    async fn create_election(&self, election: NewElection) -> StoreResult<Election> {
        Ok(self.insert_election(election).await)
    }

    async fn set_phase(&self, id: Id, phase: Phase) -> StoreResult<PhaseChange> {
        let mut state = self.state.lock().await;
        let Some(election) = state.elections.get_mut(&id) else {
            return Ok(PhaseChange::NotFound);
        };
        if election.phase >= phase {
            return Ok(PhaseChange::Rejected(election.phase));
        }
        election.phase = phase;
        Ok(PhaseChange::Changed(election.clone()))
    }

    async fn update_details(
        &self,
        id: Id,
        expected_phase: Phase,
        details: ElectionDetails,
    ) -> StoreResult<Option<Election>> {
        let mut state = self.state.lock().await;
        match state.elections.get_mut(&id) {
            Some(election) if election.phase == expected_phase => {
                election.set_details(details);
                Ok(Some(election.clone()))
            }
            _ => Ok(None),
        }
    }
}

#[rocket::async_trait]
impl BallotStore for MemoryStore {
    async fn ballot_count(&self, election_id: Id) -> StoreResult<u64> {
        let state = self.state.lock().await;
        let count = state
            .ballots
            .iter()
            .filter(|b| b.election_id == election_id)
            .count();
        Ok(count as u64)
    }

    async fn region_tallies(&self, election_id: Id) -> StoreResult<Vec<RegionTally>> {
        let state = self.state.lock().await;
        let mut tallies: BTreeMap<(String, Id), u64> = BTreeMap::new();
        for ballot in state.ballots.iter().filter(|b| b.election_id == election_id) {
            *tallies
                .entry((ballot.region.clone(), ballot.candidate_id))
                .or_default() += 1;
        }
        Ok(tallies
            .into_iter()
            .map(|((region, candidate_id), votes)| RegionTally {
                region,
                candidate_id,
                votes,
            })
            .collect())
    }
}

#[rocket::async_trait]
impl VoterLedger for MemoryStore {
    async fn has_voted(&self, voter_id: Id, election_id: Id) -> StoreResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .ledger
            .contains_key(&(voter_id, election_id)))
    }
}

#[rocket::async_trait]
impl VoterDirectory for MemoryStore {
    async fn voter(&self, id: Id) -> StoreResult<Option<Voter>> {
        Ok(self.state.lock().await.voters.get(&id).cloned())
    }

    async fn voters(&self) -> StoreResult<Vec<Voter>> {
        Ok(self.state.lock().await.voters.values().cloned().collect())
    }

    async fn pending_voters(&self) -> StoreResult<Vec<Voter>> {
        Ok(self
            .state
            .lock()
            .await
            .voters
            .values()
            .filter(|v| !v.approved)
            .cloned()
            .collect())
    }

    async fn approve_voter(&self, id: Id) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        match state.voters.get_mut(&id) {
            Some(voter) => {
                voter.approved = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[rocket::async_trait]
impl AuditSink for MemoryStore {
    async fn record(&self, entry: AuditEntry) -> StoreResult<()> {
        self.state.lock().await.audit.push(entry);
        Ok(())
    }
}

#[rocket::async_trait]
impl VoteStore for MemoryStore {
    async fn begin(&self) -> StoreResult<Box<dyn VoteTransaction>> {
        trip(&self.faults, FailPoint::Begin)?;
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryTransaction {
            state: Some(guard),
            faults: self.faults.clone(),
            ledger: Vec::new(),
            voted: HashSet::new(),
            ballots: Vec::new(),
            increments: Vec::new(),
        }))
    }
}

/// Writes staged against a locked [`MemoryState`], applied only on commit.
struct MemoryTransaction {
    state: Option<OwnedMutexGuard<MemoryState>>,
    faults: Faults,
    ledger: Vec<LedgerEntry>,
    voted: HashSet<(Id, Id)>,
    ballots: Vec<Ballot>,
    increments: Vec<(Id, Id)>,
}

impl MemoryTransaction {
    fn state(&self) -> StoreResult<&MemoryState> {
        self.state.as_deref().ok_or(StoreError::TransactionFinished)
    }

    fn discard(&mut self) {
        self.ledger.clear();
        self.voted.clear();
        self.ballots.clear();
        self.increments.clear();
        self.state = None;
    }
}

#[rocket::async_trait]
impl VoteTransaction for MemoryTransaction {
    async fn record_if_absent(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> StoreResult<LedgerInsert> {
        let key = (voter_id, election_id);
        if self.state()?.ledger.contains_key(&key) || self.voted.contains(&key) {
            return Ok(LedgerInsert::AlreadyExists);
        }
        trip(&self.faults, FailPoint::LedgerInsert)?;
        self.voted.insert(key);
        self.ledger.push(LedgerEntry::new(voter_id, election_id));
        Ok(LedgerInsert::Inserted)
    }

    async fn append_ballot(&mut self, ballot: NewBallot) -> StoreResult<Id> {
        self.state()?;
        trip(&self.faults, FailPoint::BallotAppend)?;
        let ballot = Ballot::new(ballot);
        let id = ballot.id;
        self.ballots.push(ballot);
        Ok(id)
    }

    async fn increment_candidate_count(
        &mut self,
        election_id: Id,
        candidate_id: Id,
    ) -> StoreResult<CounterUpdate> {
        let election = match self.state()?.elections.get(&election_id) {
            Some(election) if election.phase.accepts_votes() => election,
            _ => return Ok(CounterUpdate::ElectionNotActive),
        };
        if election.candidate(candidate_id).is_none() {
            return Ok(CounterUpdate::CandidateNotFound);
        }
        let mut candidates = election.candidates.clone();
        trip(&self.faults, FailPoint::CounterIncrement)?;
        self.increments.push((election_id, candidate_id));

        // Report counts as they will be once this transaction commits.
        for (e, c) in &self.increments {
            if *e != election_id {
                continue;
            }
            if let Some(candidate) = candidates.iter_mut().find(|x| x.id == *c) {
                candidate.count += 1;
            }
        }
        Ok(CounterUpdate::Incremented(candidates))
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.state()?;
        if let Err(e) = trip(&self.faults, FailPoint::Commit) {
            self.discard();
            return Err(e);
        }
        let mut state = self.state.take().ok_or(StoreError::TransactionFinished)?;
        for entry in self.ledger.drain(..) {
            state
                .ledger
                .insert((entry.voter_id, entry.election_id), entry);
        }
        state.ballots.append(&mut self.ballots);
        for (election_id, candidate_id) in self.increments.drain(..) {
            let candidate = state
                .elections
                .get_mut(&election_id)
                .and_then(|e| e.candidates.iter_mut().find(|c| c.id == candidate_id));
            if let Some(candidate) = candidate {
                candidate.count += 1;
            }
        }
        self.voted.clear();
        if let Err(e) = trip(&self.faults, FailPoint::CommitOutcome) {
            return Err(StoreError::CommitOutcomeUnknown(e.to_string()));
        }
        Ok(())
    }

    async fn abort(&mut self) -> StoreResult<()> {
        self.state()?;
        self.discard();
        Ok(())
    }
}
