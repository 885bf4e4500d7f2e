use log::warn;
use mongodb::{
    bson::{doc, from_document, DateTime as BsonDateTime, Document},
    options::{
        Acknowledgment, FindOneAndUpdateOptions, ReadConcern, ReturnDocument, TransactionOptions,
        WriteConcern,
    },
    Client, ClientSession, Database,
};
use rocket::futures::TryStreamExt;
use serde::Deserialize;

use crate::model::{
    db::{
        audit::AuditEntry,
        ballot::{Ballot, NewBallot, RegionTally},
        election::{Election, ElectionDetails, NewElection, Phase},
        ledger::LedgerEntry,
        voter::Voter,
    },
    mongodb::{
        ensure_indexes_exist, is_duplicate_key_error, is_unknown_commit_result, Coll, Id,
    },
};

use super::{
    AuditSink, BallotStore, CounterUpdate, ElectionStore, LedgerInsert, PhaseChange, StoreError,
    StoreResult, VoteStore, VoteTransaction, VoterDirectory, VoterLedger,
};

/// How many times to retry a commit whose outcome the server couldn't confirm.
const COMMIT_RETRIES: usize = 3;

/// MongoDB-backed storage. Vote transactions are multi-document session
/// transactions, which require the server to be part of a replica set.
#[derive(Debug, Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

impl MongoStore {
    pub fn new(client: Client, db: Database) -> Self {
        Self { client, db }
    }

    /// Create collections and indexes if they don't already exist.
    pub async fn prepare(&self) -> StoreResult<()> {
        ensure_indexes_exist(&self.db).await?;
        Ok(())
    }

    fn election_coll(&self) -> Coll<Election> {
        Coll::from_db(&self.db)
    }
}

#[rocket::async_trait]
impl ElectionStore for MongoStore {
    async fn election(&self, id: Id) -> StoreResult<Option<Election>> {
        Ok(self.election_coll().find_one(id.as_doc(), None).await?)
    }

    async fn elections(&self) -> StoreResult<Vec<Election>> {
        let elections = self
            .election_coll()
            .find(None, None)
            .await?
            .try_collect()
            .await?;
        Ok(elections)
    }

    async fn create_election(&self, election: NewElection) -> StoreResult<Election> {
        let id: Id = Coll::<NewElection>::from_db(&self.db)
            .insert_one(&election, None)
            .await?
            .inserted_id
            .as_object_id()
            .expect("Inserted election IDs are always ObjectIds")
            .into();
        Ok(Election { id, election })
    }

    async fn set_phase(&self, id: Id, phase: Phase) -> StoreResult<PhaseChange> {
        // Only match elections in an earlier phase, so the move is forwards-only
        // and atomic with respect to concurrent transitions.
        let filter = doc! {
            "_id": id,
            "phase": { "$in": phase.predecessors() },
        };
        let update = doc! { "$set": { "phase": phase } };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = self
            .election_coll()
            .find_one_and_update(filter, update, options)
            .await?;
        if let Some(election) = updated {
            return Ok(PhaseChange::Changed(election));
        }
        match self.election(id).await? {
            Some(election) => Ok(PhaseChange::Rejected(election.phase)),
            None => Ok(PhaseChange::NotFound),
        }
    }

    async fn update_details(
        &self,
        id: Id,
        expected_phase: Phase,
        details: ElectionDetails,
    ) -> StoreResult<Option<Election>> {
        let filter = doc! { "_id": id, "phase": expected_phase };
        let update = doc! {
            "$set": {
                "title": details.title,
                "description": details.description,
                "constituencies": details.constituencies,
                "start_time": BsonDateTime::from_chrono(details.start_time),
                "end_time": BsonDateTime::from_chrono(details.end_time),
            }
        };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        Ok(self
            .election_coll()
            .find_one_and_update(filter, update, options)
            .await?)
    }
}

/// Shape of one `$group` output row of the regional tally pipeline.
#[derive(Deserialize)]
struct RegionGroup {
    #[serde(rename = "_id")]
    key: RegionKey,
    votes: u64,
}

#[derive(Deserialize)]
struct RegionKey {
    region: String,
    candidate_id: Id,
}

#[rocket::async_trait]
impl BallotStore for MongoStore {
    async fn ballot_count(&self, election_id: Id) -> StoreResult<u64> {
        let count = Coll::<Ballot>::from_db(&self.db)
            .count_documents(doc! { "election_id": election_id }, None)
            .await?;
        Ok(count)
    }

    async fn region_tallies(&self, election_id: Id) -> StoreResult<Vec<RegionTally>> {
        let pipeline = vec![
            doc! { "$match": { "election_id": election_id } },
            doc! {
                "$group": {
                    "_id": { "region": "$region", "candidate_id": "$candidate_id" },
                    "votes": { "$sum": 1 },
                }
            },
            doc! { "$sort": { "_id.region": 1 } },
        ];
        let groups: Vec<Document> = Coll::<Ballot>::from_db(&self.db)
            .aggregate(pipeline, None)
            .await?
            .try_collect()
            .await?;
        groups
            .into_iter()
            .map(|group| -> StoreResult<RegionTally> {
                let group: RegionGroup = from_document(group)?;
                Ok(RegionTally {
                    region: group.key.region,
                    candidate_id: group.key.candidate_id,
                    votes: group.votes,
                })
            })
            .collect()
    }
}

#[rocket::async_trait]
impl VoterLedger for MongoStore {
    async fn has_voted(&self, voter_id: Id, election_id: Id) -> StoreResult<bool> {
        let filter = doc! { "voter_id": voter_id, "election_id": election_id };
        let entry = Coll::<LedgerEntry>::from_db(&self.db)
            .find_one(filter, None)
            .await?;
        Ok(entry.is_some())
    }
}

#[rocket::async_trait]
impl VoterDirectory for MongoStore {
    async fn voter(&self, id: Id) -> StoreResult<Option<Voter>> {
        Ok(Coll::<Voter>::from_db(&self.db)
            .find_one(id.as_doc(), None)
            .await?)
    }

    async fn voters(&self) -> StoreResult<Vec<Voter>> {
        let voters = Coll::<Voter>::from_db(&self.db)
            .find(None, None)
            .await?
            .try_collect()
            .await?;
        Ok(voters)
    }

    async fn pending_voters(&self) -> StoreResult<Vec<Voter>> {
        let voters = Coll::<Voter>::from_db(&self.db)
            .find(doc! { "approved": { "$ne": true } }, None)
            .await?
            .try_collect()
            .await?;
        Ok(voters)
    }

    async fn approve_voter(&self, id: Id) -> StoreResult<bool> {
        let result = Coll::<Voter>::from_db(&self.db)
            .update_one(id.as_doc(), doc! { "$set": { "approved": true } }, None)
            .await?;
        Ok(result.matched_count == 1)
    }
}

#[rocket::async_trait]
impl AuditSink for MongoStore {
    async fn record(&self, entry: AuditEntry) -> StoreResult<()> {
        Coll::<AuditEntry>::from_db(&self.db)
            .insert_one(entry, None)
            .await?;
        Ok(())
    }
}

#[rocket::async_trait]
impl VoteStore for MongoStore {
    async fn begin(&self) -> StoreResult<Box<dyn VoteTransaction>> {
        let mut session = self.client.start_session(None).await?;
        let options = TransactionOptions::builder()
            .read_concern(ReadConcern::snapshot())
            .write_concern(WriteConcern::builder().w(Acknowledgment::Majority).build())
            .build();
        session.start_transaction(options).await?;
        Ok(Box::new(MongoTransaction {
            session,
            db: self.db.clone(),
            finished: false,
        }))
    }
}

/// A vote transaction running in a MongoDB client session.
/// Dropping the session with the transaction still open aborts it.
struct MongoTransaction {
    session: ClientSession,
    db: Database,
    finished: bool,
}

impl MongoTransaction {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.finished {
            Err(StoreError::TransactionFinished)
        } else {
            Ok(())
        }
    }
}

#[rocket::async_trait]
impl VoteTransaction for MongoTransaction {
    async fn record_if_absent(
        &mut self,
        voter_id: Id,
        election_id: Id,
    ) -> StoreResult<LedgerInsert> {
        self.ensure_open()?;
        // The unique index on (voter_id, election_id) makes this insert the
        // check: a concurrent insert of the same pair either conflicts (and
        // is retried) or fails with a duplicate key.
        let result = Coll::<LedgerEntry>::from_db(&self.db)
            .insert_one_with_session(
                LedgerEntry::new(voter_id, election_id),
                None,
                &mut self.session,
            )
            .await;
        match result {
            Ok(_) => Ok(LedgerInsert::Inserted),
            Err(e) if is_duplicate_key_error(&e) => Ok(LedgerInsert::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn append_ballot(&mut self, ballot: NewBallot) -> StoreResult<Id> {
        self.ensure_open()?;
        let ballot = Ballot::new(ballot);
        Coll::<Ballot>::from_db(&self.db)
            .insert_one_with_session(&ballot, None, &mut self.session)
            .await?;
        Ok(ballot.id)
    }

    async fn increment_candidate_count(
        &mut self,
        election_id: Id,
        candidate_id: Id,
    ) -> StoreResult<CounterUpdate> {
        self.ensure_open()?;
        let elections = Coll::<Election>::from_db(&self.db);
        // Server-side `$inc` on the matched candidate; the phase is re-checked
        // under the transaction rather than trusted from the earlier read.
        let filter = doc! {
            "_id": election_id,
            "phase": Phase::Ongoing,
            "candidates._id": candidate_id,
        };
        let update = doc! { "$inc": { "candidates.$.count": 1 } };
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();
        let updated = elections
            .find_one_and_update_with_session(filter, update, options, &mut self.session)
            .await?;
        if let Some(election) = updated {
            return Ok(CounterUpdate::Incremented(election.election.candidates));
        }

        let election = elections
            .find_one_with_session(election_id.as_doc(), None, &mut self.session)
            .await?;
        match election {
            Some(election) if election.phase.accepts_votes() => {
                Ok(CounterUpdate::CandidateNotFound)
            }
            _ => Ok(CounterUpdate::ElectionNotActive),
        }
    }

    async fn commit(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.session.commit_transaction().await {
                Ok(()) => {
                    self.finished = true;
                    return Ok(());
                }
                // Retrying the commit itself is safe: the server deduplicates it.
                Err(e) if is_unknown_commit_result(&e) && attempt < COMMIT_RETRIES => {
                    warn!("Commit outcome unknown, retrying commit (attempt {attempt}): {e}");
                }
                // Rerunning the body could then record the vote twice.
                Err(e) if is_unknown_commit_result(&e) => {
                    self.finished = true;
                    return Err(StoreError::CommitOutcomeUnknown(e.to_string()));
                }
                Err(e) => {
                    self.finished = true;
                    return Err(e.into());
                }
            }
        }
    }

    async fn abort(&mut self) -> StoreResult<()> {
        self.ensure_open()?;
        self.finished = true;
        self.session.abort_transaction().await?;
        Ok(())
    }
}
