use std::ops::Deref;

use log::debug;
use mongodb::{
    bson::doc, error::Error as DbError, options::IndexOptions, Collection, Database, IndexModel,
};

use crate::model::db::{
    audit::AuditEntry,
    ballot::Ballot,
    election::{Election, NewElection},
    ledger::LedgerEntry,
    voter::{NewVoter, Voter},
};

/// A type that can be directly inserted/read to/from the database.
pub trait MongoCollection {
    /// The name of the collection.
    const NAME: &'static str;
}

/// A database collection of the given type.
pub struct Coll<T>(Collection<T>);

impl<T> Coll<T>
where
    T: MongoCollection,
{
    /// Get a handle on this collection in the given database.
    pub fn from_db(db: &Database) -> Self {
        Self(db.collection(T::NAME))
    }
}

// `Derive(Clone)` would only derive if `T: Clone`, but we don't need that bound.
impl<T> Clone for Coll<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Deref for Coll<T> {
    type Target = Collection<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Election collections
const ELECTIONS: &str = "elections";
impl MongoCollection for Election {
    const NAME: &'static str = ELECTIONS;
}
impl MongoCollection for NewElection {
    const NAME: &'static str = ELECTIONS;
}

// Ballot collections
const BALLOTS: &str = "ballots";
impl MongoCollection for Ballot {
    const NAME: &'static str = BALLOTS;
}

// Voter-ballot ledger
const VOTE_RECORDS: &str = "vote_records";
impl MongoCollection for LedgerEntry {
    const NAME: &'static str = VOTE_RECORDS;
}

// Voter collections
const VOTERS: &str = "voters";
impl MongoCollection for Voter {
    const NAME: &'static str = VOTERS;
}
impl MongoCollection for NewVoter {
    const NAME: &'static str = VOTERS;
}

// Audit log
const AUDIT_LOGS: &str = "audit_logs";
impl MongoCollection for AuditEntry {
    const NAME: &'static str = AUDIT_LOGS;
}

/// Ensure that all the required indexes exist on the given database.
///
/// This also creates the collections themselves, which matters because
/// collections cannot be implicitly created inside a transaction on older
/// servers. This operation is idempotent.
pub async fn ensure_indexes_exist(db: &Database) -> Result<(), DbError> {
    debug!("Ensuring collection indexes exist");

    let unique = IndexOptions::builder().unique(true).build();

    // The ledger's uniqueness constraint is what prevents double voting.
    let ledger_index = IndexModel::builder()
        .keys(doc! {"voter_id": 1, "election_id": 1})
        .options(unique)
        .build();
    Coll::<LedgerEntry>::from_db(db)
        .create_index(ledger_index, None)
        .await?;

    // Ballots are only ever looked up by election.
    let ballot_index = IndexModel::builder()
        .keys(doc! {"election_id": 1, "region": 1})
        .build();
    Coll::<Ballot>::from_db(db)
        .create_index(ballot_index, None)
        .await?;

    let election_index = IndexModel::builder().keys(doc! {"phase": 1}).build();
    Coll::<Election>::from_db(db)
        .create_index(election_index, None)
        .await?;

    let voter_index = IndexModel::builder().keys(doc! {"approved": 1}).build();
    Coll::<Voter>::from_db(db)
        .create_index(voter_index, None)
        .await?;

    let audit_index = IndexModel::builder().keys(doc! {"created_at": 1}).build();
    Coll::<AuditEntry>::from_db(db)
        .create_index(audit_index, None)
        .await?;

    Ok(())
}
