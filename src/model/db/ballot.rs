use std::ops::Deref;

use chrono::{DateTime, Duration, DurationRound, Utc};
use mongodb::bson::{oid::ObjectId, serde_helpers::chrono_datetime_as_bson_datetime};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// Granularity of ballot timestamps. The ledger entry written in the same
/// transaction keeps full precision, so ballots must not.
pub fn ballot_time_resolution() -> Duration {
    Duration::hours(1)
}

/// Truncate to [`ballot_time_resolution`].
fn coarsen(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(ballot_time_resolution())
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

/// An anonymous vote. It has no voter field, so once written it cannot be
/// traced back to whoever cast it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotCore {
    pub election_id: Id,
    pub candidate_id: Id,
    /// The voter's region at the time of voting, for regional reporting.
    pub region: String,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl BallotCore {
    pub fn new(election_id: Id, candidate_id: Id, region: String) -> Self {
        Self {
            election_id,
            candidate_id,
            region,
            created_at: coarsen(Utc::now()),
        }
    }
}

/// A ballot without an ID, ready for insertion.
pub type NewBallot = BallotCore;

/// A ballot from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub ballot: BallotCore,
}

impl Ballot {
    /// Assign an ID to a new ballot.
    ///
    /// Driver-generated object IDs carry the insertion second and a
    /// per-process counter shared with the ledger's IDs. Ballot IDs instead
    /// carry the coarse timestamp followed by random bytes.
    pub fn new(ballot: NewBallot) -> Self {
        let mut bytes = [0u8; 12];
        let seconds = ballot.created_at.timestamp().clamp(0, u32::MAX.into()) as u32;
        bytes[..4].copy_from_slice(&seconds.to_be_bytes());
        rand::thread_rng().fill(&mut bytes[4..]);
        Self {
            id: ObjectId::from_bytes(bytes).into(),
            ballot,
        }
    }
}

impl Deref for Ballot {
    type Target = BallotCore;

    fn deref(&self) -> &Self::Target {
        &self.ballot
    }
}

/// Number of ballots for one candidate within one region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionTally {
    pub region: String,
    pub candidate_id: Id,
    pub votes: u64,
}
