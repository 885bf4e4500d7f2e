use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// Records that a voter has voted in an election, but not how.
/// Unique on `(voter_id, election_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub voter_id: Id,
    pub election_id: Id,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(voter_id: Id, election_id: Id) -> Self {
        Self {
            voter_id,
            election_id,
            created_at: Utc::now(),
        }
    }
}
