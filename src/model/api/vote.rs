use serde::{Deserialize, Serialize};

use crate::model::mongodb::{ApiId, Id};

/// A vote as submitted by a voter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteSpec {
    pub election_id: Id,
    pub candidate_id: Id,
}

/// Whether the authenticated voter has voted in an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VotedStatus {
    pub election_id: ApiId,
    pub voted: bool,
}

/// A plain message body, used for acknowledgements and errors alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
