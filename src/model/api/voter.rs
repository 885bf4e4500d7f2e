use serde::{Deserialize, Serialize};

use crate::model::{db::voter::Voter, mongodb::ApiId};

/// An API-friendly view of a voter, as shown to administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterDescription {
    pub id: ApiId,
    pub name: String,
    pub region: String,
    pub approved: bool,
}

impl From<Voter> for VoterDescription {
    fn from(voter: Voter) -> Self {
        Self {
            id: voter.id.into(),
            name: voter.voter.name,
            region: voter.voter.region,
            approved: voter.voter.approved,
        }
    }
}
