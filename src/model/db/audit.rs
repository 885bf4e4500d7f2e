use chrono::{DateTime, Utc};
use mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime;
use serde::{Deserialize, Serialize};

use crate::model::{db::election::Phase, mongodb::Id};

/// What kind of principal performed an audited action.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    Admin,
    Voter,
    System,
}

/// Audited actions. Vote events name the voter and the election only;
/// the chosen candidate is never audited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    VoteCast { election_id: Id },
    VoteRejected { election_id: Id, reason: String },
    ElectionCreated { election_id: Id },
    ElectionUpdated { election_id: Id },
    ElectionPhaseChanged { election_id: Id, phase: Phase },
    VoterApproved { voter_id: Id },
}

/// One compliance log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(flatten)]
    pub action: AuditAction,
    /// `None` for system actions.
    pub actor_id: Option<Id>,
    pub actor_type: ActorType,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: AuditAction, actor_type: ActorType, actor_id: Option<Id>) -> Self {
        Self {
            action,
            actor_id,
            actor_type,
            created_at: Utc::now(),
        }
    }

    pub fn by_voter(voter_id: Id, action: AuditAction) -> Self {
        Self::new(action, ActorType::Voter, Some(voter_id))
    }

    pub fn by_admin(admin_id: Id, action: AuditAction) -> Self {
        Self::new(action, ActorType::Admin, Some(admin_id))
    }

    pub fn by_system(action: AuditAction) -> Self {
        Self::new(action, ActorType::System, None)
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::to_document;

    use super::*;

    #[test]
    fn audit_entry_is_flat() {
        let election_id = Id::new();
        let entry = AuditEntry::by_voter(Id::new(), AuditAction::VoteCast { election_id });
        let doc = to_document(&entry).unwrap();
        assert_eq!(doc.get_str("action").unwrap(), "VOTE_CAST");
        assert_eq!(doc.get_object_id("election_id").unwrap(), *election_id);
        assert_eq!(doc.get_str("actor_type").unwrap(), "Voter");
        assert!(!doc.contains_key("candidate_id"));
    }
}
