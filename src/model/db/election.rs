use std::fmt::{Display, Formatter};
use std::ops::{Deref, DerefMut};

use chrono::{DateTime, Utc};
use mongodb::bson::{serde_helpers::chrono_datetime_as_bson_datetime, to_bson, Bson};
use serde::{Deserialize, Serialize};

use crate::model::mongodb::Id;

/// States in the election lifecycle. Phases are ordered: an election only
/// ever moves forwards through them.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Announced, details may still change.
    Proclamation,
    /// Fixed, waiting for the start time.
    Scheduled,
    /// Accepting votes.
    Ongoing,
    /// Closed to votes, results not yet official.
    Ended,
    /// Results are official.
    ResultPublished,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Proclamation,
        Phase::Scheduled,
        Phase::Ongoing,
        Phase::Ended,
        Phase::ResultPublished,
    ];

    /// Is a vote accepted in this phase?
    pub fn accepts_votes(self) -> bool {
        self == Phase::Ongoing
    }

    /// All phases strictly before this one.
    pub fn predecessors(self) -> Vec<Phase> {
        Self::ALL.into_iter().filter(|p| *p < self).collect()
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Proclamation => "proclamation",
            Phase::Scheduled => "scheduled",
            Phase::Ongoing => "ongoing",
            Phase::Ended => "ended",
            Phase::ResultPublished => "result_published",
        };
        f.write_str(name)
    }
}

impl From<Phase> for Bson {
    fn from(phase: Phase) -> Self {
        to_bson(&phase).expect("Serialisation is infallible")
    }
}

/// A candidate standing in an election, with their running vote count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    #[serde(rename = "_id")]
    pub id: Id,
    pub name: String,
    /// Display symbol; opaque to the vote path.
    #[serde(default)]
    pub symbol: Option<String>,
    /// Only ever incremented, and only by the vote transaction.
    pub count: u64,
}

impl Candidate {
    pub fn new(name: String, symbol: Option<String>) -> Self {
        Self {
            id: Id::new(),
            name,
            symbol,
            count: 0,
        }
    }
}

/// Core election data, as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionCore {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub candidates: Vec<Candidate>,
    /// Region tags this election covers. Empty means national.
    #[serde(default)]
    pub constituencies: Vec<String>,
    pub phase: Phase,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub end_time: DateTime<Utc>,
}

impl ElectionCore {
    /// Find a candidate by ID.
    pub fn candidate(&self, id: Id) -> Option<&Candidate> {
        self.candidates.iter().find(|c| c.id == id)
    }

    /// Sum of all candidate counts.
    pub fn total_votes(&self) -> u64 {
        self.candidates.iter().map(|c| c.count).sum()
    }
}

/// The administrator-editable fields of an election. Candidates and their
/// counters are not among them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionDetails {
    pub title: String,
    pub description: String,
    pub constituencies: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl ElectionCore {
    pub fn details(&self) -> ElectionDetails {
        ElectionDetails {
            title: self.title.clone(),
            description: self.description.clone(),
            constituencies: self.constituencies.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
        }
    }

    pub fn set_details(&mut self, details: ElectionDetails) {
        self.title = details.title;
        self.description = details.description;
        self.constituencies = details.constituencies;
        self.start_time = details.start_time;
        self.end_time = details.end_time;
    }
}

/// An election without an ID, ready for insertion.
pub type NewElection = ElectionCore;

/// An election from the database, with its unique ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    #[serde(rename = "_id")]
    pub id: Id,
    #[serde(flatten)]
    pub election: ElectionCore,
}

impl Deref for Election {
    type Target = ElectionCore;

    fn deref(&self) -> &Self::Target {
        &self.election
    }
}

impl DerefMut for Election {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.election
    }
}


#[cfg(test)]
mod tests {
    use mongodb::bson::to_document;

    use super::*;

    #[test]
    fn phases_are_ordered() {
        assert!(Phase::Proclamation < Phase::Scheduled);
        assert!(Phase::Ongoing < Phase::ResultPublished);
        assert_eq!(
            Phase::Ongoing.predecessors(),
            vec![Phase::Proclamation, Phase::Scheduled]
        );
        assert!(Phase::Proclamation.predecessors().is_empty());
        assert!(Phase::Ongoing.accepts_votes());
        assert!(!Phase::Ended.accepts_votes());
    }

    #[test]
    fn phase_stored_as_snake_case() {
        assert_eq!(Bson::from(Phase::ResultPublished), Bson::String("result_published".into()));
        assert_eq!(Phase::ResultPublished.to_string(), "result_published");
    }

    #[test]
    fn election_document_shape() {
        let election = Election {
            id: Id::new(),
            election: ElectionCore::example(Phase::Ongoing),
        };
        let doc = to_document(&election).unwrap();
        assert!(doc.get_object_id("_id").is_ok());
        assert_eq!(doc.get_str("phase").unwrap(), "ongoing");
        assert!(doc.get_datetime("start_time").is_ok());
        let candidates = doc.get_array("candidates").unwrap();
        assert_eq!(candidates.len(), 2);
    }
}
