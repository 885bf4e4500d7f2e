use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    db::{
        ballot::RegionTally,
        election::{Candidate, Election, ElectionCore, ElectionDetails, NewElection, Phase},
    },
    mongodb::ApiId,
};

/// An election specification, as submitted by an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub candidates: Vec<CandidateSpec>,
    #[serde(default)]
    pub constituencies: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSpec {
    pub name: String,
    #[serde(default)]
    pub symbol: Option<String>,
}

impl ElectionSpec {
    /// Check this describes a usable election.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("Election title must not be empty".to_string());
        }
        if self.candidates.is_empty() {
            return Err("Election must have at least one candidate".to_string());
        }
        if let Some(c) = self.candidates.iter().find(|c| c.name.trim().is_empty()) {
            return Err(format!(
                "Candidate name must not be empty (symbol {:?})",
                c.symbol
            ));
        }
        if self.end_time <= self.start_time {
            return Err("Election must end after it starts".to_string());
        }
        Ok(())
    }
}

impl From<ElectionSpec> for NewElection {
    /// New elections are created `scheduled`, with zeroed counters.
    fn from(spec: ElectionSpec) -> Self {
        Self {
            title: spec.title,
            description: spec.description,
            candidates: spec
                .candidates
                .into_iter()
                .map(|c| Candidate::new(c.name, c.symbol))
                .collect(),
            constituencies: spec.constituencies,
            phase: Phase::Scheduled,
            start_time: spec.start_time,
            end_time: spec.end_time,
        }
    }
}

/// Changes to an existing election's details. Absent fields are left as
/// they are; candidates cannot be changed after creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionUpdate {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub constituencies: Option<Vec<String>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

/// Why an [`ElectionUpdate`] cannot be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateRejection {
    #[error("Election {field} cannot change once the election is {phase}")]
    Locked { field: &'static str, phase: Phase },
    #[error("{0}")]
    Invalid(String),
}

impl ElectionUpdate {
    /// Merge this update into the election's current details.
    ///
    /// The start time and constituencies are fixed once voting opens, and the
    /// end time once voting closes. Resubmitting a fixed field unchanged is
    /// allowed.
    pub fn apply_to(&self, election: &ElectionCore) -> Result<ElectionDetails, UpdateRejection> {
        let phase = election.phase;
        let locked = |field| Err(UpdateRejection::Locked { field, phase });
        let mut details = election.details();

        if let Some(start_time) = self.start_time {
            if start_time != details.start_time && phase >= Phase::Ongoing {
                return locked("start time");
            }
            details.start_time = start_time;
        }
        if let Some(constituencies) = &self.constituencies {
            if *constituencies != details.constituencies && phase >= Phase::Ongoing {
                return locked("constituencies");
            }
            details.constituencies = constituencies.clone();
        }
        if let Some(end_time) = self.end_time {
            if end_time != details.end_time && phase >= Phase::Ended {
                return locked("end time");
            }
            details.end_time = end_time;
        }
        if let Some(title) = &self.title {
            details.title = title.clone();
        }
        if let Some(description) = &self.description {
            details.description = description.clone();
        }

        if details.title.trim().is_empty() {
            return Err(UpdateRejection::Invalid(
                "Election title must not be empty".to_string(),
            ));
        }
        if details.end_time <= details.start_time {
            return Err(UpdateRejection::Invalid(
                "Election must end after it starts".to_string(),
            ));
        }
        Ok(details)
    }
}

/// A candidate and their current count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescription {
    pub id: ApiId,
    pub name: String,
    pub symbol: Option<String>,
    pub count: u64,
}

impl From<Candidate> for CandidateDescription {
    fn from(candidate: Candidate) -> Self {
        Self {
            id: candidate.id.into(),
            name: candidate.name,
            symbol: candidate.symbol,
            count: candidate.count,
        }
    }
}

/// An API-friendly election description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionDescription {
    pub id: ApiId,
    pub title: String,
    pub description: String,
    pub candidates: Vec<CandidateDescription>,
    pub constituencies: Vec<String>,
    pub phase: Phase,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl From<Election> for ElectionDescription {
    fn from(election: Election) -> Self {
        let core = election.election;
        Self {
            id: election.id.into(),
            title: core.title,
            description: core.description,
            candidates: core.candidates.into_iter().map(Into::into).collect(),
            constituencies: core.constituencies,
            phase: core.phase,
            start_time: core.start_time,
            end_time: core.end_time,
        }
    }
}

/// Request body for a phase transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseUpdate {
    pub phase: Phase,
}

/// Aggregate results for one election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionResults {
    pub election_id: ApiId,
    pub phase: Phase,
    /// Number of ballots recorded. Equals the sum of candidate counts.
    pub total_ballots: u64,
    pub candidates: Vec<CandidateDescription>,
    /// Per-region breakdown, keyed by region then candidate ID.
    pub regions: BTreeMap<String, BTreeMap<String, u64>>,
}

impl ElectionResults {
    pub fn new(election: Election, total_ballots: u64, tallies: Vec<RegionTally>) -> Self {
        let mut regions: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for tally in tallies {
            *regions
                .entry(tally.region)
                .or_default()
                .entry(tally.candidate_id.to_string())
                .or_default() += tally.votes;
        }
        Self {
            election_id: election.id.into(),
            phase: election.phase,
            total_ballots,
            candidates: election
                .election
                .candidates
                .into_iter()
                .map(Into::into)
                .collect(),
            regions,
        }
    }
}

/// Example data for tests.
#[cfg(test)]
pub mod examples {
    use chrono::Duration;

    use super::*;

    impl ElectionSpec {
        pub fn example() -> Self {
            let now = Utc::now();
            Self {
                title: "Chittagong-5 general election".to_string(),
                description: String::new(),
                candidates: vec![
                    CandidateSpec {
                        name: "Razon Ahmed".to_string(),
                        symbol: Some("scales".to_string()),
                    },
                    CandidateSpec {
                        name: "Safiul Karim".to_string(),
                        symbol: None,
                    },
                ],
                constituencies: vec!["Chittagong-5".to_string()],
                start_time: now + Duration::days(1),
                end_time: now + Duration::days(2),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use crate::model::mongodb::Id;

    use super::*;

    #[test]
    fn spec_validation() {
        assert!(ElectionSpec::example().validate().is_ok());

        let mut spec = ElectionSpec::example();
        spec.candidates.clear();
        assert!(spec.validate().is_err());

        let mut spec = ElectionSpec::example();
        spec.end_time = spec.start_time - Duration::minutes(1);
        assert!(spec.validate().is_err());

        let mut spec = ElectionSpec::example();
        spec.title = "  ".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn new_election_from_spec_is_scheduled_and_zeroed() {
        let election: NewElection = ElectionSpec::example().into();
        assert_eq!(election.phase, Phase::Scheduled);
        assert_eq!(election.candidates.len(), 2);
        assert_eq!(election.total_votes(), 0);
        assert_ne!(election.candidates[0].id, election.candidates[1].id);
    }

    #[test]
    fn updates_merge_into_current_details() {
        let election = ElectionCore::example(Phase::Scheduled);
        let update = ElectionUpdate {
            title: Some("Dhaka-10 by-election (rescheduled)".to_string()),
            start_time: Some(election.start_time + Duration::days(1)),
            end_time: Some(election.end_time + Duration::days(2)),
            ..Default::default()
        };
        let details = update.apply_to(&election).unwrap();
        assert_eq!(details.title, "Dhaka-10 by-election (rescheduled)");
        assert_eq!(details.description, election.description);
        assert_eq!(details.constituencies, election.constituencies);
        assert_eq!(details.start_time, election.start_time + Duration::days(1));

        assert_eq!(
            ElectionUpdate::default().apply_to(&election).unwrap(),
            election.details()
        );
    }

    #[test]
    fn running_elections_keep_their_start() {
        let election = ElectionCore::example(Phase::Ongoing);
        let moved = ElectionUpdate {
            start_time: Some(election.start_time + Duration::minutes(5)),
            ..Default::default()
        };
        assert_eq!(
            moved.apply_to(&election),
            Err(UpdateRejection::Locked {
                field: "start time",
                phase: Phase::Ongoing
            })
        );
        let regions = ElectionUpdate {
            constituencies: Some(vec!["Sylhet-1".to_string()]),
            ..Default::default()
        };
        assert!(matches!(
            regions.apply_to(&election),
            Err(UpdateRejection::Locked { .. })
        ));

        // The end can still move, and unchanged fields are fine.
        let extended = ElectionUpdate {
            start_time: Some(election.start_time),
            end_time: Some(election.end_time + Duration::hours(1)),
            ..Default::default()
        };
        assert!(extended.apply_to(&election).is_ok());

        let ended = ElectionCore::example(Phase::Ended);
        let extended = ElectionUpdate {
            end_time: Some(ended.end_time + Duration::hours(1)),
            ..Default::default()
        };
        assert!(matches!(
            extended.apply_to(&ended),
            Err(UpdateRejection::Locked { field: "end time", .. })
        ));
    }

    #[test]
    fn merged_updates_are_validated() {
        let election = ElectionCore::example(Phase::Scheduled);
        let backwards = ElectionUpdate {
            end_time: Some(election.start_time - Duration::minutes(1)),
            ..Default::default()
        };
        assert!(matches!(
            backwards.apply_to(&election),
            Err(UpdateRejection::Invalid(_))
        ));
        let untitled = ElectionUpdate {
            title: Some(" ".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            untitled.apply_to(&election),
            Err(UpdateRejection::Invalid(_))
        ));
    }

    #[test]
    fn results_group_by_region() {
        let election = Election {
            id: Id::new(),
            election: ElectionSpec::example().into(),
        };
        let c1 = election.candidates[0].id;
        let c2 = election.candidates[1].id;
        let tally = |region: &str, candidate_id, votes| RegionTally {
            region: region.to_string(),
            candidate_id,
            votes,
        };
        let tallies = vec![
            tally("Dhaka-10", c1, 2),
            tally("Dhaka-10", c2, 1),
            tally("Sylhet-1", c1, 4),
        ];
        let results = ElectionResults::new(election, 7, tallies);
        assert_eq!(results.total_ballots, 7);
        assert_eq!(results.regions.len(), 2);
        assert_eq!(results.regions["Dhaka-10"][&c1.to_string()], 2);
        assert_eq!(results.regions["Sylhet-1"][&c1.to_string()], 4);
    }
}
