//! Live result updates, pushed to connected clients after each committed vote.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::trace;
use rocket::tokio::sync::broadcast::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    db::election::Candidate,
    mongodb::{ApiId, Id},
};

/// Name of the server-sent event carrying a [`ResultUpdate`].
pub const UPDATE_RESULTS_EVENT: &str = "update_results";

/// One candidate's count within a [`ResultUpdate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCount {
    pub id: ApiId,
    pub name: String,
    pub count: u64,
}

impl From<&Candidate> for CandidateCount {
    fn from(candidate: &Candidate) -> Self {
        Self {
            id: candidate.id.into(),
            name: candidate.name.clone(),
            count: candidate.count,
        }
    }
}

/// Snapshot of an election's counters as of a specific committed vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultUpdate {
    pub election_id: ApiId,
    pub candidates: Vec<CandidateCount>,
    pub total_votes: u64,
}

impl ResultUpdate {
    pub fn new(election_id: Id, candidates: &[Candidate]) -> Self {
        let candidates: Vec<CandidateCount> = candidates.iter().map(Into::into).collect();
        let total_votes = candidates.iter().map(|c| c.count).sum();
        Self {
            election_id: election_id.into(),
            candidates,
            total_votes,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("No subscribers are listening for result updates")]
    NoSubscribers,
}

/// Something that can fan result updates out to observers.
pub trait ResultNotifier: Send + Sync {
    /// Publish an update. Returns how many observers it reached.
    fn publish(&self, update: ResultUpdate) -> Result<usize, NotifyError>;
}

/// Fans updates out over a tokio broadcast channel.
///
/// Updates for one election are published in increasing order of total
/// votes; an update older than one already sent is dropped, so observers
/// never see a count go backwards even when committing votes race to
/// publish.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: Sender<ResultUpdate>,
    published: Arc<Mutex<HashMap<Id, u64>>>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: Default::default(),
        }
    }

    pub fn subscribe(&self) -> Receiver<ResultUpdate> {
        self.sender.subscribe()
    }
}

impl ResultNotifier for BroadcastNotifier {
    fn publish(&self, update: ResultUpdate) -> Result<usize, NotifyError> {
        let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
        let last = published.entry(*update.election_id).or_default();
        if update.total_votes <= *last {
            trace!(
                "Dropping stale update for election {} ({} <= {})",
                update.election_id,
                update.total_votes,
                last
            );
            return Ok(0);
        }
        *last = update.total_votes;
        // Send under the lock so concurrent publishers can't reorder.
        self.sender
            .send(update)
            .map_err(|_| NotifyError::NoSubscribers)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::db::election::{ElectionCore, Phase};

    use super::*;

    fn update(election_id: Id, counts: [u64; 2]) -> ResultUpdate {
        let mut candidates = ElectionCore::example(Phase::Ongoing).candidates;
        candidates[0].count = counts[0];
        candidates[1].count = counts[1];
        ResultUpdate::new(election_id, &candidates)
    }

    #[test]
    fn update_totals_candidates() {
        let update = update(Id::new(), [3, 4]);
        assert_eq!(update.total_votes, 7);
        assert_eq!(update.candidates.len(), 2);
    }

    #[test]
    fn update_serializes_plain_ids() {
        let election_id = Id::new();
        let json = rocket::serde::json::serde_json::to_value(update(election_id, [1, 0])).unwrap();
        assert_eq!(json["electionId"], election_id.to_string());
        assert_eq!(json["totalVotes"], 1);
        assert!(json["candidates"][0]["id"].is_string());
    }

    #[test]
    fn publish_without_subscribers_fails() {
        let notifier = BroadcastNotifier::new(8);
        assert!(matches!(
            notifier.publish(update(Id::new(), [1, 0])),
            Err(NotifyError::NoSubscribers)
        ));
    }

    #[rocket::async_test]
    async fn stale_updates_are_dropped() {
        let notifier = BroadcastNotifier::new(8);
        let mut receiver = notifier.subscribe();
        let election = Id::new();
        let other = Id::new();

        assert_eq!(notifier.publish(update(election, [1, 1])).unwrap(), 1);
        assert_eq!(notifier.publish(update(election, [1, 0])).unwrap(), 0);
        assert_eq!(notifier.publish(update(election, [2, 1])).unwrap(), 1);
        // Totals are tracked per election.
        assert_eq!(notifier.publish(update(other, [0, 1])).unwrap(), 1);

        let totals: Vec<(ApiId, u64)> = (0..3)
            .map(|_| {
                let update = receiver.try_recv().unwrap();
                (update.election_id, update.total_votes)
            })
            .collect();
        assert_eq!(
            totals,
            vec![
                (election.into(), 2),
                (election.into(), 3),
                (other.into(), 1)
            ]
        );
        assert!(receiver.try_recv().is_err());
    }
}
