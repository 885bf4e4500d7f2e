use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, error, info, warn};
use rocket::{
    fairing::{Fairing, Info, Kind},
    futures::future::{BoxFuture, FutureExt},
    tokio::sync::Mutex,
    Build, Rocket,
};

use crate::model::{
    db::{
        audit::{AuditAction, AuditEntry},
        election::{Election, Phase},
    },
    mongodb::Id,
};
use crate::scheduled_task::ScheduledTask;
use crate::store::{audit, DynAudit, DynStore, ElectionStore, PhaseChange, StoreResult};

/// How long to wait before retrying a transition that hit a storage error.
const RETRY_INTERVAL_SECONDS: i64 = 60;

/// Map from election IDs to their pending transition.
type TaskMap = HashMap<Id, ScheduledTask<()>>;

/// The phase an election should move to next on its own, and when.
fn next_transition(election: &Election) -> Option<(Phase, DateTime<Utc>)> {
    match election.phase {
        Phase::Proclamation | Phase::Scheduled => Some((Phase::Ongoing, election.start_time)),
        Phase::Ongoing => Some((Phase::Ended, election.end_time)),
        Phase::Ended | Phase::ResultPublished => None,
    }
}

/// Phase schedule: one timed task per election, opening it for voting at its
/// start time and closing it at its end time.
pub struct PhaseScheduler {
    store: DynStore,
    audit: DynAudit,
    tasks: Arc<Mutex<TaskMap>>,
}

impl PhaseScheduler {
    pub fn new(store: DynStore, audit: DynAudit) -> Self {
        Self {
            store,
            audit,
            tasks: Default::default(),
        }
    }

    /// Does the given election have a transition pending?
    pub async fn is_scheduled(&self, election_id: Id) -> bool {
        self.tasks.lock().await.contains_key(&election_id)
    }

    /// Schedule the next transition of every election that has one.
    pub async fn schedule_elections(&self) -> StoreResult<usize> {
        let mut scheduled = 0;
        for election in self.store.elections().await? {
            if self.schedule(&election).await {
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Schedule the next transition for the given election, replacing any
    /// pending one. Returns false if the election has nowhere left to go.
    pub async fn schedule(&self, election: &Election) -> bool {
        let mut tasks_locked = self.tasks.lock().await;
        if let Some(task) = tasks_locked.remove(&election.id) {
            task.cancel().await;
        }
        let Some((phase, at)) = next_transition(election) else {
            return false;
        };
        debug!("Election {} moves to {phase} at {at}", election.id);
        let transition = Self::transition(
            election.id,
            phase,
            self.store.clone(),
            self.audit.clone(),
            self.tasks.clone(),
        );
        tasks_locked.insert(election.id, ScheduledTask::new(transition, at));
        true
    }

    /// Move the election to `phase` and queue up the transition after it.
    /// Since this schedules further instances of itself, we must use
    /// `BoxFuture` to avoid an infinitely-recursive state machine.
    fn transition(
        election_id: Id,
        phase: Phase,
        store: DynStore,
        audit_sink: DynAudit,
        tasks: Arc<Mutex<TaskMap>>,
    ) -> BoxFuture<'static, ()> {
        async move {
            let next = match store.set_phase(election_id, phase).await {
                Ok(PhaseChange::Changed(election)) => {
                    info!("Election {election_id} is now {phase}");
                    let action = AuditAction::ElectionPhaseChanged { election_id, phase };
                    audit(audit_sink.as_ref(), AuditEntry::by_system(action)).await;
                    next_transition(&election)
                }
                Ok(PhaseChange::Rejected(current)) => {
                    debug!("Election {election_id} already {current}, not moving to {phase}");
                    None
                }
                Ok(PhaseChange::NotFound) => {
                    warn!("Election {election_id} disappeared before moving to {phase}");
                    None
                }
                Err(e) => {
                    error!("Failed to move election {election_id} to {phase}: {e}");
                    warn!("Transition will be retried in {RETRY_INTERVAL_SECONDS} seconds");
                    Some((phase, Utc::now() + Duration::seconds(RETRY_INTERVAL_SECONDS)))
                }
            };

            let mut tasks_locked = tasks.lock().await;
            tasks_locked.remove(&election_id);
            if let Some((phase, at)) = next {
                let transition = Self::transition(
                    election_id,
                    phase,
                    store,
                    audit_sink,
                    tasks.clone(),
                );
                tasks_locked.insert(election_id, ScheduledTask::new(transition, at));
            }
        }
        .boxed()
    }
}

/// A fairing that schedules phase transitions for all elections during Rocket
/// ignition, and places a `PhaseScheduler` into managed state.
/// This fairing depends on the store being available in managed state,
/// and so must be attached after the fairing responsible for that.
pub struct PhaseSchedulerFairing;

#[rocket::async_trait]
impl Fairing for PhaseSchedulerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Phase Scheduler",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        info!("Scheduling election phases...");
        let (store, audit) = match (rocket.state::<DynStore>(), rocket.state::<DynAudit>()) {
            (Some(store), Some(audit)) => (store.clone(), audit.clone()),
            _ => {
                error!("Storage was not available when scheduling election phases");
                return Err(rocket);
            }
        };
        let scheduler = PhaseScheduler::new(store, audit);
        match scheduler.schedule_elections().await {
            Ok(count) => info!("...{count} election transitions scheduled!"),
            Err(e) => {
                error!("Failed to schedule election phases: {e}");
                return Err(rocket);
            }
        }

        // Manage the state.
        rocket = rocket.manage(scheduler);
        Ok(rocket)
    }
}

#[cfg(test)]
mod tests {
    use rocket::tokio::time::{sleep, Duration as StdDuration};

    use crate::model::db::election::ElectionCore;
    use crate::store::{ElectionStore, MemoryStore};

    use super::*;

    fn scheduler(store: &MemoryStore) -> PhaseScheduler {
        PhaseScheduler::new(Arc::new(store.clone()), Arc::new(store.clone()))
    }

    /// Poll until the election reaches `phase`, or give up after a couple of seconds.
    async fn wait_for_phase(store: &MemoryStore, election_id: Id, phase: Phase) -> bool {
        for _ in 0..200 {
            let current = store.election(election_id).await.unwrap().unwrap().phase;
            if current == phase {
                return true;
            }
            sleep(StdDuration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        let mut election = Election {
            id: Id::new(),
            election: ElectionCore::example(Phase::Scheduled),
        };
        let start = election.start_time;
        let end = election.end_time;
        assert_eq!(next_transition(&election), Some((Phase::Ongoing, start)));
        election.phase = Phase::Ongoing;
        assert_eq!(next_transition(&election), Some((Phase::Ended, end)));
        election.phase = Phase::Ended;
        assert_eq!(next_transition(&election), None);
    }

    #[rocket::async_test]
    async fn due_elections_open_and_stay_scheduled_to_end() {
        let store = MemoryStore::new();
        let scheduler = scheduler(&store);
        // Started an hour ago, ends in an hour.
        let election = store
            .insert_election(ElectionCore::example(Phase::Scheduled))
            .await;

        assert!(scheduler.schedule(&election).await);
        assert!(wait_for_phase(&store, election.id, Phase::Ongoing).await);
        // The closing transition replaces the opening one.
        sleep(StdDuration::from_millis(20)).await;
        assert!(scheduler.is_scheduled(election.id).await);

        let audited = store.audit_entries().await;
        assert_eq!(
            audited[0].action,
            AuditAction::ElectionPhaseChanged {
                election_id: election.id,
                phase: Phase::Ongoing
            }
        );
    }

    #[rocket::async_test]
    async fn finished_elections_close() {
        let store = MemoryStore::new();
        let scheduler = scheduler(&store);
        let mut core = ElectionCore::example(Phase::Ongoing);
        core.start_time = Utc::now() - Duration::hours(2);
        core.end_time = Utc::now() - Duration::hours(1);
        let election = store.insert_election(core).await;

        assert_eq!(scheduler.schedule_elections().await.unwrap(), 1);
        assert!(wait_for_phase(&store, election.id, Phase::Ended).await);
        sleep(StdDuration::from_millis(20)).await;
        assert!(!scheduler.is_scheduled(election.id).await);
    }

    #[rocket::async_test]
    async fn future_elections_wait() {
        let store = MemoryStore::new();
        let scheduler = scheduler(&store);
        let mut core = ElectionCore::example(Phase::Scheduled);
        core.start_time = Utc::now() + Duration::days(1);
        core.end_time = Utc::now() + Duration::days(2);
        let election = store.insert_election(core).await;
        let ended = store
            .insert_election(ElectionCore::example(Phase::Ended))
            .await;

        assert_eq!(scheduler.schedule_elections().await.unwrap(), 1);
        assert!(!scheduler.is_scheduled(ended.id).await);
        sleep(StdDuration::from_millis(20)).await;
        let stored = store.election(election.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Scheduled);
        assert!(scheduler.is_scheduled(election.id).await);
    }
}
