#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use std::sync::Arc;

use rocket::{figment::Figment, Build, Rocket};

use crate::config::{ConfigFairing, CoordinatorFairing, StorageFairing};
use crate::logging::LoggerFairing;
use crate::schedule::PhaseSchedulerFairing;
use crate::store::{AuditSink, VoteStore};

pub mod api;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod model;
pub mod notifier;
pub mod schedule;
pub mod scheduled_task;
pub mod store;

pub use config::Config;

/// Build the server from `Rocket.toml` and the environment, with storage as
/// configured there.
pub fn build() -> Rocket<Build> {
    assemble(rocket::build())
}

/// Build the server from the given configuration, running against a store
/// the caller already holds.
pub fn rocket_for_store<S>(figment: Figment, store: Arc<S>) -> Rocket<Build>
where
    S: VoteStore + AuditSink + 'static,
{
    let rocket = config::manage_store(rocket::custom(figment), store);
    assemble(rocket)
}

/// Attach fairings in dependency order: config, then storage, then the
/// pieces that need both.
fn assemble(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(StorageFairing)
        .attach(CoordinatorFairing)
        .attach(PhaseSchedulerFairing)
        .mount("/", api::routes())
        .register("/", api::catchers())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        vote_attempts: 3,
        notifier_capacity: 64,
        storage: config::StorageBackend::Memory,
        jwt_secret: "test secret".to_string(),
    }
}

#[cfg(test)]
pub(crate) fn test_figment() -> Figment {
    use rocket::figment::providers::Serialized;

    rocket::Config::figment().merge(Serialized::globals(test_config()))
}
