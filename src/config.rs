use std::sync::Arc;

use log::{debug, error, info, warn};
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::{Deserialize, Serialize};

use crate::coordinator::VoteCoordinator;
use crate::notifier::BroadcastNotifier;
use crate::store::{DynAudit, DynStore, MemoryStore, MongoStore};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // non-secrets
    #[serde(default = "default_vote_attempts")]
    pub(crate) vote_attempts: u32,
    #[serde(default = "default_notifier_capacity")]
    pub(crate) notifier_capacity: usize,
    #[serde(default)]
    pub(crate) storage: StorageBackend,
    // secrets
    pub(crate) jwt_secret: String,
}

fn default_vote_attempts() -> u32 {
    3
}

fn default_notifier_capacity() -> usize {
    256
}

impl Config {
    /// Secret key used to verify JWTs.
    pub fn jwt_secret(&self) -> &[u8] {
        self.jwt_secret.as_bytes()
    }

    /// How many times the vote transaction is tried before giving up.
    pub fn vote_attempts(&self) -> u32 {
        self.vote_attempts
    }

    /// How many result updates a slow observer may fall behind by.
    pub fn notifier_capacity(&self) -> usize {
        self.notifier_capacity
    }

    pub fn storage(&self) -> StorageBackend {
        self.storage
    }
}

/// Which storage backend to run against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Mongodb,
    /// Process-local state, lost on restart. For development and tests.
    Memory,
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // non-secrets
    #[serde(default = "default_db_name")]
    db_name: String,
    // secrets
    db_uri: String,
}

fn default_db_name() -> String {
    "evote".to_string()
}

/// A fairing that sets up the configured storage backend and places it into
/// managed state as both a [`DynStore`] and a [`DynAudit`].
///
/// A store already in managed state is used as-is. This fairing depends on
/// the [`Config`] being in managed state, and so must be attached after
/// [`ConfigFairing`].
pub struct StorageFairing;

#[rocket::async_trait]
impl Fairing for StorageFairing {
    fn info(&self) -> Info {
        Info {
            name: "Storage",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        if rocket.state::<DynStore>().is_some() {
            debug!("Storage provided ahead of ignition");
            return Ok(rocket);
        }
        let backend = match rocket.state::<Config>() {
            Some(config) => config.storage(),
            None => {
                error!("Config was not available when setting up storage");
                return Err(rocket);
            }
        };

        match backend {
            StorageBackend::Memory => {
                warn!("Using in-memory storage, nothing will persist across restarts");
                let store = Arc::new(MemoryStore::new());
                Ok(manage_store(rocket, store))
            }
            StorageBackend::Mongodb => {
                // Load the config.
                let config = match rocket.figment().extract::<DbConfig>() {
                    Ok(config) => config,
                    Err(e) => {
                        error!("Failed to load database config");
                        rocket::config::pretty_print_error(e);
                        return Err(rocket);
                    }
                };
                info!("Loaded database config, connecting...");
                // Construct the connection.
                let client = match MongoClient::with_uri_str(config.db_uri).await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("Failed to connect to database: {e}");
                        return Err(rocket);
                    }
                };
                let db = client.database(&config.db_name);
                let store = MongoStore::new(client, db);

                // Ensure the required indexes exist.
                if let Err(e) = store.prepare().await {
                    error!("Failed to prepare database: {e}");
                    return Err(rocket);
                }
                info!("...database connection online!");

                Ok(manage_store(rocket, Arc::new(store)))
            }
        }
    }
}

/// Place a store into managed state under both of the handles endpoints use.
pub(crate) fn manage_store<S>(rocket: Rocket<Build>, store: Arc<S>) -> Rocket<Build>
where
    S: crate::store::VoteStore + crate::store::AuditSink + 'static,
{
    let audit: DynAudit = store.clone();
    let store: DynStore = store;
    rocket.manage(store).manage(audit)
}

/// A fairing that creates the result notifier and the vote coordinator and
/// places both into managed state. Must be attached after [`StorageFairing`].
pub struct CoordinatorFairing;

#[rocket::async_trait]
impl Fairing for CoordinatorFairing {
    fn info(&self) -> Info {
        Info {
            name: "Vote Coordinator",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let (capacity, attempts) = match rocket.state::<Config>() {
            Some(config) => (config.notifier_capacity(), config.vote_attempts()),
            None => {
                error!("Config was not available when creating the vote coordinator");
                return Err(rocket);
            }
        };
        let (store, audit) = match (rocket.state::<DynStore>(), rocket.state::<DynAudit>()) {
            (Some(store), Some(audit)) => (store.clone(), audit.clone()),
            _ => {
                error!("Storage was not available when creating the vote coordinator");
                return Err(rocket);
            }
        };

        let notifier = BroadcastNotifier::new(capacity);
        let coordinator = VoteCoordinator::new(store, audit, Arc::new(notifier.clone()), attempts);
        info!("Vote coordinator ready ({attempts} attempts per vote)");

        // Manage the state.
        Ok(rocket.manage(notifier).manage(coordinator))
    }
}
