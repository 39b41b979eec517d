#![forbid(unsafe_code)]

//! Predicate-filtered entity stores for the platform's ownable, permissioned
//! resources (apps and subdomains): one engine, two thin entity definitions.
//!
//! Storage, permission checking, event emission and read-time enrichment are
//! collaborator traits; the actor performing each operation is threaded
//! explicitly through every call.

use std::sync::Arc;

use crate::config::{Config, ConfigError};
use crate::db::Database;
use crate::events::EventBus;
use crate::permission::PermissionChecker;
use crate::providers::AppCollaborators;
use crate::store::EntityStore;
use crate::store::apps::AppDefinition;
use crate::store::subdomains::SubdomainDefinition;

pub mod actor;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod permission;
pub mod predicate;
pub mod providers;
pub mod schema;
pub mod store;

/// Both entity stores, wired from shared collaborators.
#[derive(Clone)]
pub struct EntityStores {
    pub apps: EntityStore,
    pub subdomains: EntityStore,
}

impl EntityStores {
    pub fn build(
        db: Arc<dyn Database>,
        permissions: Arc<dyn PermissionChecker>,
        events: Arc<dyn EventBus>,
        collaborators: AppCollaborators,
        config: Arc<Config>,
    ) -> Result<Self, ConfigError> {
        let apps = EntityStore::new(
            Arc::new(AppDefinition::new(
                db.clone(),
                events,
                collaborators,
                config.clone(),
            )?),
            db.clone(),
            permissions.clone(),
        );
        let subdomains = EntityStore::new(
            Arc::new(SubdomainDefinition::new(
                db.clone(),
                permissions.clone(),
                config,
            )?),
            db,
            permissions,
        );
        Ok(Self { apps, subdomains })
    }
}
