use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::actor::Actor;

/// Global override letting a holder mutate entities it does not own.
pub const WRITE_ALL_OWNERS: &str = "system:es:write-all-owners";
/// Lets a holder list every subdomain rather than only its own.
pub const READ_ALL_SUBDOMAINS: &str = "read-all-subdomains";

/// Resource-scoped access permission for a protected entity,
/// e.g. `app:uid#app-1234:access`.
pub fn access_permission(kind: &str, uid: &str) -> String {
    format!("{kind}:uid#{uid}:access")
}

/// Delegated permission letting an app write another entity kind belonging
/// to its user, e.g. `apps-of-user:<user uuid>:write`.
pub fn delegated_write_permission(kind_plural: &str, user_uuid: &str) -> String {
    format!("{kind_plural}-of-user:{user_uuid}:write")
}

/// One grant surfaced by a permission scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionReading {
    pub permission: String,
    pub grantor: String,
}

/// The permission-check collaborator. `check` answers a single permission
/// string; `scan` surfaces every qualifying grant for it.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    async fn check(&self, actor: &Actor, permission: &str) -> bool;
    async fn scan(&self, actor: &Actor, permission: &str) -> Vec<PermissionReading>;
}

/// In-memory permission set keyed by actor identity; grants are exact
/// permission strings. Suitable for tests and single-process embedding.
#[derive(Default)]
pub struct StaticPermissions {
    grants: Mutex<HashSet<(String, String)>>,
}

impl StaticPermissions {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn grant_user(&self, user_id: i64, permission: &str) {
        let mut grants = self.grants.lock().await;
        grants.insert((user_key(user_id), permission.to_string()));
    }

    pub async fn grant_app(&self, app_uid: &str, permission: &str) {
        let mut grants = self.grants.lock().await;
        grants.insert((app_key(app_uid), permission.to_string()));
    }
}

fn user_key(user_id: i64) -> String {
    format!("user:{user_id}")
}

fn app_key(app_uid: &str) -> String {
    format!("app:{app_uid}")
}

fn actor_keys(actor: &Actor) -> Vec<String> {
    match actor {
        Actor::User { user } => vec![user_key(user.id)],
        Actor::AppUnderUser { user, app } => vec![user_key(user.id), app_key(&app.uid)],
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn check(&self, actor: &Actor, permission: &str) -> bool {
        let grants = self.grants.lock().await;
        actor_keys(actor)
            .iter()
            .any(|key| grants.contains(&(key.clone(), permission.to_string())))
    }

    async fn scan(&self, actor: &Actor, permission: &str) -> Vec<PermissionReading> {
        let grants = self.grants.lock().await;
        actor_keys(actor)
            .into_iter()
            .filter(|key| grants.contains(&(key.clone(), permission.to_string())))
            .map(|grantor| PermissionReading {
                permission: permission.to_string(),
                grantor,
            })
            .collect()
    }
}
