use serde::{Deserialize, Serialize};

/// The user on whose authority an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    pub username: String,
    /// Per-user override of the subdomain quota; falls back to config.
    #[serde(default)]
    pub max_subdomains: Option<u64>,
}

/// Reference to an application acting on a user's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHandle {
    pub id: i64,
    pub uid: String,
}

/// The authenticated party performing an operation. Supplied per call by the
/// caller; the stores never construct actors themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    User { user: User },
    AppUnderUser { user: User, app: AppHandle },
}

impl Actor {
    pub fn user(&self) -> &User {
        match self {
            Self::User { user } | Self::AppUnderUser { user, .. } => user,
        }
    }

    pub fn app(&self) -> Option<&AppHandle> {
        match self {
            Self::User { .. } => None,
            Self::AppUnderUser { app, .. } => Some(app),
        }
    }
}
