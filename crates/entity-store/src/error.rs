use crate::db::DbError;

/// Failure taxonomy for the entity stores.
///
/// Validation and authorization failures are typed and terminal; storage
/// errors propagate unmodified. Route layers render these via [`code`]
/// and the display message.
///
/// [`code`]: EntityStoreError::code
#[derive(Debug, thiserror::Error)]
pub enum EntityStoreError {
    #[error("forbidden")]
    Forbidden,
    #[error("entity not found: {identifier}")]
    EntityNotFound { identifier: String },
    #[error("invalid identifier")]
    InvalidId,
    #[error("missing required field: {key}")]
    FieldMissing { key: String },
    #[error("invalid value for field: {key}")]
    FieldInvalid { key: String },
    #[error("name already in use: {name}")]
    NameInUse { name: String },
    #[error("subdomain is reserved: {subdomain}")]
    SubdomainReserved { subdomain: String },
    #[error("limit reached: {limit}")]
    LimitReached { limit: u64 },
    #[error("db error: {0}")]
    Db(String),
}

impl EntityStoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Forbidden => "forbidden",
            Self::EntityNotFound { .. } => "entity_not_found",
            Self::InvalidId => "invalid_id",
            Self::FieldMissing { .. } => "field_missing",
            Self::FieldInvalid { .. } => "field_invalid",
            Self::NameInUse { .. } => "already_in_use",
            Self::SubdomainReserved { .. } => "subdomain_reserved",
            Self::LimitReached { .. } => "limit_reached",
            Self::Db(_) => "internal_error",
        }
    }

    pub fn field_missing(key: &str) -> Self {
        Self::FieldMissing {
            key: key.to_string(),
        }
    }

    pub fn field_invalid(key: &str) -> Self {
        Self::FieldInvalid {
            key: key.to_string(),
        }
    }
}

impl From<DbError> for EntityStoreError {
    fn from(error: DbError) -> Self {
        Self::Db(error.to_string())
    }
}
