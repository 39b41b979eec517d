use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::actor::Actor;
use crate::config::{CompiledPatterns, Config, ConfigError};
use crate::db::{Database, Row, SqlValue};
use crate::error::EntityStoreError;
use crate::permission::{self, PermissionChecker};
use crate::predicate::{ColumnMap, CompiledWhere};
use crate::store::{
    Entity, EntityDefinition, NormalizedRecord, ReadParams, UpsertOptions, parse_timestamp,
};

const SUBDOMAIN_COLUMNS: ColumnMap = ColumnMap::new(&[
    ("uid", "uuid"),
    ("subdomain", "subdomain"),
    ("domain", "domain"),
    ("owner", "user_id"),
    ("root_dir", "root_dir_id"),
    ("associated_app", "associated_app_id"),
    ("app_owner", "app_owner"),
]);

/// The subdomain entity store definition.
pub struct SubdomainDefinition {
    db: Arc<dyn Database>,
    permissions: Arc<dyn PermissionChecker>,
    config: Arc<Config>,
    patterns: CompiledPatterns,
}

impl SubdomainDefinition {
    pub fn new(
        db: Arc<dyn Database>,
        permissions: Arc<dyn PermissionChecker>,
        config: Arc<Config>,
    ) -> Result<Self, ConfigError> {
        let patterns = config.compile()?;
        Ok(Self {
            db,
            permissions,
            config,
            patterns,
        })
    }

    async fn subdomain_exists(
        &self,
        subdomain: &str,
        exclude_id: Option<i64>,
    ) -> Result<bool, EntityStoreError> {
        let mut sql = "SELECT COUNT(*) AS n FROM subdomains WHERE subdomain = ?".to_string();
        let mut params = vec![SqlValue::Text(subdomain.to_string())];
        if let Some(id) = exclude_id {
            sql.push_str(" AND id != ?");
            params.push(SqlValue::Integer(id));
        }
        let rows = self.db.read(&sql, &params).await?;
        Ok(rows.first().and_then(|row| row.integer("n")).unwrap_or(0) > 0)
    }

    async fn normalize_subdomain(
        &self,
        value: &Value,
        existing: Option<&Entity>,
        options: &UpsertOptions,
    ) -> Result<String, EntityStoreError> {
        let subdomain = value
            .as_str()
            .ok_or_else(|| EntityStoreError::field_invalid("subdomain"))?
            .to_lowercase();

        if !self.patterns.subdomain.is_match(&subdomain) {
            return Err(EntityStoreError::field_invalid("subdomain"));
        }
        if self.config.reserved_words.contains(&subdomain) {
            return Err(EntityStoreError::SubdomainReserved { subdomain });
        }
        if subdomain.len() > self.config.subdomain_max_length {
            return Err(EntityStoreError::field_invalid("subdomain"));
        }

        // The subdomain name is immutable once created; re-supplying the
        // current value is a no-op, anything else is rejected.
        if let Some(entity) = existing {
            if entity.field_str("subdomain") != Some(subdomain.as_str()) {
                return Err(EntityStoreError::field_invalid("subdomain"));
            }
            return Ok(subdomain);
        }

        if self.subdomain_exists(&subdomain, None).await? {
            if !options.dedupe_name {
                return Err(EntityStoreError::NameInUse { name: subdomain });
            }
            let mut number = 1u32;
            loop {
                let candidate = format!("{subdomain}-{number}");
                if !self.subdomain_exists(&candidate, None).await? {
                    return Ok(candidate);
                }
                number += 1;
            }
        }

        Ok(subdomain)
    }
}

#[async_trait]
impl EntityDefinition for SubdomainDefinition {
    fn kind(&self) -> &'static str {
        "subdomain"
    }

    fn kind_plural(&self) -> &'static str {
        "subdomains"
    }

    fn uid_prefix(&self) -> &'static str {
        "sd"
    }

    fn table(&self) -> &'static str {
        "subdomains"
    }

    fn uid_column(&self) -> &'static str {
        "uuid"
    }

    fn columns(&self) -> &ColumnMap {
        &SUBDOMAIN_COLUMNS
    }

    async fn normalize(
        &self,
        actor: &Actor,
        payload: &Map<String, Value>,
        existing: Option<&Entity>,
        options: &UpsertOptions,
    ) -> Result<NormalizedRecord, EntityStoreError> {
        let mut record = NormalizedRecord::default();

        if let Some(value) = payload.get("subdomain") {
            if !value.is_null() {
                let subdomain = self.normalize_subdomain(value, existing, options).await?;
                record.set("subdomain", SqlValue::Text(subdomain));
            }
        }

        if let Some(value) = payload.get("domain") {
            match value {
                Value::Null => record.set("domain", SqlValue::Null),
                Value::String(text) => record.set("domain", SqlValue::Text(text.to_lowercase())),
                _ => return Err(EntityStoreError::field_invalid("domain")),
            }
        }

        if let Some(value) = payload.get("root_dir") {
            record.set("root_dir_id", node_reference(value)?);
        }

        if let Some(value) = payload.get("associated_app") {
            match value {
                Value::Null | Value::Number(_) => {
                    record.set("associated_app_id", SqlValue::from_json(value));
                }
                _ => return Err(EntityStoreError::field_invalid("associated_app")),
            }
        }

        if let Some(value) = payload.get("app_owner") {
            match value {
                Value::Null | Value::Number(_) => {
                    record.set("app_owner", SqlValue::from_json(value));
                }
                _ => return Err(EntityStoreError::field_invalid("app_owner")),
            }
        }

        if existing.is_none() {
            record.uid = payload
                .get("uid")
                .and_then(Value::as_str)
                .map(str::to_string);
            record.set("user_id", SqlValue::Integer(actor.user().id));
        }

        let has_subdomain = matches!(record.get("subdomain"), Some(value) if *value != SqlValue::Null)
            || existing
                .and_then(|entity| entity.field("subdomain"))
                .is_some_and(|value| !value.is_null());
        if !has_subdomain {
            return Err(EntityStoreError::field_missing("subdomain"));
        }

        Ok(record)
    }

    /// Per-user quota, checked before any insert. The acting user's own
    /// override wins over the configured default.
    async fn before_create(&self, actor: &Actor) -> Result<(), EntityStoreError> {
        let user = actor.user();
        let rows = self
            .db
            .read(
                "SELECT COUNT(id) AS subdomain_count FROM subdomains WHERE user_id = ?",
                &[SqlValue::Integer(user.id)],
            )
            .await?;
        let count = rows
            .first()
            .and_then(|row| row.integer("subdomain_count"))
            .unwrap_or(0) as u64;

        let max = user
            .max_subdomains
            .unwrap_or(self.config.max_subdomains_per_user);
        if max > 0 && count >= max {
            return Err(EntityStoreError::LimitReached { limit: max });
        }
        Ok(())
    }

    async fn map_row(
        &self,
        _actor: &Actor,
        row: &Row,
        _params: &ReadParams,
    ) -> Result<Entity, EntityStoreError> {
        let mut fields = Map::new();
        for (key, column) in [
            ("subdomain", "subdomain"),
            ("domain", "domain"),
            ("root_dir", "root_dir_id"),
        ] {
            fields.insert(
                key.to_string(),
                row.get(column).map_or(Value::Null, SqlValue::to_json),
            );
        }
        fields.insert(
            "associated_app".to_string(),
            row.get("associated_app_id")
                .map_or(Value::Null, SqlValue::to_json),
        );
        fields.insert(
            "app_owner".to_string(),
            row.get("app_owner").map_or(Value::Null, SqlValue::to_json),
        );

        Ok(Entity {
            id: row.integer("id").unwrap_or_default(),
            uid: row.text("uuid").unwrap_or_default().to_string(),
            owner_id: row.integer("user_id"),
            app_owner_id: row.integer("app_owner"),
            protected: row.boolean("protected"),
            created_at: row.text("ts").and_then(parse_timestamp),
            fields,
        })
    }

    async fn select_scope(&self, actor: &Actor) -> Result<CompiledWhere, EntityStoreError> {
        if self
            .permissions
            .check(actor, permission::READ_ALL_SUBDOMAINS)
            .await
        {
            return Ok(CompiledWhere::empty());
        }
        Ok(CompiledWhere {
            sql: "user_id = ?".to_string(),
            params: vec![SqlValue::Integer(actor.user().id)],
        })
    }
}

/// A filesystem node reference from the payload: a bare id, or an object
/// carrying one.
fn node_reference(value: &Value) -> Result<SqlValue, EntityStoreError> {
    match value {
        Value::Null | Value::Number(_) | Value::String(_) => Ok(SqlValue::from_json(value)),
        Value::Object(object) => object
            .get("id")
            .filter(|id| id.is_number() || id.is_string())
            .map(SqlValue::from_json)
            .ok_or_else(|| EntityStoreError::field_invalid("root_dir")),
        _ => Err(EntityStoreError::field_invalid("root_dir")),
    }
}
