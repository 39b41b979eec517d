use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::actor::Actor;
use crate::db::{Database, Row, SqlValue};
use crate::error::EntityStoreError;
use crate::permission::{self, PermissionChecker};
use crate::predicate::{ColumnMap, CompiledWhere, Predicate, compile};

pub mod apps;
pub mod subdomains;

#[cfg(test)]
mod tests;

/// A mapped domain entity: the common ownable/permissioned attributes plus
/// the kind-specific fields as a JSON object.
#[derive(Debug, Clone)]
pub struct Entity {
    /// Internal storage id; never exposed as an identifier to callers.
    pub id: i64,
    pub uid: String,
    pub owner_id: Option<i64>,
    pub app_owner_id: Option<i64>,
    pub protected: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub fields: Map<String, Value>,
}

impl Entity {
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// The caller-facing JSON shape.
    pub fn to_value(&self) -> Value {
        let mut out = self.fields.clone();
        out.insert("uid".to_string(), Value::from(self.uid.clone()));
        out.insert(
            "owner".to_string(),
            self.owner_id.map_or(Value::Null, |id| json!({ "id": id })),
        );
        out.insert("protected".to_string(), Value::from(self.protected));
        out.insert(
            "created_at".to_string(),
            self.created_at.map_or(Value::Null, |at| {
                Value::from(at.format("%Y-%m-%d %H:%M:%S").to_string())
            }),
        );
        Value::Object(out)
    }
}

/// Optional read-time enrichment requests, passed through to collaborator
/// services by the row mappers.
#[derive(Debug, Clone, Default)]
pub struct ReadParams {
    pub icon_size: Option<u32>,
    pub stats_period: Option<String>,
    pub stats_grouping: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub predicate: Option<Predicate>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub params: ReadParams,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertOptions {
    /// Resolve an identity-field collision by appending `-1`, `-2`, …
    /// instead of failing with a name-in-use error.
    pub dedupe_name: bool,
}

/// The canonical write produced by a normalization pass. `columns` holds
/// only the physical columns actually present in the payload; an update
/// with no columns is an idempotent no-op.
#[derive(Debug, Clone, Default)]
pub struct NormalizedRecord {
    /// Caller-supplied uid, honored on creation only.
    pub uid: Option<String>,
    pub columns: Vec<(String, SqlValue)>,
    /// Full replacement set for the child association table, when the
    /// payload specified one (or on creation).
    pub associations: Option<Vec<String>>,
    /// Definition-private data carried from normalization to the
    /// side-effect pass.
    pub extras: Map<String, Value>,
}

impl NormalizedRecord {
    pub fn set(&mut self, column: &str, value: SqlValue) {
        if let Some(entry) = self.columns.iter_mut().find(|(name, _)| name == column) {
            entry.1 = value;
        } else {
            self.columns.push((column.to_string(), value));
        }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// Everything kind-specific about one entity store: physical naming, the
/// normalization pipeline, row mapping, select scoping, and post-mutation
/// side effects. The engine owns the operation state machine and the
/// ownership/visibility checks.
#[async_trait]
pub trait EntityDefinition: Send + Sync {
    /// Kind tag used in uids and permission strings ("app", "subdomain").
    fn kind(&self) -> &'static str;
    /// Plural used in delegated-write permission strings.
    fn kind_plural(&self) -> &'static str;
    /// Uid prefix ("app", "sd").
    fn uid_prefix(&self) -> &'static str;
    fn table(&self) -> &'static str;
    fn uid_column(&self) -> &'static str;
    fn columns(&self) -> &ColumnMap;

    /// Validates and transforms an incoming payload into a canonical record.
    async fn normalize(
        &self,
        actor: &Actor,
        payload: &Map<String, Value>,
        existing: Option<&Entity>,
        options: &UpsertOptions,
    ) -> Result<NormalizedRecord, EntityStoreError>;

    /// Pre-creation invariants (quotas). Runs before normalization.
    async fn before_create(&self, actor: &Actor) -> Result<(), EntityStoreError> {
        let _ = actor;
        Ok(())
    }

    /// Converts a raw storage row into a mapped entity.
    async fn map_row(
        &self,
        actor: &Actor,
        row: &Row,
        params: &ReadParams,
    ) -> Result<Entity, EntityStoreError>;

    /// Visibility scoping ANDed into every select, appropriate to the actor.
    async fn select_scope(&self, actor: &Actor) -> Result<CompiledWhere, EntityStoreError>;

    /// Post-write side effects: association resync, derived sub-records,
    /// event emission, cache refresh.
    async fn after_write(
        &self,
        actor: &Actor,
        entity_id: i64,
        uid: &str,
        record: &NormalizedRecord,
        existing: Option<&Entity>,
    ) -> Result<(), EntityStoreError> {
        let _ = (actor, entity_id, uid, record, existing);
        Ok(())
    }

    /// Dependent-row cleanup after the primary row is deleted.
    async fn after_delete(&self, entity: &Entity) -> Result<(), EntityStoreError> {
        let _ = entity;
        Ok(())
    }
}

/// Generic predicate-filtered entity store: one engine, parameterized by an
/// [`EntityDefinition`].
///
/// Mutations are two separate statements (row write, then child-association
/// resync) with no wrapping transaction; a crash between them leaves
/// associations stale until the next successful update, which recomputes
/// them in full. The uniqueness pre-checks in normalization are a fast
/// rejection path only; the storage engine's UNIQUE constraints are the
/// actual guarantee under races.
#[derive(Clone)]
pub struct EntityStore {
    definition: Arc<dyn EntityDefinition>,
    db: Arc<dyn Database>,
    permissions: Arc<dyn PermissionChecker>,
}

impl EntityStore {
    pub fn new(
        definition: Arc<dyn EntityDefinition>,
        db: Arc<dyn Database>,
        permissions: Arc<dyn PermissionChecker>,
    ) -> Self {
        Self {
            definition,
            db,
            permissions,
        }
    }

    pub async fn create(
        &self,
        actor: &Actor,
        payload: &Map<String, Value>,
        options: &UpsertOptions,
    ) -> Result<Entity, EntityStoreError> {
        self.upsert(actor, None, payload, options).await
    }

    pub async fn update(
        &self,
        actor: &Actor,
        id: &str,
        payload: &Map<String, Value>,
        options: &UpsertOptions,
    ) -> Result<Entity, EntityStoreError> {
        self.upsert(actor, Some(id), payload, options).await
    }

    /// Creates (`id: None`) or mutates (`id: Some`) an entity. An id that
    /// matches no visible row fails with `EntityNotFound`: update-by-id
    /// never silently creates.
    pub async fn upsert(
        &self,
        actor: &Actor,
        id: Option<&str>,
        payload: &Map<String, Value>,
        options: &UpsertOptions,
    ) -> Result<Entity, EntityStoreError> {
        let existing = match id {
            Some(identifier) => Some(
                self.read(
                    actor,
                    &Predicate::Uid(identifier.to_string()),
                    &ReadParams::default(),
                )
                .await?
                .ok_or_else(|| EntityStoreError::EntityNotFound {
                    identifier: identifier.to_string(),
                })?,
            ),
            None => None,
        };

        if let Some(entity) = &existing {
            self.assert_owner(actor, entity).await?;
        } else {
            self.definition.before_create(actor).await?;
        }

        let record = self
            .definition
            .normalize(actor, payload, existing.as_ref(), options)
            .await?;

        let (entity_id, uid) = match &existing {
            Some(entity) => {
                self.run_update(&entity.uid, &record).await?;
                (entity.id, entity.uid.clone())
            }
            None => {
                let uid = record
                    .uid
                    .clone()
                    .unwrap_or_else(|| generate_uid(self.definition.uid_prefix()));
                let entity_id = self.run_insert(&uid, &record).await?;
                (entity_id, uid)
            }
        };

        self.definition
            .after_write(actor, entity_id, &uid, &record, existing.as_ref())
            .await?;

        self.read(actor, &Predicate::Uid(uid.clone()), &ReadParams::default())
            .await?
            .ok_or(EntityStoreError::EntityNotFound { identifier: uid })
    }

    /// Deletes an entity and its dependent child rows. Returns the uid.
    pub async fn delete(
        &self,
        actor: &Actor,
        identifier: &str,
    ) -> Result<String, EntityStoreError> {
        let existing = self
            .read(
                actor,
                &Predicate::Uid(identifier.to_string()),
                &ReadParams::default(),
            )
            .await?
            .ok_or_else(|| EntityStoreError::EntityNotFound {
                identifier: identifier.to_string(),
            })?;

        self.assert_owner(actor, &existing).await?;

        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.definition.table(),
            self.definition.uid_column()
        );
        self.db
            .write(&sql, &[SqlValue::Text(existing.uid.clone())])
            .await?;
        self.definition.after_delete(&existing).await?;

        Ok(existing.uid)
    }

    /// Fetches at most one entity. A hidden entity is indistinguishable from
    /// an absent one.
    pub async fn read(
        &self,
        actor: &Actor,
        predicate: &Predicate,
        params: &ReadParams,
    ) -> Result<Option<Entity>, EntityStoreError> {
        let clause = compile(
            Some(predicate),
            self.definition.columns(),
            self.definition.uid_column(),
        );
        if clause.is_empty() {
            return Err(EntityStoreError::InvalidId);
        }

        let sql = format!(
            "SELECT * FROM {} WHERE {} LIMIT 1",
            self.definition.table(),
            clause.sql
        );
        let rows = self.db.read(&sql, &clause.params).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let entity = self.definition.map_row(actor, row, params).await?;
        if !self.can_read(actor, &entity).await {
            return Ok(None);
        }
        Ok(Some(entity))
    }

    /// Lists entities matching the predicate, scoped to what the actor may
    /// see (SQL-level scoping plus a mapped-entity visibility pass), most
    /// recently inserted first.
    pub async fn select(
        &self,
        actor: &Actor,
        options: &SelectOptions,
    ) -> Result<Vec<Entity>, EntityStoreError> {
        if options.offset.is_some() && options.limit.is_none() {
            return Err(EntityStoreError::field_invalid("offset"));
        }

        let mut parts = Vec::new();
        let mut params = Vec::new();

        if let Some(predicate) = &options.predicate {
            let clause = compile(
                Some(predicate),
                self.definition.columns(),
                self.definition.uid_column(),
            );
            if !clause.is_empty() {
                parts.push(clause.sql);
                params.extend(clause.params);
            }
        }

        let scope = self.definition.select_scope(actor).await?;
        if !scope.is_empty() {
            parts.push(scope.sql);
            params.extend(scope.params);
        }

        let mut sql = format!("SELECT * FROM {}", self.definition.table());
        if !parts.is_empty() {
            sql.push_str(&format!(" WHERE {}", parts.join(" AND ")));
        }
        sql.push_str(" ORDER BY id DESC");
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = options.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        let rows = self.db.read(&sql, &params).await?;
        let mut results = Vec::new();
        for row in &rows {
            let entity = self.definition.map_row(actor, row, &options.params).await?;
            if self.can_read(actor, &entity).await {
                results.push(entity);
            }
        }
        Ok(results)
    }

    /// Whether the actor may see the entity. Unprotected entities are
    /// visible to everyone; protected ones to the app itself, the owner, or
    /// holders of a resource-scoped access grant.
    pub async fn can_read(&self, actor: &Actor, entity: &Entity) -> bool {
        if !entity.protected {
            return true;
        }

        if let Actor::AppUnderUser { app, .. } = actor {
            if app.uid == entity.uid {
                return true;
            }
        }
        if let Actor::User { user } = actor {
            if entity.owner_id == Some(user.id) {
                return true;
            }
        }

        let access = permission::access_permission(self.definition.kind(), &entity.uid);
        !self.permissions.scan(actor, &access).await.is_empty()
    }

    /// Whether the actor may mutate the entity; `Forbidden` otherwise.
    /// Precedence: global override permission, then owning user, then an
    /// app holding the delegated write permission for this user or named as
    /// the entity's app owner.
    pub async fn assert_owner(
        &self,
        actor: &Actor,
        entity: &Entity,
    ) -> Result<(), EntityStoreError> {
        if self
            .permissions
            .check(actor, permission::WRITE_ALL_OWNERS)
            .await
        {
            return Ok(());
        }

        match actor {
            Actor::User { user } => {
                if entity.owner_id == Some(user.id) {
                    return Ok(());
                }
            }
            Actor::AppUnderUser { user, app } => {
                let delegated = permission::delegated_write_permission(
                    self.definition.kind_plural(),
                    &user.uuid,
                );
                if self.permissions.check(actor, &delegated).await {
                    return Ok(());
                }
                if entity.app_owner_id == Some(app.id) {
                    return Ok(());
                }
            }
        }

        Err(EntityStoreError::Forbidden)
    }

    async fn run_insert(
        &self,
        uid: &str,
        record: &NormalizedRecord,
    ) -> Result<i64, EntityStoreError> {
        let mut columns = vec![self.definition.uid_column().to_string()];
        let mut params = vec![SqlValue::Text(uid.to_string())];
        for (column, value) in &record.columns {
            columns.push(column.clone());
            params.push(value.clone());
        }

        let placeholders = vec!["?"; params.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.definition.table(),
            columns.join(", "),
            placeholders
        );
        let outcome = self.db.write(&sql, &params).await?;
        Ok(outcome.last_insert_id)
    }

    async fn run_update(
        &self,
        uid: &str,
        record: &NormalizedRecord,
    ) -> Result<(), EntityStoreError> {
        if record.columns.is_empty() {
            return Ok(());
        }

        let assignments = record
            .columns
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut params: Vec<SqlValue> = record
            .columns
            .iter()
            .map(|(_, value)| value.clone())
            .collect();
        params.push(SqlValue::Text(uid.to_string()));

        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.definition.table(),
            assignments,
            self.definition.uid_column()
        );
        self.db.write(&sql, &params).await?;
        Ok(())
    }
}

/// Fresh kind-prefixed external identifier, e.g. `app-<uuid4>`.
pub fn generate_uid(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// Parses the storage timestamp format (`CURRENT_TIMESTAMP` text), with an
/// RFC 3339 fallback.
pub(crate) fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .ok()
}
