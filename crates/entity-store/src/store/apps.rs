use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::actor::Actor;
use crate::config::{CompiledPatterns, Config, ConfigError};
use crate::db::{Database, Row, SqlValue};
use crate::error::EntityStoreError;
use crate::events::EventBus;
use crate::predicate::{ColumnMap, CompiledWhere};
use crate::providers::AppCollaborators;
use crate::store::{
    Entity, EntityDefinition, NormalizedRecord, ReadParams, UpsertOptions, generate_uid,
    parse_timestamp,
};

const APP_COLUMNS: ColumnMap = ColumnMap::new(&[
    ("uid", "uid"),
    ("name", "name"),
    ("title", "title"),
    ("owner", "owner_user_id"),
    ("app_owner", "app_owner"),
    ("approved_for_listing", "approved_for_listing"),
]);

/// Moderation flags visible to the owning user only.
const REDACTED_FIELDS: &[&str] = &[
    "approved_for_listing",
    "approved_for_opening_items",
    "approved_for_incentive_program",
];

const REQUIRED_FIELDS: &[&str] = &["name", "title", "index_url"];

/// The application entity store definition.
pub struct AppDefinition {
    db: Arc<dyn Database>,
    events: Arc<dyn EventBus>,
    collaborators: AppCollaborators,
    config: Arc<Config>,
    patterns: CompiledPatterns,
}

impl AppDefinition {
    pub fn new(
        db: Arc<dyn Database>,
        events: Arc<dyn EventBus>,
        collaborators: AppCollaborators,
        config: Arc<Config>,
    ) -> Result<Self, ConfigError> {
        let patterns = config.compile()?;
        Ok(Self {
            db,
            events,
            collaborators,
            config,
            patterns,
        })
    }

    async fn name_exists(
        &self,
        name: &str,
        exclude_id: Option<i64>,
    ) -> Result<bool, EntityStoreError> {
        let mut sql = "SELECT COUNT(*) AS n FROM apps WHERE name = ?".to_string();
        let mut params = vec![SqlValue::Text(name.to_string())];
        if let Some(id) = exclude_id {
            sql.push_str(" AND id != ?");
            params.push(SqlValue::Integer(id));
        }
        let rows = self.db.read(&sql, &params).await?;
        Ok(rows.first().and_then(|row| row.integer("n")).unwrap_or(0) > 0)
    }

    async fn normalize_name(
        &self,
        value: &Value,
        existing: Option<&Entity>,
        options: &UpsertOptions,
    ) -> Result<String, EntityStoreError> {
        let name = value
            .as_str()
            .ok_or_else(|| EntityStoreError::field_invalid("name"))?;
        if !self.patterns.app_name.is_match(name) {
            return Err(EntityStoreError::field_invalid("name"));
        }
        if name.len() > self.config.app_name_max_length {
            return Err(EntityStoreError::field_invalid("name"));
        }

        let exclude_id = existing.map(|entity| entity.id);
        let is_name_change = existing.is_none_or(|entity| entity.field_str("name") != Some(name));
        if is_name_change && self.name_exists(name, exclude_id).await? {
            if !options.dedupe_name {
                return Err(EntityStoreError::NameInUse {
                    name: name.to_string(),
                });
            }
            let mut number = 1u32;
            loop {
                let candidate = format!("{name}-{number}");
                if !self.name_exists(&candidate, exclude_id).await? {
                    return Ok(candidate);
                }
                number += 1;
            }
        }

        Ok(name.to_string())
    }

    /// Diffs old vs. new and emits the domain events for semantically
    /// significant changes.
    async fn emit_change_events(
        &self,
        uid: &str,
        record: &NormalizedRecord,
        existing: Option<&Entity>,
    ) {
        if let Some(icon) = record.get("icon").and_then(SqlValue::as_text) {
            let old_icon = existing.and_then(|entity| entity.field_str("icon"));
            if old_icon != Some(icon) {
                self.events
                    .emit("app.new-icon", json!({ "app_uid": uid, "data_url": icon }))
                    .await;
            }
        }

        if let (Some(entity), Some(name)) = (existing, record.get("name").and_then(SqlValue::as_text))
        {
            let old_name = entity.field_str("name");
            if old_name != Some(name) {
                self.events
                    .emit(
                        "app.rename",
                        json!({ "app_uid": uid, "new_name": name, "old_name": old_name }),
                    )
                    .await;
            }
        }
    }

    /// Replaces the association set for an app: delete, then reinsert the
    /// full set from the payload.
    async fn sync_associations(
        &self,
        app_id: i64,
        associations: &[String],
    ) -> Result<(), EntityStoreError> {
        self.db
            .write(
                "DELETE FROM app_filetype_association WHERE app_id = ?",
                &[SqlValue::Integer(app_id)],
            )
            .await?;
        if associations.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["(?, ?)"; associations.len()].join(", ");
        let mut params = Vec::with_capacity(associations.len() * 2);
        for association in associations {
            params.push(SqlValue::Integer(app_id));
            params.push(SqlValue::Text(association.to_lowercase()));
        }
        self.db
            .write(
                &format!(
                    "INSERT INTO app_filetype_association (app_id, type) VALUES {placeholders}"
                ),
                &params,
            )
            .await?;
        Ok(())
    }

    /// Provisions the hosting subdomain for an app created or updated with
    /// a `subdomain` + `source_directory` pair, then binds it to the app.
    async fn provision_hosting_subdomain(
        &self,
        actor: &Actor,
        app_id: i64,
        record: &NormalizedRecord,
    ) -> Result<(), EntityStoreError> {
        let Some(subdomain) = record.extras.get("hosting_subdomain").and_then(Value::as_str) else {
            return Ok(());
        };
        let root_dir = record
            .extras
            .get("hosting_root_dir")
            .cloned()
            .unwrap_or(Value::Null);

        self.db
            .write(
                "INSERT OR IGNORE INTO subdomains (subdomain, user_id, root_dir_id, uuid) \
                 VALUES (?, ?, ?, ?)",
                &[
                    SqlValue::Text(subdomain.to_string()),
                    SqlValue::Integer(actor.user().id),
                    SqlValue::from_json(&root_dir),
                    SqlValue::Text(generate_uid("sd")),
                ],
            )
            .await?;
        self.db
            .write(
                "UPDATE subdomains SET associated_app_id = ? WHERE subdomain = ?",
                &[
                    SqlValue::Integer(app_id),
                    SqlValue::Text(subdomain.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl EntityDefinition for AppDefinition {
    fn kind(&self) -> &'static str {
        "app"
    }

    fn kind_plural(&self) -> &'static str {
        "apps"
    }

    fn uid_prefix(&self) -> &'static str {
        "app"
    }

    fn table(&self) -> &'static str {
        "apps"
    }

    fn uid_column(&self) -> &'static str {
        "uid"
    }

    fn columns(&self) -> &ColumnMap {
        &APP_COLUMNS
    }

    async fn normalize(
        &self,
        actor: &Actor,
        payload: &Map<String, Value>,
        existing: Option<&Entity>,
        options: &UpsertOptions,
    ) -> Result<NormalizedRecord, EntityStoreError> {
        let mut record = NormalizedRecord::default();

        if let Some(value) = payload.get("name") {
            if !value.is_null() {
                let name = self.normalize_name(value, existing, options).await?;
                record.set("name", SqlValue::Text(name));
            }
        }

        if let Some(value) = payload.get("title") {
            match value {
                Value::Null => record.set("title", SqlValue::Null),
                Value::String(title) => {
                    if title.len() > self.config.app_title_max_length {
                        return Err(EntityStoreError::field_invalid("title"));
                    }
                    record.set("title", SqlValue::Text(title.clone()));
                }
                _ => return Err(EntityStoreError::field_invalid("title")),
            }
        }

        for key in ["description", "icon", "index_url"] {
            if let Some(value) = payload.get(key) {
                match value {
                    Value::Null => record.set(key, SqlValue::Null),
                    Value::String(text) => record.set(key, SqlValue::Text(text.clone())),
                    _ => return Err(EntityStoreError::field_invalid(key)),
                }
            }
        }

        if let Some(value) = payload.get("metadata") {
            if value.is_null() {
                record.set("metadata", SqlValue::Null);
            } else {
                let raw = serde_json::to_string(value)
                    .map_err(|_| EntityStoreError::field_invalid("metadata"))?;
                record.set("metadata", SqlValue::Text(raw));
            }
        }

        for key in ["maximize_on_start", "background"] {
            if let Some(value) = payload.get(key) {
                record.set(key, SqlValue::Integer(coerce_flag(key, value)?));
            }
        }

        if let Some(value) = payload.get("app_owner") {
            match value {
                Value::Null => record.set("app_owner", SqlValue::Null),
                Value::Number(_) => record.set("app_owner", SqlValue::from_json(value)),
                Value::Object(object) => {
                    let id = object.get("id").and_then(Value::as_i64).ok_or_else(|| {
                        EntityStoreError::field_invalid("app_owner")
                    })?;
                    record.set("app_owner", SqlValue::Integer(id));
                }
                _ => return Err(EntityStoreError::field_invalid("app_owner")),
            }
        }

        match payload.get("filetype_associations") {
            Some(Value::Array(items)) => {
                let mut associations = Vec::with_capacity(items.len());
                for item in items {
                    let text = item.as_str().ok_or_else(|| {
                        EntityStoreError::field_invalid("filetype_associations")
                    })?;
                    associations.push(text.to_string());
                }
                record.associations = Some(associations);
            }
            Some(Value::Null) | None => {
                if existing.is_none() {
                    record.associations = Some(Vec::new());
                }
            }
            Some(_) => {
                return Err(EntityStoreError::field_invalid("filetype_associations"));
            }
        }

        if existing.is_none() {
            record.uid = payload
                .get("uid")
                .and_then(Value::as_str)
                .map(str::to_string);
            record.set("owner_user_id", SqlValue::Integer(actor.user().id));
        }

        // A column present in the record wins over the stored value, so an
        // explicit null counts as clearing the field.
        for &key in REQUIRED_FIELDS {
            let populated = match record.get(key) {
                Some(value) => *value != SqlValue::Null,
                None => existing
                    .and_then(|entity| entity.field(key))
                    .is_some_and(|value| !value.is_null()),
            };
            if !populated {
                return Err(EntityStoreError::field_missing(key));
            }
        }

        // An app shipped with a subdomain and a source directory is hosted:
        // its index_url is derived, overriding any supplied value.
        if let (Some(subdomain), Some(source_directory)) = (
            payload.get("subdomain").and_then(Value::as_str),
            payload.get("source_directory").filter(|value| !value.is_null()),
        ) {
            let subdomain = subdomain.to_lowercase();
            let derived = format!(
                "{}://{}.{}",
                self.config.protocol, subdomain, self.config.static_hosting_domain
            );
            record.set("index_url", SqlValue::Text(derived));
            record
                .extras
                .insert("hosting_subdomain".to_string(), Value::from(subdomain));
            record
                .extras
                .insert("hosting_root_dir".to_string(), source_directory.clone());
        }

        Ok(record)
    }

    async fn map_row(
        &self,
        actor: &Actor,
        row: &Row,
        params: &ReadParams,
    ) -> Result<Entity, EntityStoreError> {
        let id = row.integer("id").unwrap_or_default();
        let uid = row.text("uid").unwrap_or_default().to_string();
        let owner_id = row.integer("owner_user_id");
        let app_owner_id = row.integer("app_owner");

        let mut fields = Map::new();
        fields.insert("id".to_string(), Value::from(id));
        for key in ["name", "title", "description", "icon", "index_url", "last_review"] {
            fields.insert(
                key.to_string(),
                row.text(key).map_or(Value::Null, Value::from),
            );
        }
        for key in [
            "maximize_on_start",
            "background",
            "approved_for_listing",
            "approved_for_opening_items",
            "approved_for_incentive_program",
        ] {
            fields.insert(key.to_string(), Value::from(row.boolean(key)));
        }
        fields.insert(
            "app_owner".to_string(),
            app_owner_id.map_or(Value::Null, |id| json!({ "id": id })),
        );

        // Opaque JSON; a row that predates the JSON format falls back to the
        // raw string.
        if let Some(raw) = row.text("metadata") {
            let metadata = serde_json::from_str(raw).unwrap_or_else(|_| Value::from(raw));
            fields.insert("metadata".to_string(), metadata);
        }

        let association_rows = self
            .db
            .read(
                "SELECT type FROM app_filetype_association WHERE app_id = ?",
                &[SqlValue::Integer(id)],
            )
            .await?;
        fields.insert(
            "filetype_associations".to_string(),
            Value::Array(
                association_rows
                    .iter()
                    .filter_map(|association| association.text("type").map(Value::from))
                    .collect(),
            ),
        );

        let is_owner_user =
            matches!(actor, Actor::User { user } if owner_id == Some(user.id));
        if !is_owner_user {
            for &key in REDACTED_FIELDS {
                fields.remove(key);
            }
        }

        if let Some(size) = params.icon_size {
            let stored_icon = fields.get("icon").and_then(Value::as_str).map(str::to_string);
            match self
                .collaborators
                .icons
                .render(&uid, stored_icon.as_deref(), size)
                .await
            {
                Ok(data_url) => {
                    fields.insert("icon".to_string(), Value::from(data_url));
                }
                Err(error) => {
                    self.collaborators
                        .errors
                        .report("AppStore:icon", &error.to_string())
                        .await;
                }
            }
        }

        if let Some(period) = &params.stats_period {
            match self
                .collaborators
                .stats
                .stats(&uid, period, params.stats_grouping.as_deref())
                .await
            {
                Ok(stats) => {
                    fields.insert("stats".to_string(), stats);
                }
                Err(error) => {
                    self.collaborators
                        .errors
                        .report("AppStore:stats", &error.to_string())
                        .await;
                }
            }
        }

        let created_from_origin = match fields
            .get("index_url")
            .and_then(Value::as_str)
            .and_then(origin_from_url)
        {
            Some(origin) => match self
                .collaborators
                .origins
                .app_uid_for_origin(&origin)
                .await
            {
                Ok(Some(expected)) if expected == uid => Value::from(origin),
                Ok(_) => Value::Null,
                Err(error) => {
                    self.collaborators
                        .errors
                        .report("AppStore:origin", &error.to_string())
                        .await;
                    Value::Null
                }
            },
            None => Value::Null,
        };
        fields.insert("created_from_origin".to_string(), created_from_origin);

        let entity = Entity {
            id,
            uid: uid.clone(),
            owner_id,
            app_owner_id,
            protected: row.boolean("protected"),
            created_at: row.text("timestamp").and_then(parse_timestamp),
            fields,
        };

        self.collaborators
            .cache
            .refresh(&uid, &entity.to_value())
            .await;

        Ok(entity)
    }

    async fn select_scope(&self, actor: &Actor) -> Result<CompiledWhere, EntityStoreError> {
        let mut clauses = vec![
            "approved_for_listing = 1".to_string(),
            "owner_user_id = ?".to_string(),
        ];
        let mut params = vec![SqlValue::Integer(actor.user().id)];

        // An app is also allowed to see its own entry.
        if let Some(app) = actor.app() {
            clauses.push("uid = ?".to_string());
            params.push(SqlValue::Text(app.uid.clone()));
        }

        Ok(CompiledWhere {
            sql: format!("({})", clauses.join(" OR ")),
            params,
        })
    }

    async fn after_write(
        &self,
        actor: &Actor,
        entity_id: i64,
        uid: &str,
        record: &NormalizedRecord,
        existing: Option<&Entity>,
    ) -> Result<(), EntityStoreError> {
        if let Some(associations) = &record.associations {
            self.sync_associations(entity_id, associations).await?;
        }
        self.provision_hosting_subdomain(actor, entity_id, record)
            .await?;
        self.emit_change_events(uid, record, existing).await;
        Ok(())
    }

    async fn after_delete(&self, entity: &Entity) -> Result<(), EntityStoreError> {
        self.db
            .write(
                "DELETE FROM app_filetype_association WHERE app_id = ?",
                &[SqlValue::Integer(entity.id)],
            )
            .await?;
        self.collaborators.cache.invalidate(&entity.uid).await;
        Ok(())
    }
}

fn coerce_flag(key: &str, value: &Value) -> Result<i64, EntityStoreError> {
    match value {
        Value::Bool(flag) => Ok(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(0) => Ok(0),
            Some(1) => Ok(1),
            _ => Err(EntityStoreError::field_invalid(key)),
        },
        _ => Err(EntityStoreError::field_invalid(key)),
    }
}

/// `scheme://host[:port]` of a URL, or nothing for unparseable input.
fn origin_from_url(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split(['/', '?', '#']).next()?;
    if host.is_empty() {
        return None;
    }
    Some(format!("{scheme}://{host}"))
}

#[cfg(test)]
mod tests {
    use super::origin_from_url;

    #[test]
    fn origin_strips_path_and_query() {
        assert_eq!(
            origin_from_url("https://demo.site.example/index.html?x=1"),
            Some("https://demo.site.example".to_string())
        );
        assert_eq!(
            origin_from_url("http://localhost:4100/app"),
            Some("http://localhost:4100".to_string())
        );
        assert_eq!(origin_from_url("not a url"), None);
        assert_eq!(origin_from_url("https://"), None);
    }
}
