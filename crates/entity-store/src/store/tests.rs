use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::EntityStores;
use crate::actor::{Actor, AppHandle, User};
use crate::config::Config;
use crate::db::{self, Database, SqlValue};
use crate::error::EntityStoreError;
use crate::events::RecordingEventBus;
use crate::permission::{self, StaticPermissions};
use crate::predicate::Predicate;
use crate::providers::{
    AppCollaborators, AppStatsProvider, IconProvider, MemoryAppCache, ProviderError,
    RecordingErrorReporter, StaticOriginResolver, UnavailableIconProvider,
};
use crate::schema;
use crate::store::{ReadParams, SelectOptions, UpsertOptions};

struct StaticIconProvider;

#[async_trait]
impl IconProvider for StaticIconProvider {
    async fn render(
        &self,
        app_uid: &str,
        _stored_icon: Option<&str>,
        size: u32,
    ) -> Result<String, ProviderError> {
        Ok(format!("data:image/png;base64,{app_uid}@{size}"))
    }
}

struct StaticStatsProvider;

#[async_trait]
impl AppStatsProvider for StaticStatsProvider {
    async fn stats(
        &self,
        _app_uid: &str,
        period: &str,
        grouping: Option<&str>,
    ) -> Result<Value, ProviderError> {
        Ok(json!({ "period": period, "grouping": grouping, "open_count": 0 }))
    }
}

struct Harness {
    stores: EntityStores,
    db: Arc<dyn Database>,
    permissions: Arc<StaticPermissions>,
    events: Arc<RecordingEventBus>,
    errors: Arc<RecordingErrorReporter>,
    cache: Arc<MemoryAppCache>,
    origins: Arc<StaticOriginResolver>,
}

async fn harness() -> Result<Harness> {
    harness_with(|_| {}).await
}

async fn harness_with(adjust: impl FnOnce(&mut AppCollaborators)) -> Result<Harness> {
    let database = db::memory()?;
    schema::migrate(database.as_ref()).await?;

    let permissions = StaticPermissions::shared();
    let events = RecordingEventBus::shared();
    let errors = RecordingErrorReporter::shared();
    let cache = MemoryAppCache::shared();
    let origins = StaticOriginResolver::shared();

    let mut collaborators = AppCollaborators {
        icons: Arc::new(StaticIconProvider),
        stats: Arc::new(StaticStatsProvider),
        origins: origins.clone(),
        errors: errors.clone(),
        cache: cache.clone(),
    };
    adjust(&mut collaborators);

    let stores = EntityStores::build(
        database.clone(),
        permissions.clone(),
        events.clone(),
        collaborators,
        Arc::new(Config::default()),
    )?;

    Ok(Harness {
        stores,
        db: database,
        permissions,
        events,
        errors,
        cache,
        origins,
    })
}

fn user_actor(id: i64, username: &str) -> Actor {
    Actor::User {
        user: User {
            id,
            uuid: format!("user-uuid-{id}"),
            username: username.to_string(),
            max_subdomains: None,
        },
    }
}

fn app_actor(user_id: i64, app_id: i64, app_uid: &str) -> Actor {
    Actor::AppUnderUser {
        user: User {
            id: user_id,
            uuid: format!("user-uuid-{user_id}"),
            username: format!("user-{user_id}"),
            max_subdomains: None,
        },
        app: AppHandle {
            id: app_id,
            uid: app_uid.to_string(),
        },
    }
}

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

fn app_payload(name: &str) -> Map<String, Value> {
    payload(json!({
        "name": name,
        "title": "Demo",
        "index_url": "https://demo.example/start",
    }))
}

#[tokio::test]
async fn created_app_round_trips_on_read() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(
            &alice,
            &payload(json!({
                "name": "demo",
                "title": "Demo",
                "description": "a demo app",
                "index_url": "https://demo.example/start",
                "metadata": { "fullpage": true },
                "maximize_on_start": true,
                "filetype_associations": ["TXT", "md"],
            })),
            &UpsertOptions::default(),
        )
        .await
        .context("create app")?;

    assert!(created.uid.starts_with("app-"));
    assert_eq!(created.owner_id, Some(1));
    assert!(created.created_at.is_some());

    let read = h
        .stores
        .apps
        .read(
            &alice,
            &Predicate::Uid(created.uid.clone()),
            &ReadParams::default(),
        )
        .await?
        .context("read back")?;

    assert_eq!(read.uid, created.uid);
    assert_eq!(read.field_str("name"), Some("demo"));
    assert_eq!(read.field_str("title"), Some("Demo"));
    assert_eq!(read.field_str("description"), Some("a demo app"));
    assert_eq!(read.field_str("index_url"), Some("https://demo.example/start"));
    assert_eq!(read.field("metadata"), Some(&json!({ "fullpage": true })));
    assert_eq!(read.field("maximize_on_start"), Some(&json!(true)));
    assert_eq!(read.field("background"), Some(&json!(false)));
    // Associations are stored lowercased.
    assert_eq!(
        read.field("filetype_associations"),
        Some(&json!(["txt", "md"]))
    );
    Ok(())
}

#[tokio::test]
async fn update_never_reassigns_uid_or_owner() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;

    let updated = h
        .stores
        .apps
        .update(
            &alice,
            &created.uid,
            &payload(json!({
                "uid": "app-forged",
                "owner": { "id": 999 },
                "title": "Renamed Title",
            })),
            &UpsertOptions::default(),
        )
        .await?;

    assert_eq!(updated.uid, created.uid);
    assert_eq!(updated.owner_id, created.owner_id);
    assert_eq!(updated.field_str("title"), Some("Renamed Title"));
    Ok(())
}

#[tokio::test]
async fn duplicate_name_fails_unless_dedupe_requested() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    h.stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;

    let error = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await
        .expect_err("duplicate name should fail");
    assert!(matches!(error, EntityStoreError::NameInUse { ref name } if name == "demo"));

    let deduped = h
        .stores
        .apps
        .create(
            &alice,
            &app_payload("demo"),
            &UpsertOptions { dedupe_name: true },
        )
        .await?;
    assert_eq!(deduped.field_str("name"), Some("demo-1"));

    let deduped_again = h
        .stores
        .apps
        .create(
            &alice,
            &app_payload("demo"),
            &UpsertOptions { dedupe_name: true },
        )
        .await?;
    assert_eq!(deduped_again.field_str("name"), Some("demo-2"));
    Ok(())
}

#[tokio::test]
async fn protected_entity_is_hidden_without_a_grant() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");
    let bob = user_actor(2, "bob");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;

    // Everyone can read an unprotected entity.
    assert!(
        h.stores
            .apps
            .read(&bob, &Predicate::Uid(created.uid.clone()), &ReadParams::default())
            .await?
            .is_some()
    );

    // Protection is a moderation decision made outside this layer.
    h.db.write(
        "UPDATE apps SET protected = 1 WHERE uid = ?",
        &[SqlValue::Text(created.uid.clone())],
    )
    .await?;

    let as_owner = h
        .stores
        .apps
        .read(&alice, &Predicate::Uid(created.uid.clone()), &ReadParams::default())
        .await?;
    assert!(as_owner.is_some());

    // Hidden is indistinguishable from absent.
    let as_bob = h
        .stores
        .apps
        .read(&bob, &Predicate::Uid(created.uid.clone()), &ReadParams::default())
        .await?;
    assert!(as_bob.is_none());

    h.permissions
        .grant_user(2, &permission::access_permission("app", &created.uid))
        .await;
    let as_bob_with_grant = h
        .stores
        .apps
        .read(&bob, &Predicate::Uid(created.uid.clone()), &ReadParams::default())
        .await?;
    assert!(as_bob_with_grant.is_some());

    // The app itself can always see its own protected record.
    let as_itself = app_actor(3, created.id, &created.uid);
    assert!(
        h.stores
            .apps
            .read(&as_itself, &Predicate::Uid(created.uid.clone()), &ReadParams::default())
            .await?
            .is_some()
    );
    Ok(())
}

#[tokio::test]
async fn mutation_is_gated_on_ownership() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");
    let bob = user_actor(2, "bob");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;

    let error = h
        .stores
        .apps
        .update(
            &bob,
            &created.uid,
            &payload(json!({ "title": "Hijacked" })),
            &UpsertOptions::default(),
        )
        .await
        .expect_err("non-owner update should fail");
    assert!(matches!(error, EntityStoreError::Forbidden));

    let error = h
        .stores
        .apps
        .delete(&bob, &created.uid)
        .await
        .expect_err("non-owner delete should fail");
    assert!(matches!(error, EntityStoreError::Forbidden));

    // The global override permission bypasses the owner match.
    h.permissions
        .grant_user(2, permission::WRITE_ALL_OWNERS)
        .await;
    h.stores
        .apps
        .update(
            &bob,
            &created.uid,
            &payload(json!({ "title": "Moderated" })),
            &UpsertOptions::default(),
        )
        .await
        .context("override update")?;

    let deleted = h.stores.apps.delete(&alice, &created.uid).await?;
    assert_eq!(deleted, created.uid);
    assert!(
        h.stores
            .apps
            .read(&alice, &Predicate::Uid(created.uid), &ReadParams::default())
            .await?
            .is_none()
    );
    Ok(())
}

#[tokio::test]
async fn association_resync_is_total() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(
            &alice,
            &payload(json!({
                "name": "demo",
                "title": "Demo",
                "index_url": "https://demo.example",
                "filetype_associations": ["txt", "md"],
            })),
            &UpsertOptions::default(),
        )
        .await?;

    let updated = h
        .stores
        .apps
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "filetype_associations": ["PNG"] })),
            &UpsertOptions::default(),
        )
        .await?;
    assert_eq!(updated.field("filetype_associations"), Some(&json!(["png"])));

    let cleared = h
        .stores
        .apps
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "filetype_associations": [] })),
            &UpsertOptions::default(),
        )
        .await?;
    assert_eq!(cleared.field("filetype_associations"), Some(&json!([])));

    // A payload that says nothing about associations leaves them alone.
    let untouched = h
        .stores
        .apps
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "title": "Still Demo" })),
            &UpsertOptions::default(),
        )
        .await?;
    assert_eq!(untouched.field("filetype_associations"), Some(&json!([])));
    Ok(())
}

#[tokio::test]
async fn select_scopes_to_visible_rows() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");
    let bob = user_actor(2, "bob");

    let mine = h
        .stores
        .apps
        .create(&alice, &app_payload("mine"), &UpsertOptions::default())
        .await?;
    h.stores
        .apps
        .create(&bob, &app_payload("theirs"), &UpsertOptions::default())
        .await?;

    let listed = h
        .stores
        .apps
        .select(
            &alice,
            &SelectOptions {
                predicate: Some(Predicate::Eq {
                    key: "owner".to_string(),
                    value: json!(1),
                }),
                ..SelectOptions::default()
            },
        )
        .await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].uid, mine.uid);

    // Unapproved apps of other users are not listed.
    let all_for_alice = h
        .stores
        .apps
        .select(&alice, &SelectOptions::default())
        .await?;
    assert_eq!(all_for_alice.len(), 1);

    // Approval makes a row listable for everyone, but its moderation flags
    // stay redacted for non-owners.
    h.db.write(
        "UPDATE apps SET approved_for_listing = 1 WHERE uid = ?",
        &[SqlValue::Text(mine.uid.clone())],
    )
    .await?;
    let for_bob = h
        .stores
        .apps
        .select(&bob, &SelectOptions::default())
        .await?;
    assert_eq!(for_bob.len(), 2);
    let listed_mine = for_bob
        .iter()
        .find(|entity| entity.uid == mine.uid)
        .context("approved app should be listed")?;
    assert!(listed_mine.field("approved_for_listing").is_none());

    let for_alice = h
        .stores
        .apps
        .select(&alice, &SelectOptions::default())
        .await?;
    let own = for_alice
        .iter()
        .find(|entity| entity.uid == mine.uid)
        .context("own app should be listed")?;
    assert_eq!(own.field("approved_for_listing"), Some(&json!(true)));
    Ok(())
}

#[tokio::test]
async fn an_app_sees_exactly_its_own_record() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;

    // Unapproved and not owned by the acting user, but it is the acting app.
    let as_app = app_actor(2, created.id, &created.uid);
    let listed = h
        .stores
        .apps
        .select(&as_app, &SelectOptions::default())
        .await?;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].uid, created.uid);
    Ok(())
}

#[tokio::test]
async fn delegated_app_owner_may_mutate() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let manager = h
        .stores
        .apps
        .create(&alice, &app_payload("manager"), &UpsertOptions::default())
        .await?;
    let managed = h
        .stores
        .apps
        .create(
            &alice,
            &payload(json!({
                "name": "managed",
                "title": "Managed",
                "index_url": "https://managed.example",
                "app_owner": manager.id,
            })),
            &UpsertOptions::default(),
        )
        .await?;

    // The manager app, acting under an unrelated user, may mutate the app
    // that names it as app_owner.
    let as_manager = app_actor(7, manager.id, &manager.uid);
    h.stores
        .apps
        .update(
            &as_manager,
            &managed.uid,
            &payload(json!({ "title": "Managed v2" })),
            &UpsertOptions::default(),
        )
        .await
        .context("app-owner update")?;

    // A different app without the delegation is refused.
    let other = h
        .stores
        .apps
        .create(&alice, &app_payload("other"), &UpsertOptions::default())
        .await?;
    let as_other = app_actor(7, other.id, &other.uid);
    let error = h
        .stores
        .apps
        .update(
            &as_other,
            &managed.uid,
            &payload(json!({ "title": "Nope" })),
            &UpsertOptions::default(),
        )
        .await
        .expect_err("unrelated app should be refused");
    assert!(matches!(error, EntityStoreError::Forbidden));

    // The delegated write permission works without an app_owner link.
    h.permissions
        .grant_app(
            &other.uid,
            &permission::delegated_write_permission("apps", "user-uuid-1"),
        )
        .await;
    let as_other = app_actor(1, other.id, &other.uid);
    h.stores
        .apps
        .update(
            &as_other,
            &managed.uid,
            &payload(json!({ "title": "Delegated" })),
            &UpsertOptions::default(),
        )
        .await
        .context("delegated update")?;
    Ok(())
}

#[tokio::test]
async fn events_track_icon_and_name_changes() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(
            &alice,
            &payload(json!({
                "name": "demo",
                "title": "Demo",
                "index_url": "https://demo.example",
                "icon": "data:image/png;base64,AAA",
            })),
            &UpsertOptions::default(),
        )
        .await?;

    h.stores
        .apps
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "name": "demo-next" })),
            &UpsertOptions::default(),
        )
        .await?;

    // Re-supplying the same name is not a rename.
    h.stores
        .apps
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "name": "demo-next" })),
            &UpsertOptions::default(),
        )
        .await?;

    h.stores
        .apps
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "icon": "data:image/png;base64,BBB" })),
            &UpsertOptions::default(),
        )
        .await?;

    let events = h.events.emitted().await;
    let names: Vec<&str> = events.iter().map(|event| event.event.as_str()).collect();
    assert_eq!(names, vec!["app.new-icon", "app.rename", "app.new-icon"]);
    assert_eq!(
        events[1].payload,
        json!({
            "app_uid": created.uid,
            "new_name": "demo-next",
            "old_name": "demo",
        })
    );
    Ok(())
}

#[tokio::test]
async fn enrichment_failures_degrade_the_read() -> Result<()> {
    let h = harness_with(|collaborators| {
        collaborators.icons = Arc::new(UnavailableIconProvider);
    })
    .await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(
            &alice,
            &payload(json!({
                "name": "demo",
                "title": "Demo",
                "index_url": "https://demo.example",
                "icon": "data:image/png;base64,AAA",
            })),
            &UpsertOptions::default(),
        )
        .await?;

    let read = h
        .stores
        .apps
        .read(
            &alice,
            &Predicate::Uid(created.uid.clone()),
            &ReadParams {
                icon_size: Some(64),
                ..ReadParams::default()
            },
        )
        .await?
        .context("read")?;

    // The stored icon survives; the failure goes to the side channel.
    assert_eq!(read.field_str("icon"), Some("data:image/png;base64,AAA"));
    let reported = h.errors.reported().await;
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].0, "AppStore:icon");
    Ok(())
}

#[tokio::test]
async fn icon_and_stats_enrichment_merge_into_the_entity() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;

    let read = h
        .stores
        .apps
        .read(
            &alice,
            &Predicate::Uid(created.uid.clone()),
            &ReadParams {
                icon_size: Some(32),
                stats_period: Some("30d".to_string()),
                stats_grouping: None,
            },
        )
        .await?
        .context("read")?;

    assert_eq!(
        read.field_str("icon"),
        Some(format!("data:image/png;base64,{}@32", created.uid).as_str())
    );
    assert_eq!(
        read.field("stats"),
        Some(&json!({ "period": "30d", "grouping": null, "open_count": 0 }))
    );
    assert!(h.errors.reported().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn provenance_requires_an_origin_match() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;

    let read = h
        .stores
        .apps
        .read(&alice, &Predicate::Uid(created.uid.clone()), &ReadParams::default())
        .await?
        .context("read")?;
    assert_eq!(read.field("created_from_origin"), Some(&json!(null)));

    h.origins.bind("https://demo.example", &created.uid).await;
    let read = h
        .stores
        .apps
        .read(&alice, &Predicate::Uid(created.uid.clone()), &ReadParams::default())
        .await?
        .context("read")?;
    assert_eq!(
        read.field("created_from_origin"),
        Some(&json!("https://demo.example"))
    );

    // A mismatching registration yields nothing rather than an error.
    h.origins.bind("https://demo.example", "app-someone-else").await;
    let read = h
        .stores
        .apps
        .read(&alice, &Predicate::Uid(created.uid.clone()), &ReadParams::default())
        .await?
        .context("read")?;
    assert_eq!(read.field("created_from_origin"), Some(&json!(null)));
    Ok(())
}

#[tokio::test]
async fn app_cache_follows_the_entity_lifecycle() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;

    let cached = h.cache.get(&created.uid).await.context("cached app")?;
    assert_eq!(cached.get("name"), Some(&json!("demo")));

    h.stores.apps.delete(&alice, &created.uid).await?;
    assert!(h.cache.get(&created.uid).await.is_none());
    Ok(())
}

#[tokio::test]
async fn hosted_app_provisions_its_subdomain() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(
            &alice,
            &payload(json!({
                "name": "site-app",
                "title": "Site App",
                "index_url": "https://will-be-overridden.example",
                "subdomain": "MySiteApp",
                "source_directory": "dir-123",
            })),
            &UpsertOptions::default(),
        )
        .await?;

    // index_url is derived from the hosting pair, overriding the payload.
    assert_eq!(
        created.field_str("index_url"),
        Some("https://mysiteapp.site.nexus.localhost")
    );

    let sites = h
        .stores
        .subdomains
        .select(
            &alice,
            &SelectOptions {
                predicate: Some(Predicate::Eq {
                    key: "subdomain".to_string(),
                    value: json!("mysiteapp"),
                }),
                ..SelectOptions::default()
            },
        )
        .await?;
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].field("associated_app"), Some(&json!(created.id)));
    assert_eq!(sites[0].field_str("root_dir"), Some("dir-123"));
    Ok(())
}

#[tokio::test]
async fn empty_update_is_an_idempotent_no_op() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;
    let updated = h
        .stores
        .apps
        .update(&alice, &created.uid, &Map::new(), &UpsertOptions::default())
        .await?;
    assert_eq!(updated.uid, created.uid);
    assert_eq!(updated.field_str("name"), Some("demo"));
    Ok(())
}

#[tokio::test]
async fn required_fields_cannot_be_cleared() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .apps
        .create(&alice, &app_payload("demo"), &UpsertOptions::default())
        .await?;
    let error = h
        .stores
        .apps
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "title": null })),
            &UpsertOptions::default(),
        )
        .await
        .expect_err("clearing a required field should fail");
    assert!(matches!(error, EntityStoreError::FieldMissing { ref key } if key == "title"));
    Ok(())
}

#[tokio::test]
async fn update_of_a_missing_id_fails_without_creating() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let error = h
        .stores
        .apps
        .update(
            &alice,
            "app-does-not-exist",
            &app_payload("ghost"),
            &UpsertOptions::default(),
        )
        .await
        .expect_err("missing id should fail");
    assert!(matches!(error, EntityStoreError::EntityNotFound { .. }));

    let listed = h
        .stores
        .apps
        .select(&alice, &SelectOptions::default())
        .await?;
    assert!(listed.is_empty());
    Ok(())
}

#[tokio::test]
async fn degenerate_selectors_are_rejected() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let error = h
        .stores
        .apps
        .read(&alice, &Predicate::And(Vec::new()), &ReadParams::default())
        .await
        .expect_err("empty predicate should fail");
    assert!(matches!(error, EntityStoreError::InvalidId));

    let error = h
        .stores
        .apps
        .select(
            &alice,
            &SelectOptions {
                offset: Some(10),
                ..SelectOptions::default()
            },
        )
        .await
        .expect_err("offset without limit should fail");
    assert_eq!(error.code(), "field_invalid");
    Ok(())
}

#[tokio::test]
async fn subdomains_are_lowercased_and_unique() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .subdomains
        .create(
            &alice,
            &payload(json!({ "subdomain": "MySite" })),
            &UpsertOptions::default(),
        )
        .await?;
    assert!(created.uid.starts_with("sd-"));
    assert_eq!(created.field_str("subdomain"), Some("mysite"));

    let error = h
        .stores
        .subdomains
        .create(
            &alice,
            &payload(json!({ "subdomain": "mysite" })),
            &UpsertOptions::default(),
        )
        .await
        .expect_err("duplicate subdomain should fail");
    assert!(matches!(error, EntityStoreError::NameInUse { ref name } if name == "mysite"));

    let deduped = h
        .stores
        .subdomains
        .create(
            &alice,
            &payload(json!({ "subdomain": "mysite" })),
            &UpsertOptions { dedupe_name: true },
        )
        .await?;
    assert_eq!(deduped.field_str("subdomain"), Some("mysite-1"));
    Ok(())
}

#[tokio::test]
async fn reserved_words_cannot_be_claimed() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let error = h
        .stores
        .subdomains
        .create(
            &alice,
            &payload(json!({ "subdomain": "api" })),
            &UpsertOptions::default(),
        )
        .await
        .expect_err("reserved word should fail");
    assert!(
        matches!(error, EntityStoreError::SubdomainReserved { ref subdomain } if subdomain == "api")
    );
    Ok(())
}

#[tokio::test]
async fn subdomain_name_is_immutable_after_creation() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    let created = h
        .stores
        .subdomains
        .create(
            &alice,
            &payload(json!({ "subdomain": "mysite" })),
            &UpsertOptions::default(),
        )
        .await?;

    let error = h
        .stores
        .subdomains
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "subdomain": "othersite" })),
            &UpsertOptions::default(),
        )
        .await
        .expect_err("renaming a subdomain should fail");
    assert_eq!(error.code(), "field_invalid");

    // Re-supplying the current name alongside other fields is fine.
    let updated = h
        .stores
        .subdomains
        .update(
            &alice,
            &created.uid,
            &payload(json!({ "subdomain": "mysite", "domain": "Example.COM" })),
            &UpsertOptions::default(),
        )
        .await?;
    assert_eq!(updated.field_str("subdomain"), Some("mysite"));
    assert_eq!(updated.field_str("domain"), Some("example.com"));
    Ok(())
}

#[tokio::test]
async fn subdomain_quota_is_enforced_per_user() -> Result<()> {
    let h = harness().await?;
    let capped = Actor::User {
        user: User {
            id: 5,
            uuid: "user-uuid-5".to_string(),
            username: "capped".to_string(),
            max_subdomains: Some(1),
        },
    };

    h.stores
        .subdomains
        .create(
            &capped,
            &payload(json!({ "subdomain": "first" })),
            &UpsertOptions::default(),
        )
        .await?;

    let error = h
        .stores
        .subdomains
        .create(
            &capped,
            &payload(json!({ "subdomain": "second" })),
            &UpsertOptions::default(),
        )
        .await
        .expect_err("quota should be enforced");
    assert!(matches!(error, EntityStoreError::LimitReached { limit: 1 }));
    Ok(())
}

#[tokio::test]
async fn subdomain_listing_is_scoped_to_the_owner() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");
    let bob = user_actor(2, "bob");

    h.stores
        .subdomains
        .create(
            &alice,
            &payload(json!({ "subdomain": "alices" })),
            &UpsertOptions::default(),
        )
        .await?;
    h.stores
        .subdomains
        .create(
            &bob,
            &payload(json!({ "subdomain": "bobs" })),
            &UpsertOptions::default(),
        )
        .await?;

    let for_alice = h
        .stores
        .subdomains
        .select(&alice, &SelectOptions::default())
        .await?;
    assert_eq!(for_alice.len(), 1);
    assert_eq!(for_alice[0].field_str("subdomain"), Some("alices"));

    h.permissions
        .grant_user(1, permission::READ_ALL_SUBDOMAINS)
        .await;
    let for_auditor = h
        .stores
        .subdomains
        .select(&alice, &SelectOptions::default())
        .await?;
    assert_eq!(for_auditor.len(), 2);
    Ok(())
}

#[tokio::test]
async fn select_orders_newest_first_and_paginates() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    for name in ["one", "two", "three"] {
        h.stores
            .subdomains
            .create(
                &alice,
                &payload(json!({ "subdomain": name })),
                &UpsertOptions::default(),
            )
            .await?;
    }

    let page = h
        .stores
        .subdomains
        .select(
            &alice,
            &SelectOptions {
                limit: Some(2),
                ..SelectOptions::default()
            },
        )
        .await?;
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].field_str("subdomain"), Some("three"));
    assert_eq!(page[1].field_str("subdomain"), Some("two"));

    let rest = h
        .stores
        .subdomains
        .select(
            &alice,
            &SelectOptions {
                limit: Some(2),
                offset: Some(2),
                ..SelectOptions::default()
            },
        )
        .await?;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].field_str("subdomain"), Some("one"));
    Ok(())
}

#[tokio::test]
async fn subdomains_filter_by_prefix() -> Result<()> {
    let h = harness().await?;
    let alice = user_actor(1, "alice");

    for name in ["blog", "blog-staging", "shop"] {
        h.stores
            .subdomains
            .create(
                &alice,
                &payload(json!({ "subdomain": name })),
                &UpsertOptions::default(),
            )
            .await?;
    }

    let matches = h
        .stores
        .subdomains
        .select(
            &alice,
            &SelectOptions {
                predicate: Some(Predicate::StartsWith {
                    key: "subdomain".to_string(),
                    value: "blog".to_string(),
                }),
                ..SelectOptions::default()
            },
        )
        .await?;
    assert_eq!(matches.len(), 2);
    Ok(())
}
