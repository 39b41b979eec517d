use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProviderError(pub String);

/// Renders an app icon at a requested size, returned as a data URL.
#[async_trait]
pub trait IconProvider: Send + Sync {
    async fn render(
        &self,
        app_uid: &str,
        stored_icon: Option<&str>,
        size: u32,
    ) -> Result<String, ProviderError>;
}

/// Usage-statistics aggregation for an app.
#[async_trait]
pub trait AppStatsProvider: Send + Sync {
    async fn stats(
        &self,
        app_uid: &str,
        period: &str,
        grouping: Option<&str>,
    ) -> Result<Value, ProviderError>;
}

/// Resolves an origin (`https://host`) to the app uid expected to own it.
#[async_trait]
pub trait OriginResolver: Send + Sync {
    async fn app_uid_for_origin(&self, origin: &str) -> Result<Option<String>, ProviderError>;
}

/// Side channel for enrichment failures; reads degrade instead of failing.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, location: &str, message: &str);
}

/// Read-through cache of mapped apps, refreshed on every successful mapping
/// and invalidated on delete.
#[async_trait]
pub trait AppCache: Send + Sync {
    async fn refresh(&self, uid: &str, app: &Value);
    async fn invalidate(&self, uid: &str);
}

/// Enrichment collaborators for the app store. Defaults are inert: icon and
/// stats enrichment report unavailability, provenance resolves to nothing.
#[derive(Clone)]
pub struct AppCollaborators {
    pub icons: Arc<dyn IconProvider>,
    pub stats: Arc<dyn AppStatsProvider>,
    pub origins: Arc<dyn OriginResolver>,
    pub errors: Arc<dyn ErrorReporter>,
    pub cache: Arc<dyn AppCache>,
}

impl Default for AppCollaborators {
    fn default() -> Self {
        Self {
            icons: Arc::new(UnavailableIconProvider),
            stats: Arc::new(UnavailableStatsProvider),
            origins: Arc::new(NullOriginResolver),
            errors: Arc::new(TracingErrorReporter),
            cache: Arc::new(NullAppCache),
        }
    }
}

pub struct UnavailableIconProvider;

#[async_trait]
impl IconProvider for UnavailableIconProvider {
    async fn render(
        &self,
        _app_uid: &str,
        _stored_icon: Option<&str>,
        _size: u32,
    ) -> Result<String, ProviderError> {
        Err(ProviderError("icon rendering not configured".to_string()))
    }
}

pub struct UnavailableStatsProvider;

#[async_trait]
impl AppStatsProvider for UnavailableStatsProvider {
    async fn stats(
        &self,
        _app_uid: &str,
        _period: &str,
        _grouping: Option<&str>,
    ) -> Result<Value, ProviderError> {
        Err(ProviderError("usage statistics not configured".to_string()))
    }
}

pub struct NullOriginResolver;

#[async_trait]
impl OriginResolver for NullOriginResolver {
    async fn app_uid_for_origin(&self, _origin: &str) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }
}

/// Maps fixed origins to app uids; for tests and static deployments.
#[derive(Default)]
pub struct StaticOriginResolver {
    entries: Mutex<HashMap<String, String>>,
}

impl StaticOriginResolver {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn bind(&self, origin: &str, app_uid: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(origin.to_string(), app_uid.to_string());
    }
}

#[async_trait]
impl OriginResolver for StaticOriginResolver {
    async fn app_uid_for_origin(&self, origin: &str) -> Result<Option<String>, ProviderError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(origin).cloned())
    }
}

pub struct TracingErrorReporter;

#[async_trait]
impl ErrorReporter for TracingErrorReporter {
    async fn report(&self, location: &str, message: &str) {
        tracing::warn!(location, reason = message, "enrichment failure");
    }
}

/// Records reported failures for inspection in tests.
#[derive(Default)]
pub struct RecordingErrorReporter {
    reports: Mutex<Vec<(String, String)>>,
}

impl RecordingErrorReporter {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn reported(&self) -> Vec<(String, String)> {
        self.reports.lock().await.clone()
    }
}

#[async_trait]
impl ErrorReporter for RecordingErrorReporter {
    async fn report(&self, location: &str, message: &str) {
        let mut reports = self.reports.lock().await;
        reports.push((location.to_string(), message.to_string()));
    }
}

pub struct NullAppCache;

#[async_trait]
impl AppCache for NullAppCache {
    async fn refresh(&self, _uid: &str, _app: &Value) {}
    async fn invalidate(&self, _uid: &str) {}
}

/// In-memory app cache keyed by uid.
#[derive(Default)]
pub struct MemoryAppCache {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryAppCache {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn get(&self, uid: &str) -> Option<Value> {
        let entries = self.entries.lock().await;
        entries.get(uid).cloned()
    }
}

#[async_trait]
impl AppCache for MemoryAppCache {
    async fn refresh(&self, uid: &str, app: &Value) {
        let mut entries = self.entries.lock().await;
        entries.insert(uid.to_string(), app.clone());
    }

    async fn invalidate(&self, uid: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(uid);
    }
}
