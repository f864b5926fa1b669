//! Two-tier result cache with version-qualified keys
//!
//! Local tier is an in-process moka cache; the shared tier is any
//! `SharedCacheTier` (Redis-like). The cache is advisory: shared-tier
//! failures are logged and swallowed, never surfaced to callers.

use crate::config::ModelVersions;
use crate::types::{AnswerMode, Intent, Scope, StrategyKind};
use async_trait::async_trait;
use moka::sync::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

const KEY_ROOT: &str = "bookmind";
const GLOBAL_NAMESPACE: &str = "_global";

#[derive(Debug, Error)]
#[error("shared cache error: {0}")]
pub struct SharedCacheError(pub String);

/// Value read back from the shared tier
#[derive(Debug, Clone)]
pub struct SharedEntry {
    pub value: String,
    pub ttl_remaining: Duration,
}

#[async_trait]
pub trait SharedCacheTier: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SharedEntry>, SharedCacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SharedCacheError>;
    /// Remove every key starting with `prefix`, returning how many were removed
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, SharedCacheError>;
}

/// Shared tier kept in process memory; stands in for a networked store in
/// single-node deployments and tests
#[derive(Default)]
pub struct InMemorySharedCache {
    entries: Mutex<BTreeMap<String, (String, Instant)>>,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedCacheTier for InMemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<SharedEntry>, SharedCacheError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Ok(Some(SharedEntry {
                value: value.clone(),
                ttl_remaining: *expires_at - now,
            })),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), SharedCacheError> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, SharedCacheError> {
        let mut entries = self.entries.lock();
        let doomed: Vec<String> = entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            entries.remove(key);
        }
        Ok(doomed.len())
    }
}

#[derive(Clone)]
struct LocalEntry {
    value: Arc<str>,
    ttl: Duration,
}

/// Each local entry lives for the TTL it was written with
struct EntryTtl;

impl Expiry<String, LocalEntry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, value: &LocalEntry, _created_at: StdInstant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: StdInstant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

pub struct ResultCache {
    local: Cache<String, LocalEntry>,
    shared: Option<Arc<dyn SharedCacheTier>>,
}

impl ResultCache {
    pub fn new(local_capacity: u64, shared: Option<Arc<dyn SharedCacheTier>>) -> Self {
        let local = Cache::builder()
            .max_capacity(local_capacity)
            .expire_after(EntryTtl)
            .support_invalidation_closures()
            .build();
        Self { local, shared }
    }

    /// Local tier first, then shared; shared hits are promoted into the local tier
    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(entry) = self.local.get(key) {
            debug!("Cache local hit: {}", key);
            return Some(entry.value.to_string());
        }

        let shared = self.shared.as_ref()?;
        match shared.get(key).await {
            Ok(Some(entry)) => {
                debug!("Cache shared hit: {}", key);
                self.insert_local(key, &entry.value, entry.ttl_remaining);
                Some(entry.value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Shared cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    /// Write both tiers; a shared-tier failure is logged and ignored
    pub async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.insert_local(key, &value, ttl);
        if let Some(shared) = &self.shared {
            if let Err(e) = shared.set(key, &value, ttl).await {
                warn!("Shared cache write failed for {}: {}", key, e);
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                self.local.invalidate(key);
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, raw, ttl).await,
            Err(e) => warn!("Not caching {}: {}", key, e),
        }
    }

    /// Drop everything cached for one user, in both tiers
    pub async fn invalidate_user(&self, user_id: &str) {
        let prefix = namespace_prefix(user_id);
        let local_prefix = prefix.clone();
        if let Err(e) = self
            .local
            .invalidate_entries_if(move |k, _| k.starts_with(&local_prefix))
        {
            warn!("Local cache invalidation failed for {}: {}", prefix, e);
        }
        if let Some(shared) = &self.shared {
            match shared.delete_prefix(&prefix).await {
                Ok(n) => debug!("Invalidated {} shared entries under {}", n, prefix),
                Err(e) => warn!("Shared cache invalidation failed for {}: {}", prefix, e),
            }
        }
    }

    fn insert_local(&self, key: &str, value: &str, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        self.local.insert(
            key.to_string(),
            LocalEntry {
                value: Arc::from(value),
                ttl,
            },
        );
    }
}

fn namespace_prefix(namespace: &str) -> String {
    format!("{}:{}:", KEY_ROOT, urlencoding::encode(namespace))
}

/// Composite cache key; components are hashed in name order
#[derive(Debug, Clone)]
pub struct CacheKey {
    namespace: String,
    kind: &'static str,
    components: BTreeMap<&'static str, String>,
}

impl CacheKey {
    pub fn new(namespace: &str, kind: &'static str) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind,
            components: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.components.insert(name, value.into());
        self
    }

    pub fn render(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (name, value) in &self.components {
            hasher.update(name.as_bytes());
            hasher.update(&[0x1f]);
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        let digest = hasher.finalize().to_hex();
        format!("{}{}:{}", namespace_prefix(&self.namespace), self.kind, &digest[..32])
    }
}

fn strategy_list(strategies: &[StrategyKind]) -> String {
    let mut names: Vec<&str> = strategies.iter().map(|s| s.as_str()).collect();
    names.sort();
    names.join(",")
}

/// Everything about a routed search that changes what it retrieves
#[derive(Debug, Clone, Copy)]
pub struct SearchShape<'a> {
    pub normalized: &'a str,
    /// Quoted phrase the strategies search for instead of the full text
    pub focus: Option<&'a str>,
    pub intent: Intent,
    pub strategies: &'a [StrategyKind],
    pub graph_enriched: bool,
}

fn with_search_components(key: CacheKey, scope: &Scope, shape: &SearchShape<'_>, models: &ModelVersions) -> CacheKey {
    key.with("query", shape.normalized)
        .with("focus", shape.focus.map_or_else(|| "-".to_string(), |f| format!("{:?}", f)))
        .with("intent", shape.intent.as_str())
        .with("strategies", strategy_list(shape.strategies))
        .with("graph", shape.graph_enriched.to_string())
        .with("scope", scope.fingerprint())
        .with("embedding_model", models.embedding_model.clone())
        .with("embedding_dim", models.embedding_dimension.to_string())
}

/// Key for a fused search result
pub fn search_key(scope: &Scope, shape: &SearchShape<'_>, models: &ModelVersions) -> CacheKey {
    with_search_components(CacheKey::new(&scope.user_id, "search"), scope, shape, models)
}

/// Key for a synthesized answer: every search component plus generation versions
pub fn answer_key(scope: &Scope, shape: &SearchShape<'_>, mode: AnswerMode, models: &ModelVersions) -> CacheKey {
    with_search_components(CacheKey::new(&scope.user_id, "answer"), scope, shape, models)
        .with("mode", mode.as_str())
        .with("generation_model", models.generation_model.clone())
        .with("judge_model", models.judge_model.clone())
        .with("prompt_version", models.prompt_version.clone())
}

pub fn embedding_key(text: &str, purpose: &str, models: &ModelVersions) -> CacheKey {
    CacheKey::new(GLOBAL_NAMESPACE, "embedding")
        .with("text", text)
        .with("purpose", purpose)
        .with("embedding_model", models.embedding_model.clone())
        .with("embedding_dim", models.embedding_dimension.to_string())
}

pub fn classifier_key(normalized: &str, has_history: bool, models: &ModelVersions) -> CacheKey {
    CacheKey::new(GLOBAL_NAMESPACE, "intent")
        .with("query", normalized)
        .with("history", has_history.to_string())
        .with("router_model", models.router_model.clone())
        .with("prompt_version", models.prompt_version.clone())
}
