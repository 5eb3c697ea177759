//! Backend catalog: the set of zero-cost backends currently offered by the
//! gateway, joined with offline quality scores.
//!
//! Snapshots are immutable and shared as `Arc`; a refresh builds a new one and
//! swaps it in, so readers never observe a half-updated catalog.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::gateway::{is_free_listing, CatalogSource, ModelListing, ProviderError};
use crate::store::{self, FileLock, StoreError};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Low,
    Mid,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendDescriptor {
    pub id: String,
    pub display_name: String,
    pub context_limit: u32,
    pub quality_score: f64,
    pub tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CatalogSnapshot {
    pub fetched_at: DateTime<Utc>,
    pub task_class: String,
    pub backends: Vec<BackendDescriptor>,
}

impl CatalogSnapshot {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) < max_age
    }

    pub fn get(&self, id: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.id == id)
    }
}

/// Tier cut-offs on the quality score.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TierThresholds {
    pub high: f64,
    pub mid: f64,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            high: 0.75,
            mid: 0.5,
        }
    }
}

impl TierThresholds {
    pub fn tier_for(&self, score: f64) -> Tier {
        if score >= self.high {
            Tier::High
        } else if score >= self.mid {
            Tier::Mid
        } else {
            Tier::Low
        }
    }
}

/// Offline quality scores: `{"scores": {task_class: {backend_id: score}}}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityTable {
    #[serde(default)]
    pub scores: HashMap<String, HashMap<String, f64>>,
}

impl QualityTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        store::read_json(path)?.ok_or_else(|| {
            CatalogError::QualityTable(format!("{} does not exist", path.display()))
        })
    }

    pub fn score(&self, task_class: &str, backend_id: &str) -> Option<f64> {
        self.scores
            .get(task_class)
            .and_then(|by_id| by_id.get(backend_id))
            .copied()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// No listing could be fetched and there is no snapshot to fall back on.
    #[error("backend catalog unavailable: {source}")]
    Unavailable {
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("quality table: {0}")]
    QualityTable(String),
    #[error("catalog task failed: {0}")]
    Join(String),
}

#[derive(Debug, Clone)]
pub struct CatalogSettings {
    /// Snapshot cache file. `None` keeps the catalog in memory only.
    pub cache_path: Option<PathBuf>,
    pub task_class: String,
    /// Score given to backends the quality table does not mention.
    pub default_quality: f64,
    pub thresholds: TierThresholds,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            cache_path: None,
            task_class: "site".to_string(),
            default_quality: 0.3,
            thresholds: TierThresholds::default(),
        }
    }
}

// =============================================================================
// SNAPSHOT CONSTRUCTION
// =============================================================================

/// Keep free listings only, join scores, assign tiers. Sorted by id.
pub fn build_snapshot(
    listings: &[ModelListing],
    quality: &QualityTable,
    settings: &CatalogSettings,
    fetched_at: DateTime<Utc>,
) -> CatalogSnapshot {
    let mut by_id: BTreeMap<String, BackendDescriptor> = BTreeMap::new();
    for listing in listings.iter().filter(|l| is_free_listing(l)) {
        let score = quality
            .score(&settings.task_class, &listing.id)
            .unwrap_or(settings.default_quality)
            .clamp(0.0, 1.0);
        by_id.insert(
            listing.id.clone(),
            BackendDescriptor {
                id: listing.id.clone(),
                display_name: listing.name.clone().unwrap_or_else(|| listing.id.clone()),
                context_limit: listing.context_length.unwrap_or(0),
                quality_score: score,
                tier: settings.thresholds.tier_for(score),
            },
        );
    }

    CatalogSnapshot {
        fetched_at,
        task_class: settings.task_class.clone(),
        backends: by_id.into_values().collect(),
    }
}

// =============================================================================
// CATALOG
// =============================================================================

pub struct BackendCatalog {
    source: Arc<dyn CatalogSource>,
    quality: QualityTable,
    settings: CatalogSettings,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl BackendCatalog {
    pub fn new(
        source: Arc<dyn CatalogSource>,
        quality: QualityTable,
        settings: CatalogSettings,
    ) -> Self {
        Self {
            source,
            quality,
            settings,
            current: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &CatalogSettings {
        &self.settings
    }

    /// The snapshot currently held in memory, if any.
    pub fn current(&self) -> Option<Arc<CatalogSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn install(&self, snapshot: Arc<CatalogSnapshot>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    /// Return a snapshot no older than `max_age`, fetching if needed.
    ///
    /// A failed fetch falls back to the stale snapshot when one exists.
    pub async fn refresh(&self, max_age: Duration) -> Result<Arc<CatalogSnapshot>, CatalogError> {
        let _guard = self.refresh_lock.lock().await;
        let now = Utc::now();

        if let Some(snapshot) = self.current() {
            if snapshot.is_fresh(max_age, now) {
                return Ok(snapshot);
            }
        } else if let Some(loaded) = self.load_cached().await? {
            let loaded = Arc::new(loaded);
            self.install(loaded.clone());
            if loaded.is_fresh(max_age, now) {
                tracing::debug!(backends = loaded.backends.len(), "catalog loaded from cache");
                return Ok(loaded);
            }
        }

        match self.source.list_backends().await {
            Ok(listings) => {
                let snapshot = Arc::new(build_snapshot(
                    &listings,
                    &self.quality,
                    &self.settings,
                    Utc::now(),
                ));
                if snapshot.backends.is_empty() {
                    tracing::warn!(listed = listings.len(), "catalog refresh found no free backends");
                }
                self.persist(snapshot.clone()).await;
                self.install(snapshot.clone());
                tracing::info!(
                    listed = listings.len(),
                    free = snapshot.backends.len(),
                    "catalog refreshed"
                );
                Ok(snapshot)
            }
            Err(e) => match self.current() {
                Some(stale) => {
                    tracing::warn!(
                        error = %e,
                        age_secs = stale.age(now).as_secs(),
                        "catalog refresh failed; serving stale snapshot"
                    );
                    Ok(stale)
                }
                None => Err(CatalogError::Unavailable { source: e }),
            },
        }
    }

    async fn load_cached(&self) -> Result<Option<CatalogSnapshot>, CatalogError> {
        let Some(path) = self.settings.cache_path.clone() else {
            return Ok(None);
        };
        let loaded = tokio::task::spawn_blocking(move || store::read_json::<CatalogSnapshot>(&path))
            .await
            .map_err(|e| CatalogError::Join(e.to_string()))?;
        match loaded {
            Ok(snapshot) => Ok(snapshot),
            // An unreadable cache is as good as none; the next fetch rewrites it.
            Err(e @ StoreError::Json { .. }) => {
                tracing::warn!(error = %e, "ignoring corrupt catalog cache");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, snapshot: Arc<CatalogSnapshot>) {
        let Some(path) = self.settings.cache_path.clone() else {
            return;
        };
        let result = tokio::task::spawn_blocking(move || {
            let _lock = FileLock::acquire(&path)?;
            store::write_json_atomic(&path, snapshot.as_ref())
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to persist catalog snapshot"),
            Err(e) => tracing::warn!(error = %e, "catalog persist task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ListingPricing;

    fn listing(id: &str, prompt: &str, ctx: u32) -> ModelListing {
        ModelListing {
            id: id.to_string(),
            name: None,
            context_length: Some(ctx),
            pricing: ListingPricing {
                prompt: Some(prompt.to_string()),
                completion: Some(prompt.to_string()),
                request: None,
                image: None,
            },
        }
    }

    #[test]
    fn tiers_follow_thresholds() {
        let t = TierThresholds::default();
        assert_eq!(t.tier_for(0.9), Tier::High);
        assert_eq!(t.tier_for(0.75), Tier::High);
        assert_eq!(t.tier_for(0.6), Tier::Mid);
        assert_eq!(t.tier_for(0.1), Tier::Low);
    }

    #[test]
    fn snapshot_keeps_free_only_and_scores() {
        let mut quality = QualityTable::default();
        quality
            .scores
            .entry("site".into())
            .or_default()
            .insert("b/free".into(), 1.7);
        let listings = vec![
            listing("b/free", "0", 32_000),
            listing("a/paid", "0.000001", 32_000),
            listing("c/free", "0", 4_000),
        ];
        let snap = build_snapshot(&listings, &quality, &CatalogSettings::default(), Utc::now());
        let ids: Vec<_> = snap.backends.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b/free", "c/free"]);
        // clamped
        assert_eq!(snap.backends[0].quality_score, 1.0);
        assert_eq!(snap.backends[0].tier, Tier::High);
        assert_eq!(snap.backends[1].quality_score, 0.3);
        assert_eq!(snap.backends[1].tier, Tier::Low);
    }

    #[test]
    fn freshness_uses_fetch_time() {
        let now = Utc::now();
        let snap = CatalogSnapshot {
            fetched_at: now - chrono::Duration::seconds(120),
            task_class: "site".into(),
            backends: vec![],
        };
        assert!(snap.is_fresh(Duration::from_secs(300), now));
        assert!(!snap.is_fresh(Duration::from_secs(60), now));
    }
}
