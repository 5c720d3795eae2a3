//! Registry-mapping cache
//!
//! Holds the latest [`CacheSnapshot`] of upstream registry -> proxy-cache
//! project mappings. Readers clone an `Arc` under a read lock that is never
//! held across I/O; a refresh builds the next snapshot off to the side and
//! swaps the pointer in one write. A failed refresh leaves the previous
//! snapshot in place.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::harbor::{ProjectSource, UpstreamProject};
use crate::metrics::Metrics;
use crate::policy::RegistryPolicy;

/// One upstream registry mirrored by a Harbor proxy-cache project
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyProject {
    /// Normalized host (and port) of the mirrored registry
    pub registry_endpoint: String,
    /// Path under the Harbor host that serves the mirror
    pub project_path: String,
}

/// Immutable point-in-time view of the registry mappings
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    projects: BTreeMap<String, ProxyProject>,
    generation: u64,
    built_at: Instant,
}

impl CacheSnapshot {
    /// A snapshot with no mappings
    pub fn empty() -> Self {
        Self {
            projects: BTreeMap::new(),
            generation: 0,
            built_at: Instant::now(),
        }
    }

    /// Build a snapshot, keeping the first project listed for each endpoint
    pub fn from_projects(projects: impl IntoIterator<Item = ProxyProject>, generation: u64) -> Self {
        let mut by_endpoint: BTreeMap<String, ProxyProject> = BTreeMap::new();
        for project in projects {
            match by_endpoint.entry(project.registry_endpoint.clone()) {
                Entry::Occupied(kept) => warn!(
                    endpoint = %project.registry_endpoint,
                    kept = %kept.get().project_path,
                    dropped = %project.project_path,
                    "Multiple proxy-cache projects mirror the same registry"
                ),
                Entry::Vacant(slot) => {
                    slot.insert(project);
                }
            }
        }
        Self {
            projects: by_endpoint,
            generation,
            built_at: Instant::now(),
        }
    }

    /// Project mirroring the given normalized registry host
    pub fn lookup(&self, registry_endpoint: &str) -> Option<&ProxyProject> {
        self.projects.get(registry_endpoint)
    }

    /// All mappings, ordered by endpoint
    pub fn projects(&self) -> impl Iterator<Item = &ProxyProject> {
        self.projects.values()
    }

    /// Number of mappings
    pub fn len(&self) -> usize {
        self.projects.len()
    }

    /// Whether there are no mappings
    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Refresh counter that produced this snapshot (0 for the empty one)
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// When this snapshot was built
    pub fn built_at(&self) -> Instant {
        self.built_at
    }
}

impl Default for CacheSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

/// Background-refreshed cache of Harbor proxy-cache projects
pub struct ProjectsCache {
    source: Arc<dyn ProjectSource>,
    policy: RegistryPolicy,
    deadline: Duration,
    snapshot: RwLock<Option<Arc<CacheSnapshot>>>,
    /// Serializes refreshes so two never overlap
    refresh_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl ProjectsCache {
    /// Create an empty cache over a project source
    pub fn new(source: Arc<dyn ProjectSource>, policy: RegistryPolicy, deadline: Duration) -> Self {
        Self {
            source,
            policy,
            deadline,
            snapshot: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// Record refresh outcomes and the mapping count in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Latest successful snapshot, without touching the network
    ///
    /// Returns [`Error::NotPopulated`] until the first refresh succeeds.
    pub fn list(&self) -> Result<Arc<CacheSnapshot>> {
        self.snapshot.read().clone().ok_or(Error::NotPopulated)
    }

    /// Latest snapshot, or an empty one when the cache is cold
    pub fn list_or_empty(&self) -> Arc<CacheSnapshot> {
        self.list().unwrap_or_else(|_| Arc::new(CacheSnapshot::empty()))
    }

    /// Whether a refresh has ever succeeded
    pub fn is_populated(&self) -> bool {
        self.snapshot.read().is_some()
    }

    /// When the held snapshot was built
    pub fn last_refresh(&self) -> Option<Instant> {
        self.snapshot.read().as_ref().map(|s| s.built_at())
    }

    /// Fetch the full listing and replace the snapshot
    ///
    /// All-or-nothing: on any error the held snapshot is left untouched.
    /// Returns the number of mappings in the new snapshot.
    pub async fn refresh(&self) -> Result<usize> {
        let _guard = self.refresh_lock.lock().await;

        let result = self.refresh_locked().await;
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(count) => {
                    metrics.refresh_success.inc();
                    metrics.mappings.set(*count as i64);
                }
                Err(_) => metrics.refresh_failure.inc(),
            }
        }
        result
    }

    async fn refresh_locked(&self) -> Result<usize> {
        let upstream = tokio::time::timeout(self.deadline, self.source.list_proxy_projects())
            .await
            .map_err(|_| Error::RefreshTimeout {
                deadline: self.deadline,
            })??;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = CacheSnapshot::from_projects(self.normalize(upstream), generation);
        let count = snapshot.len();

        let previous = self.snapshot.write().replace(Arc::new(snapshot));

        match previous {
            Some(prev) if prev.len() == count => {
                debug!(mappings = count, generation = generation, "Registry mappings refreshed")
            }
            _ => info!(mappings = count, generation = generation, "Registry mappings updated"),
        }
        Ok(count)
    }

    /// Normalize upstream URLs, dropping entries without a usable host
    fn normalize(&self, mut upstream: Vec<UpstreamProject>) -> Vec<ProxyProject> {
        // Lowest project id wins when two projects mirror one registry
        upstream.sort_by_key(|p| p.project_id);

        upstream
            .into_iter()
            .filter_map(|p| match self.policy.normalize_endpoint(&p.registry_url) {
                Some(endpoint) => Some(ProxyProject {
                    registry_endpoint: endpoint,
                    project_path: p.project_name.trim_matches('/').to_string(),
                }),
                None => {
                    warn!(
                        project = %p.project_name,
                        url = %p.registry_url,
                        "Registry URL has no host, skipping"
                    );
                    None
                }
            })
            .collect()
    }
}

impl std::fmt::Debug for ProjectsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectsCache")
            .field("policy", &self.policy)
            .field("deadline", &self.deadline)
            .field("snapshot", &self.snapshot.read())
            .finish_non_exhaustive()
    }
}
