//! Pod mutation
//!
//! Turns a decoded Pod into an admission decision: allow untouched, or allow
//! with a JSON patch that replaces only the image fields that changed. A pod
//! is never denied; when the cache is cold the pod is allowed as written.

use std::fmt;
use std::sync::Arc;

use json_patch::{Patch, PatchOperation, ReplaceOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::{Container, Pod};
use tracing::{debug, info, warn};

use crate::cache::{CacheSnapshot, ProjectsCache};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::rewrite::{ImageRewriter, RewritePlan};

/// Which container list of the pod spec an image belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// `spec.initContainers`
    Init,
    /// `spec.containers`
    App,
}

impl ContainerKind {
    /// Field name in the pod spec
    pub fn field(self) -> &'static str {
        match self {
            Self::Init => "initContainers",
            Self::App => "containers",
        }
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// One image field to replace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageChange {
    /// Container list the change applies to
    pub kind: ContainerKind,
    /// Index within that list
    pub index: usize,
    /// Container name
    pub container: String,
    /// Image as written
    pub from: String,
    /// Proxied image
    pub to: String,
}

impl ImageChange {
    /// JSON pointer to the image field
    pub fn path(&self) -> PointerBuf {
        let index = self.index.to_string();
        PointerBuf::from_tokens(["spec", self.kind.field(), index.as_str(), "image"])
    }

    /// `replace` operation for this change
    pub fn to_operation(&self) -> PatchOperation {
        PatchOperation::Replace(ReplaceOperation {
            path: self.path(),
            value: serde_json::Value::String(self.to.clone()),
        })
    }
}

/// Outcome of mutating one pod
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    /// Admit the pod as submitted
    Allow,
    /// Admit the pod with this patch applied
    Patch(Patch),
}

impl AdmissionDecision {
    /// Decision for a set of changes: no changes means no patch
    pub fn from_changes(changes: &[ImageChange]) -> Self {
        if changes.is_empty() {
            Self::Allow
        } else {
            Self::Patch(Patch(changes.iter().map(ImageChange::to_operation).collect()))
        }
    }

    /// The patch, if any
    pub fn patch(&self) -> Option<&Patch> {
        match self {
            Self::Allow => None,
            Self::Patch(patch) => Some(patch),
        }
    }
}

/// Plan every init and app container image of a pod against a snapshot
///
/// Init containers come first, matching pod start order. Containers without
/// an image are skipped.
pub fn plan_pod(snapshot: &CacheSnapshot, rewriter: &ImageRewriter, pod: &Pod) -> Vec<ImageChange> {
    let Some(spec) = pod.spec.as_ref() else {
        return Vec::new();
    };

    let init = spec
        .init_containers
        .iter()
        .flatten()
        .enumerate()
        .map(|(i, c)| (ContainerKind::Init, i, c));
    let app = spec
        .containers
        .iter()
        .enumerate()
        .map(|(i, c)| (ContainerKind::App, i, c));

    init.chain(app)
        .filter_map(|(kind, index, container)| plan_container(snapshot, rewriter, kind, index, container))
        .collect()
}

fn plan_container(
    snapshot: &CacheSnapshot,
    rewriter: &ImageRewriter,
    kind: ContainerKind,
    index: usize,
    container: &Container,
) -> Option<ImageChange> {
    let image = container.image.as_deref()?;
    match rewriter.plan(snapshot, image) {
        RewritePlan::NoChange => None,
        RewritePlan::Rewrite { new_reference } => Some(ImageChange {
            kind,
            index,
            container: container.name.clone(),
            from: image.to_string(),
            to: new_reference,
        }),
    }
}

/// Applies the rewrite engine to pods using the live cache
#[derive(Debug, Clone)]
pub struct PodMutator {
    cache: Arc<ProjectsCache>,
    rewriter: ImageRewriter,
    metrics: Option<Arc<Metrics>>,
}

impl PodMutator {
    /// Create a mutator over a cache and rewriter
    pub fn new(cache: Arc<ProjectsCache>, rewriter: ImageRewriter) -> Self {
        Self {
            cache,
            rewriter,
            metrics: None,
        }
    }

    /// Count rewritten images in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The cache this mutator reads
    pub fn cache(&self) -> &Arc<ProjectsCache> {
        &self.cache
    }

    /// Decide what to do with `pod`
    pub fn handle(&self, pod: &Pod) -> AdmissionDecision {
        let pod_name = pod_display_name(pod);

        let snapshot = match self.cache.list() {
            Ok(snapshot) => snapshot,
            Err(Error::NotPopulated) => {
                warn!(pod = %pod_name, "Registry mappings not loaded yet, allowing pod unmodified");
                return AdmissionDecision::Allow;
            }
            Err(e) => {
                warn!(pod = %pod_name, error = %e, "Registry mappings unavailable, allowing pod unmodified");
                return AdmissionDecision::Allow;
            }
        };

        let changes = plan_pod(&snapshot, &self.rewriter, pod);
        if changes.is_empty() {
            debug!(pod = %pod_name, "No images to rewrite");
        }
        for change in &changes {
            info!(
                pod = %pod_name,
                container = %change.container,
                kind = %change.kind,
                image = %change.from,
                rewritten = %change.to,
                "Rewriting image to proxy cache"
            );
            if let Some(metrics) = &self.metrics {
                metrics
                    .images_rewritten
                    .with_label_values(&[change.kind.field()])
                    .inc();
            }
        }

        AdmissionDecision::from_changes(&changes)
    }
}

/// `namespace/name`, falling back to `generateName` for pods not yet named
fn pod_display_name(pod: &Pod) -> String {
    let meta = &pod.metadata;
    let name = meta
        .name
        .as_deref()
        .or(meta.generate_name.as_deref())
        .unwrap_or("<unnamed>");
    match meta.namespace.as_deref() {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}
