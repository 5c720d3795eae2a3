//! Pod image rewriting onto Harbor proxy-cache projects
//!
//! A background task mirrors Harbor's proxy-cache projects into an in-memory
//! registry mapping. The admission webhook consults that mapping to point
//! container images at `<harbor>/<project>/<repository>` so that pulls go
//! through the cache.

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod harbor;
pub mod metrics;
pub mod mutate;
pub mod policy;
pub mod reference;
pub mod refresh;
pub mod rewrite;
pub mod telemetry;
pub mod webhook;

pub use cache::{CacheSnapshot, ProjectsCache, ProxyProject};
pub use config::HarborConfig;
pub use error::{Error, Result};
pub use harbor::{HarborClient, ProjectSource, UpstreamProject};
pub use metrics::{metrics_router, Metrics};
pub use mutate::{AdmissionDecision, PodMutator};
pub use policy::RegistryPolicy;
pub use reference::ImageReference;
pub use refresh::RefreshTask;
pub use rewrite::{ImageRewriter, RewritePlan};
pub use webhook::{webhook_router, WebhookState};
