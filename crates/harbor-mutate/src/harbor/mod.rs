//! Harbor API access
//!
//! The cache only needs one question answered: which Harbor projects are
//! proxy caches, and for which upstream registry URL. [`ProjectSource`] is
//! that question; [`HarborClient`] answers it over the Harbor v2.0 REST API.

mod client;
mod types;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::Result;

pub use client::{HarborClient, MAX_PAGES};
pub use types::{Project, Registry};

/// A proxy-cache project as reported upstream, before normalization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProject {
    /// Harbor project id
    pub project_id: i64,
    /// Harbor project name (the path segment under the Harbor host)
    pub project_name: String,
    /// URL of the registry the project mirrors, as configured in Harbor
    pub registry_url: String,
}

/// Source of proxy-cache project listings
///
/// Abstracts the Harbor API for testability.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProjectSource: Send + Sync {
    /// List every proxy-cache project together with its upstream registry URL
    ///
    /// Either the complete listing or an error; never a partial result.
    async fn list_proxy_projects(&self) -> Result<Vec<UpstreamProject>>;
}
