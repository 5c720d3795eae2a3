//! Harbor v2.0 API payloads
//!
//! Only the fields the cache reads are modelled; Harbor sends many more.

use serde::Deserialize;

/// A Harbor project (`GET /api/v2.0/projects`)
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Project {
    /// Project id
    pub project_id: i64,
    /// Project name
    pub name: String,
    /// Registry the project proxies; absent or zero for regular projects
    #[serde(default)]
    pub registry_id: Option<i64>,
}

impl Project {
    /// Id of the mirrored registry when this project is a proxy cache
    pub fn proxied_registry(&self) -> Option<i64> {
        self.registry_id.filter(|id| *id > 0)
    }
}

/// A registry endpoint configured in Harbor (`GET /api/v2.0/registries`)
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Registry {
    /// Registry id
    pub id: i64,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Endpoint URL (e.g. `https://registry-1.docker.io`)
    pub url: String,
    /// Adapter type (e.g. `docker-hub`, `quay`, `docker-registry`)
    #[serde(default, rename = "type")]
    pub kind: String,
}
