//! Default-registry resolution
//!
//! Container runtimes resolve an image without a registry host against a
//! default registry, and prefix single-component Docker Hub repositories with
//! `library/`. These rules are runtime specific, so they live in an injectable
//! policy instead of constants in the rewrite engine.

use crate::reference::ImageReference;

/// Registry every Docker-compatible runtime uses for unqualified images
pub const DOCKER_HUB: &str = "docker.io";

/// Namespace Docker Hub uses for official images
pub const DOCKER_HUB_OFFICIAL_NAMESPACE: &str = "library";

/// Other hostnames that serve Docker Hub
pub const DOCKER_HUB_ALIASES: [&str; 3] = ["index.docker.io", "registry-1.docker.io", "hub.docker.com"];

/// Rules for resolving image references to the registry they are pulled from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPolicy {
    /// Registry used when an image names none
    pub default_registry: String,
    /// Namespace prepended to single-component repositories on the default registry
    pub official_namespace: Option<String>,
    /// Hostnames that are the same registry as `default_registry`
    pub aliases: Vec<String>,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self::docker_hub()
    }
}

/// Effective pull location of an image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    /// Normalized registry host
    pub registry: String,
    /// Repository path on that registry
    pub repository: String,
}

impl RegistryPolicy {
    /// Docker/containerd behaviour: `docker.io` with the `library` namespace
    pub fn docker_hub() -> Self {
        Self {
            default_registry: DOCKER_HUB.to_string(),
            official_namespace: Some(DOCKER_HUB_OFFICIAL_NAMESPACE.to_string()),
            aliases: DOCKER_HUB_ALIASES.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Resolve where a reference is actually pulled from
    pub fn resolve(&self, reference: &ImageReference) -> ResolvedImage {
        let registry = match &reference.registry {
            Some(host) => self.canonical_host(host),
            None => self.default_registry.clone(),
        };

        let repository = match &self.official_namespace {
            Some(namespace)
                if registry == self.default_registry && !reference.repository.contains('/') =>
            {
                format!("{namespace}/{}", reference.repository)
            }
            _ => reference.repository.clone(),
        };

        ResolvedImage {
            registry,
            repository,
        }
    }

    /// Normalize a registry URL or host as reported by Harbor
    ///
    /// Drops the scheme, any path or query and trailing slashes, lowercases,
    /// and folds aliases into the default registry. Returns `None` when no
    /// host remains.
    pub fn normalize_endpoint(&self, endpoint: &str) -> Option<String> {
        let host = host_of(endpoint)?;
        Some(self.canonical_host(host))
    }

    /// Lowercase a bare host and fold aliases
    fn canonical_host(&self, host: &str) -> String {
        let host = host.to_ascii_lowercase();
        if self.aliases.iter().any(|alias| alias.eq_ignore_ascii_case(&host)) {
            self.default_registry.clone()
        } else {
            host
        }
    }
}

/// Host (and port) portion of a URL or bare host string
pub fn host_of(endpoint: &str) -> Option<&str> {
    let trimmed = endpoint.trim();
    let without_scheme = trimmed
        .split_once("://")
        .map_or(trimmed, |(_, rest)| rest);
    let host = without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    // Userinfo never identifies the registry
    let host = host.rsplit_once('@').map_or(host, |(_, h)| h);
    (!host.is_empty()).then_some(host)
}
