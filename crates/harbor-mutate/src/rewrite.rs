//! Image rewrite engine
//!
//! Decides, for one image reference and one cache snapshot, whether the image
//! should be pulled through a Harbor proxy-cache project and what the proxied
//! reference is. Pure: no I/O, no shared state.

use tracing::{debug, warn};

use crate::cache::CacheSnapshot;
use crate::policy::RegistryPolicy;
use crate::reference::ImageReference;

/// Decision for a single image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewritePlan {
    /// Leave the image as written
    NoChange,
    /// Replace the image with `new_reference`
    Rewrite {
        /// Proxied image reference
        new_reference: String,
    },
}

impl RewritePlan {
    /// Whether the plan changes anything
    pub fn is_rewrite(&self) -> bool {
        matches!(self, Self::Rewrite { .. })
    }
}

/// Rewrites image references onto the Harbor host
#[derive(Debug, Clone)]
pub struct ImageRewriter {
    proxy_host: String,
    policy: RegistryPolicy,
}

impl ImageRewriter {
    /// Create a rewriter targeting `proxy_host` (e.g. `harbor.example.com`)
    pub fn new(proxy_host: impl Into<String>, policy: RegistryPolicy) -> Self {
        Self {
            proxy_host: proxy_host.into().to_ascii_lowercase(),
            policy,
        }
    }

    /// The Harbor host rewritten images point at
    pub fn proxy_host(&self) -> &str {
        &self.proxy_host
    }

    /// Classify `image` against `snapshot`
    pub fn plan(&self, snapshot: &CacheSnapshot, image: &str) -> RewritePlan {
        let reference = match ImageReference::parse(image) {
            Ok(reference) => reference,
            Err(e) => {
                warn!(image = %image, error = %e, "Unparseable image reference, leaving unchanged");
                return RewritePlan::NoChange;
            }
        };

        // Already on Harbor, either rewritten before or authored that way
        if reference
            .registry
            .as_deref()
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.proxy_host))
        {
            return RewritePlan::NoChange;
        }

        let resolved = self.policy.resolve(&reference);
        let Some(project) = snapshot.lookup(&resolved.registry) else {
            debug!(image = %image, registry = %resolved.registry, "No proxy-cache project for registry");
            return RewritePlan::NoChange;
        };

        let new_reference = format!(
            "{}/{}/{}{}",
            self.proxy_host,
            project.project_path,
            resolved.repository,
            reference.suffix()
        );

        // The project prefix can push a valid name past the grammar limits
        if let Err(e) = ImageReference::parse(&new_reference) {
            warn!(
                image = %image,
                rewritten = %new_reference,
                error = %e,
                "Proxied reference would be invalid, leaving unchanged"
            );
            return RewritePlan::NoChange;
        }

        RewritePlan::Rewrite { new_reference }
    }

    /// Apply the plan for `image`, returning the image to use
    pub fn rewrite(&self, snapshot: &CacheSnapshot, image: &str) -> String {
        match self.plan(snapshot, image) {
            RewritePlan::NoChange => image.to_string(),
            RewritePlan::Rewrite { new_reference } => new_reference,
        }
    }
}
