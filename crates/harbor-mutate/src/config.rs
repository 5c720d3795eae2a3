//! Harbor connection settings
//!
//! Values arrive already parsed from the binary's CLI; nothing here reads
//! flags, environment variables or files.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::{host_of, RegistryPolicy};
use crate::reference::looks_like_registry;

/// Default interval between cache refreshes
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Default timeout for a single Harbor API call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of items requested per Harbor API page
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Largest page size the Harbor API accepts
const MAX_PAGE_SIZE: u32 = 100;

/// Configuration for talking to Harbor and rewriting onto it
#[derive(Clone)]
pub struct HarborConfig {
    /// Harbor address, with or without scheme (e.g. `harbor.example.com`)
    ///
    /// The host part is also the registry host images are rewritten to.
    pub address: String,
    /// API username; empty disables basic auth
    pub username: String,
    /// API password
    pub password: String,
    /// How often the project/registry mapping is refreshed
    pub resync_interval: Duration,
    /// Timeout for each Harbor API call
    pub timeout: Duration,
    /// Skip TLS certificate verification of Harbor
    pub skip_verify: bool,
    /// Items per page when listing projects and registries
    pub page_size: u32,
    /// Default-registry resolution rules
    pub policy: RegistryPolicy,
}

impl std::fmt::Debug for HarborConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarborConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("resync_interval", &self.resync_interval)
            .field("timeout", &self.timeout)
            .field("skip_verify", &self.skip_verify)
            .field("page_size", &self.page_size)
            .field("policy", &self.policy)
            .finish()
    }
}

impl Default for HarborConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            username: String::new(),
            password: String::new(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            skip_verify: false,
            page_size: DEFAULT_PAGE_SIZE,
            policy: RegistryPolicy::default(),
        }
    }
}

impl HarborConfig {
    /// Create a configuration for the given Harbor address with defaults
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Check the configuration before anything is started
    pub fn validate(&self) -> Result<()> {
        let host = self.proxy_host()?;
        if !looks_like_registry(&host) {
            return Err(Error::configuration(format!(
                "harbor host {host:?} would be read as a Docker Hub namespace; \
                 use a fully qualified hostname or add a port"
            )));
        }
        if self.resync_interval.is_zero() {
            return Err(Error::configuration("resync interval must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(Error::configuration("timeout must be greater than zero"));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(Error::configuration(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if self.password.is_empty() != self.username.is_empty() {
            return Err(Error::configuration(
                "harbor username and password must be set together",
            ));
        }
        Ok(())
    }

    /// Registry host that rewritten images point at
    pub fn proxy_host(&self) -> Result<String> {
        host_of(&self.address)
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| Error::configuration(format!("invalid harbor address {:?}", self.address)))
    }

    /// Base URL of the Harbor API, defaulting to https
    pub fn api_base(&self) -> Result<String> {
        let address = self.address.trim().trim_end_matches('/');
        if address.is_empty() {
            return Err(Error::configuration("harbor address is empty"));
        }
        if address.contains("://") {
            Ok(address.to_string())
        } else {
            Ok(format!("https://{address}"))
        }
    }

    /// Upper bound on one complete refresh
    pub fn refresh_deadline(&self) -> Duration {
        self.resync_interval
    }

    /// HTTP client honoring the timeout and TLS verification settings
    pub fn build_http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.skip_verify)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build HTTP client: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::bare("harbor.example.com", "harbor.example.com", "https://harbor.example.com")]
    #[case::https("https://harbor.example.com/", "harbor.example.com", "https://harbor.example.com")]
    #[case::http_port("http://Harbor.local:8080", "harbor.local:8080", "http://Harbor.local:8080")]
    fn derives_proxy_host_and_api_base(
        #[case] address: &str,
        #[case] host: &str,
        #[case] base: &str,
    ) {
        let config = HarborConfig::new(address);
        assert_eq!(config.proxy_host().unwrap(), host);
        assert_eq!(config.api_base().unwrap(), base);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_host_that_runtimes_would_send_to_docker_hub() {
        let err = HarborConfig::new("harbor").validate().unwrap_err();
        assert!(err.to_string().contains("Docker Hub namespace"));

        assert!(HarborConfig::new("harbor:443").validate().is_ok());
        assert!(HarborConfig::new("localhost").validate().is_ok());
    }

    #[test]
    fn rejects_empty_address() {
        assert!(HarborConfig::default().validate().is_err());
        assert!(HarborConfig::default().api_base().is_err());
    }

    #[test]
    fn rejects_zero_durations_and_bad_page_sizes() {
        let mut config = HarborConfig::new("harbor.example.com");
        config.resync_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = HarborConfig::new("harbor.example.com");
        config.timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = HarborConfig::new("harbor.example.com");
        config.page_size = 0;
        assert!(config.validate().is_err());
        config.page_size = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn credentials_come_in_pairs() {
        let mut config = HarborConfig::new("harbor.example.com");
        config.username = "robot$webhook".to_string();
        assert!(config.validate().is_err());
        config.password = "secret".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn debug_output_redacts_password() {
        let mut config = HarborConfig::new("harbor.example.com");
        config.username = "admin".to_string();
        config.password = "hunter2".to_string();
        let debug = format!("{config:?}");
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn refresh_deadline_never_exceeds_interval() {
        let mut config = HarborConfig::new("harbor.example.com");
        config.resync_interval = Duration::from_secs(30);
        assert!(config.refresh_deadline() <= config.resync_interval);
    }
}
