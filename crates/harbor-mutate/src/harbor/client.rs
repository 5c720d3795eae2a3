//! Harbor REST client

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::types::{Project, Registry};
use super::{ProjectSource, UpstreamProject};
use crate::config::HarborConfig;
use crate::error::{Error, Result};

/// Path prefix of the Harbor v2.0 API
const API_PREFIX: &str = "/api/v2.0";

/// Upper bound on pages fetched for one listing
pub const MAX_PAGES: u32 = 1000;

/// Client for the Harbor project and registry listings
#[derive(Debug, Clone)]
pub struct HarborClient {
    http: reqwest::Client,
    api_base: String,
    credentials: Option<(String, String)>,
    page_size: u32,
}

impl HarborClient {
    /// Create a client from validated configuration
    pub fn new(config: &HarborConfig) -> Result<Self> {
        Self::with_client(config.build_http_client()?, config)
    }

    /// Create a client around an existing HTTP client
    pub fn with_client(http: reqwest::Client, config: &HarborConfig) -> Result<Self> {
        let credentials = (!config.username.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));
        Ok(Self {
            http,
            api_base: format!("{}{API_PREFIX}", config.api_base()?),
            credentials,
            page_size: config.page_size.max(1),
        })
    }

    /// List all projects, following pagination
    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        self.list_all("projects").await
    }

    /// List all registry endpoints, following pagination
    pub async fn list_registries(&self) -> Result<Vec<Registry>> {
        self.list_all("registries").await
    }

    /// Fetch every page of a listing
    ///
    /// Stops on the first page shorter than the page size. Elements that fail
    /// to decode are skipped; a page that is not a JSON array fails the whole
    /// listing.
    async fn list_all<T: DeserializeOwned>(&self, resource: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();

        for page in 1..=MAX_PAGES {
            let raw = self.get_page(resource, page).await?;
            let received = raw.len();

            for value in raw {
                match serde_json::from_value::<T>(value) {
                    Ok(item) => items.push(item),
                    Err(e) => warn!(
                        resource = %resource,
                        page = page,
                        error = %e,
                        "Skipping undecodable harbor item"
                    ),
                }
            }

            if received < self.page_size as usize {
                debug!(resource = %resource, pages = page, items = items.len(), "Harbor listing complete");
                return Ok(items);
            }
        }

        Err(Error::harbor_payload(
            format!("{}/{resource}", self.api_base),
            format!("listing did not end within {MAX_PAGES} pages"),
        ))
    }

    async fn get_page(&self, resource: &str, page: u32) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/{resource}", self.api_base);

        let mut request = self
            .http
            .get(&url)
            .query(&[("page", page), ("page_size", self.page_size)]);
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::harbor_request(&url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::harbor_status(&url, status.as_u16()));
        }

        response
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| Error::harbor_payload(&url, e.to_string()))
    }
}

#[async_trait]
impl ProjectSource for HarborClient {
    async fn list_proxy_projects(&self) -> Result<Vec<UpstreamProject>> {
        let projects = self.list_projects().await?;
        let registries = self.list_registries().await?;
        Ok(join_projects(projects, registries))
    }
}

/// Pair proxy-cache projects with the URL of the registry they mirror
fn join_projects(projects: Vec<Project>, registries: Vec<Registry>) -> Vec<UpstreamProject> {
    let urls: HashMap<i64, String> = registries.into_iter().map(|r| (r.id, r.url)).collect();

    projects
        .into_iter()
        .filter_map(|project| {
            let registry_id = project.proxied_registry()?;
            match urls.get(&registry_id) {
                Some(url) => Some(UpstreamProject {
                    project_id: project.project_id,
                    project_name: project.name,
                    registry_url: url.clone(),
                }),
                None => {
                    warn!(
                        project = %project.name,
                        registry_id = registry_id,
                        "Proxy-cache project references unknown registry, skipping"
                    );
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(id: i64, name: &str, registry_id: Option<i64>) -> Project {
        Project {
            project_id: id,
            name: name.to_string(),
            registry_id,
        }
    }

    fn registry(id: i64, url: &str) -> Registry {
        Registry {
            id,
            name: format!("registry-{id}"),
            url: url.to_string(),
            kind: "docker-registry".to_string(),
        }
    }

    #[test]
    fn join_keeps_only_proxy_cache_projects() {
        let joined = join_projects(
            vec![
                project(1, "library", None),
                project(2, "dockerhub", Some(10)),
                project(3, "quay", Some(11)),
            ],
            vec![
                registry(10, "https://registry-1.docker.io"),
                registry(11, "https://quay.io"),
            ],
        );

        assert_eq!(
            joined,
            vec![
                UpstreamProject {
                    project_id: 2,
                    project_name: "dockerhub".to_string(),
                    registry_url: "https://registry-1.docker.io".to_string(),
                },
                UpstreamProject {
                    project_id: 3,
                    project_name: "quay".to_string(),
                    registry_url: "https://quay.io".to_string(),
                },
            ]
        );
    }

    #[test]
    fn join_skips_dangling_registry_references() {
        let joined = join_projects(
            vec![project(2, "ghcr", Some(99))],
            vec![registry(10, "https://ghcr.io")],
        );
        assert!(joined.is_empty());
    }

    #[test]
    fn client_targets_v2_api_under_configured_address() {
        let config = HarborConfig::new("harbor.example.com");
        let client = HarborClient::new(&config).unwrap();
        assert_eq!(client.api_base, "https://harbor.example.com/api/v2.0");
        assert!(client.credentials.is_none());

        let mut config = HarborConfig::new("http://127.0.0.1:8080/");
        config.username = "admin".to_string();
        config.password = "Harbor12345".to_string();
        let client = HarborClient::new(&config).unwrap();
        assert_eq!(client.api_base, "http://127.0.0.1:8080/api/v2.0");
        assert_eq!(
            client.credentials,
            Some(("admin".to_string(), "Harbor12345".to_string()))
        );
    }
}
