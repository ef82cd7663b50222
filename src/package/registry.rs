//! Package registry client (npm-style FHIR package registries)

use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::PackageError;

/// Downloads package tarballs from a FHIR package registry
#[derive(Debug, Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: String,
}

impl RegistryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PackageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PackageError::Registry(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Download a package, resolving the latest version when none is given.
    /// Returns the resolved version and the tarball bytes.
    pub async fn download(
        &self,
        id: &str,
        version: Option<&str>,
    ) -> Result<(String, Vec<u8>), PackageError> {
        let version = match version {
            Some(version) => version.to_string(),
            None => self.latest_version(id).await?,
        };

        // npm-style URL format: {registry}/{package}/-/{package}-{version}.tgz
        let url = format!("{}/{id}/-/{id}-{version}.tgz", self.base_url);
        debug!(url = %url, "Fetching package tarball");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PackageError::Registry(format!("{url}: {e}")))?;

        if !response.status().is_success() {
            return Err(PackageError::Registry(format!(
                "{url}: HTTP {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| PackageError::Registry(format!("{url}: {e}")))?;

        Ok((version, bytes.to_vec()))
    }

    async fn latest_version(&self, id: &str) -> Result<String, PackageError> {
        let url = format!("{}/{id}", self.base_url);
        let manifest: Value = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PackageError::Registry(format!("{url}: {e}")))?
            .json()
            .await
            .map_err(|e| PackageError::Registry(format!("{url}: {e}")))?;

        manifest
            .pointer("/dist-tags/latest")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                PackageError::Registry(format!("Could not determine latest version of {id}"))
            })
    }
}
