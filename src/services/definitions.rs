//! Definition service: introspection and runtime loading of profiles and IGs

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::SessionHandle;
use crate::engine::{DefinitionAdditions, PackageSummary};
use crate::error::{Result, ServiceError};
use crate::package::{PackageLoader, PackageSpec, loader};

/// Reports what the current session knows and derives extended sessions.
///
/// Loading never touches a live session: the current engine is extended
/// into a new one, which is then swapped in for subsequent requests.
pub struct DefinitionService {
    sessions: Arc<SessionHandle>,
    loader: PackageLoader,
}

impl DefinitionService {
    pub fn new(sessions: Arc<SessionHandle>, loader: PackageLoader) -> Self {
        Self { sessions, loader }
    }

    /// Resource types known to the current engine
    pub async fn resource_types(&self) -> Vec<String> {
        self.sessions.current().await.engine().resource_types()
    }

    /// StructureDefinition URLs known to the current engine
    pub async fn profiles(&self) -> Vec<String> {
        self.sessions.current().await.engine().structures()
    }

    /// Package id to canonical, for loaded packages and everything in the
    /// package cache. Loaded packages win when both name the same id.
    pub async fn packages(&self) -> Result<BTreeMap<String, Option<String>>> {
        let loader = self.loader.clone();
        let cached = tokio::task::spawn_blocking(move || loader.cached_manifests())
            .await
            .map_err(|e| ServiceError::Internal(format!("Package cache scan failed: {e}")))?;

        let mut packages: BTreeMap<String, Option<String>> = cached
            .into_iter()
            .map(|manifest| (manifest.name, manifest.canonical))
            .collect();
        for package in self.sessions.current().await.engine().packages() {
            packages.insert(package.id, package.canonical);
        }
        Ok(packages)
    }

    /// Package id to the profiles it contributed, for loaded packages
    pub async fn profiles_by_package(&self) -> BTreeMap<String, Vec<String>> {
        self.sessions
            .current()
            .await
            .engine()
            .packages()
            .into_iter()
            .map(|package| (package.id, package.profiles))
            .collect()
    }

    /// Add a standalone StructureDefinition, returning its URL
    pub async fn load_profile(&self, definition: Value) -> Result<String> {
        let url = definition
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.apply(DefinitionAdditions::resource(definition)).await?;
        info!(profile = %url, "Loaded profile");
        Ok(url)
    }

    /// Add an IG package uploaded as a gzipped tarball
    pub async fn load_archive(&self, bytes: Vec<u8>) -> Result<PackageSummary> {
        let package = tokio::task::spawn_blocking(move || loader::read_archive(&bytes))
            .await
            .map_err(|e| ServiceError::Internal(format!("Package read failed: {e}")))??;

        let summary = package.summary();
        self.apply(DefinitionAdditions::package(package)).await?;
        info!(package = %summary.id, version = %summary.version, "Loaded uploaded IG package");
        Ok(summary)
    }

    /// Add an IG package from the package cache, or the registry when downloads are allowed
    pub async fn load_package(&self, id: &str, version: Option<&str>) -> Result<PackageSummary> {
        let spec = PackageSpec::parse(&match version {
            Some(version) => format!("{id}#{version}"),
            None => id.to_string(),
        })?;
        if !matches!(spec, PackageSpec::Registry { .. }) {
            return Err(ServiceError::BadRequest(format!(
                "'{id}' is not a package id"
            )));
        }

        let package = self.loader.load(&spec).await?;
        let summary = package.summary();
        self.apply(DefinitionAdditions::package(package)).await?;
        info!(package = %summary.id, version = %summary.version, "Loaded IG package");
        Ok(summary)
    }

    async fn apply(&self, additions: DefinitionAdditions) -> Result<()> {
        let _update = self.sessions.begin_update().await;
        let current = self.sessions.current().await;

        let next = tokio::task::spawn_blocking(move || current.extend(additions))
            .await
            .map_err(|e| ServiceError::Internal(format!("Definition loading failed: {e}")))??;

        self.sessions.replace(next).await;
        Ok(())
    }
}
