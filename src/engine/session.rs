//! Engine session: an initialized engine plus what it was built from

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    ConformanceEngine, DefinitionAdditions, DefinitionSet, EngineError, ValidationEngine,
};
use crate::core::{EngineConfig, FhirVersion, ValidationRequest};
use crate::error::{Result, ServiceError};
use crate::outcome::{OutcomeFormatter, ValidationOutcome};
use crate::package::{FhirPackage, PackageLoader, PackageSpec, RegistryClient, loader};
use crate::terminology::{TerminologyController, TerminologyMode};

/// An initialized validation engine, shared read-only by every request.
///
/// A session is only handed out once initialization has fully succeeded.
/// Loading more definitions produces a new session; an existing one never
/// changes.
#[derive(Clone)]
pub struct EngineSession {
    engine: Arc<dyn ValidationEngine>,
    fhir_version: FhirVersion,
    terminology_mode: TerminologyMode,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSession")
            .field("engine", &self.engine.info())
            .field("fhir_version", &self.fhir_version)
            .field("terminology_mode", &self.terminology_mode)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl EngineSession {
    /// Load the configured IG packages and build the built-in engine.
    ///
    /// Any configured package that cannot be resolved fails initialization.
    /// Package dependencies are resolved on a best-effort basis.
    pub async fn initialize(
        config: &EngineConfig,
        terminology: TerminologyController,
    ) -> Result<Self> {
        let loader = package_loader(config)?;
        let packages = load_packages(config, &loader).await?;

        let definitions = DefinitionSet::build(config.fhir_version, &packages, &[])
            .map_err(|e| ServiceError::Init(e.message))?;

        info!(
            fhir_version = %config.fhir_version,
            packages = packages.len(),
            resource_types = definitions.resource_types().len(),
            structures = definitions.structure_urls().len(),
            terminology = %terminology.mode(),
            "Engine session initialized"
        );

        let terminology_mode = terminology.mode();
        let engine = ConformanceEngine::new(definitions, Arc::new(terminology));
        Ok(Self::with_engine(
            Arc::new(engine),
            config.fhir_version,
            terminology_mode,
        ))
    }

    /// Wrap an already initialized engine
    pub fn with_engine(
        engine: Arc<dyn ValidationEngine>,
        fhir_version: FhirVersion,
        terminology_mode: TerminologyMode,
    ) -> Self {
        Self {
            engine,
            fhir_version,
            terminology_mode,
            created_at: Utc::now(),
        }
    }

    pub fn engine(&self) -> &Arc<dyn ValidationEngine> {
        &self.engine
    }

    pub fn fhir_version(&self) -> FhirVersion {
        self.fhir_version
    }

    pub fn terminology_mode(&self) -> TerminologyMode {
        self.terminology_mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Validate a request and format the engine's issues
    pub async fn validate(
        &self,
        request: &ValidationRequest,
    ) -> std::result::Result<ValidationOutcome, EngineError> {
        let issues = self.engine.validate(request).await?;
        Ok(OutcomeFormatter::format(issues))
    }

    /// Derive a session with additional definitions, leaving this one as is
    pub fn extend(&self, additions: DefinitionAdditions) -> std::result::Result<Self, EngineError> {
        let engine = self.engine.extend(additions)?;
        Ok(Self::with_engine(
            engine,
            self.fhir_version,
            self.terminology_mode,
        ))
    }
}

/// Package loader for the configured cache, with the registry when downloads are allowed
pub fn package_loader(config: &EngineConfig) -> Result<PackageLoader> {
    let loader = PackageLoader::new(&config.package_cache);
    if !config.allow_download {
        return Ok(loader);
    }
    let registry = RegistryClient::new(&config.registry_url, std::time::Duration::from_secs(120))
        .map_err(|e| ServiceError::Init(e.to_string()))?;
    Ok(loader.with_registry(registry))
}

/// Package references named by the configuration, in load order:
/// explicit packages first, then whatever the IG directory holds
pub fn configured_specs(config: &EngineConfig) -> Result<Vec<PackageSpec>> {
    let mut specs = config
        .packages
        .iter()
        .map(|value| PackageSpec::parse(value).map_err(|e| ServiceError::Init(e.to_string())))
        .collect::<Result<Vec<_>>>()?;

    if let Some(dir) = &config.ig_directory {
        if dir.is_dir() {
            let found = loader::scan_directory(dir).map_err(|e| {
                ServiceError::Init(format!("Could not scan {}: {e}", dir.display()))
            })?;
            debug!(directory = %dir.display(), packages = found.len(), "Scanned IG directory");
            specs.extend(found);
        } else {
            debug!(directory = %dir.display(), "IG directory not present, skipping");
        }
    }

    Ok(specs)
}

/// Load every configured package and then their dependencies.
///
/// A configured package that fails to load is fatal. A dependency that
/// fails is logged and skipped; the core package of the session's own FHIR
/// version is never required.
pub async fn load_packages(
    config: &EngineConfig,
    loader: &PackageLoader,
) -> Result<Vec<FhirPackage>> {
    let mut packages = Vec::new();
    let mut seen = BTreeSet::new();

    for spec in configured_specs(config)? {
        let package = loader.load(&spec).await.map_err(|e| {
            ServiceError::Init(format!("Could not load IG package {spec}: {e}"))
        })?;
        info!(package = %package.key(), resources = package.resources.len(), "Loaded IG package");
        seen.insert(package.id.clone());
        packages.push(package);
    }

    let mut pending: VecDeque<(String, String)> = packages
        .iter()
        .flat_map(|p| p.dependencies.clone())
        .collect();

    while let Some((id, version)) = pending.pop_front() {
        if seen.contains(&id) {
            continue;
        }
        seen.insert(id.clone());

        let spec = PackageSpec::Registry {
            id: id.clone(),
            version: Some(version.clone()),
        };
        match loader.load(&spec).await {
            Ok(package) => {
                info!(package = %package.key(), "Loaded package dependency");
                pending.extend(package.dependencies.clone());
                packages.push(package);
            }
            Err(e) if id == config.fhir_version.core_package() => {
                debug!(
                    package = %spec,
                    error = %e,
                    "Core package not available, using built-in base definitions"
                );
            }
            Err(e) => {
                warn!(package = %spec, error = %e, "Could not load package dependency");
            }
        }
    }

    Ok(packages)
}
