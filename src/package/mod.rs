//! FHIR IG package handling.
//!
//! Packages are npm-style bundles (`package/package.json` plus one JSON file
//! per conformance resource). They can be referenced as `id#version` and
//! resolved through the local package cache or the registry, or given
//! directly as a `.tgz` archive or an unpacked directory.

pub mod loader;
pub mod registry;

use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

use crate::engine::PackageSummary;

pub use loader::PackageLoader;
pub use registry::RegistryClient;

/// Resource types kept when a package is read; everything else is skipped
pub const CONFORMANCE_RESOURCE_TYPES: &[&str] = &[
    "StructureDefinition",
    "ValueSet",
    "CodeSystem",
    "ImplementationGuide",
];

static PACKAGE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*(#[A-Za-z0-9._\-+]+)?$")
        .expect("package id pattern is valid")
});

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("Invalid package reference '{0}'")]
    InvalidSpec(String),

    #[error("Package {0} is not in the package cache and downloads are disabled")]
    NotFound(String),

    #[error("Invalid package archive: {0}")]
    InvalidArchive(String),

    #[error("Missing or invalid package manifest in {0}")]
    Manifest(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A reference to an IG package
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageSpec {
    /// `id` or `id#version`, resolved through the cache or the registry
    Registry { id: String, version: Option<String> },
    /// A gzipped tarball on disk
    Archive(PathBuf),
    /// An unpacked package directory
    Directory(PathBuf),
}

impl PackageSpec {
    pub fn parse(value: &str) -> Result<Self, PackageError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(PackageError::InvalidSpec(value.to_string()));
        }

        if value.ends_with(".tgz") || value.ends_with(".tar.gz") {
            return Ok(PackageSpec::Archive(PathBuf::from(value)));
        }

        let path = Path::new(value);
        if path.is_dir() || value.starts_with('.') || value.contains('/') || value.contains('\\')
        {
            return Ok(PackageSpec::Directory(path.to_path_buf()));
        }

        if !PACKAGE_ID.is_match(value) {
            return Err(PackageError::InvalidSpec(value.to_string()));
        }

        Ok(match value.split_once('#') {
            Some((id, version)) => PackageSpec::Registry {
                id: id.to_string(),
                version: Some(version.to_string()),
            },
            None => PackageSpec::Registry {
                id: value.to_string(),
                version: None,
            },
        })
    }
}

impl std::fmt::Display for PackageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageSpec::Registry {
                id,
                version: Some(version),
            } => write!(f, "{id}#{version}"),
            PackageSpec::Registry { id, version: None } => write!(f, "{id}"),
            PackageSpec::Archive(path) | PackageSpec::Directory(path) => {
                write!(f, "{}", path.display())
            }
        }
    }
}

/// The `package.json` manifest
#[derive(Debug, Clone, Deserialize)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub canonical: Option<String>,
    #[serde(default, rename = "fhirVersions")]
    pub fhir_versions: Vec<String>,
    #[serde(default, rename = "fhir-version-list")]
    pub fhir_version_list: Vec<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// A loaded IG package: manifest data plus its conformance resources
#[derive(Debug, Clone)]
pub struct FhirPackage {
    pub id: String,
    pub version: String,
    pub canonical: Option<String>,
    pub fhir_versions: Vec<String>,
    pub dependencies: BTreeMap<String, String>,
    /// Conformance resources in file order
    pub resources: Vec<serde_json::Value>,
}

impl FhirPackage {
    pub fn from_manifest(manifest: PackageManifest, resources: Vec<serde_json::Value>) -> Self {
        let mut fhir_versions = manifest.fhir_versions;
        fhir_versions.extend(manifest.fhir_version_list);
        Self {
            id: manifest.name,
            version: manifest.version,
            canonical: manifest.canonical,
            fhir_versions,
            dependencies: manifest.dependencies,
            resources,
        }
    }

    /// `id#version`, the key used by the package cache
    pub fn key(&self) -> String {
        format!("{}#{}", self.id, self.version)
    }

    /// StructureDefinition URLs in this package, sorted and distinct
    pub fn profile_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = self
            .resources
            .iter()
            .filter(|r| {
                r.get("resourceType").and_then(|v| v.as_str()) == Some("StructureDefinition")
            })
            .filter_map(|r| r.get("url").and_then(|v| v.as_str()).map(str::to_string))
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    pub fn summary(&self) -> PackageSummary {
        PackageSummary {
            id: self.id.clone(),
            version: self.version.clone(),
            canonical: self.canonical.clone(),
            profiles: self.profile_urls(),
        }
    }
}

/// Whether a parsed JSON document is a conformance resource worth keeping
pub fn is_conformance_resource(resource: &serde_json::Value) -> bool {
    resource
        .get("resourceType")
        .and_then(|v| v.as_str())
        .is_some_and(|rt| CONFORMANCE_RESOURCE_TYPES.contains(&rt))
}
