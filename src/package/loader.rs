//! Package resolution and reading

use flate2::read::GzDecoder;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info, warn};

use super::{
    FhirPackage, PackageError, PackageManifest, PackageSpec, RegistryClient,
    is_conformance_resource,
};

/// Resolves package references to loaded packages.
///
/// Registry references are looked up in the local cache first
/// (`<cache>/<id>#<version>/package`). A miss is downloaded only when a
/// registry client is configured.
#[derive(Debug, Clone)]
pub struct PackageLoader {
    cache_dir: PathBuf,
    registry: Option<RegistryClient>,
}

impl PackageLoader {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            registry: None,
        }
    }

    pub fn with_registry(mut self, registry: RegistryClient) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Load the package a spec points at
    pub async fn load(&self, spec: &PackageSpec) -> Result<FhirPackage, PackageError> {
        match spec {
            PackageSpec::Archive(path) => {
                let path = path.clone();
                blocking(move || {
                    let bytes = fs::read(&path)?;
                    read_archive(&bytes)
                })
                .await
            }
            PackageSpec::Directory(path) => {
                let path = path.clone();
                blocking(move || read_directory(&path)).await
            }
            PackageSpec::Registry { id, version } => {
                if let Some(dir) = self.find_cached(id, version.as_deref()) {
                    debug!(package = %id, path = %dir.display(), "Loading package from cache");
                    return blocking(move || read_directory(&dir)).await;
                }

                let Some(registry) = &self.registry else {
                    return Err(PackageError::NotFound(spec.to_string()));
                };

                let (version, bytes) = registry.download(id, version.as_deref()).await?;
                info!(package = %id, version = %version, "Downloaded package from registry");

                let target = self.cache_dir.join(format!("{id}#{version}"));
                blocking(move || {
                    match unpack_archive(&bytes, &target) {
                        Ok(()) => read_directory(&target),
                        Err(e) => {
                            warn!(
                                path = %target.display(),
                                error = %e,
                                "Could not write package to cache, reading archive directly"
                            );
                            read_archive(&bytes)
                        }
                    }
                })
                .await
            }
        }
    }

    /// `id#version` keys of every package present in the cache, sorted
    pub fn cached_packages(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return Vec::new();
        };

        let mut keys: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join("package").join("package.json").is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.contains('#'))
            .collect();
        keys.sort();
        keys
    }

    /// Manifests of every cached package, in key order. Unreadable manifests are skipped.
    pub fn cached_manifests(&self) -> Vec<PackageManifest> {
        self.cached_packages()
            .into_iter()
            .filter_map(|key| {
                let path = self.cache_dir.join(&key).join("package").join("package.json");
                match fs::read(&path).map_err(PackageError::from).and_then(|bytes| {
                    serde_json::from_slice::<PackageManifest>(&bytes).map_err(PackageError::from)
                }) {
                    Ok(manifest) => Some(manifest),
                    Err(e) => {
                        debug!(package = %key, error = %e, "Skipping unreadable cached manifest");
                        None
                    }
                }
            })
            .collect()
    }

    /// Find a cached package directory, picking the highest version when none is given
    fn find_cached(&self, id: &str, version: Option<&str>) -> Option<PathBuf> {
        if let Some(version) = version {
            let dir = self.cache_dir.join(format!("{id}#{version}"));
            return dir.join("package").join("package.json").is_file().then_some(dir);
        }

        let prefix = format!("{id}#");
        self.cached_packages()
            .into_iter()
            .filter(|key| key.starts_with(&prefix))
            .max_by(|a, b| compare_versions(&a[prefix.len()..], &b[prefix.len()..]))
            .map(|key| self.cache_dir.join(key))
    }
}

/// Package references found in an IG directory: archives and unpacked packages
pub fn scan_directory(dir: &Path) -> Result<Vec<PackageSpec>, PackageError> {
    let mut specs = Vec::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    entries.sort();

    for path in entries {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if path.is_file() && (name.ends_with(".tgz") || name.ends_with(".tar.gz")) {
            specs.push(PackageSpec::Archive(path));
        } else if path.is_dir()
            && (path.join("package").join("package.json").is_file()
                || path.join("package.json").is_file())
        {
            specs.push(PackageSpec::Directory(path));
        }
    }

    Ok(specs)
}

/// Read a gzipped package tarball held in memory
pub fn read_archive(bytes: &[u8]) -> Result<FhirPackage, PackageError> {
    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
    let mut manifest: Option<PackageManifest> = None;
    let mut resources = Vec::new();

    let entries = archive
        .entries()
        .map_err(|e| PackageError::InvalidArchive(e.to_string()))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| PackageError::InvalidArchive(e.to_string()))?;
        if entry.header().entry_type().is_dir() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| PackageError::InvalidArchive(e.to_string()))?
            .into_owned();
        let Some(name) = package_root_file(&path) else {
            continue;
        };

        let mut contents = String::new();
        if let Err(e) = entry.read_to_string(&mut contents) {
            warn!(file = %path.display(), error = %e, "Skipping unreadable package entry");
            continue;
        }

        if name == "package.json" {
            manifest = Some(
                serde_json::from_str(&contents)
                    .map_err(|e| PackageError::Manifest(format!("archive: {e}")))?,
            );
        } else if let Some(resource) = parse_resource_file(&path, &contents) {
            resources.push(resource);
        }
    }

    let manifest = manifest.ok_or_else(|| PackageError::Manifest("archive".to_string()))?;
    Ok(FhirPackage::from_manifest(manifest, resources))
}

/// Read an unpacked package directory (either the package root or its parent)
pub fn read_directory(dir: &Path) -> Result<FhirPackage, PackageError> {
    let root = if dir.join("package").join("package.json").is_file() {
        dir.join("package")
    } else {
        dir.to_path_buf()
    };

    let manifest_path = root.join("package.json");
    let manifest: PackageManifest = fs::read_to_string(&manifest_path)
        .map_err(|_| PackageError::Manifest(root.display().to_string()))
        .and_then(|text| {
            serde_json::from_str(&text)
                .map_err(|e| PackageError::Manifest(format!("{}: {e}", root.display())))
        })?;

    let mut files: Vec<PathBuf> = fs::read_dir(&root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            name != "package.json" && !name.starts_with('.')
        })
        .collect();
    files.sort();

    let mut resources = Vec::new();
    for file in files {
        match fs::read_to_string(&file) {
            Ok(contents) => {
                if let Some(resource) = parse_resource_file(&file, &contents) {
                    resources.push(resource);
                }
            }
            Err(e) => warn!(file = %file.display(), error = %e, "Skipping unreadable package file"),
        }
    }

    Ok(FhirPackage::from_manifest(manifest, resources))
}

/// Unpack a package tarball into a cache directory
pub fn unpack_archive(bytes: &[u8], target: &Path) -> Result<(), PackageError> {
    fs::create_dir_all(target)?;
    let mut archive = Archive::new(GzDecoder::new(Cursor::new(bytes)));
    archive
        .unpack(target)
        .map_err(|e| PackageError::InvalidArchive(e.to_string()))
}

/// File name of an entry that sits directly under `package/`, if any.
/// Examples, `other/` material and dot-files are ignored.
fn package_root_file(path: &Path) -> Option<String> {
    let mut components = path.components();
    let first = components.next()?.as_os_str().to_str()?;
    let second = components.next()?.as_os_str().to_str()?;
    if first != "package" || components.next().is_some() {
        return None;
    }
    if second.starts_with('.') || !second.ends_with(".json") {
        return None;
    }
    Some(second.to_string())
}

fn parse_resource_file(path: &Path, contents: &str) -> Option<serde_json::Value> {
    match serde_json::from_str::<serde_json::Value>(contents) {
        Ok(resource) if is_conformance_resource(&resource) => Some(resource),
        Ok(_) => None,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "Skipping malformed package file");
            None
        }
    }
}

/// Compare dotted version strings numerically where possible
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Vec<(u64, String)> {
        v.split(['.', '-'])
            .map(|part| (part.parse::<u64>().unwrap_or(0), part.to_string()))
            .collect()
    };
    parse(a).cmp(&parse(b))
}

async fn blocking<T, F>(f: F) -> Result<T, PackageError>
where
    F: FnOnce() -> Result<T, PackageError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PackageError::Io(std::io::Error::other(e.to_string())))?
}
