use crate::errors::{Result, RewriteError};
use mosaic_core::VersionedPath;
use rustc_hash::FxHashMap;
use semver::{Version, VersionReq};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// The subset of `package.json` the rewriter cares about.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    /// Directory the descriptor was read from; filled in by the probe.
    #[serde(skip)]
    pub dir: PathBuf,
}

/// Resolves source files to the package that owns them.
///
/// Walks upward from a file until a package descriptor is found. Descriptors
/// marked `private` are skipped unless they sit at the project root, so the
/// local workspace can still name its own modules while private intermediate
/// workspaces are never mistaken for publishable dependencies. Parsed
/// descriptors are cached per directory for the lifetime of the probe.
pub struct PackageProbe {
    project_root: PathBuf,
    cache: FxHashMap<PathBuf, Option<Arc<PackageDescriptor>>>,
}

impl PackageProbe {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            cache: FxHashMap::default(),
        }
    }

    /// Find the nearest accepting package descriptor for `start`.
    pub fn find(&mut self, start: &Path) -> Result<Arc<PackageDescriptor>> {
        let mut current = if start.is_dir() {
            start
        } else {
            start
                .parent()
                .ok_or_else(|| RewriteError::NotInPackage(start.to_path_buf()))?
        };

        loop {
            if let Some(descriptor) = self.descriptor_at(current)?
                && (!descriptor.private || current == self.project_root)
            {
                return Ok(descriptor);
            }
            current = match current.parent() {
                Some(parent) => parent,
                None => return Err(RewriteError::NotInPackage(start.to_path_buf())),
            };
        }
    }

    /// The exact-version identifier for a module's own home:
    /// `pkg@version/subpath`.
    pub fn version_path(&mut self, module_path: &Path) -> Result<VersionedPath> {
        let descriptor = self.find(module_path)?;
        Ok(VersionedPath {
            pkg: descriptor.name.clone(),
            version: descriptor.version.clone(),
            sub: subpath(&descriptor.dir, module_path),
        })
    }

    /// The ranged identifier for a reference from `issuer_path` to
    /// `target_path`: `pkg@range/subpath`.
    ///
    /// The range is the one the issuer declares for the target package, with
    /// two overrides: a reference within a single package uses
    /// `~exactVersion` (unconditionally — the declared self-range, if any,
    /// is never consulted), and a `file:`-linked dependency uses
    /// `~<version read from the linked package's descriptor>`.
    pub fn semver_path(&mut self, issuer_path: &Path, target_path: &Path) -> Result<VersionedPath> {
        let target = self.find(target_path)?;
        let issuer = self.find(issuer_path)?;

        let range = if issuer.dir == target.dir {
            format!("~{}", target.version)
        } else {
            match issuer.dependencies.get(&target.name) {
                Some(declared) if declared.starts_with("file:") => {
                    format!("~{}", target.version)
                }
                Some(declared) => declared.clone(),
                None => {
                    return Err(RewriteError::UndeclaredDependency {
                        issuer: issuer.name.clone(),
                        target: target.name.clone(),
                    });
                }
            }
        };

        // Whatever reaches a chunk must be resolvable at runtime.
        if VersionReq::parse(&range).is_err() {
            return Err(RewriteError::BadPath(format!("{}@{}", target.name, range)));
        }

        Ok(VersionedPath {
            pkg: target.name.clone(),
            version: range,
            sub: subpath(&target.dir, target_path),
        })
    }

    fn descriptor_at(&mut self, dir: &Path) -> Result<Option<Arc<PackageDescriptor>>> {
        if let Some(cached) = self.cache.get(dir) {
            return Ok(cached.clone());
        }

        let manifest = dir.join("package.json");
        let loaded = if manifest.is_file() {
            let text = fs::read_to_string(&manifest)?;
            let mut descriptor: PackageDescriptor =
                serde_json::from_str(&text).map_err(|e| RewriteError::Descriptor {
                    path: manifest.clone(),
                    message: e.to_string(),
                })?;
            if Version::parse(&descriptor.version).is_err() {
                return Err(RewriteError::Descriptor {
                    path: manifest,
                    message: format!("'{}' is not an exact semver version", descriptor.version),
                });
            }
            descriptor.dir = dir.to_path_buf();
            Some(Arc::new(descriptor))
        } else {
            None
        };

        self.cache.insert(dir.to_path_buf(), loaded.clone());
        Ok(loaded)
    }
}

/// Module path relative to its package directory, as a `/`-separated string
/// with a leading slash, or empty when the module is the directory itself.
fn subpath(package_dir: &Path, module_path: &Path) -> String {
    let relative = match module_path.strip_prefix(package_dir) {
        Ok(relative) => relative,
        Err(_) => return String::new(),
    };

    let mut out = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            out.push('/');
            out.push_str(&part.to_string_lossy());
        }
    }
    out
}
