//! Reading and writing `poetry.lock`.
//!
//! The lock file is TOML: one `[[package]]` table per resolved package
//! (sorted by name), the root project's `[extras]`, and a `[metadata]`
//! table carrying the content hash of the manifest it was produced from.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use pep440_rs::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SolveError};
use crate::manifest::{DependencySpec, Manifest};
use crate::marker::Marker;
use crate::package::{MAIN_GROUP, Package, PackageSource, canonicalize_name};
use crate::repository::InMemoryRepository;
use crate::version::VersionConstraint;

pub const LOCK_FILE: &str = "poetry.lock";
pub const LOCK_VERSION: &str = "1.1";

/// The whole lock file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockData {
    #[serde(default)]
    pub package: Vec<LockedPackage>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extras: IndexMap<String, Vec<String>>,
    pub metadata: LockMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockMetadata {
    pub lock_version: String,
    pub python_versions: String,
    pub content_hash: String,
}

/// One `[[package]]` entry. Index files use the same schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockedPackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "any_python")]
    pub python_versions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub dependencies: IndexMap<String, DependencySpec>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub extras: IndexMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<LockedSource>,
}

fn any_python() -> String {
    "*".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LockedSource {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdirectory: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub develop: bool,
}

impl LockedSource {
    fn from_source(source: &PackageSource) -> Option<Self> {
        let mut locked = LockedSource {
            kind: source.kind()?.to_string(),
            url: String::new(),
            reference: None,
            resolved_reference: None,
            subdirectory: None,
            develop: false,
        };
        match source {
            PackageSource::Default => return None,
            PackageSource::Legacy { name, url } => {
                locked.url = url.clone();
                locked.reference = Some(name.clone());
            }
            PackageSource::Directory { path, develop } => {
                locked.url = path.clone();
                locked.develop = *develop;
            }
            PackageSource::File { path } => locked.url = path.clone(),
            PackageSource::Url { url } => locked.url = url.clone(),
            PackageSource::Git {
                url,
                reference,
                resolved_reference,
                subdirectory,
            } => {
                locked.url = url.clone();
                locked.reference = reference.clone();
                locked.resolved_reference = resolved_reference.clone();
                locked.subdirectory = subdirectory.clone();
            }
        }
        Some(locked)
    }

    fn to_source(&self) -> std::result::Result<PackageSource, String> {
        let source = match self.kind.as_str() {
            "legacy" => PackageSource::Legacy {
                name: self.reference.clone().unwrap_or_default(),
                url: self.url.clone(),
            },
            "directory" => PackageSource::Directory {
                path: self.url.clone(),
                develop: self.develop,
            },
            "file" => PackageSource::File {
                path: self.url.clone(),
            },
            "url" => PackageSource::Url {
                url: self.url.clone(),
            },
            "git" => PackageSource::Git {
                url: self.url.clone(),
                reference: self.reference.clone(),
                resolved_reference: self.resolved_reference.clone(),
                subdirectory: self.subdirectory.clone(),
            },
            other => return Err(format!("unknown source type `{other}`")),
        };
        Ok(source)
    }
}

/// Name part of a PEP 508 requirement string (`bar (>=1.0) ; ...` -> `bar`).
pub(crate) fn requirement_name(requirement: &str) -> String {
    let end = requirement
        .find(|c: char| c.is_whitespace() || "([;<>=!~@".contains(c))
        .unwrap_or(requirement.len());
    canonicalize_name(&requirement[..end])
}

impl LockedPackage {
    pub fn from_package(package: &Package) -> Self {
        let requires = package.all_requires();
        let mut by_name: IndexMap<&str, Vec<_>> = IndexMap::new();
        for dep in &requires {
            by_name.entry(dep.pretty_name.as_str()).or_default().push(dep);
        }
        let dependencies = by_name
            .into_iter()
            .filter_map(|(name, deps)| {
                DependencySpec::from_dependencies(&deps).map(|spec| (name.to_string(), spec))
            })
            .collect();

        let extras = package
            .extras
            .iter()
            .map(|(extra, names)| {
                let rendered = names
                    .iter()
                    .map(|name| {
                        requires
                            .iter()
                            .find(|d| &d.name == name)
                            .map(|d| d.to_pep_508(false))
                            .unwrap_or_else(|| name.clone())
                    })
                    .collect();
                (extra.clone(), rendered)
            })
            .collect();

        LockedPackage {
            name: package.pretty_name.clone(),
            version: package.version.to_string(),
            description: package.description.clone(),
            optional: package.optional,
            python_versions: package.python_versions.pretty(),
            markers: (!package.marker.is_any()).then(|| package.marker.to_string()),
            dependencies,
            extras,
            source: LockedSource::from_source(&package.source),
        }
    }

    pub fn to_package(&self) -> Result<Package> {
        let version = Version::from_str(&self.version).map_err(|_| {
            SolveError::Manifest(format!("invalid version `{}` for {}", self.version, self.name))
        })?;
        let mut package = Package::new(&self.name, version);
        package.description = self.description.clone();
        package.optional = self.optional;
        package.python_versions = VersionConstraint::parse(&self.python_versions)?;
        if let Some(markers) = &self.markers {
            package.marker = Marker::parse(markers)?;
        }
        if let Some(source) = &self.source {
            package.source = source.to_source().map_err(SolveError::Manifest)?;
        }
        for (name, spec) in &self.dependencies {
            for dep in spec.to_dependencies(name, MAIN_GROUP)? {
                package.add_dependency(dep);
            }
        }
        package.extras = self
            .extras
            .iter()
            .map(|(extra, requirements)| {
                (
                    canonicalize_name(extra),
                    requirements.iter().map(|r| requirement_name(r)).collect(),
                )
            })
            .collect();
        Ok(package)
    }
}

/// Access to the lock file of one project.
#[derive(Debug, Clone)]
pub struct Locker {
    path: PathBuf,
    content_hash: String,
}

impl Locker {
    pub fn new(path: impl Into<PathBuf>, content_hash: &str) -> Self {
        Self {
            path: path.into(),
            content_hash: content_hash.to_string(),
        }
    }

    /// The `poetry.lock` next to `manifest`.
    pub fn for_manifest(manifest: &Manifest) -> Self {
        Self::new(manifest.project_dir().join(LOCK_FILE), manifest.content_hash())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_locked(&self) -> bool {
        self.path.exists()
    }

    pub fn lock_data(&self) -> Result<LockData> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| SolveError::io(&self.path, e))?;
        toml::from_str(&text).map_err(|e| SolveError::toml(&self.path, e))
    }

    /// Whether the lock file was produced from the current manifest.
    pub fn is_fresh(&self) -> Result<bool> {
        Ok(self.lock_data()?.metadata.content_hash == self.content_hash)
    }

    /// Every locked package; empty when there is no lock file.
    pub fn locked_repository(&self) -> Result<InMemoryRepository> {
        let mut repository = InMemoryRepository::named("poetry-locked");
        if !self.is_locked() {
            return Ok(repository);
        }
        for locked in self.lock_data()?.package {
            repository.add(locked.to_package().map_err(|e| self.error(e))?);
        }
        Ok(repository)
    }

    /// Locked packages needed for `extras`: every non-optional package plus
    /// whatever the extras pull in, transitively.
    pub fn required_packages(&self, extras: &[String]) -> Result<Vec<Package>> {
        let data = self.lock_data()?;
        let packages = data
            .package
            .iter()
            .map(LockedPackage::to_package)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| self.error(e))?;

        let mut queue: VecDeque<String> = packages
            .iter()
            .filter(|p| !p.optional)
            .map(|p| p.name.clone())
            .collect();
        for extra in extras {
            let names = data
                .extras
                .iter()
                .find(|(name, _)| canonicalize_name(name) == canonicalize_name(extra))
                .map(|(_, names)| names.clone())
                .ok_or_else(|| SolveError::InvalidExtra(extra.clone()))?;
            queue.extend(names.iter().map(|n| requirement_name(n)));
        }

        let mut required: BTreeSet<String> = BTreeSet::new();
        while let Some(name) = queue.pop_front() {
            if !required.insert(name.clone()) {
                continue;
            }
            for package in packages.iter().filter(|p| p.name == name) {
                queue.extend(package.all_requires().into_iter().map(|d| d.name));
            }
        }

        Ok(packages
            .into_iter()
            .filter(|p| required.contains(&p.name))
            .collect())
    }

    /// Build the lock data for `root` resolved to `packages`.
    pub fn compute_lock_data(&self, root: &Package, packages: &[Package]) -> LockData {
        let mut locked: Vec<LockedPackage> = packages
            .iter()
            .filter(|p| !p.is_root())
            .map(LockedPackage::from_package)
            .collect();
        locked.sort_by(|a, b| {
            canonicalize_name(&a.name)
                .cmp(&canonicalize_name(&b.name))
                .then_with(|| {
                    match (Version::from_str(&a.version), Version::from_str(&b.version)) {
                        (Ok(x), Ok(y)) => x.cmp(&y),
                        _ => a.version.cmp(&b.version),
                    }
                })
        });

        let requires = root.all_requires();
        let extras = root
            .extras
            .iter()
            .map(|(extra, names)| {
                let pretty = names
                    .iter()
                    .map(|name| {
                        requires
                            .iter()
                            .find(|d| &d.name == name)
                            .map(|d| d.pretty_name.clone())
                            .unwrap_or_else(|| name.clone())
                    })
                    .collect();
                (extra.clone(), pretty)
            })
            .collect();

        LockData {
            package: locked,
            extras,
            metadata: LockMetadata {
                lock_version: LOCK_VERSION.to_string(),
                python_versions: root.python_versions.pretty(),
                content_hash: self.content_hash.clone(),
            },
        }
    }

    /// Write the lock file unless it already holds exactly this data.
    /// Returns whether the file was written.
    pub fn set_lock_data(&self, root: &Package, packages: &[Package]) -> Result<bool> {
        let data = self.compute_lock_data(root, packages);
        if self.is_locked() {
            if let Ok(existing) = self.lock_data() {
                if existing == data {
                    debug!("lock file is up to date");
                    return Ok(false);
                }
            }
        }
        let text = toml::to_string(&data)?;
        std::fs::write(&self.path, text).map_err(|e| SolveError::io(&self.path, e))?;
        Ok(true)
    }

    fn error(&self, err: SolveError) -> SolveError {
        SolveError::Lock {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Dependency;
    use crate::repository::PackageRepository;

    fn v(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    fn root() -> Package {
        let mut root = Package::root("project", v("1.0.0"));
        root.python_versions = VersionConstraint::parse("^3.8").unwrap();
        let mut bar = Dependency::new("bar", VersionConstraint::parse("^1.1").unwrap()).optional(true);
        bar.in_extras = vec!["feature-bar".into()];
        root.add_dependency(Dependency::new("foo", VersionConstraint::parse("^1.0").unwrap()));
        root.add_dependency(bar);
        root.extras.insert("feature-bar".into(), vec!["bar".into()]);
        root
    }

    fn resolved() -> Vec<Package> {
        let mut foo = Package::new("foo", v("1.0.0"));
        foo.add_dependency(Dependency::new("baz", VersionConstraint::parse(">=2").unwrap()));
        let baz = Package::new("baz", v("2.1"));
        let mut bar = Package::new("bar", v("1.1.0"));
        bar.optional = true;
        bar.source = PackageSource::Git {
            url: "https://github.com/demo/bar.git".into(),
            reference: Some("main".into()),
            resolved_reference: Some("0123abc".into()),
            subdirectory: None,
        };
        vec![foo, baz, bar]
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join(LOCK_FILE), "hash");
        assert!(!locker.is_locked());
        assert!(locker.locked_repository().unwrap().packages().is_empty());

        assert!(locker.set_lock_data(&root(), &resolved()).unwrap());
        assert!(locker.is_locked());
        assert!(locker.is_fresh().unwrap());

        let data = locker.lock_data().unwrap();
        let names: Vec<_> = data.package.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["bar", "baz", "foo"]);
        assert_eq!(data.extras["feature-bar"], vec!["bar".to_string()]);
        assert_eq!(data.metadata.python_versions, "^3.8");

        let repository = locker.locked_repository().unwrap();
        let bar = repository.package("bar", &v("1.1.0")).unwrap();
        assert!(bar.optional);
        assert!(matches!(bar.source, PackageSource::Git { ref resolved_reference, .. } if resolved_reference.as_deref() == Some("0123abc")));
        let foo = repository.package("foo", &v("1.0.0")).unwrap();
        assert_eq!(foo.requires()[0].name, "baz");
    }

    #[test]
    fn unchanged_data_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join(LOCK_FILE), "hash");
        assert!(locker.set_lock_data(&root(), &resolved()).unwrap());
        assert!(!locker.set_lock_data(&root(), &resolved()).unwrap());

        let stale = Locker::new(dir.path().join(LOCK_FILE), "other-hash");
        assert!(!stale.is_fresh().unwrap());
    }

    #[test]
    fn required_packages_follow_extras() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join(LOCK_FILE), "hash");
        locker.set_lock_data(&root(), &resolved()).unwrap();

        let names = |packages: Vec<Package>| -> Vec<String> {
            packages.into_iter().map(|p| p.name).collect()
        };
        assert_eq!(names(locker.required_packages(&[]).unwrap()), vec!["baz", "foo"]);
        assert_eq!(
            names(locker.required_packages(&["feature_bar".into()]).unwrap()),
            vec!["bar", "baz", "foo"]
        );
        assert!(matches!(
            locker.required_packages(&["nope".into()]),
            Err(SolveError::InvalidExtra(_))
        ));
    }

    #[test]
    fn same_named_entries_sort_by_version() {
        // b 10.0 must come after b 9.0.
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let root = Package::root("project", v("1.0"));
        let packages = vec![
            Package::new("b", v("10.0")),
            Package::new("a", v("1.0")),
            Package::new("b", v("9.0")),
        ];
        let data = locker.compute_lock_data(&root, &packages);
        let entries: Vec<(String, String)> = data
            .package
            .iter()
            .map(|p| (p.name.clone(), p.version.clone()))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("a".to_string(), "1.0".to_string()),
                ("b".to_string(), "9.0".to_string()),
                ("b".to_string(), "10.0".to_string()),
            ]
        );
    }

    #[test]
    fn requirement_names() {
        assert_eq!(requirement_name("bar (>=1.1,<2.0)"), "bar");
        assert_eq!(requirement_name("Foo_Bar[extra]>=1"), "foo-bar");
        assert_eq!(requirement_name("baz"), "baz");
    }
}
