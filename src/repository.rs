//! Package repository abstraction.
//!
//! [`PackageRepository`] provides read-only access to a package database.
//! [`InMemoryRepository`] backs tests and the locked/installed package sets,
//! [`IndexRepository`] loads a local TOML index, and [`RepositoryPool`]
//! queries several repositories in priority order.

use std::path::Path;

use pep440_rs::Version;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SolveError};
use crate::lock::LockedPackage;
use crate::package::{Dependency, Package, PackageSource, canonicalize_name};

/// Read-only package database.
pub trait PackageRepository {
    /// Name used by dependencies that pin a `source`.
    fn name(&self) -> &str;

    /// Every package in the repository.
    fn packages(&self) -> Vec<Package>;

    /// Packages whose name matches `dependency` and whose version it allows.
    fn find_packages(&self, dependency: &Dependency) -> Vec<Package> {
        self.packages()
            .into_iter()
            .filter(|p| p.name == dependency.name && dependency.constraint.allows(&p.version))
            .collect()
    }

    /// The exact `name` / `version` package, if present.
    fn package(&self, name: &str, version: &Version) -> Option<Package> {
        let name = canonicalize_name(name);
        self.packages()
            .into_iter()
            .find(|p| p.name == name && &p.version == version)
    }

    fn has_package(&self, package: &Package) -> bool {
        self.packages()
            .iter()
            .any(|p| p.name == package.name && p.version == package.version)
    }
}

/// In-memory repository backed by a `Vec`, useful for tests and for
/// package sets computed during an install run.
#[derive(Debug, Clone)]
pub struct InMemoryRepository {
    name: String,
    packages: Vec<Package>,
}

impl InMemoryRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::named("in-memory")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            packages: Vec::new(),
        }
    }

    /// Add a package version to the repository.
    pub fn add(&mut self, package: Package) {
        self.packages.push(package);
    }

    pub fn remove(&mut self, package: &Package) {
        self.packages
            .retain(|p| !(p.name == package.name && p.version == package.version));
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl FromIterator<Package> for InMemoryRepository {
    fn from_iter<I: IntoIterator<Item = Package>>(iter: I) -> Self {
        let mut repository = Self::new();
        for package in iter {
            repository.add(package);
        }
        repository
    }
}

impl PackageRepository for InMemoryRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn packages(&self) -> Vec<Package> {
        self.packages.clone()
    }
}

#[derive(Debug, Deserialize)]
struct IndexFile {
    #[serde(default)]
    package: Vec<LockedPackage>,
}

/// A local package index: a TOML file with one `[[package]]` table per
/// release, in the lock file entry schema.
#[derive(Debug, Clone)]
pub struct IndexRepository {
    inner: InMemoryRepository,
}

impl IndexRepository {
    /// Load `path`. With `legacy_url`, packages are recorded as coming from
    /// the named secondary source at that url.
    pub fn open(name: &str, path: &Path, legacy_url: Option<&str>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SolveError::io(path, e))?;
        let file: IndexFile = toml::from_str(&text).map_err(|e| SolveError::toml(path, e))?;

        let mut inner = InMemoryRepository::named(name);
        for entry in &file.package {
            let mut package = entry.to_package()?;
            if let (Some(url), PackageSource::Default) = (legacy_url, &package.source) {
                package.source = PackageSource::Legacy {
                    name: name.to_string(),
                    url: url.to_string(),
                };
            }
            inner.add(package);
        }
        debug!(repository = name, packages = inner.len(), "loaded index");
        Ok(Self { inner })
    }
}

impl PackageRepository for IndexRepository {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn packages(&self) -> Vec<Package> {
        self.inner.packages()
    }
}

/// Repositories queried in priority order.
#[derive(Default)]
pub struct RepositoryPool {
    repositories: Vec<Box<dyn PackageRepository>>,
    ignore_repository_names: bool,
}

impl RepositoryPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A pool that ignores the `source` a dependency pins. Used once every
    /// package is already known, when packages are looked up by name only.
    pub fn ignoring_repository_names() -> Self {
        Self {
            repositories: Vec::new(),
            ignore_repository_names: true,
        }
    }

    pub fn add_repository(&mut self, repository: Box<dyn PackageRepository>) {
        self.repositories.push(repository);
    }

    pub fn has_repository(&self, name: &str) -> bool {
        self.repositories.iter().any(|r| r.name() == name)
    }

    pub fn ignores_repository_names(&self) -> bool {
        self.ignore_repository_names
    }

    fn candidates_for<'a>(
        &'a self,
        repository: Option<&'a str>,
    ) -> impl Iterator<Item = &'a dyn PackageRepository> + 'a {
        let pinned = repository.filter(|_| !self.ignore_repository_names);
        self.repositories
            .iter()
            .map(|r| r.as_ref())
            .filter(move |r| pinned.is_none_or(|name| r.name() == name))
    }

    /// The exact `name` / `version` variant with `extras` applied as features.
    pub fn package(
        &self,
        name: &str,
        version: &Version,
        extras: &[String],
        repository: Option<&str>,
    ) -> Result<Package> {
        self.candidates_for(repository)
            .find_map(|r| r.package(name, version))
            .map(|p| p.with_features(extras))
            .ok_or_else(|| SolveError::PackageNotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    /// Every package satisfying `dependency`, first repository wins on
    /// duplicates.
    pub fn find_packages(&self, dependency: &Dependency) -> Vec<Package> {
        let mut found: Vec<Package> = Vec::new();
        for repository in self.candidates_for(dependency.source_name()) {
            for package in repository.find_packages(dependency) {
                if !found
                    .iter()
                    .any(|p| p.name == package.name && p.version == package.version)
                {
                    found.push(package);
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::version::VersionConstraint;

    fn package(name: &str, version: &str) -> Option<Package> {
        Some(Package::new(name, Version::from_str(version).ok()?))
    }

    fn dep(name: &str, constraint: &str) -> Dependency {
        Dependency::new(name, VersionConstraint::parse(constraint).unwrap())
    }

    #[test]
    fn in_memory_add_and_query() {
        let mut repo = InMemoryRepository::new();
        repo.add(package("foo", "1.0.0").unwrap());
        repo.add(package("foo", "2.0.0").unwrap());
        repo.add(package("bar", "1.1.0").unwrap());

        assert_eq!(repo.packages().len(), 3);
        assert_eq!(repo.find_packages(&dep("foo", "^1.0")).len(), 1);
        assert_eq!(repo.find_packages(&dep("Foo", "*")).len(), 2);
        assert!(repo.package("bar", &Version::from_str("1.1").unwrap()).is_some());
    }

    #[test]
    fn find_packages_for_unknown_package() {
        let repo = InMemoryRepository::new();
        assert!(repo.find_packages(&dep("foo", "*")).is_empty());
    }

    #[test]
    fn pool_respects_pinned_sources() {
        let mut public = InMemoryRepository::named("pypi");
        public.add(package("foo", "1.0.0").unwrap());
        let mut private = InMemoryRepository::named("private");
        private.add(package("foo", "1.5.0").unwrap());

        let mut pool = RepositoryPool::new();
        pool.add_repository(Box::new(public.clone()));
        pool.add_repository(Box::new(private.clone()));

        let pinned = dep("foo", "*").with_source(crate::package::DependencySource::Index {
            source_name: Some("private".into()),
        });
        let found = pool.find_packages(&pinned);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version.to_string(), "1.5.0");
        assert_eq!(pool.find_packages(&dep("foo", "*")).len(), 2);

        let v1 = Version::from_str("1.0.0").unwrap();
        assert!(pool.package("foo", &v1, &[], Some("private")).is_err());

        let mut relaxed = RepositoryPool::ignoring_repository_names();
        relaxed.add_repository(Box::new(public));
        relaxed.add_repository(Box::new(private));
        assert!(relaxed.package("foo", &v1, &[], Some("private")).is_ok());
    }

    #[test]
    fn pool_applies_requested_extras() {
        let mut repo = InMemoryRepository::new();
        repo.add(package("foo", "1.0.0").unwrap());
        let mut pool = RepositoryPool::new();
        pool.add_repository(Box::new(repo));

        let v1 = Version::from_str("1.0.0").unwrap();
        let featured = pool.package("foo", &v1, &["bar".into()], None).unwrap();
        assert_eq!(featured.complete_name(), "foo[bar]");
        assert!(matches!(
            pool.package("foo", &Version::from_str("9").unwrap(), &[], None),
            Err(SolveError::PackageNotFound { .. })
        ));
    }

    #[test]
    fn index_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.toml");
        std::fs::write(
            &path,
            r#"
[[package]]
name = "foo"
version = "1.0.0"

[package.dependencies]
bar = "^1.0"

[[package]]
name = "bar"
version = "1.1.0"
python-versions = ">=3.6"
"#,
        )
        .unwrap();

        let index = IndexRepository::open("local", &path, None).unwrap();
        assert_eq!(index.packages().len(), 2);
        let foo = index.find_packages(&dep("foo", "*")).remove(0);
        assert_eq!(foo.requires()[0].name, "bar");
        assert_eq!(foo.source, PackageSource::Default);

        let legacy = IndexRepository::open("private", &path, Some("file:///srv/index")).unwrap();
        assert_eq!(legacy.packages()[0].source.repository_name(), Some("private"));
    }
}
