//! Arena-based pool mapping resolvo IDs to packages and requirements.
//!
//! [`SolverPool`] backs every resolvo identifier ([`NameId`], [`SolvableId`],
//! [`VersionSetId`], [`StringId`]) with a concrete value. Names are complete
//! names (`requests[socks]`), so every extras variant is a separate name for
//! the solver. The pool lives for a single solver attempt.

use std::collections::HashMap;

use resolvo::{ArenaId, NameId, SolvableId, StringId, VersionSetId};

use crate::package::{Dependency, DependencySource, Package, PackageId};

/// Requirements that match exactly the same candidates share a version set.
type VersionSetKey = (NameId, String, DependencySource);

#[derive(Debug, Default)]
pub(crate) struct SolverPool {
    // NameId arena
    names: Vec<String>,
    names_rev: HashMap<String, NameId>,

    // SolvableId arena
    solvables: Vec<Package>,
    solvable_names: Vec<NameId>,
    solvables_rev: HashMap<PackageId, SolvableId>,

    // VersionSetId arena
    version_sets: Vec<Dependency>,
    version_set_names: Vec<NameId>,
    version_sets_rev: HashMap<VersionSetKey, VersionSetId>,

    // StringId arena
    strings: Vec<String>,
}

impl SolverPool {
    pub fn new() -> Self {
        Self::default()
    }

    // --- NameId ---

    /// Intern a complete name, returning the existing ID if already interned.
    pub fn intern_name(&mut self, name: String) -> NameId {
        if let Some(&id) = self.names_rev.get(&name) {
            return id;
        }
        let id = NameId::from_usize(self.names.len());
        self.names_rev.insert(name.clone(), id);
        self.names.push(name);
        id
    }

    pub fn resolve_name(&self, id: NameId) -> &str {
        &self.names[id.to_usize()]
    }

    pub fn lookup_name(&self, name: &str) -> Option<NameId> {
        self.names_rev.get(name).copied()
    }

    // --- SolvableId ---

    /// Add a package variant, deduplicated by identity.
    pub fn intern_solvable(&mut self, name_id: NameId, package: Package) -> SolvableId {
        let key = package.id();
        if let Some(&id) = self.solvables_rev.get(&key) {
            return id;
        }
        let id = SolvableId::from_usize(self.solvables.len());
        self.solvables_rev.insert(key, id);
        self.solvables.push(package);
        self.solvable_names.push(name_id);
        id
    }

    pub fn resolve_solvable(&self, id: SolvableId) -> &Package {
        &self.solvables[id.to_usize()]
    }

    pub fn solvable_name(&self, id: SolvableId) -> NameId {
        self.solvable_names[id.to_usize()]
    }

    // --- VersionSetId ---

    /// Intern a requirement. The first requirement interned for a given
    /// name, constraint and source is the one kept.
    pub fn intern_version_set(&mut self, name_id: NameId, dependency: &Dependency) -> VersionSetId {
        let key = (
            name_id,
            dependency.constraint.to_string(),
            dependency.source.clone(),
        );
        if let Some(&id) = self.version_sets_rev.get(&key) {
            return id;
        }
        let id = VersionSetId::from_usize(self.version_sets.len());
        self.version_sets_rev.insert(key, id);
        self.version_sets.push(dependency.clone());
        self.version_set_names.push(name_id);
        id
    }

    pub fn resolve_version_set(&self, id: VersionSetId) -> &Dependency {
        &self.version_sets[id.to_usize()]
    }

    pub fn version_set_name(&self, id: VersionSetId) -> NameId {
        self.version_set_names[id.to_usize()]
    }

    // --- StringId ---

    /// Intern a string (used for solver error messages).
    pub fn intern_string(&mut self, s: String) -> StringId {
        let id = StringId::from_usize(self.strings.len());
        self.strings.push(s);
        id
    }

    pub fn resolve_string(&self, id: StringId) -> &str {
        &self.strings[id.to_usize()]
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use pep440_rs::Version;

    use super::*;
    use crate::version::VersionConstraint;

    fn package(name: &str, version: &str) -> Package {
        Package::new(name, Version::from_str(version).unwrap())
    }

    #[test]
    fn intern_name_dedup() {
        let mut pool = SolverPool::new();
        let a = pool.intern_name("requests".into());
        let b = pool.intern_name("requests".into());
        let c = pool.intern_name("requests[socks]".into());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.resolve_name(c), "requests[socks]");
        assert_eq!(pool.lookup_name("requests"), Some(a));
        assert_eq!(pool.lookup_name("urllib3"), None);
    }

    #[test]
    fn solvables_are_keyed_by_identity() {
        let mut pool = SolverPool::new();
        let name = pool.intern_name("foo".into());
        let first = pool.intern_solvable(name, package("foo", "1.0"));
        let again = pool.intern_solvable(name, package("foo", "1.0.0"));
        let other = pool.intern_solvable(name, package("foo", "2.0"));
        assert_eq!(first, again);
        assert_ne!(first, other);
        assert_eq!(pool.solvable_name(other), name);
        assert_eq!(pool.resolve_solvable(other).version.to_string(), "2.0");
    }

    #[test]
    fn version_sets_ignore_markers() {
        let mut pool = SolverPool::new();
        let name = pool.intern_name("foo".into());
        let plain = Dependency::new("foo", VersionConstraint::parse("^1.0").unwrap());
        let gated = plain
            .clone()
            .with_marker(crate::marker::Marker::parse(r#"sys_platform == "win32""#).unwrap());
        let other = Dependency::new("foo", VersionConstraint::parse("^2.0").unwrap());

        let a = pool.intern_version_set(name, &plain);
        assert_eq!(pool.intern_version_set(name, &gated), a);
        assert_ne!(pool.intern_version_set(name, &other), a);
        assert_eq!(pool.version_set_name(a), name);
        assert!(pool.resolve_version_set(a).marker.is_any());
    }

    #[test]
    fn intern_string_roundtrip() {
        let mut pool = SolverPool::new();
        let id = pool.intern_string("hello".into());
        assert_eq!(pool.resolve_string(id), "hello");
    }
}
