//! Expansion of a selected package into the requirement edges handed back to
//! the solver.
//!
//! [`Provider::complete_package`] is where duplicate requirements are
//! reconciled. Requirements sharing a constraint are merged by marker union;
//! requirements whose constraints differ and whose markers do not already
//! separate them ask the solver to split the graph, returning
//! [`Completion::NeedsOverride`] with one [`Overrides`] branch per candidate.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::rc::Rc;

use indexmap::IndexMap;
use tracing::debug;

use crate::error::{Result, SolveError};
use crate::manifest::Manifest;
use crate::marker::{Marker, MarkerEnvironment, MarkerVariable};
use crate::package::{
    Dependency, DependencyPackage, DependencySource, MAIN_GROUP, Package, PackageId, PackageSource,
    canonicalize_name,
};
use crate::repository::RepositoryPool;
use crate::version::{VersionConstraint, parse_version};

/// Forced substitutions for one solver attempt: package identity ->
/// dependency name -> the single requirement replacing every same-named one.
///
/// A replacement with an empty constraint drops the requirement. Cloning is
/// cheap; [`Overrides::with_override`] copies on write so sibling branches
/// never observe each other.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    map: Rc<IndexMap<PackageId, IndexMap<String, Dependency>>>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PackageId) -> Option<&IndexMap<String, Dependency>> {
        self.map.get(id)
    }

    /// A copy with `dependency` replacing the requirements of `id` that share
    /// its name.
    pub fn with_override(&self, id: PackageId, dependency: Dependency) -> Self {
        let mut branch = self.clone();
        Rc::make_mut(&mut branch.map)
            .entry(id)
            .or_default()
            .insert(dependency.name.clone(), dependency);
        branch
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.values().map(IndexMap::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PackageId, &Dependency)> {
        self.map
            .iter()
            .flat_map(|(id, deps)| deps.values().map(move |dep| (id, dep)))
    }

    /// The environments this branch is restricted to.
    pub fn marker_intersection(&self) -> Marker {
        self.iter()
            .fold(Marker::any(), |acc, (_, dep)| acc.intersect(&dep.marker))
    }
}

/// Result of [`Provider::complete_package`].
#[derive(Debug, Clone)]
pub enum Completion {
    /// The package with its clean requirement list.
    Complete(DependencyPackage),
    /// Resolution must be retried once per branch.
    NeedsOverride(Vec<Overrides>),
}

/// Source of packages that are not served by an index: local directories,
/// archives, urls and VCS checkouts.
pub trait DirectOrigin {
    fn get_package(&self, dependency: &Dependency) -> Result<Package>;
}

/// Reads directory dependencies from their `pyproject.toml`, relative to the
/// project directory. Other origins are reported as unsupported.
#[derive(Debug, Clone)]
pub struct LocalDirectOrigin {
    base: PathBuf,
}

impl LocalDirectOrigin {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl DirectOrigin for LocalDirectOrigin {
    fn get_package(&self, dependency: &Dependency) -> Result<Package> {
        let DependencySource::Directory { path, develop } = &dependency.source else {
            return Err(SolveError::UnsupportedOrigin {
                name: dependency.name.clone(),
                kind: dependency.source.kind(),
            });
        };

        let manifest = Manifest::read(&self.base.join(path).join("pyproject.toml"))?;
        let mut package = manifest
            .package()
            .with_dependency_groups(&[MAIN_GROUP.to_string()], true);
        if package.name != dependency.name {
            return Err(SolveError::Manifest(format!(
                "the dependency name for {} does not match the actual package's name: {}",
                dependency.name, package.name
            )));
        }
        package.root = false;
        package.source = PackageSource::Directory {
            path: path.clone(),
            develop: *develop,
        };
        Ok(package)
    }
}

enum Duplicates {
    Keep(Vec<Dependency>),
    Split(Vec<Overrides>),
}

/// Answers the solver's questions about candidates and requirement edges.
pub struct Provider<'a> {
    package: Package,
    pool: &'a RepositoryPool,
    python_constraint: VersionConstraint,
    env: Option<MarkerEnvironment>,
    overrides: Overrides,
    deferred_cache: RefCell<HashMap<(String, DependencySource), Package>>,
    load_deferred: bool,
    unsafe_packages: BTreeSet<String>,
    origin: Box<dyn DirectOrigin + 'a>,
}

impl<'a> Provider<'a> {
    pub fn new(package: &Package, pool: &'a RepositoryPool) -> Self {
        Self {
            package: package.clone(),
            pool,
            python_constraint: package.python_constraint().clone(),
            env: None,
            overrides: Overrides::new(),
            deferred_cache: RefCell::new(HashMap::new()),
            load_deferred: true,
            unsafe_packages: BTreeSet::new(),
            origin: Box::new(LocalDirectOrigin::new(".")),
        }
    }

    pub fn with_origin(mut self, origin: impl DirectOrigin + 'a) -> Self {
        self.origin = Box::new(origin);
        self
    }

    /// Names dropped from every requirement list.
    pub fn with_unsafe_packages<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.unsafe_packages = names
            .into_iter()
            .map(|n| canonicalize_name(n.as_ref()))
            .collect();
        self
    }

    pub fn root(&self) -> &Package {
        &self.package
    }

    pub fn pool(&self) -> &RepositoryPool {
        self.pool
    }

    pub fn python_constraint(&self) -> &VersionConstraint {
        &self.python_constraint
    }

    /// Whether direct-origin requirements are fetched from their origin.
    /// Disabled once every constraint is already known.
    pub fn load_deferred(&mut self, load_deferred: bool) {
        self.load_deferred = load_deferred;
    }

    pub fn set_overrides(&mut self, overrides: Overrides) {
        self.overrides = overrides;
    }

    pub fn overrides(&self) -> &Overrides {
        &self.overrides
    }

    /// Bind resolution to a concrete target environment, or go back to
    /// environment-agnostic resolution with `None`.
    pub fn use_environment(&mut self, env: Option<MarkerEnvironment>) {
        self.python_constraint = env
            .as_ref()
            .and_then(|env| env.get(MarkerVariable::PythonFullVersion))
            .and_then(|full| parse_version(full).ok())
            .map(|version| VersionConstraint::exact(&version))
            .unwrap_or_else(|| self.package.python_constraint().clone());
        self.env = env;
    }

    pub fn environment(&self) -> Option<&MarkerEnvironment> {
        self.env.as_ref()
    }

    /// Candidates for `dependency`, newest first.
    pub fn search_for(&self, dependency: &Dependency) -> Result<Vec<Package>> {
        if dependency.is_direct_origin() {
            if self.load_deferred {
                return Ok(vec![self.search_for_direct_origin(dependency)?]);
            }
            return Ok(self
                .pool
                .find_packages(dependency)
                .into_iter()
                .filter(|p| dependency.accepts(p))
                .map(|p| p.with_features(&dependency.extras))
                .collect());
        }

        let mut packages = self.pool.find_packages(dependency);
        packages.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(packages
            .into_iter()
            .map(|p| p.with_features(&dependency.extras))
            .collect())
    }

    fn search_for_direct_origin(&self, dependency: &Dependency) -> Result<Package> {
        let key = (dependency.name.clone(), dependency.source.clone());
        if let Some(package) = self.deferred_cache.borrow().get(&key) {
            return Ok(package.with_features(&dependency.extras));
        }
        let package = self.origin.get_package(dependency)?;
        debug!(package = %package, origin = dependency.source.kind(), "loaded deferred package");
        self.deferred_cache.borrow_mut().insert(key, package.clone());
        Ok(package.with_features(&dependency.extras))
    }

    fn apply_overrides(&self, dependencies: Vec<Dependency>, id: &PackageId) -> Vec<Dependency> {
        let Some(overrides) = self.overrides.get(id) else {
            return dependencies;
        };

        let mut overridden: Vec<String> = Vec::new();
        let mut out = Vec::with_capacity(dependencies.len());
        for dep in dependencies {
            let Some(replacement) = overrides.get(&dep.name) else {
                out.push(dep);
                continue;
            };
            if overridden.contains(&dep.name) {
                continue;
            }
            if !replacement.constraint.is_empty() {
                out.push(replacement.clone());
            }
            overridden.push(dep.name);
        }
        out
    }

    /// Turn a selected package into its clean requirement list, or ask for
    /// the graph to be split.
    pub fn complete_package(&self, package: &DependencyPackage) -> Result<Completion> {
        let dependency = &package.dependency;
        let (mut package, requires) = if package.is_root() {
            (package.package.clone(), package.package.all_requires())
        } else if !package.package.source.is_direct_origin() {
            let fetched = self.pool.package(
                &package.package.name,
                &package.package.version,
                &dependency.extras.iter().cloned().collect::<Vec<_>>(),
                dependency.source_name(),
            )?;
            let requires = fetched.requires();
            (fetched, requires)
        } else {
            (package.package.clone(), package.package.requires())
        };

        if self.load_deferred {
            for requirement in requires.iter().filter(|r| r.is_direct_origin()) {
                self.search_for_direct_origin(requirement)?;
            }
        }

        let mut optional_dependencies: Vec<String> = Vec::new();
        let mut dependencies: Vec<Dependency> = Vec::new();

        if !dependency.extras.is_empty() {
            for extra in &dependency.extras {
                if let Some(names) = package.extras.get(extra) {
                    optional_dependencies.extend(names.iter().cloned());
                }
            }
            package = package.with_features(&dependency.extras);
            dependencies.push(package.without_features().to_dependency());
        }

        for dep in requires {
            if !self.python_constraint.allows_any(&dep.python_constraint()) {
                continue;
            }
            if self.unsafe_packages.contains(&dep.name) {
                continue;
            }
            if let Some(env) = &self.env {
                if !dep.marker.validate(env) {
                    continue;
                }
            }
            if !package.is_root()
                && ((dep.optional && !optional_dependencies.contains(&dep.name))
                    || (!dep.in_extras.is_empty()
                        && !dep.in_extras.iter().any(|e| dependency.extras.contains(e))))
            {
                continue;
            }
            dependencies.push(dep);
        }

        let id = package.id();
        let dependencies = self.apply_overrides(dependencies, &id);

        let mut duplicates: IndexMap<String, Vec<Dependency>> = IndexMap::new();
        for dep in dependencies {
            duplicates.entry(dep.complete_name()).or_default().push(dep);
        }

        let mut dependencies = Vec::new();
        for (name, deps) in duplicates {
            if deps.len() == 1 {
                dependencies.extend(deps);
                continue;
            }
            debug!("Duplicate dependencies for {name}");
            match self.resolve_duplicates(&id, deps) {
                Duplicates::Keep(deps) => dependencies.extend(deps),
                Duplicates::Split(branches) => return Ok(Completion::NeedsOverride(branches)),
            }
        }

        let transitive_marker = dependency.transitive_marker().without_extras();
        let transitive_python = dependency.transitive_python_constraint();
        let mut narrowed = Vec::with_capacity(dependencies.len());
        for mut dep in dependencies {
            if !transitive_marker.is_any() {
                let marker = transitive_marker.intersect(&dep.marker.without_extras());
                if marker.is_empty() {
                    continue;
                }
                dep.transitive_marker = Some(marker);
            }
            if !transitive_python.is_any() {
                let python = dep.python_constraint().intersect(&transitive_python);
                if python.is_empty() {
                    continue;
                }
                dep.transitive_python_constraint = Some(python);
            }
            narrowed.push(dep);
        }

        // A fallback only matters next to the requirements it complements.
        let mut completed = package.with_dependency_groups(&[], true);
        for dep in &narrowed {
            if dep.constraint.is_empty()
                && !narrowed.iter().any(|other| {
                    other.complete_name() == dep.complete_name() && !other.constraint.is_empty()
                })
            {
                continue;
            }
            completed.add_dependency(dep.clone());
        }

        Ok(Completion::Complete(DependencyPackage::new(
            dependency.clone(),
            completed,
        )))
    }

    fn resolve_duplicates(&self, id: &PackageId, deps: Vec<Dependency>) -> Duplicates {
        let mut by_constraint: Vec<Vec<Dependency>> = Vec::new();
        for dep in deps {
            match by_constraint
                .iter_mut()
                .find(|group| group[0].constraint == dep.constraint)
            {
                Some(group) => group.push(dep),
                None => by_constraint.push(vec![dep]),
            }
        }

        let mut representatives: Vec<Dependency> =
            by_constraint.into_iter().filter_map(merge_markers).collect();

        if representatives.len() == 1 {
            debug!("Merging requirements for {}", representatives[0]);
            return Duplicates::Keep(representatives);
        }

        // Identical markers are left for the solver to report as a conflict.
        let serialized: BTreeSet<String> = representatives
            .iter()
            .map(|d| d.marker.to_string())
            .collect();
        if serialized.len() != representatives.len() {
            return Duplicates::Keep(representatives);
        }

        let scope = self.overrides.marker_intersection();
        if representatives.iter().all(|d| !d.marker.is_any()) && pairwise_disjoint(&representatives)
        {
            // Environments outside every marker get no requirement at all.
            let uncovered =
                Marker::union_all(representatives.iter().map(|d| &d.marker)).invert();
            if !uncovered.is_empty() {
                let mut fallback = representatives[0].with_constraint(VersionConstraint::empty());
                fallback.marker = uncovered;
                representatives.push(fallback);
            }
            representatives.retain(|d| !d.marker.intersect(&scope).is_empty());
            if representatives.iter().all(|d| d.constraint.is_empty()) {
                representatives.clear();
            }
            return Duplicates::Keep(representatives);
        }

        debug!(
            "Different requirements found for {}.",
            describe(&representatives)
        );

        let inverted = Marker::union_all(
            representatives
                .iter()
                .filter(|d| !d.marker.is_any())
                .map(|d| &d.marker),
        )
        .invert();

        let catch_all: Vec<VersionConstraint> = representatives
            .iter()
            .filter(|d| d.marker.is_any())
            .map(|d| d.constraint.clone())
            .collect();
        if !catch_all.is_empty() {
            for dep in &mut representatives {
                if dep.marker.is_any() {
                    dep.marker = inverted.clone();
                } else {
                    for constraint in &catch_all {
                        dep.constraint = dep.constraint.intersect(constraint);
                    }
                }
            }
        } else if !inverted.is_empty() {
            let mut fallback = representatives[0].with_constraint(VersionConstraint::empty());
            fallback.marker = inverted;
            representatives.push(fallback);
        }

        let branches: Vec<Overrides> = representatives
            .into_iter()
            .filter(|d| !scope.intersect(&d.marker).is_empty())
            .map(|d| self.overrides.with_override(id.clone(), d))
            .collect();
        if branches.is_empty() {
            Duplicates::Keep(Vec::new())
        } else {
            Duplicates::Split(branches)
        }
    }

    /// Branches for requirements of a completed package that share a name
    /// and are told apart only by disjoint markers. A marker-agnostic solver
    /// would see them as conflicting, so each one gets its own attempt.
    pub fn marker_branches(&self, completed: &DependencyPackage) -> Vec<Overrides> {
        let mut by_name: IndexMap<String, Vec<Dependency>> = IndexMap::new();
        for dep in completed.package.all_requires() {
            let entry = by_name.entry(dep.complete_name()).or_default();
            if !entry
                .iter()
                .any(|d| d.constraint == dep.constraint && d.marker == dep.marker)
            {
                entry.push(dep);
            }
        }

        let id = completed.id();
        by_name
            .into_values()
            .find(|deps| deps.len() > 1 && pairwise_disjoint(deps))
            .map(|deps| {
                deps.into_iter()
                    .map(|d| self.overrides.with_override(id.clone(), d))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The first requirement of a constraint group, its marker widened to cover
/// every member.
fn merge_markers(group: Vec<Dependency>) -> Option<Dependency> {
    let markers: Vec<Marker> = group
        .iter()
        .map(|d| d.marker.without_extras())
        .filter(|m| !m.is_any())
        .collect();
    let mut first = group.into_iter().next()?;
    if !markers.is_empty() {
        first.marker = first.marker.union(&Marker::union_all(&markers));
    }
    Some(first)
}

fn pairwise_disjoint(deps: &[Dependency]) -> bool {
    deps.iter().enumerate().all(|(i, a)| {
        deps[i + 1..]
            .iter()
            .all(|b| a.marker.intersect(&b.marker).is_empty())
    })
}

fn describe(deps: &[Dependency]) -> String {
    let parts: Vec<String> = deps
        .iter()
        .map(|d| {
            let marker = if d.marker.is_any() {
                "*".to_string()
            } else {
                d.marker.to_string()
            };
            format!(
                "{} ({}) with markers {}",
                d.name,
                d.constraint.pretty(),
                marker
            )
        })
        .collect();
    match parts.split_last() {
        Some((last, rest)) if !rest.is_empty() => format!("{} and {}", rest.join(", "), last),
        Some((last, _)) => last.clone(),
        None => String::new(),
    }
}
