//! Resolution driver on top of resolvo.
//!
//! [`SolverProvider`] implements resolvo's [`Interner`](resolvo::Interner)
//! and [`DependencyProvider`](resolvo::DependencyProvider) over a
//! [`Provider`], completing packages lazily as the SAT search reaches them.
//! When a completion asks for the graph to be split, the attempt is
//! cancelled and [`Solver`] retries once per override branch, merging the
//! branches that resolve.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use indexmap::IndexMap;
use pep440_rs::Version;
use resolvo::{
    Candidates, Condition, ConditionId, ConditionalRequirement, Dependencies,
    HintDependenciesAvailable, KnownDependencies, NameId, Problem, Requirement, SolvableId,
    SolverCache, StringId, UnsolvableOrCancelled, VersionSetId, VersionSetUnionId,
};
use tracing::{debug, info};

use crate::error::{Result, SolveError};
use crate::marker::{Marker, MarkerEnvironment};
use crate::package::{Dependency, DependencyPackage, Package, PackageId, canonicalize_name};
use crate::pool::SolverPool;
use crate::provider::{Completion, Overrides, Provider};
use crate::repository::{InMemoryRepository, PackageRepository};
use crate::transaction::Transaction;
use crate::version::VersionConstraint;

/// Why an attempt stopped before resolvo finished.
enum Interrupt {
    Split(Vec<Overrides>),
    Failed(SolveError),
}

enum Attempt {
    Solved(Resolution),
    Split(Vec<Overrides>),
}

/// A completed package and its depth below the root.
#[derive(Debug, Clone)]
struct Resolved {
    package: Package,
    depth: usize,
}

/// Packages picked by one or more successful attempts.
#[derive(Debug, Clone, Default)]
struct Resolution {
    root_requires: Vec<Dependency>,
    packages: IndexMap<PackageId, Resolved>,
}

impl Resolution {
    /// Union of two branches: same package means union of requirements and
    /// the deeper of the two depths.
    fn merge(mut self, other: Resolution) -> Resolution {
        for dep in other.root_requires {
            if !self.root_requires.contains(&dep) {
                self.root_requires.push(dep);
            }
        }
        for (id, resolved) in other.packages {
            match self.packages.get_mut(&id) {
                Some(existing) => {
                    existing.depth = existing.depth.max(resolved.depth);
                    let known = existing.package.all_requires();
                    for dep in resolved.package.all_requires() {
                        if !known.contains(&dep) {
                            existing.package.add_dependency(dep);
                        }
                    }
                }
                None => {
                    self.packages.insert(id, resolved);
                }
            }
        }
        self
    }

    fn targets(&self, dep: &Dependency) -> Vec<&PackageId> {
        let name = dep.complete_name();
        self.packages
            .iter()
            .filter(|(id, r)| id.complete_name == name && dep.accepts(&r.package))
            .map(|(id, _)| id)
            .collect()
    }

    /// Packages reachable from the root without going through an optional
    /// root requirement.
    fn required(&self) -> HashSet<PackageId> {
        let mut queue: VecDeque<&PackageId> = self
            .root_requires
            .iter()
            .filter(|dep| !dep.optional)
            .flat_map(|dep| self.targets(dep))
            .collect();
        let mut seen = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id.clone()) {
                continue;
            }
            for dep in self.packages[id].package.all_requires() {
                queue.extend(self.targets(&dep));
            }
        }
        seen
    }

    /// Environments in which each package is reached, propagated from the
    /// root until nothing changes.
    fn markers(&self) -> HashMap<PackageId, Marker> {
        let mut markers: HashMap<PackageId, Marker> = self
            .packages
            .keys()
            .map(|id| (id.clone(), Marker::empty()))
            .collect();

        for dep in &self.root_requires {
            let reach = dep.marker.without_extras();
            for id in self.targets(dep) {
                widen(&mut markers, id, reach.clone());
            }
        }

        for _ in 0..=self.packages.len() {
            let mut changed = false;
            for (parent, resolved) in &self.packages {
                let parent_marker = markers[parent].clone();
                if parent_marker.is_empty() {
                    continue;
                }
                for dep in resolved.package.all_requires() {
                    let reach = parent_marker.intersect(&dep.marker.without_extras());
                    for id in self.targets(&dep) {
                        changed |= widen(&mut markers, id, reach.clone());
                    }
                }
            }
            if !changed {
                break;
            }
        }
        markers
    }

    /// Tag every package and fold extras variants into their base package.
    fn finalize(self) -> Vec<(Package, usize)> {
        let required = self.required();
        let markers = self.markers();

        let mut tagged: Vec<(PackageId, Resolved)> = self.packages.into_iter().collect();
        for (id, resolved) in &mut tagged {
            resolved.package.optional = !required.contains(id);
            if let Some(marker) = markers.get(id) {
                resolved.package.marker = marker.clone();
            }
        }

        let mut base: IndexMap<PackageId, Resolved> = IndexMap::new();
        let mut variants: Vec<Resolved> = Vec::new();
        for (id, resolved) in tagged {
            if resolved.package.features.is_empty() {
                base.insert(id, resolved);
            } else {
                variants.push(resolved);
            }
        }
        for variant in variants {
            let id = variant.package.without_features().id();
            let Some(target) = base.get_mut(&id) else {
                continue;
            };
            let known = target.package.all_requires();
            for dep in variant.package.all_requires() {
                if dep.name != target.package.name && !known.contains(&dep) {
                    target.package.add_dependency(dep);
                }
            }
        }

        base.into_values().map(|r| (r.package, r.depth)).collect()
    }
}

/// Add `reach` to the marker of `id`. Returns whether it grew.
fn widen(markers: &mut HashMap<PackageId, Marker>, id: &PackageId, reach: Marker) -> bool {
    let Some(current) = markers.get(id) else {
        return false;
    };
    let widened = current.union(&reach);
    if widened.equivalent(current) {
        return false;
    }
    markers.insert(id.clone(), widened);
    true
}

fn describe(overrides: &Overrides) -> String {
    overrides
        .iter()
        .map(|(id, dep)| format!("{id}: {} ; {}", dep, dep.marker))
        .collect::<Vec<_>>()
        .join(", ")
}

/// resolvo's view of one attempt.
pub(crate) struct SolverProvider<'s, 'a> {
    provider: &'s Provider<'a>,
    pool: RefCell<SolverPool>,
    /// The first requirement seen for each name. Candidates are searched
    /// with it and it is the requesting dependency of the chosen package.
    requests: RefCell<HashMap<NameId, Dependency>>,
    /// Clean requirements of every completed solvable.
    completed: RefCell<HashMap<SolvableId, Vec<Dependency>>>,
    locked: HashMap<String, Version>,
    use_latest: HashSet<String>,
    root: SolvableId,
    root_name: NameId,
    root_requirement: VersionSetId,
    interrupted: StringId,
    interrupt: RefCell<Option<Interrupt>>,
}

impl<'s, 'a> SolverProvider<'s, 'a> {
    fn new(
        provider: &'s Provider<'a>,
        root: &Package,
        locked: &InMemoryRepository,
        use_latest: &[String],
    ) -> Self {
        let mut pool = SolverPool::new();
        let root_name = pool.intern_name(root.complete_name());
        let root_solvable = pool.intern_solvable(root_name, root.clone());
        let root_dependency = root.to_dependency();
        let root_requirement = pool.intern_version_set(root_name, &root_dependency);
        let interrupted = pool.intern_string("resolution interrupted".into());

        Self {
            provider,
            pool: RefCell::new(pool),
            requests: RefCell::new(HashMap::from([(root_name, root_dependency)])),
            completed: RefCell::new(HashMap::new()),
            locked: locked
                .packages()
                .into_iter()
                .map(|p| (p.name, p.version))
                .collect(),
            use_latest: use_latest.iter().map(|n| canonicalize_name(n)).collect(),
            root: root_solvable,
            root_name,
            root_requirement,
            interrupted,
            interrupt: RefCell::new(None),
        }
    }

    fn root_requirement(&self) -> ConditionalRequirement {
        ConditionalRequirement {
            condition: None,
            requirement: Requirement::Single(self.root_requirement),
        }
    }

    fn intern_requirement(&self, dep: &Dependency) -> ConditionalRequirement {
        let mut pool = self.pool.borrow_mut();
        let name = pool.intern_name(dep.complete_name());
        self.requests
            .borrow_mut()
            .entry(name)
            .or_insert_with(|| dep.clone());
        ConditionalRequirement {
            condition: None,
            requirement: Requirement::Single(pool.intern_version_set(name, dep)),
        }
    }

    fn interrupt(&self, interrupt: Interrupt) -> Dependencies {
        let mut slot = self.interrupt.borrow_mut();
        if slot.is_none() {
            *slot = Some(interrupt);
        }
        Dependencies::Unknown(self.interrupted)
    }

    fn take_interrupt(&self) -> Option<Interrupt> {
        self.interrupt.borrow_mut().take()
    }

    /// The locked version of a candidate, unless the caller asked for the
    /// latest one.
    fn favored(&self, pool: &SolverPool, candidates: &[SolvableId]) -> Option<SolvableId> {
        candidates.iter().copied().find(|&sid| {
            let package = pool.resolve_solvable(sid);
            !self.use_latest.contains(&package.name)
                && self.locked.get(&package.name) == Some(&package.version)
        })
    }

    fn resolution(&self, solution: &[SolvableId]) -> Resolution {
        let pool = self.pool.borrow();
        let completed = self.completed.borrow();
        let by_name: HashMap<NameId, SolvableId> = solution
            .iter()
            .map(|&sid| (pool.solvable_name(sid), sid))
            .collect();
        let children = |sid: SolvableId| -> Vec<SolvableId> {
            completed
                .get(&sid)
                .into_iter()
                .flatten()
                .filter_map(|dep| pool.lookup_name(&dep.complete_name()))
                .filter_map(|name| by_name.get(&name).copied())
                .collect()
        };

        // Longest path from the root; bounded so cycles terminate.
        let mut depth: HashMap<SolvableId, usize> = HashMap::new();
        for child in children(self.root) {
            depth.insert(child, 0);
        }
        for _ in 0..solution.len() {
            let mut changed = false;
            for &sid in solution {
                let Some(&d) = depth.get(&sid) else {
                    continue;
                };
                for child in children(sid) {
                    if child != self.root && depth.get(&child).is_none_or(|&c| c < d + 1) {
                        depth.insert(child, d + 1);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        let mut packages = IndexMap::new();
        for &sid in solution.iter().filter(|&&sid| sid != self.root) {
            let mut package = pool.resolve_solvable(sid).with_dependency_groups(&[], true);
            for dep in completed.get(&sid).into_iter().flatten() {
                package.add_dependency(dep.clone());
            }
            packages.insert(
                package.id(),
                Resolved {
                    package,
                    depth: depth.get(&sid).copied().unwrap_or(0),
                },
            );
        }

        Resolution {
            root_requires: completed.get(&self.root).cloned().unwrap_or_default(),
            packages,
        }
    }
}

impl resolvo::Interner for SolverProvider<'_, '_> {
    fn display_solvable(&self, solvable: SolvableId) -> impl fmt::Display + '_ {
        self.pool.borrow().resolve_solvable(solvable).to_string()
    }

    fn display_name(&self, name: NameId) -> impl fmt::Display + '_ {
        self.pool.borrow().resolve_name(name).to_string()
    }

    fn display_version_set(&self, version_set: VersionSetId) -> impl fmt::Display + '_ {
        self.pool
            .borrow()
            .resolve_version_set(version_set)
            .constraint
            .pretty()
    }

    fn display_string(&self, string_id: StringId) -> impl fmt::Display + '_ {
        self.pool.borrow().resolve_string(string_id).to_string()
    }

    fn version_set_name(&self, version_set: VersionSetId) -> NameId {
        self.pool.borrow().version_set_name(version_set)
    }

    fn solvable_name(&self, solvable: SolvableId) -> NameId {
        self.pool.borrow().solvable_name(solvable)
    }

    // Requirements are always single version sets.
    fn version_sets_in_union(
        &self,
        _version_set_union: VersionSetUnionId,
    ) -> impl Iterator<Item = VersionSetId> {
        std::iter::empty()
    }

    fn resolve_condition(&self, _condition: ConditionId) -> Condition {
        unreachable!("requirements are never conditional")
    }
}

impl resolvo::DependencyProvider for SolverProvider<'_, '_> {
    async fn get_candidates(&self, name: NameId) -> Option<Candidates> {
        if name == self.root_name {
            return Some(Candidates {
                candidates: vec![self.root],
                favored: None,
                locked: None,
                hint_dependencies_available: HintDependenciesAvailable::None,
                excluded: Vec::new(),
            });
        }

        let request = self.requests.borrow().get(&name).cloned()?;
        let query = request.with_constraint(VersionConstraint::any());
        let packages = match self.provider.search_for(&query) {
            Ok(packages) => packages,
            Err(err) => {
                self.interrupt(Interrupt::Failed(err));
                return None;
            }
        };

        let mut pool = self.pool.borrow_mut();
        let candidates: Vec<SolvableId> = packages
            .into_iter()
            .map(|package| pool.intern_solvable(name, package))
            .collect();
        let favored = self.favored(&pool, &candidates);
        Some(Candidates {
            candidates,
            favored,
            locked: None,
            hint_dependencies_available: HintDependenciesAvailable::None,
            excluded: Vec::new(),
        })
    }

    async fn sort_candidates(&self, _solver: &SolverCache<Self>, solvables: &mut [SolvableId]) {
        let pool = self.pool.borrow();
        solvables.sort_by(|a, b| {
            let va = &pool.resolve_solvable(*a).version;
            let vb = &pool.resolve_solvable(*b).version;
            vb.cmp(va)
        });
    }

    async fn filter_candidates(
        &self,
        candidates: &[SolvableId],
        version_set: VersionSetId,
        inverse: bool,
    ) -> Vec<SolvableId> {
        let pool = self.pool.borrow();
        let dependency = pool.resolve_version_set(version_set);
        candidates
            .iter()
            .copied()
            .filter(|&sid| dependency.accepts(pool.resolve_solvable(sid)) != inverse)
            .collect()
    }

    async fn get_dependencies(&self, solvable: SolvableId) -> Dependencies {
        let (package, name) = {
            let pool = self.pool.borrow();
            (
                pool.resolve_solvable(solvable).clone(),
                pool.solvable_name(solvable),
            )
        };
        let dependency = self
            .requests
            .borrow()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| package.to_dependency());

        let completed = match self
            .provider
            .complete_package(&DependencyPackage::new(dependency, package))
        {
            Ok(Completion::Complete(completed)) => completed,
            Ok(Completion::NeedsOverride(branches)) => {
                return self.interrupt(Interrupt::Split(branches));
            }
            Err(err) => return self.interrupt(Interrupt::Failed(err)),
        };

        let branches = self.provider.marker_branches(&completed);
        if !branches.is_empty() {
            return self.interrupt(Interrupt::Split(branches));
        }

        let requires = completed.package.all_requires();
        let requirements = requires
            .iter()
            .map(|dep| self.intern_requirement(dep))
            .collect();
        self.completed.borrow_mut().insert(solvable, requires);
        Dependencies::Known(KnownDependencies {
            requirements,
            constrains: Vec::new(),
        })
    }

    fn should_cancel_with_value(&self) -> Option<Box<dyn Any>> {
        self.interrupt
            .borrow()
            .as_ref()
            .map(|_| Box::new(()) as Box<dyn Any>)
    }
}

/// Resolves the root package of a [`Provider`].
pub struct Solver<'a> {
    package: Package,
    provider: Provider<'a>,
    installed: InMemoryRepository,
    locked: InMemoryRepository,
}

impl<'a> Solver<'a> {
    /// `installed` is what the target environment already has; `locked`
    /// holds the packages of the current lock file, preferred when they
    /// still satisfy the requirements.
    pub fn new(
        provider: Provider<'a>,
        installed: InMemoryRepository,
        locked: InMemoryRepository,
    ) -> Self {
        Self {
            package: provider.root().clone(),
            provider,
            installed,
            locked,
        }
    }

    pub fn provider(&self) -> &Provider<'a> {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut Provider<'a> {
        &mut self.provider
    }

    pub fn use_environment(&mut self, env: Option<MarkerEnvironment>) {
        self.provider.use_environment(env);
    }

    /// Resolve and diff the result against the locked and installed sets.
    /// Packages named in `use_latest` ignore their locked version.
    pub fn solve(&mut self, use_latest: &[String]) -> Result<Transaction> {
        let packages = self.solve_packages(use_latest)?;
        Ok(Transaction::new(
            self.locked.packages(),
            packages,
            self.installed.packages(),
            Some(self.package.clone()),
        ))
    }

    /// Resolved packages with their depth.
    pub fn solve_packages(&mut self, use_latest: &[String]) -> Result<Vec<(Package, usize)>> {
        info!("Resolving dependencies...");
        let initial = self.provider.overrides().clone();
        let resolution = self.solve_with(initial.clone(), use_latest);
        self.provider.set_overrides(initial);
        let packages = resolution?.finalize();
        debug!(packages = packages.len(), "resolution finished");
        Ok(packages)
    }

    fn solve_with(&mut self, overrides: Overrides, use_latest: &[String]) -> Result<Resolution> {
        self.provider.set_overrides(overrides);
        match self.attempt(use_latest)? {
            Attempt::Solved(resolution) => Ok(resolution),
            Attempt::Split(branches) => self.solve_in_compatibility_mode(branches, use_latest),
        }
    }

    /// One attempt per branch. Branches that cannot be resolved are dropped;
    /// the last failure is returned only when none succeeds.
    fn solve_in_compatibility_mode(
        &mut self,
        branches: Vec<Overrides>,
        use_latest: &[String],
    ) -> Result<Resolution> {
        let mut merged: Option<Resolution> = None;
        let mut failure: Option<SolveError> = None;
        for branch in branches {
            debug!(
                "Retrying dependency resolution with the following overrides ({}).",
                describe(&branch)
            );
            match self.solve_with(branch, use_latest) {
                Ok(resolution) => {
                    merged = Some(match merged {
                        Some(merged) => merged.merge(resolution),
                        None => resolution,
                    });
                }
                Err(err @ SolveError::Unsolvable(_)) => {
                    debug!("override branch failed: {err}");
                    failure = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        merged.ok_or_else(|| {
            failure.unwrap_or_else(|| SolveError::Unsolvable("no override branch was produced".into()))
        })
    }

    fn attempt(&self, use_latest: &[String]) -> Result<Attempt> {
        let bridge = SolverProvider::new(&self.provider, &self.package, &self.locked, use_latest);
        let problem = Problem::new().requirements(vec![bridge.root_requirement()]);
        let mut solver = resolvo::Solver::new(bridge);
        let outcome = solver.solve(problem);

        if let Some(interrupt) = solver.provider().take_interrupt() {
            return match interrupt {
                Interrupt::Split(branches) => {
                    debug!(branches = branches.len(), "override needed");
                    Ok(Attempt::Split(branches))
                }
                Interrupt::Failed(err) => Err(err),
            };
        }

        match outcome {
            Ok(solution) => Ok(Attempt::Solved(solver.provider().resolution(&solution))),
            Err(UnsolvableOrCancelled::Unsolvable(conflict)) => Err(SolveError::Unsolvable(
                conflict.display_user_friendly(&solver).to_string(),
            )),
            Err(UnsolvableOrCancelled::Cancelled(_)) => Err(SolveError::Unsolvable(
                "dependency resolution was cancelled".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::repository::RepositoryPool;

    fn v(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    fn dep(name: &str, constraint: &str, marker: &str) -> Dependency {
        Dependency::new(name, VersionConstraint::parse(constraint).unwrap())
            .with_marker(Marker::parse(marker).unwrap())
    }

    fn package(name: &str, version: &str, deps: Vec<Dependency>) -> Package {
        let mut package = Package::new(name, v(version));
        for d in deps {
            package.add_dependency(d);
        }
        package
    }

    fn pool(packages: Vec<Package>) -> RepositoryPool {
        let mut pool = RepositoryPool::new();
        pool.add_repository(Box::new(packages.into_iter().collect::<InMemoryRepository>()));
        pool
    }

    fn names(packages: &[(Package, usize)]) -> Vec<String> {
        let mut names: Vec<String> = packages
            .iter()
            .map(|(p, _)| format!("{} {}", p.name, p.version))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn picks_newest_satisfying_versions() {
        // foo needs bar >= 2.0; the newest bar wins.
        let repo = pool(vec![
            package("foo", "1.0.0", vec![dep("bar", ">=2.0", "")]),
            package("bar", "1.0.0", vec![]),
            package("bar", "2.0.0", vec![]),
            package("bar", "3.0.0", vec![]),
        ]);
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("foo", "*", ""));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        let packages = solver.solve_packages(&[]).unwrap();
        assert_eq!(names(&packages), vec!["bar 3.0.0", "foo 1.0.0"]);
        let depth: HashMap<String, usize> =
            packages.iter().map(|(p, d)| (p.name.clone(), *d)).collect();
        assert_eq!(depth["foo"], 0);
        assert_eq!(depth["bar"], 1);
    }

    #[test]
    fn locked_versions_are_favored() {
        // The locked foo 1.0.0 stays unless foo is updated.
        let repo = pool(vec![
            package("foo", "1.0.0", vec![]),
            package("foo", "1.1.0", vec![]),
        ]);
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("foo", "^1.0", ""));
        let locked: InMemoryRepository = [package("foo", "1.0.0", vec![])].into_iter().collect();

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            locked,
        );
        assert_eq!(names(&solver.solve_packages(&[]).unwrap()), vec!["foo 1.0.0"]);
        assert_eq!(
            names(&solver.solve_packages(&["foo".to_string()]).unwrap()),
            vec!["foo 1.1.0"]
        );
    }

    #[test]
    fn unsatisfiable_requirements_report_a_conflict() {
        // Only foo 1.0.0 exists but ^2.0 is required.
        let repo = pool(vec![package("foo", "1.0.0", vec![])]);
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("foo", "^2.0", ""));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        assert!(matches!(
            solver.solve(&[]),
            Err(SolveError::Unsolvable(message)) if message.contains("foo")
        ));
    }

    #[test]
    fn identical_markers_with_different_constraints_conflict() {
        // Two constraints under one marker must hold at once.
        let repo = pool(vec![
            package("b", "1.0.0", vec![]),
            package("b", "2.0.0", vec![]),
        ]);
        let gate = r#"sys_platform == "win32""#;
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("b", "^1.0", gate));
        root.add_dependency(dep("b", "^2.0", gate));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        assert!(matches!(solver.solve(&[]), Err(SolveError::Unsolvable(_))));
    }

    #[test]
    fn split_branches_are_merged_with_markers() {
        // b ^1.0 on old pythons, b ^2.0 on new ones.
        let repo = pool(vec![
            package("b", "1.0.0", vec![]),
            package("b", "2.0.0", vec![]),
        ]);
        let old = r#"python_version < "3.8""#;
        let new = r#"python_version >= "3.8""#;
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("b", "^1.0", old));
        root.add_dependency(dep("b", "^2.0", new));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        let packages = solver.solve_packages(&[]).unwrap();
        assert_eq!(names(&packages), vec!["b 1.0.0", "b 2.0.0"]);
        for (package, _) in &packages {
            let expected = if package.version == v("1.0.0") { old } else { new };
            assert!(package.marker.equivalent(&Marker::parse(expected).unwrap()));
        }
        assert!(solver.provider().overrides().is_empty());
    }

    #[test]
    fn failing_branches_are_dropped() {
        // Only the python < 3.8 branch has a candidate.
        let repo = pool(vec![package("b", "1.0.0", vec![])]);
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("b", "^1.0", r#"python_version < "3.8""#));
        root.add_dependency(dep("b", "^2.0", r#"python_version >= "3.8""#));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        assert_eq!(names(&solver.solve_packages(&[]).unwrap()), vec!["b 1.0.0"]);
    }

    #[test]
    fn disjoint_markers_leave_uncovered_environments_their_own_branch() {
        // foo covers 3.7 and 3.8, bar covers 3.8 and 3.9: 3.9 still needs bar.
        let repo = pool(vec![
            package("foo", "1.0.0", vec![]),
            package("foo", "2.0.0", vec![]),
            package("bar", "2.0.0", vec![]),
            package("bar", "3.0.0", vec![]),
        ]);
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("foo", "==1.0.0", r#"python_version == "3.7""#));
        root.add_dependency(dep("foo", "==2.0.0", r#"python_version == "3.8""#));
        root.add_dependency(dep("bar", "==2.0.0", r#"python_version == "3.8""#));
        root.add_dependency(dep("bar", "==3.0.0", r#"python_version == "3.9""#));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        let packages = solver.solve_packages(&[]).unwrap();
        assert_eq!(
            names(&packages),
            vec!["bar 2.0.0", "bar 3.0.0", "foo 1.0.0", "foo 2.0.0"]
        );
        let bar3 = packages
            .iter()
            .find(|(p, _)| p.name == "bar" && p.version == v("3.0.0"))
            .unwrap();
        assert!(
            bar3.0
                .marker
                .equivalent(&Marker::parse(r#"python_version == "3.9""#).unwrap())
        );
    }

    #[test]
    fn fallback_branch_drops_the_requirement() {
        // b has no candidate, so only the python < 3.7 fallback resolves.
        let repo = pool(vec![package("c", "1.0.0", vec![])]);
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("b", "^1.0", r#"python_version >= "3.7""#));
        root.add_dependency(dep("b", "^2.0", r#"python_version >= "3.8""#));
        root.add_dependency(dep("c", "*", ""));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        assert_eq!(names(&solver.solve_packages(&[]).unwrap()), vec!["c 1.0.0"]);
        assert!(solver.provider().overrides().is_empty());
    }

    #[test]
    fn extras_variants_fold_into_the_base_package() {
        // foo[speed] pulls bar and is locked as plain foo.
        let mut foo = package("foo", "1.0.0", vec![dep("bar", "^1.0", "").optional(true)]);
        foo.extras.insert("speed".into(), vec!["bar".into()]);
        let repo = pool(vec![foo, package("bar", "1.0.0", vec![])]);
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("foo", "*", "").with_extras(["speed"]));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        let packages = solver.solve_packages(&[]).unwrap();
        assert_eq!(names(&packages), vec!["bar 1.0.0", "foo 1.0.0"]);
        let foo = packages.iter().find(|(p, _)| p.name == "foo").unwrap();
        assert!(foo.0.features.is_empty());
        assert!(foo.0.all_requires().iter().any(|d| d.name == "bar"));
        assert!(packages.iter().all(|(p, _)| !p.optional));
    }

    #[test]
    fn optional_root_requirements_tag_packages() {
        // bar is only reachable through an optional requirement.
        let repo = pool(vec![
            package("foo", "1.0.0", vec![]),
            package("bar", "1.1.0", vec![]),
        ]);
        let mut root = Package::root("project", v("1.0"));
        root.add_dependency(dep("foo", "^1.0", ""));
        root.add_dependency(dep("bar", "^1.1", "").optional(true));

        let mut solver = Solver::new(
            Provider::new(&root, &repo),
            InMemoryRepository::new(),
            InMemoryRepository::new(),
        );
        let packages = solver.solve_packages(&[]).unwrap();
        let optional: HashMap<String, bool> = packages
            .iter()
            .map(|(p, _)| (p.name.clone(), p.optional))
            .collect();
        assert!(!optional["foo"]);
        assert!(optional["bar"]);
    }
}
