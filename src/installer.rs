//! Lock-writing installer.
//!
//! [`Installer`] runs the same passes as a full install (solve, write the
//! lock file, re-solve against the locked set for the target environment)
//! and reports the resulting operations. Nothing is ever executed.

use std::collections::BTreeSet;
use std::path::PathBuf;

use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::error::{Result, SolveError};
use crate::lock::{Locker, requirement_name};
use crate::marker::MarkerEnvironment;
use crate::package::{Package, canonicalize_name};
use crate::provider::{LocalDirectOrigin, Provider};
use crate::repository::{InMemoryRepository, PackageRepository, RepositoryPool};
use crate::solver::Solver;
use crate::transaction::{Operation, Transaction};

/// What a run would have done.
#[derive(Debug, Clone, Default)]
pub struct InstallReport {
    /// Operations in execution order; skipped ones carry their reason.
    pub operations: Vec<Operation>,
    pub lock_written: bool,
}

impl InstallReport {
    /// Operations that would actually run.
    pub fn pending(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(|op| !op.is_skipped())
    }
}

pub struct Installer<'a> {
    package: Package,
    locker: Locker,
    pool: &'a RepositoryPool,
    installed: InMemoryRepository,
    env: Option<MarkerEnvironment>,
    source_root: PathBuf,
    unsafe_packages: Vec<String>,

    update: bool,
    lock: bool,
    groups: Option<Vec<String>>,
    extras: Vec<String>,
    whitelist: Vec<String>,
    requires_synchronization: bool,
}

impl<'a> Installer<'a> {
    pub fn new(package: &Package, locker: Locker, pool: &'a RepositoryPool) -> Self {
        Self {
            package: package.clone(),
            locker,
            pool,
            installed: InMemoryRepository::named("installed"),
            env: None,
            source_root: PathBuf::from("."),
            unsafe_packages: Vec::new(),
            update: false,
            lock: false,
            groups: None,
            extras: Vec::new(),
            whitelist: Vec::new(),
            requires_synchronization: false,
        }
    }

    /// Only write the lock file. Without `update`, an existing lock is
    /// refreshed with its versions kept where possible.
    pub fn lock(mut self, update: bool) -> Self {
        self.update = update;
        self.lock = true;
        self
    }

    pub fn update(mut self, update: bool) -> Self {
        self.update = update;
        self
    }

    /// Restrict the final pass to exactly these dependency groups.
    pub fn only_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = Some(groups.into_iter().map(Into::into).collect());
        self
    }

    pub fn extras(mut self, extras: Vec<String>) -> Self {
        self.extras = extras;
        self
    }

    /// Packages allowed to move away from their locked version.
    pub fn whitelist(mut self, names: Vec<String>) -> Self {
        self.whitelist = names.iter().map(|n| canonicalize_name(n)).collect();
        self
    }

    pub fn requires_synchronization(mut self, synchronize: bool) -> Self {
        self.requires_synchronization = synchronize;
        self
    }

    pub fn installed_repository(mut self, installed: InMemoryRepository) -> Self {
        self.installed = installed;
        self
    }

    pub fn use_environment(mut self, env: Option<MarkerEnvironment>) -> Self {
        self.env = env;
        self
    }

    /// Directory that local path dependencies are relative to.
    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = root.into();
        self
    }

    pub fn unsafe_packages(mut self, names: Vec<String>) -> Self {
        self.unsafe_packages = names;
        self
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    pub fn run(mut self) -> Result<InstallReport> {
        if !self.update && self.lock && self.locker.is_locked() {
            return self.do_refresh();
        }
        if !self.update && !self.locker.is_locked() {
            debug!("no lock file, resolving from scratch");
            self.update = true;
        }
        self.do_install()
    }

    fn provider<'p>(&self, root: &Package, pool: &'p RepositoryPool) -> Provider<'p> {
        Provider::new(root, pool)
            .with_origin(LocalDirectOrigin::new(self.source_root.clone()))
            .with_unsafe_packages(&self.unsafe_packages)
    }

    fn validate_extras(&self) -> Result<()> {
        for extra in &self.extras {
            if !self.package.extras.contains_key(&canonicalize_name(extra)) {
                return Err(SolveError::InvalidExtra(extra.clone()));
            }
        }
        Ok(())
    }

    /// Re-solve keeping the locked versions, then rewrite the lock file.
    fn do_refresh(&self) -> Result<InstallReport> {
        self.validate_extras()?;
        let locked = self.locker.locked_repository()?;

        // Directory dependencies are always re-read; their locked metadata
        // may be outdated.
        let use_latest: Vec<String> = locked
            .packages()
            .into_iter()
            .filter(|p| p.source.kind() == Some("directory"))
            .map(|p| p.name)
            .collect();

        let provider = self.provider(&self.package, self.pool);
        let mut solver = Solver::new(provider, locked.clone(), locked);
        let operations = solver
            .solve(&use_latest)?
            .calculate_operations(true, false);

        let lock_written = self.write_lock_file(&lockfile_packages(&operations), true)?;
        Ok(InstallReport {
            operations,
            lock_written,
        })
    }

    fn do_install(&self) -> Result<InstallReport> {
        let mut locked = InMemoryRepository::named("poetry-locked");
        let mut whitelist = self.whitelist.clone();
        let mut lock_written = false;

        let lockfile = if self.update {
            // A lock-only update resolves from scratch.
            if self.locker.is_locked() && !self.lock {
                locked = self.locker.locked_repository()?;
                if whitelist.is_empty() {
                    whitelist = locked.packages().into_iter().map(|p| p.name).collect();
                }
            }
            self.validate_extras()?;

            info!("Updating dependencies");
            let provider = self.provider(&self.package, self.pool);
            let mut solver = Solver::new(provider, self.installed.clone(), locked.clone());
            let operations = solver
                .solve(&whitelist)?
                .calculate_operations(true, false);

            let lockfile = lockfile_packages(&operations);
            lock_written = self.write_lock_file(&lockfile, false)?;
            if self.lock {
                return Ok(InstallReport {
                    operations,
                    lock_written,
                });
            }
            lockfile
        } else {
            info!("Installing dependencies from lock file");
            locked = self.locker.locked_repository()?;
            if !self.locker.is_fresh()? {
                warn!(
                    "poetry.lock is not consistent with pyproject.toml. You may be getting \
                     improper dependencies. Run `pyproject-solve solve --no-update` to fix it."
                );
            }
            let locked_extras: BTreeSet<String> = self
                .locker
                .lock_data()?
                .extras
                .keys()
                .map(|extra| canonicalize_name(extra))
                .collect();
            for extra in &self.extras {
                if !locked_extras.contains(&canonicalize_name(extra)) {
                    return Err(SolveError::InvalidExtra(extra.clone()));
                }
            }
            locked.packages()
        };

        // Every constraint is known by now: resolve the requested groups
        // against the locked set only, for the target environment.
        let root = match &self.groups {
            Some(groups) => self.package.with_dependency_groups(groups, true),
            None => self.package.without_optional_dependency_groups(),
        };
        let mut known = InMemoryRepository::new();
        for package in lockfile.iter().cloned().chain(locked.packages()) {
            if !known.has_package(&package) {
                known.add(package);
            }
        }
        let mut pool = RepositoryPool::ignoring_repository_names();
        pool.add_repository(Box::new(known));

        let mut provider = self.provider(&root, &pool);
        provider.load_deferred(false);
        let mut solver = Solver::new(provider, self.installed.clone(), locked.clone());
        solver.use_environment(self.env.clone());
        let mut operations = solver.solve(&whitelist)?.calculate_operations(
            self.requires_synchronization,
            self.requires_synchronization,
        );

        if !self.requires_synchronization {
            let transaction = Transaction::new(
                locked.packages(),
                lockfile.iter().map(|p| (p.clone(), 0)).collect(),
                self.installed.packages(),
                Some(root),
            );
            let mut uninstalls: Vec<Operation> = transaction
                .calculate_operations(true, false)
                .into_iter()
                .filter(|op| op.job_type() == "uninstall")
                .collect();
            uninstalls.append(&mut operations);
            operations = uninstalls;
        }

        let operations = self.filter_operations(operations, &lockfile)?;
        Ok(InstallReport {
            operations,
            lock_written,
        })
    }

    /// Skip operations for packages the target environment does not need
    /// and for optional packages no requested extra pulls in.
    fn filter_operations(
        &self,
        operations: Vec<Operation>,
        lockfile: &[Package],
    ) -> Result<Vec<Operation>> {
        let extra_packages = self.extra_packages(lockfile)?;
        Ok(operations
            .into_iter()
            .map(|op| {
                if op.job_type() == "uninstall" {
                    return op;
                }
                let package = op.package();
                if let Some(env) = &self.env {
                    if !package.marker.validate(env) {
                        return op.skip("Not needed for the current environment");
                    }
                }
                if package.optional && !extra_packages.contains(&package.name) {
                    return op.skip("Not required");
                }
                op
            })
            .collect())
    }

    fn extra_packages(&self, packages: &[Package]) -> Result<BTreeSet<String>> {
        let extras: IndexMap<String, Vec<String>> = if self.update {
            self.package
                .extras
                .iter()
                .map(|(extra, names)| (canonicalize_name(extra), names.clone()))
                .collect()
        } else {
            self.locker
                .lock_data()?
                .extras
                .iter()
                .map(|(extra, requirements)| {
                    (
                        canonicalize_name(extra),
                        requirements.iter().map(|r| requirement_name(r)).collect(),
                    )
                })
                .collect()
        };
        let requested: Vec<String> = self.extras.iter().map(|e| canonicalize_name(e)).collect();
        Ok(extra_package_names(packages, &extras, &requested))
    }

    fn write_lock_file(&self, packages: &[Package], force: bool) -> Result<bool> {
        if !(force || self.update) {
            return Ok(false);
        }
        let written = self.locker.set_lock_data(&self.package, packages)?;
        if written {
            info!("Writing lock file");
        }
        Ok(written)
    }
}

/// Packages to record: everything the operations leave installed.
fn lockfile_packages(operations: &[Operation]) -> Vec<Package> {
    let mut packages: Vec<Package> = Vec::new();
    for op in operations.iter().filter(|op| op.job_type() != "uninstall") {
        let package = op.package();
        if !packages
            .iter()
            .any(|p| p.name == package.name && p.version == package.version)
        {
            packages.push(package.clone());
        }
    }
    packages
}

/// Names of the packages `extras` pull in, following requirements
/// transitively through `packages`.
fn extra_package_names(
    packages: &[Package],
    extras: &IndexMap<String, Vec<String>>,
    requested: &[String],
) -> BTreeSet<String> {
    let mut stack: Vec<String> = requested
        .iter()
        .filter_map(|extra| extras.get(extra))
        .flatten()
        .map(|name| canonicalize_name(name))
        .collect();
    let mut seen = BTreeSet::new();
    while let Some(name) = stack.pop() {
        if !seen.insert(name.clone()) {
            continue;
        }
        if let Some(package) = packages.iter().find(|p| p.name == name) {
            stack.extend(
                package
                    .requires()
                    .into_iter()
                    .map(|dep| dep.name)
                    .filter(|dep| !seen.contains(dep)),
            );
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use pep440_rs::Version;

    use super::*;
    use crate::marker::{Marker, MarkerVariable};
    use crate::package::Dependency;
    use crate::version::VersionConstraint;

    fn v(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    fn dep(name: &str, constraint: &str) -> Dependency {
        Dependency::new(name, VersionConstraint::parse(constraint).unwrap())
    }

    fn root() -> Package {
        let mut root = Package::root("simple-project", v("1.2.3"));
        root.python_versions = VersionConstraint::parse("~2.7 || ^3.6").unwrap();
        let mut bar = dep("bar", "^1.1").optional(true);
        bar.in_extras = vec!["feature-bar".into()];
        root.add_dependency(dep("foo", "^1.0"));
        root.add_dependency(bar);
        root.extras.insert("feature-bar".into(), vec!["bar".into()]);
        root
    }

    fn pool(packages: Vec<Package>) -> RepositoryPool {
        let mut pool = RepositoryPool::new();
        pool.add_repository(Box::new(packages.into_iter().collect::<InMemoryRepository>()));
        pool
    }

    fn index() -> Vec<Package> {
        vec![Package::new("foo", v("1.0.0")), Package::new("bar", v("1.1.0"))]
    }

    fn names(report: &InstallReport) -> Vec<String> {
        report.pending().map(|op| op.package().name.clone()).collect()
    }

    #[test]
    fn lock_only_writes_the_lock_file() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let pool = pool(index());

        let report = Installer::new(&root(), locker.clone(), &pool)
            .lock(true)
            .run()
            .unwrap();
        assert!(report.lock_written);
        assert!(locker.is_locked());
        assert!(locker.is_fresh().unwrap());

        let required: Vec<String> = locker
            .required_packages(&[])
            .unwrap()
            .into_iter()
            .map(|p| format!("{} {}", p.name, p.version))
            .collect();
        assert_eq!(required, vec!["foo 1.0.0"]);

        let data = locker.lock_data().unwrap();
        let bar = data.package.iter().find(|p| p.name == "bar").unwrap();
        assert!(bar.optional);
        assert_eq!(data.extras["feature-bar"], vec!["bar"]);
    }

    #[test]
    fn unknown_extra_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let pool = pool(index());

        let err = Installer::new(&root(), locker.clone(), &pool)
            .lock(true)
            .extras(vec!["nope".into()])
            .run()
            .unwrap_err();
        assert_eq!(err.to_string(), "Extra [nope] is not specified.");
        assert!(!locker.is_locked());
    }

    #[test]
    fn refresh_keeps_locked_versions() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let first = pool(index());
        Installer::new(&root(), locker.clone(), &first)
            .lock(true)
            .run()
            .unwrap();

        let mut packages = index();
        packages.push(Package::new("foo", v("1.1.0")));
        let newer = pool(packages);

        Installer::new(&root(), locker.clone(), &newer)
            .lock(false)
            .run()
            .unwrap();
        let locked = locker.locked_repository().unwrap();
        assert!(locked.package("foo", &v("1.0.0")).is_some());

        Installer::new(&root(), locker.clone(), &newer)
            .lock(true)
            .run()
            .unwrap();
        let locked = locker.locked_repository().unwrap();
        assert!(locked.package("foo", &v("1.1.0")).is_some());
    }

    #[test]
    fn whitelist_limits_updates() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let first = pool(index());
        Installer::new(&root(), locker.clone(), &first)
            .lock(true)
            .run()
            .unwrap();

        let mut packages = index();
        packages.push(Package::new("foo", v("1.1.0")));
        packages.push(Package::new("bar", v("1.2.0")));
        let newer = pool(packages);
        let report = Installer::new(&root(), locker.clone(), &newer)
            .update(true)
            .whitelist(vec!["Bar".into()])
            .run()
            .unwrap();

        let locked = locker.locked_repository().unwrap();
        assert!(locked.package("foo", &v("1.0.0")).is_some());
        assert!(locked.package("bar", &v("1.2.0")).is_some());

        // The final pass also sees the old bar 1.1.0 and still picks 1.2.0.
        assert_eq!(names(&report), vec!["foo"]);
        let bar = report
            .operations
            .iter()
            .find(|op| op.package().name == "bar")
            .unwrap();
        assert_eq!(bar.package().version, v("1.2.0"));
    }

    #[test]
    fn lock_only_update_ignores_the_previous_lock() {
        // Every locked version may move when only the lock is written.
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let first = pool(index());
        Installer::new(&root(), locker.clone(), &first)
            .lock(true)
            .run()
            .unwrap();

        let mut packages = index();
        packages.push(Package::new("foo", v("1.1.0")));
        packages.push(Package::new("bar", v("1.2.0")));
        let newer = pool(packages);
        let report = Installer::new(&root(), locker.clone(), &newer)
            .lock(true)
            .whitelist(vec!["bar".into()])
            .run()
            .unwrap();
        assert!(report.lock_written);

        let locked = locker.locked_repository().unwrap();
        assert!(locked.package("foo", &v("1.1.0")).is_some());
        assert!(locked.package("bar", &v("1.2.0")).is_some());
    }

    #[test]
    fn install_from_lock_skips_unrequested_extras() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let pool = pool(index());
        Installer::new(&root(), locker.clone(), &pool)
            .lock(true)
            .run()
            .unwrap();

        let report = Installer::new(&root(), locker.clone(), &pool).run().unwrap();
        assert!(!report.lock_written);
        assert_eq!(names(&report), vec!["foo"]);
        let bar = report
            .operations
            .iter()
            .find(|op| op.package().name == "bar")
            .unwrap();
        assert_eq!(bar.skip_reason(), Some("Not required"));

        let report = Installer::new(&root(), locker, &pool)
            .extras(vec!["feature_bar".into()])
            .run()
            .unwrap();
        assert_eq!(names(&report), vec!["bar", "foo"]);
    }

    #[test]
    fn stale_lock_still_installs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poetry.lock");
        let pool = pool(index());
        Installer::new(&root(), Locker::new(&path, "old"), &pool)
            .lock(true)
            .run()
            .unwrap();

        let stale = Locker::new(&path, "new");
        assert!(!stale.is_fresh().unwrap());
        let report = Installer::new(&root(), stale, &pool).run().unwrap();
        assert_eq!(names(&report), vec!["foo"]);
    }

    #[test]
    fn missing_lock_forces_an_update() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let pool = pool(index());

        let report = Installer::new(&root(), locker.clone(), &pool).run().unwrap();
        assert!(report.lock_written);
        assert!(locker.is_locked());
        assert_eq!(names(&report), vec!["foo"]);
    }

    #[test]
    fn environment_drops_foreign_packages() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let mut root = Package::root("project", v("1.0.0"));
        root.python_versions = VersionConstraint::parse("^3.8").unwrap();
        root.add_dependency(dep("foo", "^1.0"));
        root.add_dependency(
            dep("pywin", "*").with_marker(Marker::parse(r#"sys_platform == "win32""#).unwrap()),
        );
        let pool = pool(vec![
            Package::new("foo", v("1.0.0")),
            Package::new("pywin", v("300")),
        ]);

        let env = MarkerEnvironment::for_python("3.9").with(MarkerVariable::SysPlatform, "linux");
        let report = Installer::new(&root, locker.clone(), &pool)
            .use_environment(Some(env))
            .run()
            .unwrap();
        assert_eq!(names(&report), vec!["foo"]);
        // the lock itself stays environment-agnostic
        assert!(
            locker
                .locked_repository()
                .unwrap()
                .package("pywin", &v("300"))
                .is_some()
        );
    }

    #[test]
    fn synchronization_removes_unlocked_packages() {
        let dir = tempfile::tempdir().unwrap();
        let locker = Locker::new(dir.path().join("poetry.lock"), "hash");
        let pool = pool(index());
        let installed: InMemoryRepository = vec![
            Package::new("foo", v("1.0.0")),
            Package::new("stray", v("0.1")),
        ]
        .into_iter()
        .collect();

        let report = Installer::new(&root(), locker.clone(), &pool)
            .installed_repository(installed.clone())
            .run()
            .unwrap();
        assert!(report.pending().all(|op| op.job_type() != "uninstall"));

        let report = Installer::new(&root(), locker, &pool)
            .installed_repository(installed)
            .requires_synchronization(true)
            .run()
            .unwrap();
        let removed: Vec<String> = report
            .pending()
            .filter(|op| op.job_type() == "uninstall")
            .map(|op| op.package().name.clone())
            .collect();
        assert_eq!(removed, vec!["stray"]);
        let foo = report
            .operations
            .iter()
            .find(|op| op.package().name == "foo")
            .unwrap();
        assert_eq!(foo.skip_reason(), Some("Already installed"));
    }

    #[test]
    fn extra_names_follow_requirements() {
        let mut bar = Package::new("bar", v("1.0"));
        bar.add_dependency(dep("baz", "*"));
        let packages = vec![bar, Package::new("baz", v("1.0")), Package::new("foo", v("1.0"))];
        let mut extras = IndexMap::new();
        extras.insert("feature-bar".to_string(), vec!["Bar".to_string()]);

        let names = extra_package_names(&packages, &extras, &["feature-bar".into()]);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["bar", "baz"]);
        assert!(extra_package_names(&packages, &extras, &[]).is_empty());
    }
}
