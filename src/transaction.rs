//! Install, update and uninstall operations derived from a resolution.
//!
//! Nothing here executes an operation; the list is reported and discarded.

use std::fmt;

use crate::package::Package;

/// Names left alone on synchronisation unless they are managed by the lock.
const PRESERVED_PACKAGES: [&str; 3] = ["pip", "setuptools", "wheel"];

#[derive(Debug, Clone, PartialEq)]
pub enum Job {
    Install(Package),
    Update { from: Package, to: Package },
    Uninstall(Package),
}

/// One step of a transaction. Higher priorities come first.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub job: Job,
    pub priority: usize,
    skip_reason: Option<String>,
}

impl Operation {
    pub fn install(package: Package, priority: usize) -> Self {
        Self {
            job: Job::Install(package),
            priority,
            skip_reason: None,
        }
    }

    pub fn update(from: Package, to: Package, priority: usize) -> Self {
        Self {
            job: Job::Update { from, to },
            priority,
            skip_reason: None,
        }
    }

    /// Uninstalls always run first.
    pub fn uninstall(package: Package) -> Self {
        Self {
            job: Job::Uninstall(package),
            priority: usize::MAX,
            skip_reason: None,
        }
    }

    pub fn skip(mut self, reason: &str) -> Self {
        self.skip_reason = Some(reason.to_string());
        self
    }

    pub fn unskip(mut self) -> Self {
        self.skip_reason = None;
        self
    }

    pub fn is_skipped(&self) -> bool {
        self.skip_reason.is_some()
    }

    pub fn skip_reason(&self) -> Option<&str> {
        self.skip_reason.as_deref()
    }

    /// The package the operation leaves behind (or removes).
    pub fn package(&self) -> &Package {
        match &self.job {
            Job::Install(package) | Job::Uninstall(package) => package,
            Job::Update { to, .. } => to,
        }
    }

    pub fn job_type(&self) -> &'static str {
        match self.job {
            Job::Install(_) => "install",
            Job::Update { .. } => "update",
            Job::Uninstall(_) => "uninstall",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.job {
            Job::Install(p) => write!(f, "Installing {} ({})", p.pretty_name, p.version)?,
            Job::Update { from, to } => write!(
                f,
                "Updating {} ({} -> {})",
                to.pretty_name, from.version, to.version
            )?,
            Job::Uninstall(p) => write!(f, "Removing {} ({})", p.pretty_name, p.version)?,
        }
        if let Some(reason) = &self.skip_reason {
            write!(f, ": Skipped ({reason})")?;
        }
        Ok(())
    }
}

fn is_same_package(a: &Package, b: &Package) -> bool {
    a.complete_name() == b.complete_name() && a.source == b.source
}

/// The difference between what is locked or installed and a resolution.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    current_packages: Vec<Package>,
    result_packages: Vec<(Package, usize)>,
    installed_packages: Vec<Package>,
    root_package: Option<Package>,
}

impl Transaction {
    pub fn new(
        current_packages: Vec<Package>,
        result_packages: Vec<(Package, usize)>,
        installed_packages: Vec<Package>,
        root_package: Option<Package>,
    ) -> Self {
        Self {
            current_packages,
            result_packages,
            installed_packages,
            root_package,
        }
    }

    /// Resolved packages with their depth in the dependency graph.
    pub fn result_packages(&self) -> &[(Package, usize)] {
        &self.result_packages
    }

    pub fn packages(&self) -> Vec<Package> {
        self.result_packages.iter().map(|(p, _)| p.clone()).collect()
    }

    /// Operations turning the installed set into the resolution. With
    /// `synchronize`, installed packages the lock does not know about are
    /// removed too.
    pub fn calculate_operations(&self, with_uninstalls: bool, synchronize: bool) -> Vec<Operation> {
        let mut operations = Vec::new();

        for (result, priority) in &self.result_packages {
            match self
                .installed_packages
                .iter()
                .find(|installed| installed.name == result.name)
            {
                Some(installed) => {
                    let source_changed = (installed.source.kind().is_some()
                        || result.source.kind() != Some("legacy"))
                        && !is_same_package(installed, result);
                    if result.version != installed.version || source_changed {
                        operations.push(Operation::update(
                            installed.clone(),
                            result.clone(),
                            *priority,
                        ));
                    } else {
                        operations
                            .push(Operation::install(result.clone(), *priority).skip("Already installed"));
                    }
                }
                None => operations.push(Operation::install(result.clone(), *priority)),
            }
        }

        if with_uninstalls {
            for current in &self.current_packages {
                let resolved = self
                    .result_packages
                    .iter()
                    .any(|(result, _)| result.name == current.name);
                let installed = self
                    .installed_packages
                    .iter()
                    .any(|installed| installed.name == current.name);
                if !resolved && installed {
                    operations.push(Operation::uninstall(current.clone()));
                }
            }

            if synchronize {
                let managed: Vec<&str> = self
                    .current_packages
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect();
                for installed in &self.installed_packages {
                    let is_root = self
                        .root_package
                        .as_ref()
                        .is_some_and(|root| root.name == installed.name);
                    let preserved = PRESERVED_PACKAGES.contains(&installed.name.as_str())
                        && !managed.contains(&installed.name.as_str());
                    if !is_root && !preserved && !managed.contains(&installed.name.as_str()) {
                        operations.push(Operation::uninstall(installed.clone()));
                    }
                }
            }
        }

        operations.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.package().name.cmp(&b.package().name))
                .then_with(|| a.package().version.cmp(&b.package().version))
        });
        operations
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use pep440_rs::Version;

    use super::*;
    use crate::package::PackageSource;

    fn package(name: &str, version: &str) -> Package {
        Package::new(name, Version::from_str(version).unwrap())
    }

    fn summary(operations: &[Operation]) -> Vec<String> {
        operations.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn fresh_install_orders_by_depth_then_name() {
        let transaction = Transaction::new(
            Vec::new(),
            vec![
                (package("a", "1.0"), 0),
                (package("c", "1.0"), 1),
                (package("b", "1.0"), 1),
            ],
            Vec::new(),
            None,
        );
        assert_eq!(
            summary(&transaction.calculate_operations(true, false)),
            vec![
                "Installing b (1.0)",
                "Installing c (1.0)",
                "Installing a (1.0)"
            ]
        );
    }

    #[test]
    fn installed_packages_are_skipped_or_updated() {
        let transaction = Transaction::new(
            Vec::new(),
            vec![(package("a", "1.0"), 0), (package("b", "2.0"), 0)],
            vec![package("a", "1.0"), package("b", "1.0")],
            None,
        );
        let operations = transaction.calculate_operations(true, false);
        assert_eq!(
            summary(&operations),
            vec![
                "Installing a (1.0): Skipped (Already installed)",
                "Updating b (1.0 -> 2.0)"
            ]
        );
        assert!(operations[0].is_skipped());
        assert_eq!(operations[1].job_type(), "update");
    }

    #[test]
    fn source_change_is_an_update() {
        let mut local = package("a", "1.0");
        local.source = PackageSource::Directory {
            path: "../a".into(),
            develop: true,
        };
        let transaction = Transaction::new(
            Vec::new(),
            vec![(local, 0)],
            vec![package("a", "1.0")],
            None,
        );
        assert_eq!(
            transaction.calculate_operations(false, false)[0].job_type(),
            "update"
        );
    }

    #[test]
    fn uninstalls_come_first() {
        let transaction = Transaction::new(
            vec![package("a", "1.0"), package("old", "1.0")],
            vec![(package("a", "1.0"), 0)],
            vec![package("a", "1.0"), package("old", "1.0")],
            None,
        );
        let operations = transaction.calculate_operations(true, false);
        assert_eq!(summary(&operations)[0], "Removing old (1.0)");
        assert!(summary(&transaction.calculate_operations(false, false))
            .iter()
            .all(|op| !op.starts_with("Removing")));
    }

    #[test]
    fn synchronize_removes_unmanaged_packages() {
        let root = Package::root("project", Version::from_str("0.1.0").unwrap());
        let transaction = Transaction::new(
            vec![package("a", "1.0")],
            vec![(package("a", "1.0"), 0)],
            vec![
                package("a", "1.0"),
                package("stray", "2.0"),
                package("pip", "23.0"),
                package("project", "0.1.0"),
            ],
            Some(root),
        );
        let removed: Vec<String> = transaction
            .calculate_operations(true, true)
            .into_iter()
            .filter(|op| op.job_type() == "uninstall")
            .map(|op| op.package().name.clone())
            .collect();
        assert_eq!(removed, vec!["stray"]);
    }
}
