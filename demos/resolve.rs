//! Example: resolve a small slice of PyPI with marker-split requirements.
//!
//! The project needs a different `numpy` on old and new Pythons and a
//! Windows-only package. It is resolved once environment-agnostic (what
//! goes into the lock file) and then for two concrete environments.

use std::str::FromStr;

use pep440_rs::Version;
use pyproject_solve::marker::MarkerVariable;
use pyproject_solve::{
    Dependency, InMemoryRepository, Marker, MarkerEnvironment, Package, Provider, RepositoryPool,
    Solver, VersionConstraint,
};

fn dep(name: &str, constraint: &str, marker: &str) -> Dependency {
    Dependency::new(name, VersionConstraint::parse(constraint).unwrap())
        .with_marker(Marker::parse(marker).unwrap())
}

fn pkg(name: &str, version: &str, python: &str, deps: Vec<Dependency>) -> Package {
    let mut package = Package::new(name, Version::from_str(version).unwrap());
    package.python_versions = VersionConstraint::parse(python).unwrap();
    for d in deps {
        package.add_dependency(d);
    }
    package
}

fn build_repo() -> InMemoryRepository {
    let mut repo = InMemoryRepository::new();

    for version in ["1.26.18", "2.0.7", "2.2.1"] {
        repo.add(pkg("urllib3", version, ">=3.7", vec![]));
    }
    repo.add(pkg("idna", "3.6", ">=3.5", vec![]));
    repo.add(pkg("certifi", "2024.2.2", ">=3.6", vec![]));
    repo.add(pkg("charset-normalizer", "3.3.2", ">=3.7", vec![]));
    repo.add(pkg(
        "requests",
        "2.31.0",
        ">=3.7",
        vec![
            dep("charset-normalizer", ">=2,<4", ""),
            dep("idna", ">=2.5,<4", ""),
            dep("urllib3", ">=1.21.1,<3", ""),
            dep("certifi", ">=2017.4.17", ""),
        ],
    ));

    repo.add(pkg("numpy", "1.21.6", ">=3.7,<3.11", vec![]));
    repo.add(pkg("numpy", "1.24.4", ">=3.8", vec![]));
    repo.add(pkg("numpy", "1.26.4", ">=3.9", vec![]));

    repo.add(pkg("pywin32", "306", "*", vec![]));
    repo
}

fn build_root() -> Package {
    let mut root = Package::root("demo-project", Version::from_str("0.1.0").unwrap());
    root.python_versions = VersionConstraint::parse(">=3.7,<4").unwrap();
    root.add_dependency(dep("requests", "^2.31", ""));
    root.add_dependency(dep("numpy", "~1.21", r#"python_version < "3.8""#));
    root.add_dependency(dep("numpy", "^1.24", r#"python_version >= "3.8""#));
    root.add_dependency(dep("pywin32", ">=300", r#"sys_platform == "win32""#));
    root
}

fn solve_and_print(root: &Package, pool: &RepositoryPool, env: Option<MarkerEnvironment>) {
    let mut solver = Solver::new(
        Provider::new(root, pool),
        InMemoryRepository::new(),
        InMemoryRepository::new(),
    );
    solver.use_environment(env);

    match solver.solve(&[]) {
        Ok(transaction) => {
            let mut packages = transaction.result_packages().to_vec();
            packages.sort_by(|a, b| a.0.name.cmp(&b.0.name).then(a.0.version.cmp(&b.0.version)));
            println!("Resolved {} packages:", packages.len());
            for (package, depth) in &packages {
                let marker = package.marker.to_string();
                if marker.is_empty() {
                    println!("  {package}  depth={depth}");
                } else {
                    println!("  {package}  depth={depth}  ; {marker}");
                }
            }
            println!("Operations:");
            for op in transaction.calculate_operations(true, false) {
                println!("  {op}");
            }
        }
        Err(err) => println!("  {err}"),
    }
}

fn main() {
    let mut pool = RepositoryPool::new();
    pool.add_repository(Box::new(build_repo()));
    let root = build_root();

    println!("Root requirements:");
    for requirement in root.all_requires() {
        let marker = requirement.marker.to_string();
        if marker.is_empty() {
            println!("  {requirement}");
        } else {
            println!("  {requirement} ; {marker}");
        }
    }

    println!("\n{}\nany environment (lock)\n{}", "=".repeat(60), "=".repeat(60));
    solve_and_print(&root, &pool, None);

    let linux37 = MarkerEnvironment::for_python("3.7.17")
        .with(MarkerVariable::SysPlatform, "linux")
        .with(MarkerVariable::PlatformSystem, "Linux");
    println!("\n{}\nCPython 3.7 on linux\n{}", "=".repeat(60), "=".repeat(60));
    solve_and_print(&root, &pool, Some(linux37));

    let win312 = MarkerEnvironment::for_python("3.12.2")
        .with(MarkerVariable::SysPlatform, "win32")
        .with(MarkerVariable::PlatformSystem, "Windows");
    println!("\n{}\nCPython 3.12 on windows\n{}", "=".repeat(60), "=".repeat(60));
    solve_and_print(&root, &pool, Some(win312));
}
