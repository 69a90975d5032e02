//! Example: failure modes of a solve.
//!
//! Each scenario builds a tiny repository and prints the error the solve
//! ends with: resolvo's conflict explanation, an unknown extra, or a
//! dependency origin that cannot be fetched.

use std::str::FromStr;

use pep440_rs::Version;
use pyproject_solve::package::DependencySource;
use pyproject_solve::{
    Dependency, InMemoryRepository, Installer, Locker, Marker, Package, Provider, RepositoryPool,
    Solver, VersionConstraint,
};

fn dep(name: &str, constraint: &str, marker: &str) -> Dependency {
    Dependency::new(name, VersionConstraint::parse(constraint).unwrap())
        .with_marker(Marker::parse(marker).unwrap())
}

fn pkg(name: &str, version: &str, deps: Vec<Dependency>) -> Package {
    let mut package = Package::new(name, Version::from_str(version).unwrap());
    for d in deps {
        package.add_dependency(d);
    }
    package
}

fn root(deps: Vec<Dependency>) -> Package {
    let mut root = Package::root("demo-project", Version::from_str("0.1.0").unwrap());
    for d in deps {
        root.add_dependency(d);
    }
    root
}

fn pool(packages: Vec<Package>) -> RepositoryPool {
    let mut pool = RepositoryPool::new();
    pool.add_repository(Box::new(packages.into_iter().collect::<InMemoryRepository>()));
    pool
}

fn try_solve(title: &str, root: &Package, pool: &RepositoryPool) {
    println!("\n{}", "=".repeat(60));
    println!("{title}");
    println!("{}", "=".repeat(60));

    let mut solver = Solver::new(
        Provider::new(root, pool),
        InMemoryRepository::new(),
        InMemoryRepository::new(),
    );
    match solver.solve_packages(&[]) {
        Ok(packages) => println!("  Resolved {} packages (unexpected).", packages.len()),
        Err(err) => println!("{err}"),
    }
}

fn main() {
    // Scenario 1: no version satisfies a transitive requirement.
    try_solve(
        "Scenario 1: transitive requirement without a candidate",
        &root(vec![dep("app", "*", "")]),
        &pool(vec![
            pkg("app", "1.0", vec![dep("lib", ">=2.0", "")]),
            pkg("lib", "1.0", vec![]),
            pkg("lib", "1.5", vec![]),
        ]),
    );

    // Scenario 2: two packages pin incompatible ranges of a shared one.
    try_solve(
        "Scenario 2: diamond with incompatible pins",
        &root(vec![dep("left", "*", ""), dep("right", "*", "")]),
        &pool(vec![
            pkg("left", "1.0", vec![dep("core", "^1.0", "")]),
            pkg("right", "1.0", vec![dep("core", "^2.0", "")]),
            pkg("core", "1.4", vec![]),
            pkg("core", "2.1", vec![]),
        ]),
    );

    // Scenario 3: same marker, different constraints. Nothing tells the
    // two requirements apart, so both must hold at once.
    let windows = r#"sys_platform == "win32""#;
    try_solve(
        "Scenario 3: duplicate requirement under one marker",
        &root(vec![dep("b", "^1.0", windows), dep("b", "^2.0", windows)]),
        &pool(vec![pkg("b", "1.0", vec![]), pkg("b", "2.0", vec![])]),
    );

    // Scenario 4: every marker branch fails.
    try_solve(
        "Scenario 4: no marker branch can be resolved",
        &root(vec![
            dep("b", "^3.0", r#"python_version < "3.8""#),
            dep("b", "^5.0", r#"python_version >= "3.8""#),
        ]),
        &pool(vec![pkg("b", "4.0", vec![])]),
    );

    // Scenario 5: a git dependency has no origin to fetch it from.
    let git = Dependency::new("tool", VersionConstraint::parse("*").unwrap()).with_source(
        DependencySource::Git {
            url: "https://example.invalid/tool.git".into(),
            reference: Some("main".into()),
            subdirectory: None,
        },
    );
    try_solve(
        "Scenario 5: unsupported dependency origin",
        &root(vec![git]),
        &pool(vec![]),
    );

    // Scenario 6: the installer rejects an extra the project lacks.
    println!("\n{}", "=".repeat(60));
    println!("Scenario 6: unknown extra");
    println!("{}", "=".repeat(60));
    let dir = std::env::temp_dir().join("pyproject-solve-demo");
    std::fs::create_dir_all(&dir).unwrap();
    let project = root(vec![dep("app", "*", "")]);
    let repo = pool(vec![pkg("app", "1.0", vec![])]);
    let result = Installer::new(&project, Locker::new(dir.join("poetry.lock"), "demo"), &repo)
        .lock(true)
        .extras(vec!["gui".into()])
        .run();
    match result {
        Ok(_) => println!("  Locked (unexpected)."),
        Err(err) => println!("{err}"),
    }
}
