//! Resolve `pyproject.toml` dependencies with [`resolvo`] and write
//! `poetry.lock` without installing anything.
//!
//! The [`Provider`] expands a package into its requirement edges. Requirements
//! on the same package under different environment markers are merged where
//! that is safe and otherwise split the resolution into marker branches,
//! which the [`Solver`] resolves one by one and merges. The [`Installer`]
//! runs the lock passes of a regular install and reports the operations it
//! would perform; the `solve` command ([`command::SolveCommand`]) wires it up.

pub mod command;
pub mod config;
mod error;
pub mod installer;
pub mod lock;
pub mod manifest;
pub mod marker;
pub mod package;
mod pool;
pub mod provider;
pub mod repository;
mod solver;
pub mod transaction;
pub mod version;

pub use error::{Result, SolveError};
pub use installer::{InstallReport, Installer};
pub use lock::Locker;
pub use marker::{Marker, MarkerEnvironment};
pub use package::{Dependency, DependencyPackage, Package};
pub use provider::{Completion, Overrides, Provider};
pub use repository::{InMemoryRepository, IndexRepository, PackageRepository, RepositoryPool};
pub use solver::Solver;
pub use transaction::{Job, Operation, Transaction};
pub use version::VersionConstraint;
