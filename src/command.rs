//! The `solve` command and its registration.

use std::io::Write;
use std::path::Path;

use indexmap::IndexMap;
use tracing::debug;

use crate::config::Config;
use crate::error::{Result, SolveError};
use crate::installer::Installer;
use crate::lock::Locker;
use crate::manifest::Manifest;

pub const MANIFEST_FILE: &str = "pyproject.toml";

/// A project directory: its manifest and configuration.
#[derive(Debug, Clone)]
pub struct Project {
    pub manifest: Manifest,
    pub config: Config,
}

impl Project {
    pub fn load(dir: &Path) -> Result<Self> {
        Ok(Self {
            manifest: Manifest::read(&dir.join(MANIFEST_FILE))?,
            config: Config::load(dir)?,
        })
    }

    pub fn locker(&self) -> Locker {
        Locker::for_manifest(&self.manifest)
    }
}

/// Flags of the lock command family.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct LockArgs {
    /// Do not update locked versions, only refresh the lock file.
    #[arg(long)]
    pub no_update: bool,

    /// Check that the lock file is consistent with pyproject.toml.
    #[arg(long)]
    pub check: bool,
}

pub trait Command {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn help(&self) -> &'static str;

    /// Run against `project`, returning the exit code.
    fn handle(&self, project: &Project, args: &LockArgs, out: &mut dyn Write) -> Result<i32>;
}

type Factory = Box<dyn Fn() -> Box<dyn Command>>;

/// Named command factories; a command is only built when it is run.
#[derive(Default)]
pub struct CommandLoader {
    factories: IndexMap<String, Factory>,
}

impl CommandLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_factory<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Command> + 'static,
    {
        debug!(command = name, "registering command");
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    pub fn has(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Box<dyn Command>> {
        self.factories.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Hooks into the command line application when it starts.
pub trait ApplicationPlugin {
    fn activate(&self, loader: &mut CommandLoader);
}

/// Registers `solve`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolvePlugin;

impl ApplicationPlugin for SolvePlugin {
    fn activate(&self, loader: &mut CommandLoader) {
        loader.register_factory("solve", || Box::new(SolveCommand::default()));
    }
}

/// Locks the project dependencies.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockCommand;

impl LockCommand {
    fn check(&self, locker: &Locker, out: &mut dyn Write) -> Result<i32> {
        let consistent = locker.is_locked() && locker.is_fresh()?;
        let file = locker
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        if consistent {
            writeln!(out, "{file} is consistent with {MANIFEST_FILE}.")
                .map_err(|e| SolveError::io(locker.path(), e))?;
            return Ok(0);
        }
        writeln!(
            out,
            "Error: {file} is not consistent with {MANIFEST_FILE}. \
             Run `pyproject-solve solve [--no-update]` to fix it."
        )
        .map_err(|e| SolveError::io(locker.path(), e))?;
        Ok(1)
    }
}

impl Command for LockCommand {
    fn name(&self) -> &'static str {
        "lock"
    }

    fn description(&self) -> &'static str {
        "Locks the project dependencies."
    }

    fn help(&self) -> &'static str {
        "The lock command reads the pyproject.toml file from the current directory, \
         processes it, and locks the dependencies in the poetry.lock file."
    }

    fn handle(&self, project: &Project, args: &LockArgs, out: &mut dyn Write) -> Result<i32> {
        let locker = project.locker();
        if args.check {
            return self.check(&locker, out);
        }

        let pool = project.config.repository_pool(&project.manifest)?;
        let report = Installer::new(project.manifest.package(), locker, &pool)
            .source_root(project.manifest.project_dir())
            .unsafe_packages(project.config.solver.unsafe_packages.clone())
            .use_environment(project.config.marker_environment())
            .lock(!args.no_update)
            .run()?;
        for operation in &report.operations {
            debug!("{operation}");
        }
        Ok(0)
    }
}

/// `lock` that only ever writes the lock file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolveCommand {
    lock: LockCommand,
}

impl Command for SolveCommand {
    fn name(&self) -> &'static str {
        "solve"
    }

    fn description(&self) -> &'static str {
        "Solve and lock the project dependencies."
    }

    fn help(&self) -> &'static str {
        "The solve command reads the pyproject.toml file from the current directory, \
         processes it, and locks the dependencies in the poetry.lock file without \
         installing anything."
    }

    fn handle(&self, project: &Project, args: &LockArgs, out: &mut dyn Write) -> Result<i32> {
        self.lock.handle(project, args, out)
    }
}
