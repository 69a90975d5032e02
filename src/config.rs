//! Project configuration read from `solve.toml`.
//!
//! Every section is optional. A missing file yields [`Config::default`]:
//! no extra indexes and an unbound environment.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, SolveError};
use crate::manifest::Manifest;
use crate::marker::{MarkerEnvironment, MarkerVariable};
use crate::repository::{IndexRepository, RepositoryPool};

pub const CONFIG_FILE: &str = "solve.toml";

/// Overrides the location of the configuration file.
pub const CONFIG_ENV: &str = "PYPROJECT_SOLVE_CONFIG";

/// Binds the target environment to this Python version.
pub const PYTHON_VERSION_ENV: &str = "PYPROJECT_SOLVE_PYTHON_VERSION";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub repositories: IndexMap<String, RepositoryConfig>,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub solver: SolverConfig,
}

/// A local package index, `[repositories.<name>]`.
#[derive(Debug, Clone, Deserialize)]
pub struct RepositoryConfig {
    pub path: PathBuf,
    /// Recorded in the lock as the source url of the index's packages.
    #[serde(default)]
    pub url: Option<String>,
}

/// The environment operations are filtered against.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub python_version: Option<String>,
    pub python_full_version: Option<String>,
    pub sys_platform: Option<String>,
    pub platform_system: Option<String>,
    pub platform_machine: Option<String>,
    pub os_name: Option<String>,
    pub implementation_name: Option<String>,
    pub platform_python_implementation: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SolverConfig {
    /// Requirements dropped from every package.
    #[serde(default)]
    pub unsafe_packages: Vec<String>,
}

impl Config {
    /// Load the configuration for the project in `project_dir`, honouring
    /// [`CONFIG_ENV`] and [`PYTHON_VERSION_ENV`].
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => project_dir.join(CONFIG_FILE),
        };
        let config = Self::from_file(&path)?;
        Ok(config.with_python_version(std::env::var(PYTHON_VERSION_ENV).ok()))
    }

    /// Read `path`; a missing file is the default configuration.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no configuration file");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| SolveError::io(path, e))?;
        let mut config = Self::parse(&text, path)?;
        // repository paths are relative to the file declaring them
        if let Some(base) = path.parent() {
            for repository in config.repositories.values_mut() {
                repository.path = base.join(&repository.path);
            }
        }
        Ok(config)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        toml::from_str(text).map_err(|e| SolveError::toml(path, e))
    }

    /// Replace the configured Python version, if `version` is set.
    pub fn with_python_version(mut self, version: Option<String>) -> Self {
        if let Some(version) = version.filter(|v| !v.trim().is_empty()) {
            self.environment.python_version = Some(version);
            self.environment.python_full_version = None;
        }
        self
    }

    /// The bound target environment. Unbound without a Python version.
    pub fn marker_environment(&self) -> Option<MarkerEnvironment> {
        let env = &self.environment;
        let python = env.python_full_version.as_ref().or(env.python_version.as_ref())?;
        let mut marker_env = MarkerEnvironment::for_python(python);
        let values = [
            (MarkerVariable::SysPlatform, &env.sys_platform),
            (MarkerVariable::PlatformSystem, &env.platform_system),
            (MarkerVariable::PlatformMachine, &env.platform_machine),
            (MarkerVariable::OsName, &env.os_name),
            (MarkerVariable::ImplementationName, &env.implementation_name),
            (
                MarkerVariable::PlatformPythonImplementation,
                &env.platform_python_implementation,
            ),
        ];
        for (variable, value) in values {
            if let Some(value) = value {
                marker_env.set(variable, value);
            }
        }
        Some(marker_env)
    }

    /// Repositories for `manifest`: its local `[[tool.poetry.source]]`
    /// indexes first, then the configured ones.
    pub fn repository_pool(&self, manifest: &Manifest) -> Result<RepositoryPool> {
        let mut pool = RepositoryPool::new();
        for source in manifest.sources() {
            let Some(path) = source.local_path(manifest.project_dir()) else {
                debug!(source = %source.name, "skipping remote source");
                continue;
            };
            let legacy_url = (!source.default).then_some(source.url.as_str());
            pool.add_repository(Box::new(IndexRepository::open(
                &source.name,
                &path,
                legacy_url,
            )?));
        }
        for (name, repository) in &self.repositories {
            if pool.has_repository(name) {
                debug!(repository = %name, "already declared by the project");
                continue;
            }
            pool.add_repository(Box::new(IndexRepository::open(
                name,
                &repository.path,
                repository.url.as_deref(),
            )?));
        }
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Dependency;
    use crate::version::VersionConstraint;

    const INDEX: &str = r#"
[[package]]
name = "foo"
version = "1.0.0"
"#;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join(CONFIG_FILE)).unwrap();
        assert!(config.repositories.is_empty());
        assert!(config.marker_environment().is_none());
        assert!(config.solver.unsafe_packages.is_empty());
    }

    #[test]
    fn environment_section() {
        let config = Config::parse(
            r#"
[environment]
python-version = "3.9"
sys-platform = "linux"
platform-system = "Linux"

[solver]
unsafe-packages = ["pip"]
"#,
            Path::new(CONFIG_FILE),
        )
        .unwrap();
        let env = config.marker_environment().unwrap();
        assert_eq!(env.get(MarkerVariable::PythonFullVersion), Some("3.9.0"));
        assert_eq!(env.get(MarkerVariable::SysPlatform), Some("linux"));
        assert_eq!(env.get(MarkerVariable::OsName), None);
        assert_eq!(config.solver.unsafe_packages, vec!["pip"]);
    }

    #[test]
    fn python_version_override() {
        let config = Config::parse(
            "[environment]\npython-full-version = \"3.8.10\"\n",
            Path::new(CONFIG_FILE),
        )
        .unwrap()
        .with_python_version(Some("3.11".into()));
        let env = config.marker_environment().unwrap();
        assert_eq!(env.get(MarkerVariable::PythonVersion), Some("3.11"));
        assert_eq!(env.get(MarkerVariable::PythonFullVersion), Some("3.11.0"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            Config::parse("[environment]\npython = \"3.9\"\n", Path::new(CONFIG_FILE)),
            Err(SolveError::TomlDe { .. })
        ));
    }

    #[test]
    fn repositories_from_project_and_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("local.toml"), INDEX).unwrap();
        std::fs::write(dir.path().join("extra.toml"), INDEX.replace("foo", "bar")).unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[repositories.extra]\npath = \"extra.toml\"\n",
        )
        .unwrap();
        let manifest = Manifest::parse(
            r#"
[tool.poetry]
name = "project"
version = "0.1.0"

[[tool.poetry.source]]
name = "local"
url = "local.toml"
default = true

[[tool.poetry.source]]
name = "pypi-mirror"
url = "https://mirror.invalid/simple"
"#,
            &dir.path().join("pyproject.toml"),
        )
        .unwrap();

        let config = Config::from_file(&dir.path().join(CONFIG_FILE)).unwrap();
        let pool = config.repository_pool(&manifest).unwrap();
        assert!(pool.has_repository("local"));
        assert!(pool.has_repository("extra"));
        assert!(!pool.has_repository("pypi-mirror"));
        let any = VersionConstraint::parse("*").unwrap();
        assert_eq!(pool.find_packages(&Dependency::new("foo", any.clone())).len(), 1);
        assert_eq!(pool.find_packages(&Dependency::new("bar", any)).len(), 1);
    }
}
