//! The project manifest: `[tool.poetry]` in `pyproject.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use indexmap::IndexMap;
use pep440_rs::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, SolveError};
use crate::marker::{Marker, MarkerVariable};
use crate::package::{
    DependencyGroup, Dependency, DependencySource, MAIN_GROUP, Package, canonicalize_name,
};
use crate::version::VersionConstraint;

/// Manifest tables that affect resolution; the content hash covers exactly these.
const RELEVANT_KEYS: [&str; 5] = ["dependencies", "dev-dependencies", "group", "extras", "source"];

/// A dependency as written in `pyproject.toml` or in a lock file entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencySpec {
    /// `foo = "^1.0"`
    Simple(String),
    /// `foo = { version = "^1.0", optional = true }`
    Detailed(DetailedSpec),
    /// `foo = [{ version = "<2", python = "<3.6" }, { version = ">=2", python = ">=3.6" }]`
    Multiple(Vec<DetailedSpec>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DetailedSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub markers: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub develop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdirectory: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl DetailedSpec {
    fn to_dependency(&self, name: &str, group: &str) -> Result<Dependency> {
        let constraint = self
            .version
            .as_deref()
            .map(VersionConstraint::parse)
            .transpose()?
            .unwrap_or_default();

        let mut marker = match &self.markers {
            Some(text) => Marker::parse(text)?,
            None => Marker::any(),
        };
        if let Some(python) = &self.python {
            marker = marker.intersect(&Marker::python_version(&VersionConstraint::parse(python)?));
        }
        if let Some(platform) = &self.platform {
            marker = marker.intersect(&Marker::equals(MarkerVariable::SysPlatform, platform));
        }

        let source = if let Some(url) = &self.git {
            DependencySource::Git {
                url: url.clone(),
                reference: self
                    .branch
                    .clone()
                    .or_else(|| self.tag.clone())
                    .or_else(|| self.rev.clone()),
                subdirectory: self.subdirectory.clone(),
            }
        } else if let Some(path) = &self.path {
            if [".whl", ".tar.gz", ".zip"].iter().any(|ext| path.ends_with(ext)) {
                DependencySource::File { path: path.clone() }
            } else {
                DependencySource::Directory {
                    path: path.clone(),
                    develop: self.develop,
                }
            }
        } else if let Some(url) = &self.url {
            DependencySource::Url { url: url.clone() }
        } else {
            DependencySource::Index {
                source_name: self.source.clone(),
            }
        };

        Ok(Dependency::new(name, constraint)
            .with_marker(marker)
            .with_extras(&self.extras)
            .with_source(source)
            .with_groups(vec![group.to_string()])
            .optional(self.optional))
    }

    /// The table that reproduces `dep` in a lock file.
    pub fn from_dependency(dep: &Dependency) -> Self {
        let mut spec = DetailedSpec {
            markers: (!dep.marker.is_any()).then(|| dep.marker.to_string()),
            optional: dep.optional,
            extras: dep.extras.iter().cloned().collect(),
            ..Default::default()
        };
        match &dep.source {
            DependencySource::Index { source_name } => {
                spec.version = Some(dep.constraint.pretty());
                spec.source = source_name.clone();
            }
            DependencySource::Directory { path, develop } => {
                spec.path = Some(path.clone());
                spec.develop = *develop;
            }
            DependencySource::File { path } => spec.path = Some(path.clone()),
            DependencySource::Url { url } => spec.url = Some(url.clone()),
            DependencySource::Git {
                url,
                reference,
                subdirectory,
            } => {
                spec.git = Some(url.clone());
                spec.rev = reference.clone();
                spec.subdirectory = subdirectory.clone();
            }
        }
        spec
    }
}

impl DependencySpec {
    /// Expand into one [`Dependency`] per declared constraint.
    pub fn to_dependencies(&self, name: &str, group: &str) -> Result<Vec<Dependency>> {
        match self {
            DependencySpec::Simple(constraint) => Ok(vec![
                Dependency::new(name, VersionConstraint::parse(constraint)?)
                    .with_groups(vec![group.to_string()]),
            ]),
            DependencySpec::Detailed(spec) => Ok(vec![spec.to_dependency(name, group)?]),
            DependencySpec::Multiple(specs) => specs
                .iter()
                .map(|spec| spec.to_dependency(name, group))
                .collect(),
        }
    }

    /// Lock file rendering of every requirement on one name.
    pub fn from_dependencies(deps: &[&Dependency]) -> Option<Self> {
        match deps {
            [] => None,
            [dep] => {
                let spec = DetailedSpec::from_dependency(dep);
                let simple = DetailedSpec {
                    version: spec.version.clone(),
                    ..Default::default()
                };
                match spec.version.clone() {
                    Some(version) if spec == simple => Some(DependencySpec::Simple(version)),
                    _ => Some(DependencySpec::Detailed(spec)),
                }
            }
            _ => Some(DependencySpec::Multiple(
                deps.iter().map(|d| DetailedSpec::from_dependency(d)).collect(),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupSection {
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub dependencies: IndexMap<String, DependencySpec>,
}

/// A `[[tool.poetry.source]]` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceSection {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub secondary: bool,
}

impl SourceSection {
    /// The filesystem path behind a local or `file://` url.
    pub fn local_path(&self, project_dir: &Path) -> Option<PathBuf> {
        if self.url.starts_with("http://") || self.url.starts_with("https://") {
            return None;
        }
        let path = Path::new(self.url.strip_prefix("file://").unwrap_or(&self.url));
        Some(project_dir.join(path))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PoetrySection {
    name: String,
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    dependencies: IndexMap<String, DependencySpec>,
    #[serde(default)]
    dev_dependencies: IndexMap<String, DependencySpec>,
    #[serde(default)]
    group: IndexMap<String, GroupSection>,
    #[serde(default)]
    extras: IndexMap<String, Vec<String>>,
    #[serde(default)]
    source: Vec<SourceSection>,
}

/// A parsed `pyproject.toml`.
#[derive(Debug, Clone)]
pub struct Manifest {
    pub path: PathBuf,
    package: Package,
    sources: Vec<SourceSection>,
    content_hash: String,
}

impl Manifest {
    /// Read `pyproject.toml` at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| SolveError::io(path, e))?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let document: toml::Table = text.parse().map_err(|e| SolveError::toml(path, e))?;
        let section = document
            .get("tool")
            .and_then(|tool| tool.get("poetry"))
            .ok_or_else(|| SolveError::Manifest("missing [tool.poetry] section".into()))?;
        let content_hash = content_hash(section);
        let poetry = section
            .clone()
            .try_into::<PoetrySection>()
            .map_err(|e| SolveError::Manifest(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            package: build_root(&poetry)?,
            sources: poetry.source,
            content_hash,
        })
    }

    /// The root project package.
    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn sources(&self) -> &[SourceSection] {
        &self.sources
    }

    /// sha256 of the dependency-relevant tables, used to detect stale locks.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn project_dir(&self) -> &Path {
        self.path.parent().unwrap_or(Path::new("."))
    }
}

fn content_hash(section: &toml::Value) -> String {
    let relevant: BTreeMap<&str, &toml::Value> = RELEVANT_KEYS
        .iter()
        .filter_map(|key| section.get(*key).map(|value| (*key, value)))
        .collect();
    let canonical = serde_json::to_string(&relevant).unwrap_or_default();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

fn build_root(poetry: &PoetrySection) -> Result<Package> {
    let version = Version::from_str(&poetry.version)
        .map_err(|_| SolveError::Manifest(format!("invalid version `{}`", poetry.version)))?;
    let mut package = Package::root(&poetry.name, version);
    package.description = poetry.description.clone();

    // extra -> canonical names of the dependencies it activates
    let extras: IndexMap<String, Vec<String>> = poetry
        .extras
        .iter()
        .map(|(extra, names)| {
            (
                canonicalize_name(extra),
                names.iter().map(|n| canonicalize_name(n)).collect(),
            )
        })
        .collect();

    let mut groups: Vec<(String, bool, &IndexMap<String, DependencySpec>)> =
        vec![(MAIN_GROUP.to_string(), false, &poetry.dependencies)];
    if !poetry.dev_dependencies.is_empty() {
        groups.push(("dev".to_string(), false, &poetry.dev_dependencies));
    }
    for (name, group) in &poetry.group {
        groups.push((name.clone(), group.optional, &group.dependencies));
    }

    for (group_name, optional, specs) in groups {
        let mut group = package
            .dependency_groups
            .shift_remove(&group_name)
            .unwrap_or_else(|| DependencyGroup::new(&group_name));
        group.optional = optional;
        for (name, spec) in specs {
            if name == "python" {
                if let DependencySpec::Simple(constraint) = spec {
                    package.python_versions = VersionConstraint::parse(constraint)?;
                }
                continue;
            }
            for mut dep in spec.to_dependencies(name, &group_name)? {
                dep.in_extras = extras
                    .iter()
                    .filter(|(_, names)| names.contains(&dep.name))
                    .map(|(extra, _)| extra.clone())
                    .collect();
                group.dependencies.push(dep);
            }
        }
        package.add_dependency_group(group);
    }

    package.extras = extras;
    Ok(package)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PYPROJECT: &str = r#"
[tool.poetry]
name = "simple-project"
version = "1.2.3"
description = "Some description."

[tool.poetry.dependencies]
python = "~2.7 || ^3.6"
foo = "^1.0"
bar = { version = "^1.1", optional = true }
pypiwin32 = [
    { version = "220", platform = "win32", python = ">=3.6" },
    { version = "219", platform = "win32", python = "<3.6" },
]
local = { path = "../local", develop = true }

[tool.poetry.group.test.dependencies]
pytest = "^7.0"

[tool.poetry.group.docs]
optional = true

[tool.poetry.group.docs.dependencies]
sphinx = "*"

[tool.poetry.extras]
feature_bar = ["bar"]
"#;

    fn manifest() -> Manifest {
        Manifest::parse(PYPROJECT, Path::new("/project/pyproject.toml")).unwrap()
    }

    #[test]
    fn reads_root_package() {
        let manifest = manifest();
        let root = manifest.package();
        assert!(root.is_root());
        assert_eq!(root.name, "simple-project");
        assert_eq!(root.version.to_string(), "1.2.3");
        assert!(root.python_versions.allows(&Version::from_str("2.7.18").unwrap()));
        assert!(!root.python_versions.allows(&Version::from_str("3.5").unwrap()));
    }

    #[test]
    fn multiple_constraints_become_duplicate_requirements() {
        let root = manifest().package().clone();
        let pywin: Vec<_> = root
            .requires()
            .into_iter()
            .filter(|d| d.name == "pypiwin32")
            .collect();
        assert_eq!(pywin.len(), 2);
        assert!(pywin[0].marker.intersect(&pywin[1].marker).is_empty());
        assert_eq!(
            pywin[0].marker.to_string(),
            r#"python_version >= "3.6" and sys_platform == "win32""#
        );
    }

    #[test]
    fn optional_dependencies_know_their_extras() {
        let root = manifest().package().clone();
        let bar = root.requires().into_iter().find(|d| d.name == "bar").unwrap();
        assert!(bar.optional);
        assert_eq!(bar.in_extras, vec!["feature-bar".to_string()]);
        assert_eq!(root.extras["feature-bar"], vec!["bar".to_string()]);
    }

    #[test]
    fn groups_and_direct_origins() {
        let root = manifest().package().clone();
        assert_eq!(root.dependency_groups["test"].dependencies[0].name, "pytest");
        assert!(root.dependency_groups["docs"].optional);
        let local = root.requires().into_iter().find(|d| d.name == "local").unwrap();
        assert!(local.is_directory());
        assert!(local.is_direct_origin());
    }

    #[test]
    fn content_hash_ignores_irrelevant_tables() {
        let base = manifest();
        let described = PYPROJECT.replace("Some description.", "Another description.");
        let other = Manifest::parse(&described, Path::new("pyproject.toml")).unwrap();
        assert_eq!(base.content_hash(), other.content_hash());

        let changed = PYPROJECT.replace(r#"foo = "^1.0""#, r#"foo = "^1.1""#);
        let other = Manifest::parse(&changed, Path::new("pyproject.toml")).unwrap();
        assert_ne!(base.content_hash(), other.content_hash());
        assert_eq!(base.content_hash().len(), 64);
    }

    #[test]
    fn lock_rendering_of_dependencies() {
        let simple = Dependency::new("foo", VersionConstraint::parse("^1.0").unwrap());
        assert_eq!(
            DependencySpec::from_dependencies(&[&simple]),
            Some(DependencySpec::Simple("^1.0".into()))
        );
        let optional = simple.clone().optional(true);
        assert!(matches!(
            DependencySpec::from_dependencies(&[&optional]),
            Some(DependencySpec::Detailed(_))
        ));
        assert!(matches!(
            DependencySpec::from_dependencies(&[&simple, &optional]),
            Some(DependencySpec::Multiple(specs)) if specs.len() == 2
        ));
    }

    #[test]
    fn missing_poetry_section() {
        let err = Manifest::parse("[project]\nname = \"x\"\n", Path::new("pyproject.toml"));
        assert!(matches!(err, Err(SolveError::Manifest(_))));
    }
}
