//! Packages, dependencies and the identity used to key overrides.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use pep440_rs::Version;

use crate::marker::Marker;
use crate::version::VersionConstraint;

/// Name of the dependency group holding runtime requirements.
pub const MAIN_GROUP: &str = "main";

/// PEP 503 normalisation: lowercase, runs of `-`, `_` and `.` become `-`.
pub fn canonicalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut separator = false;
    for c in name.trim().chars() {
        if matches!(c, '-' | '_' | '.') {
            separator = true;
            continue;
        }
        if separator && !out.is_empty() {
            out.push('-');
        }
        separator = false;
        out.push(c.to_ascii_lowercase());
    }
    out
}

/// `name` or `name[extra1,extra2]`.
pub fn complete_name(name: &str, extras: &BTreeSet<String>) -> String {
    if extras.is_empty() {
        name.to_string()
    } else {
        let extras: Vec<&str> = extras.iter().map(String::as_str).collect();
        format!("{}[{}]", name, extras.join(","))
    }
}

/// Where a dependency wants its package to come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DependencySource {
    /// A package index, optionally pinned to a named repository.
    Index { source_name: Option<String> },
    Directory { path: String, develop: bool },
    File { path: String },
    Url { url: String },
    Git {
        url: String,
        reference: Option<String>,
        subdirectory: Option<String>,
    },
}

impl Default for DependencySource {
    fn default() -> Self {
        DependencySource::Index { source_name: None }
    }
}

impl DependencySource {
    /// Source type as written in lock files (`directory`, `git`, ...).
    pub fn kind(&self) -> &'static str {
        match self {
            DependencySource::Index { .. } => "index",
            DependencySource::Directory { .. } => "directory",
            DependencySource::File { .. } => "file",
            DependencySource::Url { .. } => "url",
            DependencySource::Git { .. } => "git",
        }
    }
}

/// Where a concrete package was found.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum PackageSource {
    /// The default index. Nothing is recorded in the lock file.
    #[default]
    Default,
    /// A named secondary repository.
    Legacy { name: String, url: String },
    Directory { path: String, develop: bool },
    File { path: String },
    Url { url: String },
    Git {
        url: String,
        reference: Option<String>,
        resolved_reference: Option<String>,
        subdirectory: Option<String>,
    },
}

impl PackageSource {
    pub fn kind(&self) -> Option<&'static str> {
        match self {
            PackageSource::Default => None,
            PackageSource::Legacy { .. } => Some("legacy"),
            PackageSource::Directory { .. } => Some("directory"),
            PackageSource::File { .. } => Some("file"),
            PackageSource::Url { .. } => Some("url"),
            PackageSource::Git { .. } => Some("git"),
        }
    }

    /// Directory, file, url and git sources carry their own metadata and
    /// are never re-fetched from an index.
    pub fn is_direct_origin(&self) -> bool {
        !matches!(self, PackageSource::Default | PackageSource::Legacy { .. })
    }

    pub fn repository_name(&self) -> Option<&str> {
        match self {
            PackageSource::Legacy { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// A requirement edge: a named package, a version constraint and the
/// environments in which it applies.
#[derive(Debug, Clone, PartialEq)]
pub struct Dependency {
    pub name: String,
    pub pretty_name: String,
    pub constraint: VersionConstraint,
    pub extras: BTreeSet<String>,
    pub marker: Marker,
    /// Marker accumulated along the path from the root.
    pub transitive_marker: Option<Marker>,
    /// Python constraint accumulated along the path from the root.
    pub transitive_python_constraint: Option<VersionConstraint>,
    pub optional: bool,
    /// Extras of the declaring package that activate this dependency.
    pub in_extras: Vec<String>,
    pub groups: Vec<String>,
    pub source: DependencySource,
}

impl Dependency {
    pub fn new(name: &str, constraint: VersionConstraint) -> Self {
        Self {
            name: canonicalize_name(name),
            pretty_name: name.to_string(),
            constraint,
            extras: BTreeSet::new(),
            marker: Marker::any(),
            transitive_marker: None,
            transitive_python_constraint: None,
            optional: false,
            in_extras: Vec::new(),
            groups: vec![MAIN_GROUP.to_string()],
            source: DependencySource::default(),
        }
    }

    pub fn with_marker(mut self, marker: Marker) -> Self {
        self.marker = marker;
        self
    }

    pub fn with_extras<I, S>(mut self, extras: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extras = extras
            .into_iter()
            .map(|e| canonicalize_name(e.as_ref()))
            .collect();
        self
    }

    pub fn with_source(mut self, source: DependencySource) -> Self {
        self.source = source;
        self
    }

    pub fn with_groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    /// A copy of this dependency requiring `constraint` instead.
    pub fn with_constraint(&self, constraint: VersionConstraint) -> Self {
        let mut dep = self.clone();
        dep.constraint = constraint;
        dep
    }

    pub fn complete_name(&self) -> String {
        complete_name(&self.name, &self.extras)
    }

    /// Python versions for which this dependency applies.
    pub fn python_constraint(&self) -> VersionConstraint {
        self.marker.python_constraint()
    }

    /// The transitive marker, or the dependency's own marker before one has
    /// been recorded.
    pub fn transitive_marker(&self) -> &Marker {
        self.transitive_marker.as_ref().unwrap_or(&self.marker)
    }

    pub fn transitive_python_constraint(&self) -> VersionConstraint {
        self.transitive_python_constraint
            .clone()
            .unwrap_or_else(|| self.python_constraint())
    }

    pub fn source_name(&self) -> Option<&str> {
        match &self.source {
            DependencySource::Index { source_name } => source_name.as_deref(),
            _ => None,
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.source, DependencySource::Directory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self.source, DependencySource::File { .. })
    }

    pub fn is_url(&self) -> bool {
        matches!(self.source, DependencySource::Url { .. })
    }

    pub fn is_vcs(&self) -> bool {
        matches!(self.source, DependencySource::Git { .. })
    }

    /// Whether the package must be obtained from its own location rather
    /// than an index.
    pub fn is_direct_origin(&self) -> bool {
        !matches!(self.source, DependencySource::Index { .. })
    }

    /// Whether `package` satisfies this requirement: same name, an allowed
    /// version, and a compatible source.
    pub fn accepts(&self, package: &Package) -> bool {
        if package.name != self.name || !self.constraint.allows(&package.version) {
            return false;
        }
        match (&self.source, &package.source) {
            (DependencySource::Index { source_name: None }, _) => true,
            (DependencySource::Index { source_name: Some(wanted) }, source) => {
                source.repository_name() == Some(wanted.as_str())
            }
            (
                DependencySource::Directory { path, .. },
                PackageSource::Directory { path: found, .. },
            ) => path == found,
            (DependencySource::File { path }, PackageSource::File { path: found }) => path == found,
            (DependencySource::Url { url }, PackageSource::Url { url: found }) => url == found,
            (DependencySource::Git { url, .. }, PackageSource::Git { url: found, .. }) => {
                url == found
            }
            _ => false,
        }
    }

    /// PEP 508 rendering. With `with_extras`, the `extra == ...` clauses
    /// implied by [`Dependency::in_extras`] are added to the marker.
    pub fn to_pep_508(&self, with_extras: bool) -> String {
        let mut requirement = complete_name(&self.pretty_name, &self.extras);
        match &self.source {
            DependencySource::Index { .. } => {
                if !self.constraint.is_any() {
                    requirement.push_str(&format!(" ({})", self.constraint));
                }
            }
            DependencySource::Directory { path, .. } | DependencySource::File { path } => {
                requirement.push_str(&format!(" @ file://{path}"));
            }
            DependencySource::Url { url } => requirement.push_str(&format!(" @ {url}")),
            DependencySource::Git {
                url, reference, ..
            } => {
                requirement.push_str(&format!(" @ git+{url}"));
                if let Some(reference) = reference {
                    requirement.push_str(&format!("@{reference}"));
                }
            }
        }

        let mut marker = self.marker.clone();
        if with_extras && !self.in_extras.is_empty() {
            let extras = Marker::union_all(&self.in_extras.iter().map(|e| Marker::extra(e)).collect::<Vec<_>>());
            marker = marker.intersect(&extras);
        }
        if !marker.is_any() {
            requirement.push_str(&format!(" ; {marker}"));
        }
        requirement
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.complete_name(), self.constraint.pretty())
    }
}

/// A named set of requirements (`main`, `dev`, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyGroup {
    pub name: String,
    pub optional: bool,
    pub dependencies: Vec<Dependency>,
}

impl DependencyGroup {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            optional: false,
            dependencies: Vec::new(),
        }
    }
}

/// Identity of a resolved package variant: complete name, version, source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    pub complete_name: String,
    pub version: Version,
    pub source: PackageSource,
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.complete_name, self.version)
    }
}

/// A concrete package version with its declared requirements.
#[derive(Debug, Clone, PartialEq)]
pub struct Package {
    pub name: String,
    pub pretty_name: String,
    pub version: Version,
    pub description: String,
    pub source: PackageSource,
    /// Python versions the package supports.
    pub python_versions: VersionConstraint,
    pub dependency_groups: IndexMap<String, DependencyGroup>,
    /// Extra name -> names of the optional dependencies it activates.
    pub extras: IndexMap<String, Vec<String>>,
    /// Extras this variant was requested with.
    pub features: BTreeSet<String>,
    pub root: bool,
    /// Set after solving: only reachable through optional requirements.
    pub optional: bool,
    /// Set after solving: environments in which the package is needed.
    pub marker: Marker,
}

impl Package {
    pub fn new(name: &str, version: Version) -> Self {
        Self {
            name: canonicalize_name(name),
            pretty_name: name.to_string(),
            version,
            description: String::new(),
            source: PackageSource::Default,
            python_versions: VersionConstraint::any(),
            dependency_groups: IndexMap::new(),
            extras: IndexMap::new(),
            features: BTreeSet::new(),
            root: false,
            optional: false,
            marker: Marker::any(),
        }
    }

    /// The project being resolved.
    pub fn root(name: &str, version: Version) -> Self {
        Self {
            root: true,
            ..Self::new(name, version)
        }
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn complete_name(&self) -> String {
        complete_name(&self.name, &self.features)
    }

    pub fn id(&self) -> PackageId {
        PackageId {
            complete_name: self.complete_name(),
            version: self.version.clone(),
            source: self.source.clone(),
        }
    }

    /// Requirements of the main group.
    pub fn requires(&self) -> Vec<Dependency> {
        self.dependency_groups
            .get(MAIN_GROUP)
            .map(|g| g.dependencies.clone())
            .unwrap_or_default()
    }

    /// Requirements of every group.
    pub fn all_requires(&self) -> Vec<Dependency> {
        self.dependency_groups
            .values()
            .flat_map(|g| g.dependencies.iter().cloned())
            .collect()
    }

    /// Add `dep` to each of its groups, creating them as needed.
    pub fn add_dependency(&mut self, dep: Dependency) {
        let groups = if dep.groups.is_empty() {
            vec![MAIN_GROUP.to_string()]
        } else {
            dep.groups.clone()
        };
        for group in groups {
            self.dependency_groups
                .entry(group.clone())
                .or_insert_with(|| DependencyGroup::new(&group))
                .dependencies
                .push(dep.clone());
        }
    }

    pub fn add_dependency_group(&mut self, group: DependencyGroup) {
        self.dependency_groups.insert(group.name.clone(), group);
    }

    pub fn python_constraint(&self) -> &VersionConstraint {
        &self.python_versions
    }

    /// A requirement pinned to exactly this package.
    pub fn to_dependency(&self) -> Dependency {
        let source = match &self.source {
            PackageSource::Default => DependencySource::default(),
            PackageSource::Legacy { name, .. } => DependencySource::Index {
                source_name: Some(name.clone()),
            },
            PackageSource::Directory { path, develop } => DependencySource::Directory {
                path: path.clone(),
                develop: *develop,
            },
            PackageSource::File { path } => DependencySource::File { path: path.clone() },
            PackageSource::Url { url } => DependencySource::Url { url: url.clone() },
            PackageSource::Git {
                url,
                reference,
                subdirectory,
                ..
            } => DependencySource::Git {
                url: url.clone(),
                reference: reference.clone(),
                subdirectory: subdirectory.clone(),
            },
        };
        let mut dep = Dependency::new(&self.pretty_name, VersionConstraint::exact(&self.version))
            .with_extras(&self.features)
            .with_source(source);
        dep.marker = self.marker.clone();
        dep
    }

    pub fn with_features<I, S>(&self, features: I) -> Package
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut package = self.clone();
        package.features = features
            .into_iter()
            .map(|f| canonicalize_name(f.as_ref()))
            .collect();
        package
    }

    pub fn without_features(&self) -> Package {
        self.with_features(std::iter::empty::<&str>())
    }

    /// With `only`, keep exactly `groups`; otherwise keep every non-optional
    /// group plus `groups`.
    pub fn with_dependency_groups(&self, groups: &[String], only: bool) -> Package {
        let mut package = self.clone();
        package
            .dependency_groups
            .retain(|name, group| groups.contains(name) || (!only && !group.optional));
        package
    }

    pub fn without_optional_dependency_groups(&self) -> Package {
        let mut package = self.clone();
        package.dependency_groups.retain(|_, group| !group.optional);
        package
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.complete_name(), self.version)
    }
}

/// A package together with the requirement that selected it.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyPackage {
    pub dependency: Dependency,
    pub package: Package,
}

impl DependencyPackage {
    pub fn new(dependency: Dependency, package: Package) -> Self {
        Self {
            dependency,
            package,
        }
    }

    pub fn is_root(&self) -> bool {
        self.package.is_root()
    }

    pub fn id(&self) -> PackageId {
        self.package.id()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn v(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    fn dep(name: &str, constraint: &str) -> Dependency {
        Dependency::new(name, VersionConstraint::parse(constraint).unwrap())
    }

    #[test]
    fn canonical_names() {
        assert_eq!(canonicalize_name("Foo_Bar.baz"), "foo-bar-baz");
        assert_eq!(canonicalize_name("a--b"), "a-b");
        assert_eq!(canonicalize_name("Django"), "django");
    }

    #[test]
    fn complete_name_sorts_extras() {
        let d = dep("Foo", "^1.0").with_extras(["b", "A"]);
        assert_eq!(d.complete_name(), "foo[a,b]");
    }

    #[test]
    fn pep_508_rendering() {
        let d = dep("foo", "^1.0").with_marker(Marker::parse(r#"python_version >= "3.6""#).unwrap());
        assert_eq!(d.to_pep_508(false), r#"foo (>=1.0,<2.0) ; python_version >= "3.6""#);

        let mut d = dep("bar", "*");
        d.in_extras = vec!["feature-bar".into()];
        assert_eq!(d.to_pep_508(false), "bar");
        assert_eq!(d.to_pep_508(true), r#"bar ; extra == "feature-bar""#);
    }

    #[test]
    fn accepts_checks_name_version_and_source() {
        let package = Package::new("foo", v("1.2.0"));
        assert!(dep("foo", "^1.0").accepts(&package));
        assert!(!dep("foo", "^2.0").accepts(&package));
        assert!(!dep("bar", "*").accepts(&package));

        let pinned = dep("foo", "*").with_source(DependencySource::Index {
            source_name: Some("private".into()),
        });
        assert!(!pinned.accepts(&package));
        let mut private = package.clone();
        private.source = PackageSource::Legacy {
            name: "private".into(),
            url: "https://example.org/simple".into(),
        };
        assert!(pinned.accepts(&private));
    }

    #[test]
    fn dependency_groups() {
        let mut package = Package::root("project", v("1.0"));
        package.add_dependency(dep("foo", "*"));
        package.add_dependency(dep("pytest", "*").with_groups(vec!["dev".into()]));
        let mut docs = DependencyGroup::new("docs");
        docs.optional = true;
        docs.dependencies.push(dep("sphinx", "*").with_groups(vec!["docs".into()]));
        package.add_dependency_group(docs);

        assert_eq!(package.requires().len(), 1);
        assert_eq!(package.all_requires().len(), 3);
        assert_eq!(package.without_optional_dependency_groups().all_requires().len(), 2);
        assert_eq!(
            package
                .with_dependency_groups(&["docs".to_string()], true)
                .all_requires()
                .len(),
            1
        );
        assert!(package.with_dependency_groups(&[], true).all_requires().is_empty());
    }

    #[test]
    fn features_change_identity() {
        let package = Package::new("foo", v("1.0"));
        let featured = package.with_features(["Bar"]);
        assert_eq!(featured.complete_name(), "foo[bar]");
        assert_ne!(package.id(), featured.id());
        assert_eq!(featured.without_features().id(), package.id());

        let pinned = featured.to_dependency();
        assert_eq!(pinned.complete_name(), "foo[bar]");
        assert!(pinned.accepts(&package));
    }
}
