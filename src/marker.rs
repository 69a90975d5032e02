//! PEP 508 environment markers as a small boolean algebra.
//!
//! A [`Marker`] is kept in disjunctive normal form: a list of conjunctions,
//! each mapping a [`MarkerVariable`] to the set of values it may take. Version
//! variables (`python_version`, `python_full_version`,
//! `implementation_version`) carry a [`Ranges<Version>`]; every other variable
//! carries a finite `==` set or a co-finite `!=` set. Substring tests
//! (`in`, `not in`) are kept as opaque atoms next to those domains.
//!
//! Because each conjunction is stored with no empty domain, a conjunction is
//! always satisfiable, which makes [`Marker::is_empty`] exact. [`Marker::is_any`]
//! is computed as the emptiness of the inversion and is exact as well.
//! Variables are treated as independent of each other.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Bound;
use std::str::FromStr;

use pep440_rs::Version;
use version_ranges::Ranges;

use crate::package::canonicalize_name;
use crate::version::VersionConstraint;

/// Error produced when a marker expression cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid marker `{marker}`: {reason}")]
pub struct MarkerError {
    pub marker: String,
    pub reason: String,
}

/// A PEP 508 environment marker variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MarkerVariable {
    ImplementationName,
    ImplementationVersion,
    OsName,
    PlatformMachine,
    PlatformPythonImplementation,
    PlatformRelease,
    PlatformSystem,
    PlatformVersion,
    PythonFullVersion,
    PythonVersion,
    SysPlatform,
    Extra,
}

impl MarkerVariable {
    pub fn as_str(self) -> &'static str {
        match self {
            MarkerVariable::ImplementationName => "implementation_name",
            MarkerVariable::ImplementationVersion => "implementation_version",
            MarkerVariable::OsName => "os_name",
            MarkerVariable::PlatformMachine => "platform_machine",
            MarkerVariable::PlatformPythonImplementation => "platform_python_implementation",
            MarkerVariable::PlatformRelease => "platform_release",
            MarkerVariable::PlatformSystem => "platform_system",
            MarkerVariable::PlatformVersion => "platform_version",
            MarkerVariable::PythonFullVersion => "python_full_version",
            MarkerVariable::PythonVersion => "python_version",
            MarkerVariable::SysPlatform => "sys_platform",
            MarkerVariable::Extra => "extra",
        }
    }

    /// Whether values of this variable are compared as PEP 440 versions.
    pub fn is_version(self) -> bool {
        matches!(
            self,
            MarkerVariable::PythonVersion
                | MarkerVariable::PythonFullVersion
                | MarkerVariable::ImplementationVersion
        )
    }
}

impl FromStr for MarkerVariable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Legacy dotted spellings (`os.name`, `sys.platform`) are still accepted.
        let variable = match s.replace('.', "_").as_str() {
            "implementation_name" => MarkerVariable::ImplementationName,
            "implementation_version" => MarkerVariable::ImplementationVersion,
            "os_name" => MarkerVariable::OsName,
            "platform_machine" => MarkerVariable::PlatformMachine,
            "platform_python_implementation" | "python_implementation" => {
                MarkerVariable::PlatformPythonImplementation
            }
            "platform_release" => MarkerVariable::PlatformRelease,
            "platform_system" => MarkerVariable::PlatformSystem,
            "platform_version" => MarkerVariable::PlatformVersion,
            "python_full_version" => MarkerVariable::PythonFullVersion,
            "python_version" => MarkerVariable::PythonVersion,
            "sys_platform" => MarkerVariable::SysPlatform,
            "extra" => MarkerVariable::Extra,
            other => return Err(format!("unknown marker variable `{other}`")),
        };
        Ok(variable)
    }
}

impl fmt::Display for MarkerVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Values a string variable may take: `values` itself, or everything except
/// `values` when `negated`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StringSet {
    negated: bool,
    values: BTreeSet<String>,
}

impl StringSet {
    fn is_in(value: String) -> Self {
        Self {
            negated: false,
            values: BTreeSet::from([value]),
        }
    }

    fn not_in(value: String) -> Self {
        Self {
            negated: true,
            values: BTreeSet::from([value]),
        }
    }

    fn is_empty(&self) -> bool {
        !self.negated && self.values.is_empty()
    }

    fn is_full(&self) -> bool {
        self.negated && self.values.is_empty()
    }

    fn contains(&self, value: &str) -> bool {
        self.values.contains(value) != self.negated
    }

    fn complement(&self) -> Self {
        Self {
            negated: !self.negated,
            values: self.values.clone(),
        }
    }

    fn intersect(&self, other: &StringSet) -> Self {
        let (negated, values) = match (self.negated, other.negated) {
            (false, false) => (false, &self.values & &other.values),
            (false, true) => (false, &self.values - &other.values),
            (true, false) => (false, &other.values - &self.values),
            (true, true) => (true, &self.values | &other.values),
        };
        Self { negated, values }
    }

    fn union(&self, other: &StringSet) -> Self {
        self.complement()
            .intersect(&other.complement())
            .complement()
    }

    fn is_subset_of(&self, other: &StringSet) -> bool {
        self.intersect(&other.complement()).is_empty()
    }
}

/// A substring test on a variable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Containment {
    /// `"<needle>" in <variable>`
    Contains(MarkerVariable, String),
    /// `<variable> in "<haystack>"`
    ContainedIn(MarkerVariable, String),
}

impl Containment {
    fn variable(&self) -> MarkerVariable {
        match self {
            Containment::Contains(var, _) | Containment::ContainedIn(var, _) => *var,
        }
    }

    fn holds(&self, value: &str) -> bool {
        match self {
            Containment::Contains(_, needle) => value.contains(needle.as_str()),
            Containment::ContainedIn(_, haystack) => haystack.contains(value),
        }
    }

    fn render(&self, polarity: Polarity) -> String {
        let op = if polarity == Polarity::Negative { "not in" } else { "in" };
        match self {
            Containment::Contains(var, needle) => format!("\"{needle}\" {op} {var}"),
            Containment::ContainedIn(var, haystack) => format!("{var} {op} \"{haystack}\""),
        }
    }
}

/// Whether a [`Containment`] must hold, must fail, or was required both ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Positive,
    Negative,
    Contradiction,
}

impl Polarity {
    fn and(self, other: Polarity) -> Polarity {
        if self == other { self } else { Polarity::Contradiction }
    }

    fn negate(self) -> Polarity {
        match self {
            Polarity::Positive => Polarity::Negative,
            Polarity::Negative => Polarity::Positive,
            Polarity::Contradiction => Polarity::Contradiction,
        }
    }
}

fn ranges_subset(a: &Ranges<Version>, b: &Ranges<Version>) -> bool {
    a.intersection(&b.complement()) == Ranges::empty()
}

/// One `and`-chain of a marker. Missing variables are unconstrained.
#[derive(Debug, Clone, PartialEq, Default)]
struct Conjunction {
    versions: BTreeMap<MarkerVariable, Ranges<Version>>,
    strings: BTreeMap<MarkerVariable, StringSet>,
    containments: BTreeMap<Containment, Polarity>,
}

impl Conjunction {
    fn is_any(&self) -> bool {
        self.versions.is_empty() && self.strings.is_empty() && self.containments.is_empty()
    }

    fn is_empty(&self) -> bool {
        self.versions.values().any(|r| *r == Ranges::empty())
            || self.strings.values().any(StringSet::is_empty)
            || self.containments.values().any(|p| *p == Polarity::Contradiction)
    }

    fn simplified(mut self) -> Self {
        self.versions.retain(|_, r| *r != Ranges::full());
        self.strings.retain(|_, s| !s.is_full());
        self
    }

    fn intersect(&self, other: &Conjunction) -> Conjunction {
        let mut out = self.clone();
        for (var, ranges) in &other.versions {
            let merged = match out.versions.get(var) {
                Some(existing) => existing.intersection(ranges),
                None => ranges.clone(),
            };
            out.versions.insert(*var, merged);
        }
        for (var, set) in &other.strings {
            let merged = match out.strings.get(var) {
                Some(existing) => existing.intersect(set),
                None => set.clone(),
            };
            out.strings.insert(*var, merged);
        }
        for (atom, polarity) in &other.containments {
            let merged = match out.containments.get(atom) {
                Some(existing) => existing.and(*polarity),
                None => *polarity,
            };
            out.containments.insert(atom.clone(), merged);
        }
        out.simplified()
    }

    fn is_subset_of(&self, other: &Conjunction) -> bool {
        other.versions.iter().all(|(var, theirs)| {
            self.versions
                .get(var)
                .is_some_and(|ours| ranges_subset(ours, theirs))
        }) && other.strings.iter().all(|(var, theirs)| {
            self.strings
                .get(var)
                .is_some_and(|ours| ours.is_subset_of(theirs))
        }) && other
            .containments
            .iter()
            .all(|(atom, theirs)| self.containments.get(atom) == Some(theirs))
    }

    /// Union of two conjunctions that constrain the same variables and differ
    /// in exactly one of them.
    fn merge_with(&self, other: &Conjunction) -> Option<Conjunction> {
        if !self.versions.keys().eq(other.versions.keys())
            || !self.strings.keys().eq(other.strings.keys())
            || !self.containments.keys().eq(other.containments.keys())
        {
            return None;
        }
        let version_diff: Vec<MarkerVariable> = self
            .versions
            .iter()
            .filter(|(var, r)| other.versions.get(*var) != Some(*r))
            .map(|(var, _)| *var)
            .collect();
        let string_diff: Vec<MarkerVariable> = self
            .strings
            .iter()
            .filter(|(var, s)| other.strings.get(*var) != Some(*s))
            .map(|(var, _)| *var)
            .collect();
        let containment_diff: Vec<&Containment> = self
            .containments
            .iter()
            .filter(|(atom, p)| other.containments.get(*atom) != Some(*p))
            .map(|(atom, _)| atom)
            .collect();

        let mut merged = self.clone();
        match (
            version_diff.as_slice(),
            string_diff.as_slice(),
            containment_diff.as_slice(),
        ) {
            ([var], [], []) => {
                let union = self.versions[var].union(&other.versions[var]);
                merged.versions.insert(*var, union);
            }
            ([], [var], []) => {
                let union = self.strings[var].union(&other.strings[var]);
                merged.strings.insert(*var, union);
            }
            // Opposite polarities of one atom cover both outcomes.
            ([], [], [atom]) if self.containments[*atom].negate() == other.containments[*atom] => {
                merged.containments.remove(*atom);
            }
            _ => return None,
        }
        Some(merged.simplified())
    }

    /// The complement, as a list of single-variable conjunctions to be or-ed.
    fn complement(&self) -> Vec<Conjunction> {
        let mut out = Vec::new();
        for (var, ranges) in &self.versions {
            let mut c = Conjunction::default();
            c.versions.insert(*var, ranges.complement());
            out.push(c.simplified());
        }
        for (var, set) in &self.strings {
            let mut c = Conjunction::default();
            c.strings.insert(*var, set.complement());
            out.push(c.simplified());
        }
        for (atom, polarity) in &self.containments {
            let mut c = Conjunction::default();
            c.containments.insert(atom.clone(), polarity.negate());
            out.push(c);
        }
        out
    }

    fn validate(&self, env: &MarkerEnvironment) -> bool {
        self.versions.iter().all(|(var, ranges)| match env.get(*var) {
            Some(value) => Version::from_str(value).is_ok_and(|v| ranges.contains(&v)),
            None => true,
        }) && self.strings.iter().all(|(var, set)| match env.get(*var) {
            Some(value) => set.contains(value),
            None => true,
        }) && self
            .containments
            .iter()
            .all(|(atom, polarity)| match env.get(atom.variable()) {
                Some(value) => match polarity {
                    Polarity::Positive => atom.holds(value),
                    Polarity::Negative => !atom.holds(value),
                    Polarity::Contradiction => false,
                },
                None => true,
            })
    }

    fn variables(&self) -> impl Iterator<Item = MarkerVariable> + '_ {
        self.versions.keys().chain(self.strings.keys()).copied()
    }
}

impl fmt::Display for Conjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for var in self.variables().collect::<BTreeSet<_>>() {
            if let Some(ranges) = self.versions.get(&var) {
                parts.push(format_version_domain(var, ranges));
            } else if let Some(set) = self.strings.get(&var) {
                parts.push(format_string_domain(var, set));
            }
        }
        for (atom, polarity) in &self.containments {
            parts.push(atom.render(*polarity));
        }
        f.write_str(&parts.join(" and "))
    }
}

fn format_version_domain(var: MarkerVariable, ranges: &Ranges<Version>) -> String {
    let segments: Vec<(&Bound<Version>, &Bound<Version>)> = ranges.iter().collect();
    if let [(Bound::Unbounded, Bound::Excluded(a)), (Bound::Excluded(b), Bound::Unbounded)] =
        segments.as_slice()
    {
        if a == b {
            return format!("{var} != \"{a}\"");
        }
    }
    let rendered: Vec<String> = segments
        .iter()
        .map(|(lower, upper)| format_version_segment(var, lower, upper))
        .collect();
    match rendered.as_slice() {
        [single] => single.clone(),
        _ => format!("({})", rendered.join(" or ")),
    }
}

fn format_version_segment(var: MarkerVariable, lower: &Bound<Version>, upper: &Bound<Version>) -> String {
    if let (Bound::Included(a), Bound::Included(b)) = (lower, upper) {
        if a == b {
            return format!("{var} == \"{a}\"");
        }
    }
    let mut parts = Vec::new();
    match lower {
        Bound::Included(v) => parts.push(format!("{var} >= \"{v}\"")),
        Bound::Excluded(v) => parts.push(format!("{var} > \"{v}\"")),
        Bound::Unbounded => {}
    }
    match upper {
        Bound::Included(v) => parts.push(format!("{var} <= \"{v}\"")),
        Bound::Excluded(v) => parts.push(format!("{var} < \"{v}\"")),
        Bound::Unbounded => {}
    }
    parts.join(" and ")
}

fn format_string_domain(var: MarkerVariable, set: &StringSet) -> String {
    if set.negated {
        return set
            .values
            .iter()
            .map(|v| format!("{var} != \"{v}\""))
            .collect::<Vec<_>>()
            .join(" and ");
    }
    let rendered: Vec<String> = set
        .values
        .iter()
        .map(|v| format!("{var} == \"{v}\""))
        .collect();
    match rendered.as_slice() {
        [single] => single.clone(),
        _ => format!("({})", rendered.join(" or ")),
    }
}

/// Drop empty conjunctions, remove absorbed ones and merge neighbours until
/// nothing changes. The result is sorted by rendering.
fn normalize(clauses: Vec<Conjunction>) -> Vec<Conjunction> {
    let mut clauses: Vec<Conjunction> = clauses
        .into_iter()
        .map(Conjunction::simplified)
        .filter(|c| !c.is_empty())
        .collect();

    loop {
        if clauses.iter().any(Conjunction::is_any) {
            return vec![Conjunction::default()];
        }

        let mut changed = false;

        let mut i = 0;
        while i < clauses.len() {
            let absorbed = (0..clauses.len()).any(|j| {
                j != i
                    && clauses[i].is_subset_of(&clauses[j])
                    && (j < i || !clauses[j].is_subset_of(&clauses[i]))
            });
            if absorbed {
                clauses.remove(i);
                changed = true;
            } else {
                i += 1;
            }
        }

        'merge: for i in 0..clauses.len() {
            for j in (i + 1)..clauses.len() {
                if let Some(merged) = clauses[i].merge_with(&clauses[j]) {
                    clauses.remove(j);
                    clauses[i] = merged;
                    changed = true;
                    break 'merge;
                }
            }
        }

        if !changed {
            break;
        }
    }

    clauses.sort_by_cached_key(|c| c.to_string());
    clauses
}

/// An environment marker in normalised disjunctive form.
///
/// `PartialEq` compares the normalised structure; use
/// [`Marker::equivalent`] for semantic equality.
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    clauses: Vec<Conjunction>,
}

impl Marker {
    /// The marker matching every environment.
    pub fn any() -> Self {
        Self {
            clauses: vec![Conjunction::default()],
        }
    }

    /// The marker matching no environment.
    pub fn empty() -> Self {
        Self {
            clauses: Vec::new(),
        }
    }

    /// Parse a PEP 508 marker expression. The empty string is [`Marker::any`].
    pub fn parse(text: &str) -> Result<Self, MarkerError> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Ok(Self::any());
        }
        let mut parser = Parser {
            text,
            tokens,
            pos: 0,
        };
        let marker = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(marker)
    }

    /// `python_version` restricted to `constraint`.
    pub fn python_version(constraint: &VersionConstraint) -> Self {
        Self::version_clause(MarkerVariable::PythonVersion, constraint.ranges().clone())
    }

    /// `extra == "<name>"`.
    pub fn extra(name: &str) -> Self {
        Self::string_clause(MarkerVariable::Extra, StringSet::is_in(canonicalize_name(name)))
    }

    /// `<variable> == "<value>"` for a string variable.
    pub fn equals(variable: MarkerVariable, value: &str) -> Self {
        if variable.is_version() {
            return match Version::from_str(value) {
                Ok(v) => Self::version_clause(variable, Ranges::singleton(v)),
                Err(_) => Self::empty(),
            };
        }
        Self::string_clause(variable, StringSet::is_in(value.to_string()))
    }

    fn version_clause(variable: MarkerVariable, ranges: Ranges<Version>) -> Self {
        let mut c = Conjunction::default();
        c.versions.insert(variable, ranges);
        Self {
            clauses: normalize(vec![c]),
        }
    }

    fn containment(atom: Containment, holds: bool) -> Self {
        let polarity = if holds { Polarity::Positive } else { Polarity::Negative };
        let mut c = Conjunction::default();
        c.containments.insert(atom, polarity);
        Self {
            clauses: normalize(vec![c]),
        }
    }

    fn string_clause(variable: MarkerVariable, set: StringSet) -> Self {
        let mut c = Conjunction::default();
        c.strings.insert(variable, set);
        Self {
            clauses: normalize(vec![c]),
        }
    }

    pub fn is_any(&self) -> bool {
        self.invert().is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn union(&self, other: &Marker) -> Marker {
        let mut clauses = self.clauses.clone();
        clauses.extend(other.clauses.iter().cloned());
        Marker {
            clauses: normalize(clauses),
        }
    }

    pub fn intersect(&self, other: &Marker) -> Marker {
        let mut clauses = Vec::with_capacity(self.clauses.len() * other.clauses.len());
        for a in &self.clauses {
            for b in &other.clauses {
                clauses.push(a.intersect(b));
            }
        }
        Marker {
            clauses: normalize(clauses),
        }
    }

    /// Union of every marker in `markers`; empty input gives the empty marker.
    pub fn union_all<'a>(markers: impl IntoIterator<Item = &'a Marker>) -> Marker {
        markers
            .into_iter()
            .fold(Marker::empty(), |acc, m| acc.union(m))
    }

    /// Logical negation (De Morgan over the normal form).
    pub fn invert(&self) -> Marker {
        self.clauses.iter().fold(Marker::any(), |acc, clause| {
            let negated = Marker {
                clauses: normalize(clause.complement()),
            };
            acc.intersect(&negated)
        })
    }

    /// Whether both markers match exactly the same environments.
    pub fn equivalent(&self, other: &Marker) -> bool {
        self.intersect(&other.invert()).is_empty() && other.intersect(&self.invert()).is_empty()
    }

    /// The marker with every `extra` clause treated as satisfied.
    pub fn without_extras(&self) -> Marker {
        let clauses = self
            .clauses
            .iter()
            .cloned()
            .map(|mut c| {
                c.strings.remove(&MarkerVariable::Extra);
                c.containments
                    .retain(|atom, _| atom.variable() != MarkerVariable::Extra);
                c
            })
            .collect();
        Marker {
            clauses: normalize(clauses),
        }
    }

    /// Whether the marker mentions `extra` at all.
    pub fn has_extras(&self) -> bool {
        self.clauses
            .iter()
            .any(|c| {
                c.strings.contains_key(&MarkerVariable::Extra)
                    || c.containments
                        .keys()
                        .any(|atom| atom.variable() == MarkerVariable::Extra)
            })
    }

    /// Evaluate against an environment. Variables the environment does not
    /// define are treated as satisfied.
    pub fn validate(&self, env: &MarkerEnvironment) -> bool {
        self.clauses.iter().any(|c| c.validate(env))
    }

    /// The python versions this marker admits, projected from
    /// `python_version` and `python_full_version`.
    pub fn python_constraint(&self) -> VersionConstraint {
        let ranges = self.clauses.iter().fold(Ranges::empty(), |acc, c| {
            let mut clause = Ranges::full();
            for var in [MarkerVariable::PythonVersion, MarkerVariable::PythonFullVersion] {
                if let Some(r) = c.versions.get(&var) {
                    clause = clause.intersection(r);
                }
            }
            acc.union(&clause)
        });
        VersionConstraint::from_ranges(ranges)
    }
}

impl Default for Marker {
    fn default() -> Self {
        Self::any()
    }
}

impl FromStr for Marker {
    type Err = MarkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Renders the PEP 508 form. The any-marker renders as the empty string.
impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<empty>");
        }
        let rendered: Vec<String> = self.clauses.iter().map(|c| c.to_string()).collect();
        f.write_str(&rendered.join(" or "))
    }
}

/// Attribute values of a target environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkerEnvironment {
    values: BTreeMap<MarkerVariable, String>,
}

impl MarkerEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// A CPython environment for `python_version` (`3.8` or `3.8.10`).
    pub fn for_python(python_version: &str) -> Self {
        let full = python_version.trim();
        let short = full.split('.').take(2).collect::<Vec<_>>().join(".");
        let full = if full.split('.').count() < 3 {
            format!("{short}.0")
        } else {
            full.to_string()
        };
        Self::new()
            .with(MarkerVariable::PythonVersion, &short)
            .with(MarkerVariable::PythonFullVersion, &full)
            .with(MarkerVariable::ImplementationName, "cpython")
            .with(MarkerVariable::PlatformPythonImplementation, "CPython")
    }

    pub fn with(mut self, variable: MarkerVariable, value: &str) -> Self {
        self.set(variable, value);
        self
    }

    pub fn set(&mut self, variable: MarkerVariable, value: &str) {
        self.values.insert(variable, value.to_string());
    }

    pub fn get(&self, variable: MarkerVariable) -> Option<&str> {
        self.values.get(&variable).map(String::as_str)
    }
}

// --- parsing ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    In,
    Ident(String),
    Str(String),
    Op(String),
}

fn tokenize(text: &str) -> Result<Vec<Token>, MarkerError> {
    let error = |reason: String| MarkerError {
        marker: text.to_string(),
        reason,
    };
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '"' | '\'' => {
                let start = i + 1;
                let end = chars[start..]
                    .iter()
                    .position(|&ch| ch == c)
                    .map(|offset| start + offset)
                    .ok_or_else(|| error("unterminated string".to_string()))?;
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '=' | '!' | '<' | '>' | '~' => {
                let start = i;
                while i < chars.len() && "=!<>~".contains(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Op(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '.' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(error(format!("unexpected character `{other}`"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> MarkerError {
        MarkerError {
            marker: self.text.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn parse_or(&mut self) -> Result<Marker, MarkerError> {
        let mut marker = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            marker = marker.union(&self.parse_and()?);
        }
        Ok(marker)
    }

    fn parse_and(&mut self) -> Result<Marker, MarkerError> {
        let mut marker = self.parse_atom()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            marker = marker.intersect(&self.parse_atom()?);
        }
        Ok(marker)
    }

    fn parse_atom(&mut self) -> Result<Marker, MarkerError> {
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let marker = self.parse_or()?;
            if self.next() != Some(Token::RParen) {
                return Err(self.error("expected `)`"));
            }
            return Ok(marker);
        }

        let lhs = self.next().ok_or_else(|| self.error("unexpected end of marker"))?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            Some(Token::In) => "in".to_string(),
            Some(Token::Not) if self.peek() == Some(&Token::In) => {
                self.pos += 1;
                "not in".to_string()
            }
            _ => return Err(self.error("expected a comparison operator")),
        };
        let rhs = self.next().ok_or_else(|| self.error("unexpected end of marker"))?;

        match (lhs, rhs) {
            (Token::Ident(var), Token::Str(value)) => self.comparison(&var, &op, &value),
            (Token::Str(value), Token::Ident(var)) if op == "in" || op == "not in" => {
                let variable = MarkerVariable::from_str(&var).map_err(|reason| self.error(reason))?;
                Ok(Marker::containment(Containment::Contains(variable, value), op == "in"))
            }
            (Token::Str(value), Token::Ident(var)) => {
                let flipped = match op.as_str() {
                    "<" => ">",
                    "<=" => ">=",
                    ">" => "<",
                    ">=" => "<=",
                    "==" | "!=" | "===" => op.as_str(),
                    _ => return Err(self.error(format!("operator `{op}` cannot be reversed"))),
                };
                self.comparison(&var, flipped, &value)
            }
            _ => Err(self.error("a comparison needs one variable and one quoted value")),
        }
    }

    fn comparison(&self, var: &str, op: &str, value: &str) -> Result<Marker, MarkerError> {
        let variable = MarkerVariable::from_str(var).map_err(|reason| self.error(reason))?;

        if op == "in" || op == "not in" {
            let atom = Containment::ContainedIn(variable, value.to_string());
            return Ok(Marker::containment(atom, op == "in"));
        }

        if variable.is_version() {
            let constraint = VersionConstraint::parse(&format!("{op}{}", value.trim()))
                .map_err(|e| self.error(e.to_string()))?;
            return Ok(Marker::version_clause(variable, constraint.ranges().clone()));
        }

        let value = if variable == MarkerVariable::Extra {
            canonicalize_name(value)
        } else {
            value.to_string()
        };
        let set = match op {
            "==" | "===" => StringSet::is_in(value),
            "!=" => StringSet::not_in(value),
            _ => {
                return Err(self.error(format!(
                    "operator `{op}` is not supported for {variable}"
                )));
            }
        };
        Ok(Marker::string_clause(variable, set))
    }
}
