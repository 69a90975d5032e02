//! Version constraints over PEP 440 versions.
//!
//! A [`VersionConstraint`] is a set of [`Version`]s backed by
//! [`version_ranges::Ranges`], so intersection, union and emptiness are exact.
//! Parsing accepts the requirement syntax found in `pyproject.toml` files:
//!
//! | Syntax        | Meaning                                   |
//! |---------------|-------------------------------------------|
//! | `*`           | any version                               |
//! | `1.2.3`       | exactly `1.2.3`                           |
//! | `==1.2.*`     | any `1.2` release                         |
//! | `^1.2.3`      | `>=1.2.3,<2.0.0` (leftmost non-zero bump) |
//! | `~1.2.3`      | `>=1.2.3,<1.3.0`                          |
//! | `~=1.2`       | `>=1.2,<2`                                |
//! | `a,b` / `a b` | both `a` and `b`                          |
//! | `a || b`      | either `a` or `b`                         |

use std::fmt;
use std::ops::Bound;
use std::str::FromStr;

use pep440_rs::Version;
use version_ranges::Ranges;

/// Error produced when a version or a constraint cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintError {
    #[error("invalid version `{0}`")]
    InvalidVersion(String),
    #[error("invalid constraint `{constraint}`: {reason}")]
    InvalidConstraint { constraint: String, reason: String },
}

/// Parse a single PEP 440 version.
pub fn parse_version(text: &str) -> Result<Version, ConstraintError> {
    Version::from_str(text.trim()).map_err(|_| ConstraintError::InvalidVersion(text.to_string()))
}

/// A set of acceptable versions.
///
/// Equality is semantic: `^1.0` and `>=1.0,<2.0` compare equal. The text the
/// constraint was parsed from is kept for display in lock files.
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    ranges: Ranges<Version>,
    pretty: Option<String>,
}

impl VersionConstraint {
    /// The constraint matching every version.
    pub fn any() -> Self {
        Self::from_ranges(Ranges::full())
    }

    /// The constraint matching no version at all.
    ///
    /// Used as a sentinel by the Provider's overrides: an override carrying an
    /// empty constraint drops the requirement instead of replacing it.
    pub fn empty() -> Self {
        Self::from_ranges(Ranges::empty())
    }

    /// The constraint matching exactly `version`.
    pub fn exact(version: &Version) -> Self {
        Self {
            ranges: Ranges::singleton(version.clone()),
            pretty: Some(version.to_string()),
        }
    }

    pub fn from_ranges(ranges: Ranges<Version>) -> Self {
        Self {
            ranges,
            pretty: None,
        }
    }

    /// Parse a constraint, see the module documentation for the syntax.
    pub fn parse(text: &str) -> Result<Self, ConstraintError> {
        let trimmed = text.trim();
        let mut ranges = Ranges::empty();
        for alternative in trimmed.replace("||", "|").split('|') {
            ranges = ranges.union(&parse_conjunction(alternative, trimmed)?);
        }
        Ok(Self {
            ranges,
            pretty: Some(trimmed.to_string()),
        })
    }

    pub fn ranges(&self) -> &Ranges<Version> {
        &self.ranges
    }

    pub fn allows(&self, version: &Version) -> bool {
        self.ranges.contains(version)
    }

    /// Whether at least one version satisfies both constraints.
    pub fn allows_any(&self, other: &VersionConstraint) -> bool {
        !self.intersect(other).is_empty()
    }

    pub fn intersect(&self, other: &VersionConstraint) -> VersionConstraint {
        Self::from_ranges(self.ranges.intersection(&other.ranges))
    }

    pub fn union(&self, other: &VersionConstraint) -> VersionConstraint {
        Self::from_ranges(self.ranges.union(&other.ranges))
    }

    pub fn complement(&self) -> VersionConstraint {
        Self::from_ranges(self.ranges.complement())
    }

    pub fn is_any(&self) -> bool {
        self.ranges == Ranges::full()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges == Ranges::empty()
    }

    /// The text this constraint was written as, or its normalised form when
    /// it was computed.
    pub fn pretty(&self) -> String {
        match &self.pretty {
            Some(text) if !text.is_empty() => text.clone(),
            _ => self.to_string(),
        }
    }
}

impl Default for VersionConstraint {
    fn default() -> Self {
        Self::any()
    }
}

impl PartialEq for VersionConstraint {
    fn eq(&self, other: &Self) -> bool {
        self.ranges == other.ranges
    }
}

impl Eq for VersionConstraint {}

impl FromStr for VersionConstraint {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "<empty>");
        }
        if self.is_any() {
            return write!(f, "*");
        }
        write!(f, "{}", format_ranges(&self.ranges))
    }
}

/// Render a set of versions in PEP 440 specifier syntax.
pub(crate) fn format_ranges(ranges: &Ranges<Version>) -> String {
    let segments: Vec<(&Bound<Version>, &Bound<Version>)> = ranges.iter().collect();

    // `!=v` is the only two-segment shape worth special-casing.
    if let [(Bound::Unbounded, Bound::Excluded(a)), (Bound::Excluded(b), Bound::Unbounded)] =
        segments.as_slice()
    {
        if a == b {
            return format!("!={a}");
        }
    }

    segments
        .iter()
        .map(|(lower, upper)| format_segment(lower, upper))
        .collect::<Vec<_>>()
        .join(" || ")
}

fn format_segment(lower: &Bound<Version>, upper: &Bound<Version>) -> String {
    if let (Bound::Included(a), Bound::Included(b)) = (lower, upper) {
        if a == b {
            return format!("=={a}");
        }
    }
    let mut parts = Vec::new();
    match lower {
        Bound::Included(v) => parts.push(format!(">={v}")),
        Bound::Excluded(v) => parts.push(format!(">{v}")),
        Bound::Unbounded => {}
    }
    match upper {
        Bound::Included(v) => parts.push(format!("<={v}")),
        Bound::Excluded(v) => parts.push(format!("<{v}")),
        Bound::Unbounded => {}
    }
    if parts.is_empty() {
        "*".to_string()
    } else {
        parts.join(",")
    }
}

fn parse_conjunction(text: &str, whole: &str) -> Result<Ranges<Version>, ConstraintError> {
    let mut ranges = Ranges::full();
    for piece in text.split(',') {
        // Re-attach operators separated from their version by whitespace
        // (`>= 1.0`), then treat remaining whitespace as conjunction.
        let mut pending: Option<&str> = None;
        for token in piece.split_whitespace() {
            if token.chars().all(|c| "<>=!~^".contains(c)) {
                pending = Some(token);
                continue;
            }
            let specifier = match pending.take() {
                Some(op) => format!("{op}{token}"),
                None => token.to_string(),
            };
            ranges = ranges.intersection(&parse_single(&specifier, whole)?);
        }
        if let Some(op) = pending {
            return Err(ConstraintError::InvalidConstraint {
                constraint: whole.to_string(),
                reason: format!("operator `{op}` without a version"),
            });
        }
    }
    Ok(ranges)
}

const OPERATORS: [&str; 11] = ["===", "==", "!=", "~=", "<=", ">=", "<", ">", "^", "~", "="];

fn parse_single(specifier: &str, whole: &str) -> Result<Ranges<Version>, ConstraintError> {
    if specifier == "*" {
        return Ok(Ranges::full());
    }
    let (op, rest) = OPERATORS
        .iter()
        .find_map(|op| specifier.strip_prefix(op).map(|rest| (*op, rest.trim())))
        .unwrap_or(("", specifier));

    let invalid = |reason: &str| ConstraintError::InvalidConstraint {
        constraint: whole.to_string(),
        reason: reason.to_string(),
    };

    if let Some(prefix) = rest.strip_suffix(".*") {
        let release = release_of(&parse_version(prefix)?);
        let lower = Version::new(release.iter().copied());
        let upper = bump(&release, release.len() - 1);
        let matching = Ranges::between(lower, upper);
        return match op {
            "" | "=" | "==" => Ok(matching),
            "!=" => Ok(matching.complement()),
            _ => Err(invalid("wildcards are only allowed with `==` and `!=`")),
        };
    }

    let version = parse_version(rest)?;
    let release = release_of(&version);
    let ranges = match op {
        "" | "=" | "==" | "===" => Ranges::singleton(version),
        "!=" => Ranges::singleton(version).complement(),
        "<" => Ranges::strictly_lower_than(version),
        "<=" => Ranges::lower_than(version),
        ">" => Ranges::strictly_higher_than(version),
        ">=" => Ranges::higher_than(version),
        "^" => {
            let upper = if release[0] != 0 || release.len() == 1 {
                bump(&release, 0)
            } else if release[1] != 0 || release.len() == 2 {
                bump(&release, 1)
            } else {
                bump(&release, 2)
            };
            Ranges::between(version, upper)
        }
        "~" => {
            let upper = if release.len() == 1 {
                bump(&release, 0)
            } else {
                bump(&release, 1)
            };
            Ranges::between(version, upper)
        }
        "~=" => {
            if release.len() < 2 {
                return Err(invalid("`~=` needs at least two release segments"));
            }
            Ranges::between(version, bump(&release, release.len() - 2))
        }
        _ => return Err(invalid("unknown operator")),
    };
    Ok(ranges)
}

fn release_of(version: &Version) -> Vec<u64> {
    version.release().iter().copied().collect()
}

/// `release` with the segment at `index` incremented and every later segment
/// zeroed, keeping the original precision (`^1.0` bumps to `2.0`).
fn bump(release: &[u64], index: usize) -> Version {
    let len = release.len().max(index + 1);
    let segments = (0..len).map(|i| match i.cmp(&index) {
        std::cmp::Ordering::Less => release.get(i).copied().unwrap_or(0),
        std::cmp::Ordering::Equal => release.get(i).copied().unwrap_or(0) + 1,
        std::cmp::Ordering::Greater => 0,
    });
    Version::new(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    fn c(s: &str) -> VersionConstraint {
        VersionConstraint::parse(s).unwrap()
    }

    #[test]
    fn caret_bumps_leftmost_non_zero() {
        assert_eq!(c("^1.2.3"), c(">=1.2.3,<2.0.0"));
        assert_eq!(c("^0.2.3"), c(">=0.2.3,<0.3.0"));
        assert_eq!(c("^0.0.3"), c(">=0.0.3,<0.0.4"));
        assert_eq!(c("^0"), c(">=0,<1"));
        assert_eq!(c("^1.0"), c(">=1.0,<2.0"));
    }

    #[test]
    fn tilde_and_compatible_release() {
        assert_eq!(c("~1.2.3"), c(">=1.2.3,<1.3.0"));
        assert_eq!(c("~1"), c(">=1,<2"));
        assert_eq!(c("~=1.2"), c(">=1.2,<2"));
        assert_eq!(c("~=1.2.3"), c(">=1.2.3,<1.3"));
        assert!(VersionConstraint::parse("~=1").is_err());
    }

    #[test]
    fn wildcard_equality() {
        let constraint = c("==1.2.*");
        assert!(constraint.allows(&v("1.2")));
        assert!(constraint.allows(&v("1.2.9")));
        assert!(!constraint.allows(&v("1.3.0")));
        assert!(!c("!=1.2.*").allows(&v("1.2.5")));
    }

    #[test]
    fn padding_makes_versions_equal() {
        assert!(c("==1.0").allows(&v("1.0.0")));
        assert!(c("1.0.0").allows(&v("1")));
    }

    #[test]
    fn whitespace_between_operator_and_version() {
        assert_eq!(c(">= 1.0, < 2.0"), c(">=1.0,<2.0"));
        assert_eq!(c(">=1.0 <2.0"), c(">=1.0,<2.0"));
    }

    #[test]
    fn disjunction() {
        let constraint = c("~2.7 || ^3.6");
        assert!(constraint.allows(&v("2.7.18")));
        assert!(constraint.allows(&v("3.10")));
        assert!(!constraint.allows(&v("3.5")));
        assert!(!constraint.allows(&v("2.8")));
    }

    #[test]
    fn intersection_and_emptiness() {
        assert!(c("<3.0").intersect(&c(">=3.0")).is_empty());
        assert!(!c("^1.0").allows_any(&c(">=2.0")));
        assert!(c(">=1.2").allows_any(&c("!=1.2.1")));
        assert_eq!(c(">=1.2").intersect(&c("!=1.2.1")), c(">=1.2,!=1.2.1"));
        assert!(c("*").is_any());
        assert!(VersionConstraint::empty().is_empty());
    }

    #[test]
    fn display_is_normalised() {
        assert_eq!(c("^1.0").to_string(), ">=1.0,<2.0");
        assert_eq!(c("1.2.3").to_string(), "==1.2.3");
        assert_eq!(c("!=1.5").to_string(), "!=1.5");
        assert_eq!(c("<2 || >=3").to_string(), "<2 || >=3");
        assert_eq!(VersionConstraint::any().to_string(), "*");
        assert_eq!(VersionConstraint::empty().to_string(), "<empty>");
    }

    #[test]
    fn pretty_keeps_the_written_form() {
        assert_eq!(c("^1.0").pretty(), "^1.0");
        assert_eq!(c("^1.0").intersect(&c("<1.5")).pretty(), ">=1.0,<1.5");
    }

    #[test]
    fn rejects_garbage() {
        assert!(VersionConstraint::parse(">=").is_err());
        assert!(VersionConstraint::parse(">=abc").is_err());
        assert!(VersionConstraint::parse(">=1.*").is_err());
    }
}
