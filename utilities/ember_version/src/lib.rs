//! Version strings of the ember module registry.
//!
//! A version has the form `[epoch ':'] segment ('.' segment)*`, where every
//! segment is a run of decimal and alphabetic components, e.g. `0:1.2b`.
//! Two operations are defined over them: a total order ([`compare`]) and a
//! compatibility test ([`compatible`]). Versions are kept as plain strings
//! by the registry, so both operate on string slices directly.
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    rustdoc::broken_intra_doc_links
)]
use lazy_static::lazy_static;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

lazy_static! {
    static ref VERSION_VALIDATOR: regex::Regex =
        regex::Regex::new(r"^(?:[0-9A-Za-z]+:)?[0-9A-Za-z]+(?:\.[0-9A-Za-z]+)*$").unwrap();
}

/// Version errors.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum VersionError {
    /// The string does not match the version grammar.
    InvalidString(String),
    /// A numeric component has a leading zero.
    LeadingZero {
        /// The offending version string.
        version: String,
        /// Byte offset of the component inside the string.
        offset: usize,
    },
}

impl Display for VersionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VersionError::InvalidString(str) => write!(f, "invalid version string: {}", str),
            VersionError::LeadingZero { version, offset } => {
                write!(
                    f,
                    "leading zero in numeric component at offset {}: {}",
                    offset, version
                )
            }
        }
    }
}

impl std::error::Error for VersionError {}

/// Checks whether the version string is valid.
pub fn is_valid(version: &str) -> bool {
    validate(version).is_ok()
}

/// Validates a version string against the grammar.
///
/// # Failure
///
/// Fails if the string does not match `[epoch ':'] segment ('.' segment)*`
/// or a numeric component carries a leading zero.
pub fn validate(version: &str) -> Result<(), VersionError> {
    if !VERSION_VALIDATOR.is_match(version) {
        return Err(VersionError::InvalidString(version.to_string()));
    }

    // The regex fixes the shape; leading zeros need a component walk.
    let bytes = version.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_digit() {
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if bytes[start] == b'0' && i - start > 1 {
                return Err(VersionError::LeadingZero {
                    version: version.to_string(),
                    offset: start,
                });
            }
        } else {
            i += 1;
        }
    }
    Ok(())
}

/// A maximal run of digits or letters inside a segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Component<'a> {
    Num(&'a str),
    Alpha(&'a str),
}

fn components(segment: &str) -> impl Iterator<Item = Component<'_>> {
    let bytes = segment.as_bytes();
    let mut i = 0;
    std::iter::from_fn(move || {
        if i >= bytes.len() {
            return None;
        }
        let start = i;
        let digit = bytes[i].is_ascii_digit();
        while i < bytes.len() && bytes[i].is_ascii_digit() == digit {
            i += 1;
        }
        let run = &segment[start..i];
        Some(if digit {
            Component::Num(run)
        } else {
            Component::Alpha(run)
        })
    })
}

fn compare_components(a: Component<'_>, b: Component<'_>) -> Ordering {
    match (a, b) {
        // Longer digit runs denote larger numbers; leading zeros are
        // rejected by validate().
        (Component::Num(a), Component::Num(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        (Component::Num(_), Component::Alpha(_)) => Ordering::Less,
        (Component::Alpha(_), Component::Num(_)) => Ordering::Greater,
        (Component::Alpha(a), Component::Alpha(b)) => a.cmp(b),
    }
}

fn compare_segments(a: &str, b: &str) -> Ordering {
    let mut a_runs = components(a);
    let mut b_runs = components(b);
    loop {
        match (a_runs.next(), b_runs.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match compare_components(x, y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Splits a version into its epoch and its dotted body.
///
/// An absent epoch equals `"0"`.
fn split_epoch(version: &str) -> (&str, &str) {
    match version.split_once(':') {
        Some((epoch, body)) => (epoch, body),
        None => ("0", version),
    }
}

fn compare_bodies(a: &str, b: &str) -> Ordering {
    let mut a_segs = a.split('.').filter(|s| !s.is_empty());
    let mut b_segs = b.split('.').filter(|s| !s.is_empty());
    loop {
        match (a_segs.next(), b_segs.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match compare_segments(x, y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Compares two version strings.
///
/// The order is total: epochs compare first (absent equals `"0"`), then the
/// dotted segments left to right. Within a segment, numeric components
/// compare numerically and sort below alphabetic ones; a version that is a
/// prefix of another sorts below it.
pub fn compare(a: &str, b: &str) -> Ordering {
    let (a_epoch, a_body) = split_epoch(a);
    let (b_epoch, b_body) = split_epoch(b);

    compare_segments(a_epoch, b_epoch).then_with(|| compare_bodies(a_body, b_body))
}

/// Tests whether `version` satisfies the required `target` version.
///
/// The epochs must match exactly (absent equals `"0"`); within the epoch,
/// any `version` ordered at or above `target` is compatible.
pub fn compatible(target: &str, version: &str) -> bool {
    let (t_epoch, t_body) = split_epoch(target);
    let (v_epoch, v_body) = split_epoch(version);

    if t_epoch != v_epoch {
        return false;
    }
    compare_bodies(v_body, t_body) != Ordering::Less
}

/// A validated, owned version string.
///
/// Equality and hashing are textual; use [`Version::compare`] for the
/// version order, which treats e.g. `1.2` and `0:1.2` as the same version.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Version(String);

impl Version {
    /// Validates and wraps a version string.
    pub fn new(version: impl Into<String>) -> Result<Self, VersionError> {
        let version = version.into();
        validate(&version)?;
        Ok(Self(version))
    }

    /// The version text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares two versions under the total order of [`compare`].
    pub fn compare(&self, other: &Self) -> Ordering {
        compare(&self.0, &other.0)
    }

    /// Whether `other` satisfies `self` as the required version.
    pub fn is_compatible(&self, other: &Self) -> bool {
        compatible(&self.0, &other.0)
    }
}

impl std::str::FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for Version {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn validation() {
        assert!(is_valid("1"));
        assert!(is_valid("0:1.2"));
        assert!(is_valid("1.2b"));
        assert!(is_valid("12:5.alpha.3"));
        assert!(is_valid("0"));

        assert!(!is_valid(""));
        assert!(!is_valid("2:4:3"));
        assert!(!is_valid("1..2"));
        assert!(!is_valid(":1"));
        assert!(!is_valid("1:"));
        assert!(!is_valid("1.2-rc"));
        assert!(!is_valid("1 .2"));
    }

    #[test]
    fn leading_zeros() {
        assert_eq!(
            validate("1.01"),
            Err(VersionError::LeadingZero {
                version: "1.01".to_string(),
                offset: 2,
            })
        );
        assert!(validate("1.0").is_ok());
        assert!(validate("10.0").is_ok());
        assert!(validate("0:1").is_ok());
        assert!(validate("00:1").is_err());
    }

    #[test]
    fn ordering() {
        assert_eq!(compare("0:1.2", "0:1.10"), Ordering::Less);
        assert_eq!(compare("1:0", "0:9"), Ordering::Greater);
        assert_eq!(compare("1.2a", "1.2b"), Ordering::Less);
        assert_eq!(compare("1", "1.0"), Ordering::Less);

        assert_eq!(compare("1.2", "1.2"), Ordering::Equal);
        assert_eq!(compare("1.2", "0:1.2"), Ordering::Equal);
        assert_eq!(compare("2", "10"), Ordering::Less);
        assert_eq!(compare("1.9", "1.a"), Ordering::Less);
        assert_eq!(compare("1.a", "1.b2"), Ordering::Less);
        assert_eq!(compare("1.2", "1.2a"), Ordering::Less);
        assert_eq!(compare("2:1", "10:0"), Ordering::Less);
    }

    #[test]
    fn ordering_is_transitive() {
        let samples = [
            "0", "1", "1.0", "1.2", "1.2a", "1.2b", "1.10", "2", "10", "0:3", "1:0", "1:1",
            "2:0", "a", "b.1",
        ];
        for a in samples {
            assert_eq!(compare(a, a), Ordering::Equal);
            for b in samples {
                assert_eq!(compare(a, b), compare(b, a).reverse());
                for c in samples {
                    if compare(a, b) == Ordering::Less && compare(b, c) == Ordering::Less {
                        assert_eq!(
                            compare(a, c),
                            Ordering::Less,
                            "transitivity broken for {} {} {}",
                            a,
                            b,
                            c
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn compatibility() {
        assert!(compatible("0:1.2", "0:1.3"));
        assert!(!compatible("0:2", "0:1.9"));
        assert!(!compatible("0:1", "1:1"));

        assert!(compatible("1.2", "1.2"));
        assert!(compatible("1", "1.0"));
        assert!(!compatible("1.0", "1"));
        assert!(compatible("2:1", "2:4"));
        assert!(!compatible("2:1", "3:4"));

        // An empty requirement admits any zero-epoch version.
        assert!(compatible("", "1.5"));
        assert!(compatible("", "0:9"));
        assert!(!compatible("", "1:0"));
    }

    #[test]
    fn version_wrapper() {
        let required: Version = "0:1.2".parse().unwrap();
        let provided = Version::new("0:1.10").unwrap();

        assert_eq!(required.compare(&provided), Ordering::Less);
        assert!(required.is_compatible(&provided));
        assert!(!provided.is_compatible(&required));
        assert_eq!(provided.to_string(), "0:1.10");

        assert!(Version::new("1..2").is_err());
        assert!("1.01".parse::<Version>().is_err());

        // Equality is textual, not order-based.
        assert_ne!(Version::new("1.2").unwrap(), Version::new("0:1.2").unwrap());
    }
}
