//! Config scheme versions. Every config document carries a top-level
//! `version` of the form `MAJOR` or `MAJOR.MINOR`. Compatibility is decided
//! by the major component alone; the minor component is reserved.

use std::fmt;

use crate::errors::SdkError;

/// The scheme major version this SDK supports.
pub const SCHEME_MAJOR: u32 = 1;

/// A parsed config scheme version.
#[derive(Debug, Clone, Copy)]
pub struct SchemeVersion {
    /// The major version component. This is the only component used in
    /// comparisons.
    pub major: u32,
    /// The minor version component. Reserved.
    pub minor: u32,
}

impl SchemeVersion {
    /// Returns a new scheme version.
    pub const fn new(major: u32, minor: u32) -> Self {
        SchemeVersion { major, minor }
    }

    /// The version of the scheme this SDK currently supports.
    pub const fn current() -> Self {
        SchemeVersion::new(SCHEME_MAJOR, 0)
    }

    /// Parses a version string. The string must be `MAJOR` or `MAJOR.MINOR`
    /// where each component is a non-negative decimal integer.
    pub fn parse(s: &str) -> Result<Self, SdkError> {
        let invalid = |reason: &str| SdkError::ParseError {
            source_name: format!("version '{}'", s),
            reason: reason.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("version may not be empty"));
        }

        let mut parts = s.split('.');
        let major = parts
            .next()
            .unwrap_or_default()
            .parse::<u32>()
            .map_err(|_| invalid("major component is not a non-negative integer"))?;
        let minor = match parts.next() {
            Some(m) => m
                .parse::<u32>()
                .map_err(|_| invalid("minor component is not a non-negative integer"))?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid("too many version components"));
        }
        Ok(SchemeVersion { major, minor })
    }

    /// Whether this version is equal to the other. Only the major component
    /// is compared.
    pub fn is_equal(&self, other: &SchemeVersion) -> bool {
        self.major == other.major
    }

    /// Whether this version is less than the other, by major component.
    pub fn is_less_than(&self, other: &SchemeVersion) -> bool {
        self.major < other.major
    }

    /// Whether this version is greater than or equal to the other, by major
    /// component.
    pub fn is_greater_or_equal(&self, other: &SchemeVersion) -> bool {
        self.major >= other.major
    }
}

impl fmt::Display for SchemeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_major_only() {
        let v = SchemeVersion::parse("1").unwrap();
        assert_eq!(v.major, 1);
        assert_eq!(v.minor, 0);
    }

    #[test]
    fn parse_major_minor() {
        let v = SchemeVersion::parse("2.4").unwrap();
        assert_eq!(v.major, 2);
        assert_eq!(v.minor, 4);
    }

    #[test]
    fn parse_rejects_bad_versions() {
        for bad in &["", "a", "1.a", "1.2.3", "1.", ".1", "-1", "1.-2"] {
            assert!(
                SchemeVersion::parse(bad).is_err(),
                "'{}' should not parse",
                bad
            );
        }
    }

    #[test]
    fn equality_is_major_only() {
        let a = SchemeVersion::parse("1.2").unwrap();
        let b = SchemeVersion::parse("1.5").unwrap();
        assert!(a.is_equal(&b));
        assert!(!a.is_less_than(&b));
        assert!(a.is_greater_or_equal(&b));
    }

    #[test]
    fn ordering_is_major_only() {
        let a = SchemeVersion::parse("1.9").unwrap();
        let b = SchemeVersion::parse("2.0").unwrap();
        assert!(a.is_less_than(&b));
        assert!(!a.is_equal(&b));
        assert!(b.is_greater_or_equal(&a));
    }

    #[test]
    fn display_round_trips() {
        let v = SchemeVersion::parse("1.3").unwrap();
        assert_eq!(v.to_string(), "1.3");
    }
}
