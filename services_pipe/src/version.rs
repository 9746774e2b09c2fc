//! Version strings and server compatibility.

use crate::PipeError;

/// Parses `major.minor[.micro]` into `major * 10000 + minor * 100 + micro`
///
/// The major part must be non-empty and the minor part present and
/// non-empty; anything else is `MalformedVersion`.
pub fn parse_version(version: &str) -> Result<u32, PipeError> {
    let malformed = || PipeError::MalformedVersion(version.to_string());

    let (major, rest) = version.split_once('.').ok_or_else(malformed)?;
    let (minor, micro) = match rest.split_once('.') {
        Some((minor, micro)) => (minor, Some(micro)),
        None => (rest, None),
    };

    let number = |part: &str| part.parse::<u32>().map_err(|_| malformed());
    let micro = match micro {
        Some(micro) => number(micro)?,
        None => 0,
    };

    let (major, minor) = (number(major)?, number(minor)?);

    major
        .checked_mul(10_000)
        .and_then(|v| v.checked_add(minor.checked_mul(100)?))
        .and_then(|v| v.checked_add(micro))
        .ok_or_else(malformed)
}

/// Decides whether a server version can serve a client's requested version
///
/// Both arguments are parsed version numbers.
pub trait VersionPolicy: Send + Sync {
    fn is_compatible(&self, server: u32, requested: u32) -> bool;
}

impl<F> VersionPolicy for F
where
    F: Fn(u32, u32) -> bool + Send + Sync,
{
    fn is_compatible(&self, server: u32, requested: u32) -> bool {
        self(server, requested)
    }
}

/// Same major version, and the server is at least as new as requested
#[derive(Debug, Clone, Copy, Default)]
pub struct SameMajorAtLeast;

impl VersionPolicy for SameMajorAtLeast {
    fn is_compatible(&self, server: u32, requested: u32) -> bool {
        server / 10_000 == requested / 10_000 && server >= requested
    }
}

/// Only identical versions match
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactVersion;

impl VersionPolicy for ExactVersion {
    fn is_compatible(&self, server: u32, requested: u32) -> bool {
        server == requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_version() {
        assert_eq!(parse_version("1.2.3"), Ok(10203));
        assert_eq!(parse_version("10.0.99"), Ok(100099));
    }

    #[test]
    fn test_parse_without_micro() {
        assert_eq!(parse_version("1.2"), Ok(10200));
        assert_eq!(parse_version("0.1"), Ok(100));
    }

    #[test]
    fn test_parse_malformed() {
        for bad in ["1", "1..3", ".1.2", "", "1.", "1.2.", "a.b", "1.2.3.4", "1.-2"] {
            assert_eq!(
                parse_version(bad),
                Err(PipeError::MalformedVersion(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_overflow_is_malformed() {
        assert!(parse_version("4294967295.0").is_err());
    }

    #[test]
    fn test_same_major_at_least() {
        let policy = SameMajorAtLeast;
        assert!(policy.is_compatible(10200, 10200));
        assert!(policy.is_compatible(10305, 10200));
        assert!(!policy.is_compatible(10100, 10200));
        assert!(!policy.is_compatible(20000, 10200));
    }

    #[test]
    fn test_closure_policy() {
        let any = |_: u32, _: u32| true;
        assert!(any.is_compatible(1, 2));
        assert!(!ExactVersion.is_compatible(1, 2));
    }
}
