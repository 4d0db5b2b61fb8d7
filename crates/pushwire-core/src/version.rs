//! Protocol version negotiated during the handshake.
//!
//! Version format: `major.minor`, e.g. `1.2`. Both components are required;
//! a bare `1` or a three-part `1.2.0` is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A protocol version in the form `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProtocolVersion {
    major: u32,
    minor: u32,
}

impl ProtocolVersion {
    /// The only version this client speaks.
    pub const SUPPORTED: ProtocolVersion = ProtocolVersion::new(1, 2);

    /// Create a new version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn major(&self) -> u32 {
        self.major
    }

    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Check if this is exactly the supported version.
    pub fn is_supported(&self) -> bool {
        *self == Self::SUPPORTED
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ProtocolVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .trim()
            .split_once('.')
            .ok_or_else(|| VersionParseError::MissingDot(s.to_string()))?;

        let major = major
            .parse()
            .map_err(|_| VersionParseError::InvalidComponent(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| VersionParseError::InvalidComponent(s.to_string()))?;

        Ok(Self { major, minor })
    }
}

impl TryFrom<String> for ProtocolVersion {
    type Error = VersionParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProtocolVersion> for String {
    fn from(version: ProtocolVersion) -> Self {
        version.to_string()
    }
}

/// Error parsing a version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("protocol version must contain '.' separator, got: {0}")]
    MissingDot(String),
    #[error("protocol version components must be unsigned integers, got: {0}")]
    InvalidComponent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_supported() {
        let v: ProtocolVersion = "1.2".parse().unwrap();
        assert_eq!(v.major(), 1);
        assert_eq!(v.minor(), 2);
        assert!(v.is_supported());
    }

    #[test]
    fn other_versions_are_not_supported() {
        for raw in ["2.0", "1.1", "1.3", "0.2"] {
            let v: ProtocolVersion = raw.parse().unwrap();
            assert!(!v.is_supported(), "{raw} should not be supported");
        }
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "12".parse::<ProtocolVersion>(),
            Err(VersionParseError::MissingDot(_))
        ));
        assert!(matches!(
            "1.2.0".parse::<ProtocolVersion>(),
            Err(VersionParseError::InvalidComponent(_))
        ));
        assert!(matches!(
            "one.two".parse::<ProtocolVersion>(),
            Err(VersionParseError::InvalidComponent(_))
        ));
        assert!("".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let json = serde_json::to_string(&ProtocolVersion::SUPPORTED).unwrap();
        assert_eq!(json, "\"1.2\"");
        let back: ProtocolVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ProtocolVersion::SUPPORTED);
        assert!(serde_json::from_str::<ProtocolVersion>("\"x\"").is_err());
    }
}
