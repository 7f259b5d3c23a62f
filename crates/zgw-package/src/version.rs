//! Firmware version numbers.
//!
//! Containers encode versions as `0x00MMmmpp` (major, minor, patch, one
//! byte each); tooling and configuration use the dotted string form.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,
    #[error("too many components in `{0}` (at most major.minor.patch)")]
    TooManyComponents(String),
    #[error("invalid version component `{0}`")]
    InvalidComponent(String),
}

/// Semantic firmware version, one byte per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Whether this version satisfies a minimum-version requirement.
    pub fn satisfies_min(&self, required: Version) -> bool {
        *self >= required
    }
}

impl From<u32> for Version {
    fn from(value: u32) -> Self {
        Self {
            major: (value >> 16) as u8,
            minor: (value >> 8) as u8,
            patch: value as u8,
        }
    }
}

impl From<Version> for u32 {
    fn from(version: Version) -> Self {
        (u32::from(version.major) << 16) | (u32::from(version.minor) << 8) | u32::from(version.patch)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    /// Parses `major[.minor[.patch]]`; omitted components are zero.
    /// Components wider than one byte are truncated, matching what the
    /// packed wire form can carry.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionParseError::Empty);
        }
        let mut components = s.split('.');
        let mut next = |missing_ok: bool| -> Result<u8, VersionParseError> {
            match components.next() {
                None if missing_ok => Ok(0),
                None => Err(VersionParseError::Empty),
                Some(part) => part
                    .parse::<u32>()
                    .map(|v| v as u8)
                    .map_err(|_| VersionParseError::InvalidComponent(part.to_string())),
            }
        };
        let major = next(false)?;
        let minor = next(true)?;
        let patch = next(true)?;
        if components.next().is_some() {
            return Err(VersionParseError::TooManyComponents(s.to_string()));
        }
        Ok(Self {
            major,
            minor,
            patch,
        })
    }
}
