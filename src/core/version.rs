//! State and CVR version algebra.
//!
//! A state version labels one consistent upstream snapshot. It is carried
//! around as an opaque string whose lexicographic order matches the numeric
//! order of the underlying replication sequence, so both SQLite string
//! comparison and `Ord` on the wrapper agree with replication order.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const RADIX: u64 = 36;
const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Lexicographically sortable label of an upstream snapshot.
///
/// The empty string is the distinguished minimum and precedes every encoded
/// sequence number. Non-minimum values are length-prefixed base36: one
/// leading character encodes `digit_count - 1`, so longer (larger) numbers
/// sort after shorter ones.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateVersion(String);

impl StateVersion {
    /// The minimum version, preceding all snapshots.
    pub const MIN: StateVersion = StateVersion(String::new());

    pub fn from_seq(seq: u64) -> Self {
        let mut digits = Vec::new();
        let mut rest = seq;
        loop {
            digits.push(DIGITS[(rest % RADIX) as usize]);
            rest /= RADIX;
            if rest == 0 {
                break;
            }
        }
        let mut out = Vec::with_capacity(digits.len() + 1);
        out.push(DIGITS[digits.len() - 1]);
        digits.reverse();
        out.extend_from_slice(&digits);
        Self(String::from_utf8(out).expect("base36 digits are ascii"))
    }

    /// Decodes the underlying sequence number. `None` for the minimum.
    pub fn seq(&self) -> Option<u64> {
        if self.is_min() {
            return None;
        }
        let bytes = self.0.as_bytes();
        let mut value: u64 = 0;
        for &b in &bytes[1..] {
            let digit = DIGITS.iter().position(|&d| d == b)? as u64;
            value = value.checked_mul(RADIX)?.checked_add(digit)?;
        }
        Some(value)
    }

    pub fn parse(s: &str) -> Result<Self, VersionError> {
        if s.is_empty() {
            return Ok(Self::MIN);
        }
        let bytes = s.as_bytes();
        let len_char = bytes[0];
        let declared = DIGITS
            .iter()
            .position(|&d| d == len_char)
            .ok_or_else(|| VersionError::Malformed(s.to_string()))?;
        if bytes.len() != declared + 2 {
            return Err(VersionError::Malformed(s.to_string()));
        }
        for &b in &bytes[1..] {
            if !DIGITS.contains(&b) {
                return Err(VersionError::Malformed(s.to_string()));
            }
        }
        // Reject non-canonical leading zeros ("100" for what is "00").
        if declared > 0 && bytes[1] == b'0' {
            return Err(VersionError::Malformed(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    pub fn is_min(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_min() {
            write!(f, "StateVersion(MIN)")
        } else {
            write!(f, "StateVersion({})", self.0)
        }
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StateVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Version of a client view record: the state version of the last upstream
/// advance plus a minor counter for config-only changes in between.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CvrVersion {
    pub state_version: StateVersion,
    pub minor: u64,
}

impl CvrVersion {
    pub const MIN: CvrVersion = CvrVersion {
        state_version: StateVersion::MIN,
        minor: 0,
    };

    pub fn new(state_version: StateVersion, minor: u64) -> Self {
        Self {
            state_version,
            minor,
        }
    }

    /// Bumps the minor counter, keeping the state version.
    pub fn next_minor(&self) -> Self {
        Self {
            state_version: self.state_version.clone(),
            minor: self.minor + 1,
        }
    }

    /// Moves to a new state version, resetting the minor counter.
    ///
    /// The caller must only advance forward; going backward is a logic error
    /// surfaced as [`VersionError::NonMonotonic`].
    pub fn advance(&self, state_version: StateVersion) -> Result<Self, VersionError> {
        if state_version <= self.state_version {
            return Err(VersionError::NonMonotonic {
                from: self.to_cookie(),
                to: state_version.to_string(),
            });
        }
        Ok(Self {
            state_version,
            minor: 0,
        })
    }

    pub fn max(self, other: Self) -> Self {
        if other > self { other } else { self }
    }

    /// Opaque cookie form. Cookie strings compare lexicographically in the
    /// same order as the versions they encode.
    pub fn to_cookie(&self) -> String {
        if self.minor == 0 {
            self.state_version.to_string()
        } else {
            format!("{}.{}", self.state_version, StateVersion::from_seq(self.minor))
        }
    }

    pub fn from_cookie(cookie: &str) -> Result<Self, VersionError> {
        match cookie.split_once('.') {
            None => Ok(Self {
                state_version: StateVersion::parse(cookie)?,
                minor: 0,
            }),
            Some((state, minor)) => {
                let minor = StateVersion::parse(minor)?
                    .seq()
                    .ok_or_else(|| VersionError::Malformed(cookie.to_string()))?;
                if minor == 0 {
                    // "x.00" would alias the canonical "x".
                    return Err(VersionError::Malformed(cookie.to_string()));
                }
                Ok(Self {
                    state_version: StateVersion::parse(state)?,
                    minor,
                })
            }
        }
    }

    pub fn is_min(&self) -> bool {
        self.state_version.is_min() && self.minor == 0
    }
}

pub fn cmp(a: &CvrVersion, b: &CvrVersion) -> Ordering {
    a.cmp(b)
}

impl fmt::Debug for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CvrVersion({})", self.to_cookie())
    }
}

impl fmt::Display for CvrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_cookie())
    }
}

impl FromStr for CvrVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cookie(s)
    }
}

impl Serialize for CvrVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_cookie())
    }
}

impl<'de> Deserialize<'de> for CvrVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let cookie = String::deserialize(deserializer)?;
        Self::from_cookie(&cookie).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("malformed version token: {0:?}")]
    Malformed(String),
    #[error("version must advance: {from} -> {to}")]
    NonMonotonic { from: String, to: String },
}
