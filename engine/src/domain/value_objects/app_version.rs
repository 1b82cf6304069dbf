//! AppVersion value object
//! Semantic version (major.minor.patch[-prerelease]) ordered by semver precedence

use crate::domain::DomainError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppVersion {
    major: u64,
    minor: u64,
    patch: u64,
    pre_release: Option<String>,
}

impl AppVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            pre_release: None,
        }
    }

    pub fn with_pre_release(mut self, pre_release: impl Into<String>) -> Self {
        let pre_release = pre_release.into();
        self.pre_release = if pre_release.is_empty() {
            None
        } else {
            Some(pre_release)
        };
        self
    }

    pub fn major(&self) -> u64 {
        self.major
    }

    pub fn minor(&self) -> u64 {
        self.minor
    }

    pub fn patch(&self) -> u64 {
        self.patch
    }

    pub fn pre_release(&self) -> Option<&str> {
        self.pre_release.as_deref()
    }

    pub fn is_pre_release(&self) -> bool {
        self.pre_release.is_some()
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        s.parse()
    }
}

impl FromStr for AppVersion {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DomainError::InvalidVersion(s.to_string());
        let trimmed = s.trim();

        // Build metadata does not take part in precedence
        let without_build = trimmed.split('+').next().unwrap_or_default();
        let (core, pre_release) = match without_build.split_once('-') {
            Some((core, pre)) => (core, Some(pre)),
            None => (without_build, None),
        };

        let mut parts = core.split('.');
        let mut next_number = || -> Result<u64, DomainError> {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || (part.len() > 1 && part.starts_with('0')) {
                return Err(invalid());
            }
            part.parse::<u64>().map_err(|_| invalid())
        };

        let major = next_number()?;
        let minor = next_number()?;
        let patch = next_number()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        if let Some(pre) = pre_release {
            let well_formed = pre.split('.').all(|ident| {
                let numeric = ident.chars().all(|c| c.is_ascii_digit());
                !ident.is_empty()
                    && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
                    && !(numeric && ident.len() > 1 && ident.starts_with('0'))
            });
            if !well_formed {
                return Err(invalid());
            }
        }

        Ok(AppVersion {
            major,
            minor,
            patch,
            pre_release: pre_release.map(str::to_string),
        })
    }
}

impl fmt::Display for AppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(ref pre) = self.pre_release {
            write!(f, "-{}", pre)?;
        }
        Ok(())
    }
}

impl Ord for AppVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| compare_pre_release(self.pre_release(), other.pre_release()))
    }
}

impl PartialOrd for AppVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A release ranks above any of its pre-releases; identifiers compare
/// numerically when both are numeric and numeric ones rank below alphanumeric.
fn compare_pre_release(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let mut left = a.split('.');
            let mut right = b.split('.');
            loop {
                match (left.next(), right.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(l), Some(r)) => {
                        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                            (Ok(l), Ok(r)) => l.cmp(&r),
                            (Ok(_), Err(_)) => Ordering::Less,
                            (Err(_), Ok(_)) => Ordering::Greater,
                            (Err(_), Err(_)) => l.cmp(r),
                        };
                        if ordering != Ordering::Equal {
                            return ordering;
                        }
                    }
                }
            }
        }
    }
}

impl Serialize for AppVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AppVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
