//! Software version stamps for templates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A software version. Templates are stamped with [`Version::id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// The version of the running software.
    pub const CURRENT: Version = Version::new(0, 1, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Monotonic numeric id: `MMmmppbb` with a fixed release build of 99.
    pub const fn id(&self) -> u32 {
        self.major * 1_000_000 + self.minor * 10_000 + self.patch * 100 + 99
    }

    /// Parse `major.minor.patch`, ignoring any pre-release suffix.
    pub fn parse(s: &str) -> Option<Self> {
        let core = s.split(['-', '+']).next()?;
        let mut parts = core.split('.').map(|p| p.parse::<u32>().ok());
        let version = Self::new(parts.next()??, parts.next()??, parts.next()??);
        if parts.next().is_some() {
            return None;
        }
        Some(version)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
