//! Typed ID and name definitions.

use crate::{define_id, define_name, IdError};

/// Maximum length of a user-chosen resource name.
pub const MAX_NAME_LENGTH: usize = 64;

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(NodeId, "node");
define_id!(TaskId, "ptask");

// =============================================================================
// User-chosen names
// =============================================================================

define_name!(JobId, "job id");
define_name!(DatafeedId, "datafeed id");

/// Check a user-chosen name against the naming rules.
pub fn validate_name(kind: &'static str, name: &str) -> Result<(), IdError> {
    if name.is_empty() {
        return Err(IdError::Empty);
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(IdError::NameTooLong {
            kind,
            name: name.to_string(),
            max: MAX_NAME_LENGTH,
        });
    }

    let is_edge = |c: u8| c.is_ascii_lowercase() || c.is_ascii_digit();
    let bytes = name.as_bytes();
    let body_ok = bytes
        .iter()
        .all(|&c| is_edge(c) || c == b'-' || c == b'_');

    if !body_ok || !is_edge(bytes[0]) || !is_edge(bytes[bytes.len() - 1]) {
        return Err(IdError::InvalidName {
            kind,
            name: name.to_string(),
        });
    }

    Ok(())
}

// =============================================================================
// Allocation IDs
// =============================================================================

/// Allocation ID assigned by the coordination layer each time a persistent
/// task is placed on a node. A re-placed task gets a higher allocation ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AllocationId(u64);

impl AllocationId {
    /// Creates a new AllocationId from a u64.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the allocation ID used after re-placement.
    #[must_use]
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for AllocationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl serde::Serialize for AllocationId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> serde::Deserialize<'de> for AllocationId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let id = u64::deserialize(deserializer)?;
        Ok(Self(id))
    }
}

// =============================================================================
// Tests
// =============================================================================
