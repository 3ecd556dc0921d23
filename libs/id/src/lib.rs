//! # mlnode-id
//!
//! Identifier types shared by every mlnode crate.
//!
//! ## Two kinds of identity
//!
//! - **System IDs** (`NodeId`, `TaskId`) are generated, prefixed ULIDs:
//!   `{prefix}_{ulid}`, e.g. `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! - **Resource names** (`JobId`, `DatafeedId`) are chosen by users and
//!   validated: lowercase alphanumerics, `-` and `_`, starting and ending
//!   with an alphanumeric, at most 64 characters.
//!
//! Allocation IDs are plain monotonic integers handed out by the
//! coordination layer each time a persistent task is (re)assigned.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
