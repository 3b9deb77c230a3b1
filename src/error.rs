//! Error types for child lifecycle operations.

use crate::types::{HostRef, HostRevisionId, ItemId, RevisionId};
use thiserror::Error;

/// Main error type.
#[derive(Debug, Error)]
pub enum TetherError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Revision {revision_id} does not belong to item {item_id}")]
    UnknownRevision {
        item_id: ItemId,
        revision_id: RevisionId,
    },

    #[error("Too many items in {bundle} of {host}: {count} exceeds the limit of {limit}")]
    CardinalityExceeded {
        host: String,
        bundle: String,
        count: usize,
        limit: usize,
    },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Host unresolved: {0}")]
    HostUnresolved(String),

    #[error("Deleting item {item_id} would leave a dangling reference in {host} revision {host_revision_id}")]
    OrphanDeleteConflict {
        item_id: ItemId,
        host: HostRef,
        host_revision_id: HostRevisionId,
    },

    #[error("Item {item_id} belongs to another host than {host}")]
    HostMismatch { item_id: ItemId, host: HostRef },

    #[error("Item {item_id} does not belong to {bundle}")]
    BundleMismatch { item_id: ItemId, bundle: String },

    #[error("Item {item_id} appears more than once in {bundle}")]
    DuplicateChild { item_id: ItemId, bundle: String },

    #[error("Cannot delete default revision {1} of {0}")]
    DefaultHostRevision(HostRef, HostRevisionId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Journal entry of {len} bytes exceeds the limit of {limit}")]
    EntryTooLarge { len: usize, limit: usize },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,
}

impl TetherError {
    pub(crate) fn item_not_found(item_id: ItemId) -> Self {
        TetherError::NotFound(format!("item {}", item_id))
    }

    pub(crate) fn revision_not_found(item_id: ItemId, revision_id: RevisionId) -> Self {
        TetherError::NotFound(format!("item {} revision {}", item_id, revision_id))
    }

    /// Whether the error is meant for user-facing messaging rather than
    /// being a fault of the store.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            TetherError::CardinalityExceeded { .. }
                | TetherError::HostMismatch { .. }
                | TetherError::BundleMismatch { .. }
                | TetherError::DuplicateChild { .. }
                | TetherError::DefaultHostRevision(..)
        )
    }
}

impl From<std::io::Error> for TetherError {
    fn from(e: std::io::Error) -> Self {
        TetherError::StoreUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for TetherError {
    fn from(e: serde_json::Error) -> Self {
        TetherError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for TetherError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        TetherError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for TetherError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        TetherError::Deserialization(e.to_string())
    }
}

/// Result type for tether operations.
pub type Result<T> = std::result::Result<T, TetherError>;
