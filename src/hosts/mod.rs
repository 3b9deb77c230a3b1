//! Stored host revisions.
//!
//! The host entity framework owns hosts; this index only keeps what the
//! child lifecycle needs: each host revision, whether it is the default,
//! and the ordered child references of each of its fields.

mod index;

pub use index::{HostCounters, HostIndex, HostRecord};
