//! # Tether
//!
//! Revisioned child entities whose lifecycle follows the revisions of the
//! host entity that embeds them.
//!
//! ## Core Concepts
//!
//! - **Children**: Entities with their own identity and revision history,
//!   embedded in a field of a host
//! - **Host revisions**: Ordered `(item_id, revision_id)` references per field
//! - **Lifecycle**: Children are created, archived and deleted as host
//!   revisions are saved and deleted, never lazily
//! - **Sessions**: Request-scoped staging of children before the host saves
//!
//! ## Example
//!
//! ```ignore
//! use tether::{ChildSpec, HostSave, HostTarget, LifecycleManager, Store, StoreConfig};
//!
//! let store = Arc::new(Store::open_or_create(StoreConfig::new("./my-store"))?);
//! let manager = LifecycleManager::new(store);
//!
//! // A new host with one child
//! let saved = manager.on_host_save(
//!     HostSave::new(HostTarget::new_host("node"), "field_items")
//!         .child(ChildSpec::new(json!({"title": "first"}))),
//! )?;
//!
//! // A new host revision without it archives the child
//! manager.on_host_save(HostSave::new(saved.host.clone(), "field_items").new_revision(true))?;
//! ```

pub mod error;
pub mod events;
pub mod hosts;
pub mod journal;
pub mod lifecycle;
pub mod resolver;
pub mod revisions;
pub mod session;
pub mod store;
pub mod transaction;
pub mod types;

// Re-exports
pub use error::{Result, TetherError};
pub use events::{DropReason, EventBus, EventFilter, LifecycleEvent, Subscription, SubscriptionId};
pub use hosts::{HostIndex, HostRecord};
pub use journal::{Journal, JournalEntry};
pub use lifecycle::{AcceptProposed, ChildSpec, HostPersister, HostSave, LifecycleManager, SaveOutcome};
pub use resolver::{Classification, ReferenceResolver, Usage};
pub use revisions::{ItemRecord, RevisionIndex, RevisionStore, StoredRevision};
pub use session::{LinkSession, StagedChild};
pub use store::{
    Cardinality, CascadePolicy, FieldSettings, NewRevisionPolicy, Store, StoreConfig, StoreStats,
};
pub use transaction::{Mutation, StoreState, Transaction};
pub use types::*;
