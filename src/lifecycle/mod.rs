//! Child lifecycle driven by host saves and deletes.
//!
//! Every operation runs as one store transaction: child revisions, the
//! host's reference list, archival flags and deletions either all commit
//! or none do. Disposition of a child is decided by the
//! [`ReferenceResolver`](crate::resolver::ReferenceResolver) inside that
//! same transaction.

mod dispose;
mod manager;

pub use manager::LifecycleManager;

use crate::error::Result;
use crate::types::{ChildReference, HostId, HostRef, HostRevisionId, HostTarget, ItemId};

/// One position of a host field as handed over by the embedding form.
#[derive(Clone, Debug, PartialEq)]
pub enum ChildSpec {
    /// A child that has never been persisted.
    New { payload: serde_json::Value },

    /// A persisted child whose payload is unchanged.
    Existing { item_id: ItemId },

    /// A persisted child with a possibly changed payload.
    Updated {
        item_id: ItemId,
        payload: serde_json::Value,
    },
}

impl ChildSpec {
    pub fn new(payload: serde_json::Value) -> Self {
        ChildSpec::New { payload }
    }

    pub fn existing(item_id: ItemId) -> Self {
        ChildSpec::Existing { item_id }
    }

    pub fn updated(item_id: ItemId, payload: serde_json::Value) -> Self {
        ChildSpec::Updated { item_id, payload }
    }

    pub fn item_id(&self) -> Option<ItemId> {
        match self {
            ChildSpec::New { .. } => None,
            ChildSpec::Existing { item_id } | ChildSpec::Updated { item_id, .. } => Some(*item_id),
        }
    }
}

/// A host save as seen by one field (bundle) of the host.
#[derive(Clone, Debug, PartialEq)]
pub struct HostSave {
    pub target: HostTarget,
    pub bundle: String,

    /// Whether the host saves as a new revision.
    pub new_revision: bool,

    /// The field's children in delta order.
    pub children: Vec<ChildSpec>,
}

impl HostSave {
    pub fn new(target: impl Into<HostTarget>, bundle: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            bundle: bundle.into(),
            new_revision: false,
            children: Vec::new(),
        }
    }

    pub fn new_revision(mut self, new_revision: bool) -> Self {
        self.new_revision = new_revision;
        self
    }

    pub fn child(mut self, spec: ChildSpec) -> Self {
        self.children.push(spec);
        self
    }

    pub fn children(mut self, specs: impl IntoIterator<Item = ChildSpec>) -> Self {
        self.children.extend(specs);
        self
    }
}

/// Result of a host save.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveOutcome {
    pub host: HostRef,
    pub host_revision_id: HostRevisionId,

    /// The field's references as written, in delta order.
    pub references: Vec<ChildReference>,
}

/// Gives a new host its identity during the second phase of a save.
///
/// Called inside the save's transaction; returning an error rolls back
/// every child written in the first phase.
pub trait HostPersister {
    /// Persist the host and return its identity. `proposed` is the next
    /// free host id known to the store.
    fn persist_host(&mut self, host_type: &str, proposed: HostId) -> Result<HostId>;
}

impl<F> HostPersister for F
where
    F: FnMut(&str, HostId) -> Result<HostId>,
{
    fn persist_host(&mut self, host_type: &str, proposed: HostId) -> Result<HostId> {
        self(host_type, proposed)
    }
}

/// Accepts the id the store proposes.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptProposed;

impl HostPersister for AcceptProposed {
    fn persist_host(&mut self, _host_type: &str, proposed: HostId) -> Result<HostId> {
        Ok(proposed)
    }
}
