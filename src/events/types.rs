//! Lifecycle event types.

use crate::types::{ChildReference, HostRef, HostRevisionId, ItemId};
use serde::{Deserialize, Serialize};

/// Events emitted after a lifecycle transaction commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    /// A child entity got its first revision.
    ChildCreated {
        host: Option<HostRef>,
        bundle: String,
        child: ChildReference,
    },

    /// A child entity got a new default revision.
    ChildRevised {
        host: Option<HostRef>,
        child: ChildReference,
    },

    /// The child is now kept alive only by historical host revisions.
    ChildArchived { host: HostRef, item_id: ItemId },

    /// An archived child is referenced by the default host revision again.
    ChildRestored { host: HostRef, item_id: ItemId },

    /// All revisions of the child are gone.
    ChildDeleted {
        host: Option<HostRef>,
        item_id: ItemId,
    },

    /// A host revision's reference list was written.
    HostSaved {
        host: HostRef,
        host_revision_id: HostRevisionId,
        new_revision: bool,
    },

    /// A host revision was deleted.
    HostRevisionDeleted {
        host: HostRef,
        host_revision_id: HostRevisionId,
    },

    /// A host and every child it owned were deleted.
    HostDeleted { host: HostRef },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

impl LifecycleEvent {
    /// The host the event concerns, if known.
    pub fn host(&self) -> Option<&HostRef> {
        match self {
            LifecycleEvent::ChildCreated { host, .. }
            | LifecycleEvent::ChildRevised { host, .. }
            | LifecycleEvent::ChildDeleted { host, .. } => host.as_ref(),
            LifecycleEvent::ChildArchived { host, .. }
            | LifecycleEvent::ChildRestored { host, .. }
            | LifecycleEvent::HostSaved { host, .. }
            | LifecycleEvent::HostRevisionDeleted { host, .. }
            | LifecycleEvent::HostDeleted { host } => Some(host),
            LifecycleEvent::Dropped { .. } => None,
        }
    }
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// Only events of hosts of these types (None = all).
    pub host_types: Option<Vec<String>>,

    /// Only events of this host (None = all).
    pub host: Option<HostRef>,
}

impl EventFilter {
    /// Subscribe to everything.
    pub fn all() -> Self {
        Self::default()
    }

    /// Subscribe to one host.
    pub fn host(host: HostRef) -> Self {
        Self {
            host: Some(host),
            ..Default::default()
        }
    }

    /// Subscribe to hosts of the given types.
    pub fn host_types(types: Vec<String>) -> Self {
        Self {
            host_types: Some(types),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &LifecycleEvent) -> bool {
        let host = event.host();

        if let Some(ref wanted) = self.host {
            if host != Some(wanted) {
                return false;
            }
        }

        if let Some(ref types) = self.host_types {
            match host {
                Some(h) if types.iter().any(|t| *t == h.host_type) => {}
                _ => return false,
            }
        }

        true
    }
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to receive events of one subscription.
pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: crossbeam_channel::Receiver<LifecycleEvent>,
}

impl Subscription {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<LifecycleEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<LifecycleEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Drain every event currently buffered.
    pub fn drain(&self) -> Vec<LifecycleEvent> {
        self.receiver.try_iter().collect()
    }
}
