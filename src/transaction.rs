//! Atomic units of work over the revision and host indexes.
//!
//! A transaction holds the store's state write lock for its whole life.
//! Every write is expressed as a [`Mutation`], applied to the live indexes
//! straight away (so reads inside the transaction see their own writes),
//! and remembered for the journal. Before an item or host is first
//! touched its whole record is saved; rolling back puts those records
//! back. Commit appends the mutation list to the journal as one entry.

use crate::error::{Result, TetherError};
use crate::events::LifecycleEvent;
use crate::hosts::{HostCounters, HostIndex, HostRecord};
use crate::journal::Journal;
use crate::revisions::{ItemRecord, RevisionCounters, RevisionIndex, RevisionStore};
use crate::types::{
    ChildEntity, ChildReference, HostId, HostRef, HostRevision, HostRevisionId, ItemId,
    RevisionId, Timestamp,
};
use parking_lot::{Mutex, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One journaled change. Ids are assigned before the mutation is built,
/// so replaying a journal reproduces the same ids.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    PutRevision {
        item_id: ItemId,
        revision_id: RevisionId,
        entity: ChildEntity,
    },
    OverwritePayload {
        item_id: ItemId,
        revision_id: RevisionId,
        payload: serde_json::Value,
    },
    SetDefault {
        item_id: ItemId,
        revision_id: RevisionId,
    },
    MarkArchived {
        item_id: ItemId,
        archived: bool,
    },
    FinalizeHost {
        item_id: ItemId,
        host_id: HostId,
    },
    DeleteRevision {
        item_id: ItemId,
        revision_id: RevisionId,
    },
    DeleteEntity {
        item_id: ItemId,
    },
    RegisterHost {
        host: HostRef,
    },
    PutHostRevision {
        revision: HostRevision,
    },
    DeleteHostRevision {
        host: HostRef,
        host_revision_id: HostRevisionId,
    },
    DeleteHost {
        host: HostRef,
    },
    /// Keep id counters at least this high. Written by compaction so that
    /// ids of deleted entities are never handed out again.
    ReserveIds {
        next_item_id: u64,
        next_revision_id: u64,
        next_host_id: u64,
        next_host_revision_id: u64,
    },
}

impl Mutation {
    fn item(&self) -> Option<ItemId> {
        match self {
            Mutation::PutRevision { item_id, .. }
            | Mutation::OverwritePayload { item_id, .. }
            | Mutation::SetDefault { item_id, .. }
            | Mutation::MarkArchived { item_id, .. }
            | Mutation::FinalizeHost { item_id, .. }
            | Mutation::DeleteRevision { item_id, .. }
            | Mutation::DeleteEntity { item_id } => Some(*item_id),
            _ => None,
        }
    }

    fn host(&self) -> Option<HostRef> {
        match self {
            Mutation::RegisterHost { host }
            | Mutation::DeleteHostRevision { host, .. }
            | Mutation::DeleteHost { host } => Some(host.clone()),
            Mutation::PutHostRevision { revision } => Some(revision.host()),
            _ => None,
        }
    }
}

/// Everything the store holds in memory.
#[derive(Default)]
pub struct StoreState {
    pub revisions: RevisionIndex,
    pub hosts: HostIndex,
}

impl StoreState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one mutation. Used both live and when replaying the journal.
    pub fn apply(&mut self, mutation: &Mutation) -> Result<()> {
        match mutation {
            Mutation::PutRevision {
                item_id,
                revision_id,
                entity,
            } => {
                self.revisions.insert_revision(*item_id, *revision_id, entity);
                Ok(())
            }
            Mutation::OverwritePayload {
                item_id,
                revision_id,
                payload,
            } => self
                .revisions
                .overwrite_payload(*item_id, *revision_id, payload.clone()),
            Mutation::SetDefault {
                item_id,
                revision_id,
            } => self.revisions.set_default(*item_id, *revision_id),
            Mutation::MarkArchived { item_id, archived } => {
                self.revisions.set_archived(*item_id, *archived)
            }
            Mutation::FinalizeHost { item_id, host_id } => {
                self.revisions.set_host(*item_id, *host_id)
            }
            Mutation::DeleteRevision {
                item_id,
                revision_id,
            } => self.revisions.remove_revision(*item_id, *revision_id),
            Mutation::DeleteEntity { item_id } => {
                self.revisions.remove_item(*item_id);
                Ok(())
            }
            Mutation::RegisterHost { host } => {
                self.hosts.register(host);
                Ok(())
            }
            Mutation::PutHostRevision { revision } => {
                self.hosts.put_revision(revision.clone());
                Ok(())
            }
            Mutation::DeleteHostRevision {
                host,
                host_revision_id,
            } => self
                .hosts
                .remove_revision(host, *host_revision_id)
                .map(|_| ()),
            Mutation::DeleteHost { host } => {
                self.hosts.remove_host(host);
                Ok(())
            }
            Mutation::ReserveIds {
                next_item_id,
                next_revision_id,
                next_host_id,
                next_host_revision_id,
            } => {
                let revisions = self.revisions.counters();
                self.revisions.restore_counters(RevisionCounters {
                    next_item_id: revisions.next_item_id.max(*next_item_id),
                    next_revision_id: revisions.next_revision_id.max(*next_revision_id),
                });
                let hosts = self.hosts.counters();
                self.hosts.restore_counters(HostCounters {
                    next_host_id: hosts.next_host_id.max(*next_host_id),
                    next_host_revision_id: hosts
                        .next_host_revision_id
                        .max(*next_host_revision_id),
                });
                Ok(())
            }
        }
    }

    /// Mutations that rebuild this state from nothing.
    pub fn snapshot(&self) -> Vec<Mutation> {
        let mut mutations = Vec::new();

        for host in self.hosts.hosts() {
            mutations.push(Mutation::RegisterHost { host: host.clone() });
            for revision in self.hosts.revisions(&host) {
                mutations.push(Mutation::PutHostRevision { revision });
            }
        }

        for item_id in self.revisions.item_ids() {
            let Some(record) = self.revisions.item(item_id) else {
                continue;
            };
            for &revision_id in record.revisions.keys() {
                if let Some(entity) = record.entity(item_id, revision_id) {
                    mutations.push(Mutation::PutRevision {
                        item_id,
                        revision_id,
                        entity,
                    });
                }
            }
            mutations.push(Mutation::SetDefault {
                item_id,
                revision_id: record.default_revision,
            });
            if record.archived {
                mutations.push(Mutation::MarkArchived {
                    item_id,
                    archived: true,
                });
            }
        }

        let revisions = self.revisions.counters();
        let hosts = self.hosts.counters();
        mutations.push(Mutation::ReserveIds {
            next_item_id: revisions.next_item_id,
            next_revision_id: revisions.next_revision_id,
            next_host_id: hosts.next_host_id,
            next_host_revision_id: hosts.next_host_revision_id,
        });
        mutations
    }
}

/// A write transaction. Dropping it without [`Transaction::commit`] rolls
/// every change back.
pub struct Transaction<'a> {
    state: RwLockWriteGuard<'a, StoreState>,
    journal: &'a Mutex<Journal>,

    /// Records as they were before this transaction first touched them.
    item_images: HashMap<ItemId, Option<ItemRecord>>,
    host_images: HashMap<HostRef, Option<HostRecord>>,
    counters: (RevisionCounters, HostCounters),

    mutations: Vec<Mutation>,
    events: Vec<LifecycleEvent>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(
        state: RwLockWriteGuard<'a, StoreState>,
        journal: &'a Mutex<Journal>,
    ) -> Self {
        let counters = (state.revisions.counters(), state.hosts.counters());
        Self {
            state,
            journal,
            item_images: HashMap::new(),
            host_images: HashMap::new(),
            counters,
            mutations: Vec::new(),
            events: Vec::new(),
            finished: false,
        }
    }

    // --- Reads ---

    pub fn revisions(&self) -> &RevisionIndex {
        &self.state.revisions
    }

    pub fn hosts(&self) -> &HostIndex {
        &self.state.hosts
    }

    /// Every stored revision of `host`, oldest first.
    pub fn host_revisions(&self, host: &HostRef) -> Vec<HostRevision> {
        self.state.hosts.revisions(host)
    }

    pub fn default_host_revision(&self, host: &HostRef) -> Option<HostRevision> {
        self.state.hosts.default_revision(host).cloned()
    }

    /// Mutations recorded so far.
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    // --- Writes beyond the revision store contract ---

    /// Replace the payload of an existing revision without creating a new one.
    pub fn overwrite_payload(
        &mut self,
        item_id: ItemId,
        revision_id: RevisionId,
        payload: serde_json::Value,
    ) -> Result<()> {
        self.record(Mutation::OverwritePayload {
            item_id,
            revision_id,
            payload,
        })
    }

    /// Give a provisionally stored child the identity of its host.
    pub fn finalize_host(&mut self, item_id: ItemId, host_id: HostId) -> Result<()> {
        self.record(Mutation::FinalizeHost { item_id, host_id })
    }

    pub fn register_host(&mut self, host: HostRef) -> Result<()> {
        self.record(Mutation::RegisterHost { host })
    }

    /// Next unused host id.
    pub fn peek_host_id(&self) -> HostId {
        self.state.hosts.peek_host_id()
    }

    /// Store a new default revision of `host` carrying `fields`.
    pub fn create_host_revision(
        &mut self,
        host: &HostRef,
        fields: std::collections::BTreeMap<String, Vec<ChildReference>>,
    ) -> Result<HostRevision> {
        let revision = HostRevision {
            host_type: host.host_type.clone(),
            host_id: host.host_id,
            host_revision_id: self.state.hosts.peek_host_revision_id(),
            is_default: true,
            fields,
        };
        self.put_host_revision(revision.clone())?;
        Ok(revision)
    }

    /// Insert or replace a host revision as given.
    pub fn put_host_revision(&mut self, revision: HostRevision) -> Result<()> {
        self.record(Mutation::PutHostRevision { revision })
    }

    pub fn delete_host_revision(
        &mut self,
        host: &HostRef,
        host_revision_id: HostRevisionId,
    ) -> Result<()> {
        self.record(Mutation::DeleteHostRevision {
            host: host.clone(),
            host_revision_id,
        })
    }

    pub fn delete_host(&mut self, host: &HostRef) -> Result<()> {
        if !self.state.hosts.contains(host) {
            return Ok(());
        }
        self.record(Mutation::DeleteHost { host: host.clone() })
    }

    /// Queue an event for publication after commit.
    pub fn emit(&mut self, event: LifecycleEvent) {
        self.events.push(event);
    }

    // --- Completion ---

    /// Journal the recorded mutations and make them permanent. Returns the
    /// events to publish.
    pub fn commit(mut self) -> Result<Vec<LifecycleEvent>> {
        if !self.mutations.is_empty() {
            let appended = self.journal.lock().append(&self.mutations);
            if let Err(e) = appended {
                tracing::warn!(error = %e, "journal append failed, rolling back");
                self.rollback_in_place();
                return Err(e);
            }
        }
        self.finished = true;
        Ok(std::mem::take(&mut self.events))
    }

    /// Discard every change.
    pub fn rollback(mut self) {
        self.rollback_in_place();
    }

    fn rollback_in_place(&mut self) {
        if self.finished {
            return;
        }
        if !self.mutations.is_empty() {
            tracing::debug!(mutations = self.mutations.len(), "rolling back transaction");
        }
        for (item_id, image) in self.item_images.drain() {
            self.state.revisions.restore_item(item_id, image);
        }
        for (host, image) in self.host_images.drain() {
            self.state.hosts.restore_host(&host, image);
        }
        self.state.revisions.restore_counters(self.counters.0);
        self.state.hosts.restore_counters(self.counters.1);
        self.mutations.clear();
        self.events.clear();
        self.finished = true;
    }

    fn record(&mut self, mutation: Mutation) -> Result<()> {
        if let Some(item_id) = mutation.item() {
            if !self.item_images.contains_key(&item_id) {
                let image = self.state.revisions.item(item_id).cloned();
                self.item_images.insert(item_id, image);
            }
        }
        if let Some(host) = mutation.host() {
            if !self.host_images.contains_key(&host) {
                let image = self.state.hosts.host(&host).cloned();
                self.host_images.insert(host, image);
            }
        }

        self.state.apply(&mutation)?;
        self.mutations.push(mutation);
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.rollback_in_place();
    }
}

impl RevisionStore for Transaction<'_> {
    fn put(&mut self, entity: ChildEntity) -> Result<ChildReference> {
        let mut template = match entity.item_id {
            Some(item_id) => {
                let record = self
                    .state
                    .revisions
                    .item(item_id)
                    .ok_or_else(|| TetherError::item_not_found(item_id))?;
                ChildEntity {
                    bundle: record.bundle.clone(),
                    host_type: record.host_type.clone(),
                    host_id: record.host_id,
                    ..entity
                }
            }
            None => entity,
        };

        let item_id = template
            .item_id
            .unwrap_or_else(|| self.state.revisions.peek_item_id());
        let revision_id = self.state.revisions.peek_revision_id();

        template.item_id = Some(item_id);
        template.revision_id = Some(revision_id);
        template.is_default_revision = true;
        template.archived = false;
        template.created = Timestamp::now();

        self.record(Mutation::PutRevision {
            item_id,
            revision_id,
            entity: template,
        })?;
        Ok(ChildReference::new(item_id, revision_id))
    }

    fn get(&self, item_id: ItemId, revision_id: RevisionId) -> Result<ChildEntity> {
        self.state.revisions.get(item_id, revision_id)
    }

    fn get_default(&self, item_id: ItemId) -> Result<ChildEntity> {
        self.state.revisions.get_default(item_id)
    }

    fn set_default(&mut self, item_id: ItemId, revision_id: RevisionId) -> Result<()> {
        self.record(Mutation::SetDefault {
            item_id,
            revision_id,
        })
    }

    fn mark_archived(&mut self, item_id: ItemId, archived: bool) -> Result<()> {
        self.record(Mutation::MarkArchived { item_id, archived })
    }

    fn delete_entity(&mut self, item_id: ItemId) -> Result<()> {
        if !self.state.revisions.contains(item_id) {
            return Ok(());
        }
        self.record(Mutation::DeleteEntity { item_id })
    }

    fn delete_revision(&mut self, item_id: ItemId, revision_id: RevisionId) -> Result<()> {
        self.record(Mutation::DeleteRevision {
            item_id,
            revision_id,
        })
    }

    fn revision_ids(&self, item_id: ItemId) -> Vec<RevisionId> {
        self.state.revisions.revision_ids(item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> (RwLock<StoreState>, Mutex<Journal>) {
        let (journal, _) = Journal::open(dir.path().join("journal.log"), false).unwrap();
        (RwLock::new(StoreState::new()), Mutex::new(journal))
    }

    fn child(payload: serde_json::Value) -> ChildEntity {
        let mut entity = ChildEntity::with_payload("field_items", "node", payload);
        entity.host_id = Some(HostId(1));
        entity
    }

    #[test]
    fn test_commit_keeps_changes() {
        let dir = TempDir::new().unwrap();
        let (state, journal) = fixture(&dir);

        let mut tx = Transaction::begin(state.write(), &journal);
        let first = tx.put(child(json!("a"))).unwrap();
        let second = tx
            .put(ChildEntity {
                item_id: Some(first.item_id),
                ..child(json!("b"))
            })
            .unwrap();
        assert_eq!(first.item_id, second.item_id);
        assert!(second.revision_id > first.revision_id);
        tx.commit().unwrap();

        let state = state.read();
        let entity = state.revisions.get_default(first.item_id).unwrap();
        assert_eq!(entity.payload, json!("b"));
        assert_eq!(journal.lock().entry_count(), 1);
    }

    #[test]
    fn test_drop_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (state, journal) = fixture(&dir);

        let existing = {
            let mut tx = Transaction::begin(state.write(), &journal);
            let r = tx.put(child(json!("a"))).unwrap();
            tx.commit().unwrap();
            r
        };

        {
            let mut tx = Transaction::begin(state.write(), &journal);
            tx.put(child(json!("new"))).unwrap();
            tx.mark_archived(existing.item_id, true).unwrap();
            tx.delete_entity(existing.item_id).unwrap();
            // dropped without commit
        }

        let state = state.read();
        assert_eq!(state.revisions.count(), 1);
        let entity = state.revisions.get_default(existing.item_id).unwrap();
        assert!(!entity.archived);
        assert_eq!(state.revisions.peek_item_id(), ItemId(2));
        assert_eq!(journal.lock().entry_count(), 1);
    }

    #[test]
    fn test_put_unknown_item_fails() {
        let dir = TempDir::new().unwrap();
        let (state, journal) = fixture(&dir);

        let mut tx = Transaction::begin(state.write(), &journal);
        let result = tx.put(ChildEntity {
            item_id: Some(ItemId(42)),
            ..child(json!(1))
        });
        assert!(matches!(result, Err(TetherError::NotFound(_))));
        assert!(tx.mutations().is_empty());
    }

    #[test]
    fn test_delete_entity_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (state, journal) = fixture(&dir);

        let mut tx = Transaction::begin(state.write(), &journal);
        let r = tx.put(child(json!(1))).unwrap();
        tx.delete_entity(r.item_id).unwrap();
        tx.delete_entity(r.item_id).unwrap();
        assert_eq!(tx.mutations().len(), 2);
        assert!(tx.revision_ids(r.item_id).is_empty());
    }

    #[test]
    fn test_host_revision_rollback() {
        let dir = TempDir::new().unwrap();
        let (state, journal) = fixture(&dir);
        let host = HostRef::new("node", HostId(1));

        let mut tx = Transaction::begin(state.write(), &journal);
        tx.create_host_revision(&host, Default::default()).unwrap();
        tx.rollback();

        let state = state.read();
        assert!(!state.hosts.contains(&host));
        assert_eq!(state.hosts.peek_host_revision_id(), HostRevisionId(1));
    }
}
