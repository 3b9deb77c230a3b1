//! In-memory table of child revisions.

use crate::error::{Result, TetherError};
use crate::types::{ChildEntity, HostId, HostRef, ItemId, RevisionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Stored data of one child revision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredRevision {
    pub payload: serde_json::Value,
    pub created: Timestamp,
}

/// Everything stored for one child entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub bundle: String,
    pub host_type: String,
    pub host_id: Option<HostId>,
    pub archived: bool,
    pub default_revision: RevisionId,
    pub revisions: BTreeMap<RevisionId, StoredRevision>,
}

impl ItemRecord {
    pub fn host(&self) -> Option<HostRef> {
        self.host_id
            .map(|host_id| HostRef::new(self.host_type.clone(), host_id))
    }

    /// Materialize one revision as a `ChildEntity`.
    pub fn entity(&self, item_id: ItemId, revision_id: RevisionId) -> Option<ChildEntity> {
        let stored = self.revisions.get(&revision_id)?;
        Some(ChildEntity {
            item_id: Some(item_id),
            revision_id: Some(revision_id),
            bundle: self.bundle.clone(),
            payload: stored.payload.clone(),
            is_default_revision: revision_id == self.default_revision,
            archived: self.archived,
            host_type: self.host_type.clone(),
            host_id: self.host_id,
            created: stored.created,
        })
    }
}

/// Id counters, captured whole so a rolled back transaction can restore them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RevisionCounters {
    pub next_item_id: u64,
    pub next_revision_id: u64,
}

/// Child revisions keyed by item, with a by-host lookup.
pub struct RevisionIndex {
    /// item_id -> record.
    items: HashMap<ItemId, ItemRecord>,

    /// host -> items whose host identity is finalized.
    by_host: HashMap<HostRef, BTreeSet<ItemId>>,

    counters: RevisionCounters,
}

impl Default for RevisionIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionIndex {
    pub fn new() -> Self {
        Self {
            items: HashMap::new(),
            by_host: HashMap::new(),
            counters: RevisionCounters {
                next_item_id: 1,
                next_revision_id: 1,
            },
        }
    }

    pub fn item(&self, item_id: ItemId) -> Option<&ItemRecord> {
        self.items.get(&item_id)
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.items.contains_key(&item_id)
    }

    pub fn get(&self, item_id: ItemId, revision_id: RevisionId) -> Result<ChildEntity> {
        let record = self
            .items
            .get(&item_id)
            .ok_or_else(|| TetherError::item_not_found(item_id))?;
        record
            .entity(item_id, revision_id)
            .ok_or_else(|| TetherError::revision_not_found(item_id, revision_id))
    }

    pub fn get_default(&self, item_id: ItemId) -> Result<ChildEntity> {
        let record = self
            .items
            .get(&item_id)
            .ok_or_else(|| TetherError::item_not_found(item_id))?;
        record
            .entity(item_id, record.default_revision)
            .ok_or_else(|| {
                TetherError::Corruption(format!("item {} has no default revision", item_id))
            })
    }

    /// Revision ids of an item, oldest first. Empty if the item is gone.
    pub fn revision_ids(&self, item_id: ItemId) -> Vec<RevisionId> {
        self.items
            .get(&item_id)
            .map(|r| r.revisions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Items owned by `host`.
    pub fn items_of_host(&self, host: &HostRef) -> Vec<ItemId> {
        self.by_host
            .get(host)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Items still waiting for their host to obtain an identity.
    pub fn provisional_items(&self) -> Vec<ItemId> {
        let mut ids: Vec<_> = self
            .items
            .iter()
            .filter(|(_, r)| r.host_id.is_none())
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn item_ids(&self) -> Vec<ItemId> {
        let mut ids: Vec<_> = self.items.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn revision_count(&self) -> usize {
        self.items.values().map(|r| r.revisions.len()).sum()
    }

    pub fn counters(&self) -> RevisionCounters {
        self.counters
    }

    pub fn restore_counters(&mut self, counters: RevisionCounters) {
        self.counters = counters;
    }

    /// Next unused item id.
    pub fn peek_item_id(&self) -> ItemId {
        ItemId(self.counters.next_item_id)
    }

    /// Next unused revision id.
    pub fn peek_revision_id(&self) -> RevisionId {
        RevisionId(self.counters.next_revision_id)
    }

    // --- Mutation primitives (driven by journaled mutations) ---

    /// Insert a revision, creating the item on first insert. The new
    /// revision becomes the default.
    pub fn insert_revision(
        &mut self,
        item_id: ItemId,
        revision_id: RevisionId,
        template: &ChildEntity,
    ) {
        let stored = StoredRevision {
            payload: template.payload.clone(),
            created: template.created,
        };

        match self.items.get_mut(&item_id) {
            Some(record) => {
                record.revisions.insert(revision_id, stored);
                record.default_revision = revision_id;
            }
            None => {
                let mut revisions = BTreeMap::new();
                revisions.insert(revision_id, stored);
                let record = ItemRecord {
                    bundle: template.bundle.clone(),
                    host_type: template.host_type.clone(),
                    host_id: template.host_id,
                    archived: false,
                    default_revision: revision_id,
                    revisions,
                };
                self.link_host(item_id, record.host());
                self.items.insert(item_id, record);
            }
        }

        self.counters.next_item_id = self.counters.next_item_id.max(item_id.0 + 1);
        self.counters.next_revision_id = self.counters.next_revision_id.max(revision_id.0 + 1);
    }

    pub fn overwrite_payload(
        &mut self,
        item_id: ItemId,
        revision_id: RevisionId,
        payload: serde_json::Value,
    ) -> Result<()> {
        let stored = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| TetherError::item_not_found(item_id))?
            .revisions
            .get_mut(&revision_id)
            .ok_or(TetherError::UnknownRevision {
                item_id,
                revision_id,
            })?;
        stored.payload = payload;
        Ok(())
    }

    pub fn set_default(&mut self, item_id: ItemId, revision_id: RevisionId) -> Result<()> {
        let record = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| TetherError::item_not_found(item_id))?;
        if !record.revisions.contains_key(&revision_id) {
            return Err(TetherError::UnknownRevision {
                item_id,
                revision_id,
            });
        }
        record.default_revision = revision_id;
        Ok(())
    }

    pub fn set_archived(&mut self, item_id: ItemId, archived: bool) -> Result<()> {
        let record = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| TetherError::item_not_found(item_id))?;
        record.archived = archived;
        Ok(())
    }

    pub fn set_host(&mut self, item_id: ItemId, host_id: HostId) -> Result<()> {
        let record = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| TetherError::item_not_found(item_id))?;
        let previous = record.host();
        record.host_id = Some(host_id);
        let current = record.host();
        self.unlink_host(item_id, previous);
        self.link_host(item_id, current);
        Ok(())
    }

    /// Remove one revision. Removing the last one removes the item; removing
    /// the default promotes the newest remaining revision.
    pub fn remove_revision(&mut self, item_id: ItemId, revision_id: RevisionId) -> Result<()> {
        let record = self
            .items
            .get_mut(&item_id)
            .ok_or_else(|| TetherError::item_not_found(item_id))?;
        if record.revisions.remove(&revision_id).is_none() {
            return Err(TetherError::UnknownRevision {
                item_id,
                revision_id,
            });
        }

        let newest = record.revisions.keys().next_back().copied();
        match newest {
            Some(newest) => {
                if record.default_revision == revision_id {
                    record.default_revision = newest;
                }
            }
            None => {
                self.remove_item(item_id);
            }
        }
        Ok(())
    }

    /// Remove an item and all its revisions. No-op if absent.
    pub fn remove_item(&mut self, item_id: ItemId) -> Option<ItemRecord> {
        let record = self.items.remove(&item_id)?;
        self.unlink_host(item_id, record.host());
        Some(record)
    }

    /// Put back a whole item image (or its absence).
    pub fn restore_item(&mut self, item_id: ItemId, image: Option<ItemRecord>) {
        self.remove_item(item_id);
        if let Some(record) = image {
            self.link_host(item_id, record.host());
            self.items.insert(item_id, record);
        }
    }

    fn link_host(&mut self, item_id: ItemId, host: Option<HostRef>) {
        if let Some(host) = host {
            self.by_host.entry(host).or_default().insert(item_id);
        }
    }

    fn unlink_host(&mut self, item_id: ItemId, host: Option<HostRef>) {
        if let Some(host) = host {
            if let Some(set) = self.by_host.get_mut(&host) {
                set.remove(&item_id);
                if set.is_empty() {
                    self.by_host.remove(&host);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn child(host_id: Option<HostId>, payload: serde_json::Value) -> ChildEntity {
        let mut entity = ChildEntity::with_payload("field_items", "node", payload);
        entity.host_id = host_id;
        entity
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut index = RevisionIndex::new();
        index.insert_revision(ItemId(1), RevisionId(1), &child(Some(HostId(3)), json!(1)));

        let entity = index.get_default(ItemId(1)).unwrap();
        assert_eq!(entity.revision_id, Some(RevisionId(1)));
        assert!(entity.is_default_revision);
        assert_eq!(index.items_of_host(&HostRef::new("node", HostId(3))), vec![ItemId(1)]);
        assert_eq!(index.peek_item_id(), ItemId(2));
        assert_eq!(index.peek_revision_id(), RevisionId(2));
    }

    #[test]
    fn test_newest_insert_becomes_default() {
        let mut index = RevisionIndex::new();
        index.insert_revision(ItemId(1), RevisionId(1), &child(None, json!("a")));
        index.insert_revision(ItemId(1), RevisionId(2), &child(None, json!("b")));

        assert_eq!(index.get_default(ItemId(1)).unwrap().payload, json!("b"));
        assert!(!index.get(ItemId(1), RevisionId(1)).unwrap().is_default_revision);
        assert_eq!(index.revision_ids(ItemId(1)), vec![RevisionId(1), RevisionId(2)]);
    }

    #[test]
    fn test_set_default_rejects_foreign_revision() {
        let mut index = RevisionIndex::new();
        index.insert_revision(ItemId(1), RevisionId(1), &child(None, json!(1)));
        index.insert_revision(ItemId(2), RevisionId(2), &child(None, json!(2)));

        let result = index.set_default(ItemId(1), RevisionId(2));
        assert!(matches!(result, Err(TetherError::UnknownRevision { .. })));
    }

    #[test]
    fn test_remove_default_promotes_newest_remaining() {
        let mut index = RevisionIndex::new();
        index.insert_revision(ItemId(1), RevisionId(1), &child(None, json!(1)));
        index.insert_revision(ItemId(1), RevisionId(2), &child(None, json!(2)));
        index.insert_revision(ItemId(1), RevisionId(3), &child(None, json!(3)));

        index.remove_revision(ItemId(1), RevisionId(3)).unwrap();
        assert_eq!(index.get_default(ItemId(1)).unwrap().revision_id, Some(RevisionId(2)));

        index.remove_revision(ItemId(1), RevisionId(1)).unwrap();
        index.remove_revision(ItemId(1), RevisionId(2)).unwrap();
        assert!(!index.contains(ItemId(1)));
    }

    #[test]
    fn test_set_host_moves_item() {
        let mut index = RevisionIndex::new();
        index.insert_revision(ItemId(1), RevisionId(1), &child(None, json!(1)));
        assert_eq!(index.provisional_items(), vec![ItemId(1)]);

        index.set_host(ItemId(1), HostId(9)).unwrap();
        assert!(index.provisional_items().is_empty());
        assert_eq!(index.items_of_host(&HostRef::new("node", HostId(9))), vec![ItemId(1)]);
    }

    #[test]
    fn test_restore_item_image() {
        let mut index = RevisionIndex::new();
        index.insert_revision(ItemId(1), RevisionId(1), &child(Some(HostId(1)), json!(1)));
        let image = index.item(ItemId(1)).cloned();

        index.remove_item(ItemId(1));
        assert!(index.items_of_host(&HostRef::new("node", HostId(1))).is_empty());

        index.restore_item(ItemId(1), image);
        assert!(index.contains(ItemId(1)));
        assert_eq!(index.items_of_host(&HostRef::new("node", HostId(1))), vec![ItemId(1)]);
    }
}
