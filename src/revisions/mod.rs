//! Keyed storage of child revisions.
//!
//! The store knows nothing about hosts beyond the identity each child
//! carries. All writes go through a [`RevisionStore`], which the store's
//! transaction implements so that every write is journaled and can be
//! rolled back.

mod index;

pub use index::{ItemRecord, RevisionCounters, RevisionIndex, StoredRevision};

use crate::error::Result;
use crate::types::{ChildEntity, ChildReference, ItemId, RevisionId};

/// Write contract for child revisions.
pub trait RevisionStore {
    /// Persist `entity` as a new revision. Assigns `item_id` if absent and
    /// always a fresh `revision_id`; the new revision becomes the default.
    fn put(&mut self, entity: ChildEntity) -> Result<ChildReference>;

    fn get(&self, item_id: ItemId, revision_id: RevisionId) -> Result<ChildEntity>;

    fn get_default(&self, item_id: ItemId) -> Result<ChildEntity>;

    /// Make `revision_id` the default of `item_id`.
    fn set_default(&mut self, item_id: ItemId, revision_id: RevisionId) -> Result<()>;

    fn mark_archived(&mut self, item_id: ItemId, archived: bool) -> Result<()>;

    /// Remove all revisions of an item. Idempotent.
    fn delete_entity(&mut self, item_id: ItemId) -> Result<()>;

    /// Remove one revision; removing the last one removes the item.
    fn delete_revision(&mut self, item_id: ItemId, revision_id: RevisionId) -> Result<()>;

    /// Revision ids of an item, oldest first.
    fn revision_ids(&self, item_id: ItemId) -> Vec<RevisionId>;
}
