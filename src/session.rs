//! Request-scoped staging of children while a host form is edited.
//!
//! A [`LinkSession`] holds working copies keyed by field and delta. It
//! never reads or writes the store; committing turns the staged copies
//! into the child specs a host save consumes.

use crate::lifecycle::{ChildSpec, HostSave};
use crate::types::{ChildEntity, HostTarget};
use std::collections::{BTreeMap, HashMap};

/// One staged position.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedChild {
    pub entity: ChildEntity,

    /// Payload as loaded from the store, for persisted children.
    original: Option<serde_json::Value>,
}

impl StagedChild {
    fn pending(entity: ChildEntity) -> Self {
        Self {
            entity,
            original: None,
        }
    }

    /// Whether the embedding form changed the payload since it was loaded.
    pub fn is_modified(&self) -> bool {
        match &self.original {
            Some(original) => *original != self.entity.payload,
            None => true,
        }
    }

    fn spec(&self) -> Option<ChildSpec> {
        match self.entity.item_id {
            Some(item_id) if self.is_modified() => {
                Some(ChildSpec::updated(item_id, self.entity.payload.clone()))
            }
            Some(item_id) => Some(ChildSpec::existing(item_id)),
            // A pending child nobody filled in.
            None if self.entity.payload.is_null() => None,
            None => Some(ChildSpec::new(self.entity.payload.clone())),
        }
    }
}

/// Staging area for the children of one host being edited.
#[derive(Clone, Debug)]
pub struct LinkSession {
    host_type: String,
    fields: HashMap<String, BTreeMap<usize, StagedChild>>,
}

impl LinkSession {
    pub fn new(host_type: impl Into<String>) -> Self {
        Self {
            host_type: host_type.into(),
            fields: HashMap::new(),
        }
    }

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    /// Seed `field` with persisted children in delta order, replacing
    /// anything staged there.
    pub fn load(&mut self, field: &str, children: Vec<ChildEntity>) {
        let staged = children
            .into_iter()
            .enumerate()
            .map(|(delta, entity)| {
                let original = entity.item_id.map(|_| entity.payload.clone());
                (delta, StagedChild { entity, original })
            })
            .collect();
        self.fields.insert(field.to_string(), staged);
    }

    /// The staged child at `delta`, creating a blank one if the position
    /// is empty.
    pub fn get_or_create_pending(&mut self, field: &str, delta: usize) -> ChildEntity {
        let host_type = &self.host_type;
        self.fields
            .entry(field.to_string())
            .or_default()
            .entry(delta)
            .or_insert_with(|| StagedChild::pending(ChildEntity::blank(field, host_type.clone())))
            .entity
            .clone()
    }

    pub fn get(&self, field: &str, delta: usize) -> Option<&StagedChild> {
        self.fields.get(field)?.get(&delta)
    }

    /// Replace the staged child at `delta`.
    pub fn stage(&mut self, field: &str, delta: usize, entity: ChildEntity) {
        let slot = self.fields.entry(field.to_string()).or_default();
        let original = slot
            .get(&delta)
            .filter(|s| s.entity.item_id.is_some() && s.entity.item_id == entity.item_id)
            .and_then(|s| s.original.clone());
        slot.insert(delta, StagedChild { entity, original });
    }

    /// Remove the child at `delta`; later children move up one position.
    pub fn remove(&mut self, field: &str, delta: usize) -> Option<ChildEntity> {
        let slot = self.fields.get_mut(field)?;
        let removed = slot.remove(&delta)?;

        let shifted: Vec<_> = slot.split_off(&delta).into_iter().collect();
        for (d, staged) in shifted {
            slot.insert(d - 1, staged);
        }
        Some(removed.entity)
    }

    /// Positions a form shows for `field`; a blank form still shows one.
    pub fn items_count(&self, field: &str) -> usize {
        self.fields.get(field).map(|s| s.len()).unwrap_or(0).max(1)
    }

    /// The field's staged children as child specs, in delta order.
    pub fn commit(&self, field: &str) -> Vec<ChildSpec> {
        self.fields
            .get(field)
            .map(|slot| slot.values().filter_map(StagedChild::spec).collect())
            .unwrap_or_default()
    }

    /// Build the host save for `field`.
    pub fn into_host_save(self, target: HostTarget, field: &str, new_revision: bool) -> HostSave {
        let children = self.commit(field);
        HostSave::new(target, field)
            .new_revision(new_revision)
            .children(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HostId, ItemId, RevisionId};
    use serde_json::json;

    fn persisted(item_id: u64, payload: serde_json::Value) -> ChildEntity {
        let mut entity = ChildEntity::with_payload("field_items", "node", payload);
        entity.item_id = Some(ItemId(item_id));
        entity.revision_id = Some(RevisionId(item_id));
        entity.host_id = Some(HostId(1));
        entity
    }

    #[test]
    fn test_pending_is_created_once() {
        let mut session = LinkSession::new("node");
        let mut entity = session.get_or_create_pending("field_items", 0);
        assert!(entity.is_new());
        assert_eq!(entity.bundle, "field_items");

        entity.payload = json!({"title": "first"});
        session.stage("field_items", 0, entity.clone());

        assert_eq!(session.get_or_create_pending("field_items", 0), entity);
        assert_eq!(session.items_count("field_items"), 1);
    }

    #[test]
    fn test_commit_in_delta_order() {
        let mut session = LinkSession::new("node");
        session.load("field_items", vec![persisted(1, json!("a")), persisted(2, json!("b"))]);

        let mut edited = session.get_or_create_pending("field_items", 1);
        edited.payload = json!("b2");
        session.stage("field_items", 1, edited);

        let mut fresh = session.get_or_create_pending("field_items", 2);
        fresh.payload = json!("c");
        session.stage("field_items", 2, fresh);

        // Untouched blank position.
        session.get_or_create_pending("field_items", 3);

        assert_eq!(
            session.commit("field_items"),
            vec![
                ChildSpec::existing(ItemId(1)),
                ChildSpec::updated(ItemId(2), json!("b2")),
                ChildSpec::new(json!("c")),
            ]
        );
    }

    #[test]
    fn test_remove_shifts_later_deltas() {
        let mut session = LinkSession::new("node");
        session.load(
            "field_items",
            vec![persisted(1, json!(1)), persisted(2, json!(2)), persisted(3, json!(3))],
        );

        let removed = session.remove("field_items", 0).unwrap();
        assert_eq!(removed.item_id, Some(ItemId(1)));
        assert_eq!(session.items_count("field_items"), 2);
        assert_eq!(
            session.get("field_items", 0).unwrap().entity.item_id,
            Some(ItemId(2))
        );
        assert!(session.get("field_items", 2).is_none());
        assert!(session.remove("field_items", 7).is_none());
    }

    #[test]
    fn test_empty_field() {
        let session = LinkSession::new("node");
        assert_eq!(session.items_count("field_items"), 1);
        assert!(session.commit("field_items").is_empty());

        let save = session.into_host_save(HostTarget::new_host("node"), "field_items", true);
        assert!(save.children.is_empty());
        assert!(save.new_revision);
    }
}
