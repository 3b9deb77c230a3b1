//! Core types shared by every component.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Host type under which a child entity acts as a host for nested children.
pub const CHILD_HOST_TYPE: &str = "child_item";

/// Stable identity of a child entity, assigned on first persistence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub u64);

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one child revision. Assigned from a single store-wide
/// counter, so revisions of one item are ordered by creation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RevisionId(pub u64);

impl fmt::Debug for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rev({})", self.0)
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a host entity, stable across its revisions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostId(pub u64);

impl fmt::Debug for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostId({})", self.0)
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one host revision.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostRevisionId(pub u64);

impl fmt::Debug for HostRevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostRev({})", self.0)
    }
}

impl fmt::Display for HostRevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A host entity: its type plus its identity.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HostRef {
    pub host_type: String,
    pub host_id: HostId,
}

impl HostRef {
    pub fn new(host_type: impl Into<String>, host_id: HostId) -> Self {
        Self {
            host_type: host_type.into(),
            host_id,
        }
    }

    /// The host formed by a child entity that embeds children of its own.
    pub fn child_as_host(item_id: ItemId) -> Self {
        Self::new(CHILD_HOST_TYPE, HostId(item_id.0))
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.host_type, self.host_id)
    }
}

/// What a host save targets: a host that already has an identity, or a
/// host that obtains one during the save.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HostTarget {
    Existing(HostRef),
    New { host_type: String },
}

impl HostTarget {
    pub fn new_host(host_type: impl Into<String>) -> Self {
        HostTarget::New {
            host_type: host_type.into(),
        }
    }

    pub fn host_type(&self) -> &str {
        match self {
            HostTarget::Existing(host) => &host.host_type,
            HostTarget::New { host_type } => host_type,
        }
    }
}

impl From<HostRef> for HostTarget {
    fn from(host: HostRef) -> Self {
        HostTarget::Existing(host)
    }
}

/// One position of a host field: the child revision embedded there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildReference {
    pub item_id: ItemId,
    pub revision_id: RevisionId,
}

impl ChildReference {
    pub fn new(item_id: ItemId, revision_id: RevisionId) -> Self {
        Self {
            item_id,
            revision_id,
        }
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Timestamp(micros)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// One revision of a child entity.
///
/// `item_id` and `revision_id` are `None` until the entity is persisted;
/// `host_id` is `None` while the owning host has no identity yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChildEntity {
    pub item_id: Option<ItemId>,
    pub revision_id: Option<RevisionId>,

    /// Schema tag; the name of the host field embedding the child.
    pub bundle: String,

    /// Opaque data owned by the embedding schema.
    pub payload: serde_json::Value,

    pub is_default_revision: bool,
    pub archived: bool,

    pub host_type: String,
    pub host_id: Option<HostId>,

    /// When this revision was written.
    pub created: Timestamp,
}

impl ChildEntity {
    /// A fresh, unsaved child with a blank payload.
    pub fn blank(bundle: impl Into<String>, host_type: impl Into<String>) -> Self {
        Self::with_payload(bundle, host_type, serde_json::Value::Null)
    }

    /// A fresh, unsaved child carrying `payload`.
    pub fn with_payload(
        bundle: impl Into<String>,
        host_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            item_id: None,
            revision_id: None,
            bundle: bundle.into(),
            payload,
            is_default_revision: false,
            archived: false,
            host_type: host_type.into(),
            host_id: None,
            created: Timestamp::default(),
        }
    }

    /// Whether the entity has never been persisted.
    pub fn is_new(&self) -> bool {
        self.item_id.is_none()
    }

    /// The `(item_id, revision_id)` pair, once persisted.
    pub fn reference(&self) -> Option<ChildReference> {
        Some(ChildReference::new(self.item_id?, self.revision_id?))
    }

    /// The owning host, once it has an identity.
    pub fn host(&self) -> Option<HostRef> {
        self.host_id
            .map(|host_id| HostRef::new(self.host_type.clone(), host_id))
    }
}

/// One revision of a host entity together with the children it embeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRevision {
    pub host_type: String,
    pub host_id: HostId,
    pub host_revision_id: HostRevisionId,
    pub is_default: bool,

    /// Ordered references per field (bundle). Position is the delta.
    pub fields: std::collections::BTreeMap<String, Vec<ChildReference>>,
}

impl HostRevision {
    pub fn host(&self) -> HostRef {
        HostRef::new(self.host_type.clone(), self.host_id)
    }

    /// The ordered references of one field; empty if the field has none.
    pub fn references(&self, bundle: &str) -> &[ChildReference] {
        self.fields.get(bundle).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every reference across all fields.
    pub fn all_references(&self) -> impl Iterator<Item = &ChildReference> {
        self.fields.values().flatten()
    }

    /// Whether any field references a revision of `item_id`.
    pub fn references_item(&self, item_id: ItemId) -> bool {
        self.all_references().any(|r| r.item_id == item_id)
    }

    /// Whether any field references exactly this child revision.
    pub fn references_revision(&self, reference: ChildReference) -> bool {
        self.all_references().any(|r| *r == reference)
    }
}

/// Where a child entity stands in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildState {
    /// Referenced by the host's default revision.
    Active,
    /// Kept alive only by historical host revisions.
    Archived,
    /// No revisions remain.
    Deleted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blank_child_is_new() {
        let child = ChildEntity::blank("field_items", "node");
        assert!(child.is_new());
        assert_eq!(child.reference(), None);
        assert_eq!(child.host(), None);
        assert_eq!(child.payload, serde_json::Value::Null);
    }

    #[test]
    fn test_host_revision_references() {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(
            "field_a".to_string(),
            vec![ChildReference::new(ItemId(1), RevisionId(1))],
        );
        fields.insert(
            "field_b".to_string(),
            vec![ChildReference::new(ItemId(2), RevisionId(5))],
        );
        let revision = HostRevision {
            host_type: "node".into(),
            host_id: HostId(1),
            host_revision_id: HostRevisionId(1),
            is_default: true,
            fields,
        };

        assert_eq!(revision.references("field_a").len(), 1);
        assert!(revision.references("missing").is_empty());
        assert!(revision.references_item(ItemId(2)));
        assert!(!revision.references_item(ItemId(3)));
        assert!(revision.references_revision(ChildReference::new(ItemId(2), RevisionId(5))));
        assert!(!revision.references_revision(ChildReference::new(ItemId(2), RevisionId(4))));
    }

    #[test]
    fn test_child_as_host() {
        let host = HostRef::child_as_host(ItemId(7));
        assert_eq!(host.host_type, CHILD_HOST_TYPE);
        assert_eq!(host.host_id, HostId(7));
        assert_eq!(host.to_string(), "child_item/7");
    }

    #[test]
    fn test_with_payload() {
        let child = ChildEntity::with_payload("field_items", "node", json!({"title": "x"}));
        assert_eq!(child.payload["title"], "x");
        assert_eq!(HostTarget::new_host("node").host_type(), "node");
    }
}
