//! Reference resolution over the revisions of one host.
//!
//! Pure functions: given every stored revision of a host, decide whether a
//! child is used by the default revision, kept alive only by historical
//! revisions, or not referenced at all. Callers must run these inside the
//! transaction that acts on the answer.

use crate::types::{ChildReference, HostRevision, ItemId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// How a child is referenced by the revisions of its host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Usage {
    UsedByDefault,
    UsedByNonDefaultOnly,
    Unused,
}

/// Children of a host grouped by usage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classification {
    pub in_use: BTreeSet<ItemId>,
    pub archived: BTreeSet<ItemId>,
    pub orphaned: BTreeSet<ItemId>,
}

pub struct ReferenceResolver;

impl ReferenceResolver {
    /// Usage of any revision of `item_id`.
    pub fn usage<'a, I>(host_revisions: I, item_id: ItemId) -> Usage
    where
        I: IntoIterator<Item = &'a HostRevision>,
    {
        Self::usage_by(host_revisions, |r| r.references_item(item_id))
    }

    /// Usage of exactly one child revision.
    pub fn revision_usage<'a, I>(host_revisions: I, reference: ChildReference) -> Usage
    where
        I: IntoIterator<Item = &'a HostRevision>,
    {
        Self::usage_by(host_revisions, |r| r.references_revision(reference))
    }

    /// Group `items` by usage. Items that none of the revisions reference
    /// are orphaned.
    pub fn classify<'a, I>(host_revisions: I, items: &[ItemId]) -> Classification
    where
        I: IntoIterator<Item = &'a HostRevision>,
        I::IntoIter: Clone,
    {
        let revisions = host_revisions.into_iter();
        let mut classification = Classification::default();

        for &item_id in items {
            match Self::usage(revisions.clone(), item_id) {
                Usage::UsedByDefault => classification.in_use.insert(item_id),
                Usage::UsedByNonDefaultOnly => classification.archived.insert(item_id),
                Usage::Unused => classification.orphaned.insert(item_id),
            };
        }

        classification
    }

    /// Items referenced by any of the revisions.
    pub fn referenced_items<'a, I>(host_revisions: I) -> BTreeSet<ItemId>
    where
        I: IntoIterator<Item = &'a HostRevision>,
    {
        host_revisions
            .into_iter()
            .flat_map(|r| r.all_references().map(|c| c.item_id))
            .collect()
    }

    fn usage_by<'a, I, F>(host_revisions: I, references: F) -> Usage
    where
        I: IntoIterator<Item = &'a HostRevision>,
        F: Fn(&HostRevision) -> bool,
    {
        let mut usage = Usage::Unused;
        for revision in host_revisions {
            if !references(revision) {
                continue;
            }
            if revision.is_default {
                return Usage::UsedByDefault;
            }
            usage = Usage::UsedByNonDefaultOnly;
        }
        usage
    }
}
