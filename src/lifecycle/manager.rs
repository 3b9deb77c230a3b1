//! The lifecycle manager.

use super::dispose::{delete_child, delete_host, dispose, prune_revisions, strip_links};
use super::{AcceptProposed, ChildSpec, HostPersister, HostSave, SaveOutcome};
use crate::error::{Result, TetherError};
use crate::events::LifecycleEvent;
use crate::resolver::{ReferenceResolver, Usage};
use crate::revisions::RevisionStore;
use crate::store::{Cardinality, NewRevisionPolicy, Store, StoreConfig};
use crate::transaction::Transaction;
use crate::types::{
    ChildEntity, ChildReference, ChildState, HostRef, HostRevision, HostRevisionId, HostTarget,
    ItemId, RevisionId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Drives child entities through their lifecycle as hosts are saved and
/// deleted.
///
/// Each operation is one transaction on the underlying [`Store`].
pub struct LifecycleManager {
    store: Arc<Store>,
}

impl LifecycleManager {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // --- Host events ---

    /// Save one field of a host. New hosts get the id the store proposes.
    pub fn on_host_save(&self, save: HostSave) -> Result<SaveOutcome> {
        self.on_host_save_with(save, &mut AcceptProposed)
    }

    /// Save one field of a host. If the host is new, `persister` gives it
    /// its identity after the children are written; both commit together.
    pub fn on_host_save_with<P>(&self, save: HostSave, persister: &mut P) -> Result<SaveOutcome>
    where
        P: HostPersister + ?Sized,
    {
        let config = self.store.config();
        let outcome = self
            .store
            .transaction(|tx| save_field(tx, config, &save, persister))?;

        tracing::info!(
            host = %outcome.host,
            bundle = %save.bundle,
            host_revision_id = %outcome.host_revision_id,
            children = outcome.references.len(),
            new_revision = save.new_revision,
            "saved host"
        );
        Ok(outcome)
    }

    /// Delete a host and every child it ever owned. Returns the number of
    /// children deleted.
    pub fn on_host_delete(&self, host: &HostRef) -> Result<usize> {
        let cascade = self.store.config().cascade;
        let deleted = self
            .store
            .transaction(|tx| delete_host(tx, host, cascade))?;

        tracing::info!(host = %host, children = deleted, "deleted host");
        Ok(deleted)
    }

    /// Delete one non-default revision of a host. Children it referenced
    /// are deleted when nothing else references them; otherwise their
    /// revisions only it referenced are pruned.
    pub fn on_host_revision_delete(
        &self,
        host: &HostRef,
        host_revision_id: HostRevisionId,
    ) -> Result<()> {
        let cascade = self.store.config().cascade;
        self.store.transaction(|tx| {
            let revision = tx
                .hosts()
                .revision(host, host_revision_id)
                .cloned()
                .ok_or_else(|| {
                    TetherError::NotFound(format!("host {} revision {}", host, host_revision_id))
                })?;
            if revision.is_default {
                return Err(TetherError::DefaultHostRevision(
                    host.clone(),
                    host_revision_id,
                ));
            }

            tx.delete_host_revision(host, host_revision_id)?;
            tx.emit(LifecycleEvent::HostRevisionDeleted {
                host: host.clone(),
                host_revision_id,
            });

            let removed: Vec<ChildReference> = revision.all_references().copied().collect();
            let items: Vec<ItemId> =
                ReferenceResolver::referenced_items(std::iter::once(&revision))
                    .into_iter()
                    .collect();
            let classification = ReferenceResolver::classify(&tx.host_revisions(host), &items);

            for &item_id in &classification.orphaned {
                delete_child(tx, item_id, cascade)?;
            }
            for &item_id in classification.in_use.iter().chain(&classification.archived) {
                prune_revisions(tx, host, &removed, item_id)?;
                dispose(tx, host, item_id, cascade)?;
            }
            Ok(())
        })?;

        tracing::info!(host = %host, host_revision_id = %host_revision_id, "deleted host revision");
        Ok(())
    }

    // --- Child events ---

    /// Delete a child outside of a host save. Its references are removed
    /// from every revision of its host. Deleting a missing child is a no-op.
    pub fn on_child_explicit_delete(&self, item_id: ItemId) -> Result<()> {
        let cascade = self.store.config().cascade;
        self.store.transaction(|tx| {
            let Some(host) = tx.revisions().item(item_id).map(|r| r.host()) else {
                return Ok(());
            };

            match host {
                Some(host) => {
                    let unlinked = strip_links(tx, &host, |r| r.item_id == item_id)?;
                    tracing::debug!(item_id = %item_id, host = %host, unlinked, "unlinked child");
                    dispose(tx, &host, item_id, cascade)?;
                }
                None => delete_child(tx, item_id, cascade)?,
            }
            Ok(())
        })
    }

    /// Delete one revision of a child and every link to it. Deleting the
    /// last revision deletes the child.
    pub fn on_child_revision_delete(&self, item_id: ItemId, revision_id: RevisionId) -> Result<()> {
        let cascade = self.store.config().cascade;
        self.store.transaction(|tx| {
            let entity = tx.get(item_id, revision_id)?;
            let reference = ChildReference::new(item_id, revision_id);
            let host = entity.host();

            if let Some(host) = &host {
                strip_links(tx, host, |r| *r == reference)?;
            }

            if tx.revision_ids(item_id).len() == 1 {
                return delete_child(tx, item_id, cascade);
            }

            tx.delete_revision(item_id, revision_id)?;
            tracing::debug!(item_id = %item_id, revision_id = %revision_id, "deleted child revision");
            if let Some(host) = &host {
                dispose(tx, host, item_id, cascade)?;
            }
            Ok(())
        })
    }

    /// Append a new child to the end of a host's field, without a new host
    /// revision.
    pub fn attach_child<P>(
        &self,
        target: HostTarget,
        bundle: &str,
        payload: serde_json::Value,
        persister: &mut P,
    ) -> Result<ChildReference>
    where
        P: HostPersister + ?Sized,
    {
        let config = self.store.config();
        let outcome = self.store.transaction(|tx| {
            let mut save = HostSave::new(target, bundle);
            if let HostTarget::Existing(host) = &save.target {
                if let Some(revision) = tx.default_host_revision(host) {
                    save.children = revision
                        .references(bundle)
                        .iter()
                        .map(|r| ChildSpec::existing(r.item_id))
                        .collect();
                }
            }
            save.children.push(ChildSpec::new(payload));
            save_field(tx, config, &save, persister)
        })?;

        outcome
            .references
            .last()
            .copied()
            .ok_or_else(|| TetherError::Corruption("attached child was not referenced".into()))
    }

    /// Give a child a new revision carrying `payload` and point the host's
    /// default revision at it.
    pub fn update_child(&self, item_id: ItemId, payload: serde_json::Value) -> Result<ChildReference> {
        self.store.transaction(|tx| {
            let current = tx.get_default(item_id)?;
            let host = current.host();
            let reference = tx.put(ChildEntity { payload, ..current })?;

            if let Some(host) = &host {
                if let Some(mut revision) = tx.default_host_revision(host) {
                    let mut repointed = false;
                    for r in revision.fields.values_mut().flatten() {
                        if r.item_id == item_id {
                            r.revision_id = reference.revision_id;
                            repointed = true;
                        }
                    }
                    if repointed {
                        tx.put_host_revision(revision)?;
                    }
                }
            }

            tracing::debug!(item_id = %item_id, revision_id = %reference.revision_id, "revised child");
            tx.emit(LifecycleEvent::ChildRevised {
                host,
                child: reference,
            });
            Ok(reference)
        })
    }

    // --- Queries ---

    pub fn child_state(&self, item_id: ItemId) -> ChildState {
        match self.store.get_child(item_id) {
            Ok(entity) if entity.archived => ChildState::Archived,
            Ok(_) => ChildState::Active,
            Err(_) => ChildState::Deleted,
        }
    }

    /// Whether the default revision of the child's host references it.
    pub fn is_in_use(&self, item_id: ItemId) -> bool {
        self.host_of(item_id)
            .map(|host| {
                ReferenceResolver::usage(&self.store.host_revisions(&host), item_id)
                    == Usage::UsedByDefault
            })
            .unwrap_or(false)
    }

    pub fn host_of(&self, item_id: ItemId) -> Option<HostRef> {
        self.store.get_child(item_id).ok().and_then(|e| e.host())
    }

    /// References of `bundle` in the host's default revision.
    pub fn references(&self, host: &HostRef, bundle: &str) -> Vec<ChildReference> {
        self.store
            .default_host_revision(host)
            .map(|r| r.references(bundle).to_vec())
            .unwrap_or_default()
    }

    pub fn default_host_revision(&self, host: &HostRef) -> Option<HostRevision> {
        self.store.default_host_revision(host)
    }

    pub fn host_revisions(&self, host: &HostRef) -> Vec<HostRevision> {
        self.store.host_revisions(host)
    }

    pub fn children(&self, host: &HostRef, bundle: &str) -> Result<Vec<ChildEntity>> {
        self.store.children(host, bundle)
    }
}

fn check_cardinality(config: &StoreConfig, save: &HostSave) -> Result<()> {
    let cardinality = config.cardinality(&save.bundle);
    let count = save.children.len();
    if let Cardinality::Limited(limit) = cardinality {
        if !cardinality.allows(count) {
            let host = match &save.target {
                HostTarget::Existing(host) => host.to_string(),
                HostTarget::New { host_type } => format!("new {}", host_type),
            };
            tracing::debug!(host = %host, bundle = %save.bundle, count, limit, "too many children");
            return Err(TetherError::CardinalityExceeded {
                host,
                bundle: save.bundle.clone(),
                count,
                limit,
            });
        }
    }
    Ok(())
}

/// A persisted child may hold one position of a field only.
fn check_duplicates(save: &HostSave) -> Result<()> {
    let mut seen = BTreeSet::new();
    for item_id in save.children.iter().filter_map(ChildSpec::item_id) {
        if !seen.insert(item_id) {
            return Err(TetherError::DuplicateChild {
                item_id,
                bundle: save.bundle.clone(),
            });
        }
    }
    Ok(())
}

/// The whole of a host save, run inside `tx`.
fn save_field<P>(
    tx: &mut Transaction<'_>,
    config: &StoreConfig,
    save: &HostSave,
    persister: &mut P,
) -> Result<SaveOutcome>
where
    P: HostPersister + ?Sized,
{
    check_cardinality(config, save)?;
    check_duplicates(save)?;

    let host_type = save.target.host_type().to_string();
    let known_host = match &save.target {
        HostTarget::Existing(host) => Some(host.clone()),
        HostTarget::New { .. } => None,
    };
    let previous = known_host.as_ref().and_then(|h| tx.default_host_revision(h));

    // Phase 1: children, with the host id left open for a new host.
    let mut references = Vec::with_capacity(save.children.len());
    let mut created = Vec::new();
    let mut revised = Vec::new();

    for (delta, spec) in save.children.iter().enumerate() {
        let reference = match spec {
            ChildSpec::New { payload } => {
                let mut entity =
                    ChildEntity::with_payload(save.bundle.clone(), host_type.clone(), payload.clone());
                entity.host_id = known_host.as_ref().map(|h| h.host_id);
                let reference = tx.put(entity)?;
                tracing::debug!(delta, item_id = %reference.item_id, "created child");
                created.push(reference);
                reference
            }
            ChildSpec::Existing { item_id } => {
                keep_child(tx, config, save, known_host.as_ref(), *item_id, None, &mut revised)?
            }
            ChildSpec::Updated { item_id, payload } => keep_child(
                tx,
                config,
                save,
                known_host.as_ref(),
                *item_id,
                Some(payload),
                &mut revised,
            )?,
        };
        references.push(reference);
    }

    // Phase 2: the host's identity.
    let host = match known_host {
        Some(host) => {
            if !tx.hosts().contains(&host) {
                tx.register_host(host.clone())?;
            }
            host
        }
        None => {
            let proposed = tx.peek_host_id();
            let host_id = persister.persist_host(&host_type, proposed)?;
            let host = HostRef::new(host_type.clone(), host_id);
            if host_id.0 == 0 || tx.hosts().contains(&host) {
                return Err(TetherError::HostUnresolved(format!(
                    "persister returned unusable id {} for a new {}",
                    host_id, host_type
                )));
            }
            tx.register_host(host.clone())?;
            for reference in &created {
                tx.finalize_host(reference.item_id, host_id)?;
            }
            tracing::debug!(host = %host, children = created.len(), "resolved new host");
            host
        }
    };

    // The host's reference list.
    let previous_items: BTreeSet<ItemId> = previous
        .as_ref()
        .map(|r| r.references(&save.bundle).iter().map(|c| c.item_id).collect())
        .unwrap_or_default();

    let mut fields: BTreeMap<String, Vec<ChildReference>> = previous
        .as_ref()
        .map(|r| r.fields.clone())
        .unwrap_or_default();
    if references.is_empty() {
        fields.remove(&save.bundle);
    } else {
        fields.insert(save.bundle.clone(), references.clone());
    }

    let new_revision = save.new_revision || previous.is_none();
    let host_revision_id = match previous.filter(|_| !save.new_revision) {
        Some(mut revision) => {
            revision.fields = fields;
            let id = revision.host_revision_id;
            tx.put_host_revision(revision)?;
            id
        }
        None => tx.create_host_revision(&host, fields)?.host_revision_id,
    };

    // Disposition of every child the field referenced before or now.
    let cascade = config.cascade;
    let affected: BTreeSet<ItemId> = previous_items
        .into_iter()
        .chain(references.iter().map(|r| r.item_id))
        .collect();
    for item_id in affected {
        dispose(tx, &host, item_id, cascade)?;
    }

    for child in created {
        tx.emit(LifecycleEvent::ChildCreated {
            host: Some(host.clone()),
            bundle: save.bundle.clone(),
            child,
        });
    }
    for child in revised {
        tx.emit(LifecycleEvent::ChildRevised {
            host: Some(host.clone()),
            child,
        });
    }
    tx.emit(LifecycleEvent::HostSaved {
        host: host.clone(),
        host_revision_id,
        new_revision,
    });

    Ok(SaveOutcome {
        host,
        host_revision_id,
        references,
    })
}

/// Re-reference a persisted child, giving it a new revision or updating
/// it in place as the save requires.
fn keep_child(
    tx: &mut Transaction<'_>,
    config: &StoreConfig,
    save: &HostSave,
    host: Option<&HostRef>,
    item_id: ItemId,
    payload: Option<&serde_json::Value>,
    revised: &mut Vec<ChildReference>,
) -> Result<ChildReference> {
    let current = tx.get_default(item_id)?;
    let owner = current.host();
    let Some(host) = host.filter(|h| owner.as_ref() == Some(*h)) else {
        let host = host
            .cloned()
            .unwrap_or_else(|| HostRef::new(save.target.host_type(), tx.peek_host_id()));
        return Err(TetherError::HostMismatch { item_id, host });
    };
    if current.bundle != save.bundle {
        return Err(TetherError::BundleMismatch {
            item_id,
            bundle: save.bundle.clone(),
        });
    }

    let revision_id = current
        .revision_id
        .ok_or_else(|| TetherError::item_not_found(item_id))?;
    let changed = payload.is_some_and(|p| *p != current.payload);
    let fresh = save.new_revision
        && (changed || config.new_revision_policy == NewRevisionPolicy::Always);

    if fresh {
        let payload = payload.cloned().unwrap_or_else(|| current.payload.clone());
        let reference = tx.put(ChildEntity { payload, ..current })?;
        tracing::debug!(
            item_id = %item_id,
            host = %host,
            revision_id = %reference.revision_id,
            "new child revision"
        );
        revised.push(reference);
        return Ok(reference);
    }

    if changed {
        if let Some(payload) = payload {
            tx.overwrite_payload(item_id, revision_id, payload.clone())?;
            tracing::debug!(item_id = %item_id, host = %host, "updated child in place");
        }
    }
    Ok(ChildReference::new(item_id, revision_id))
}
