//! Disposition of children whose references changed.

use crate::error::{Result, TetherError};
use crate::events::LifecycleEvent;
use crate::resolver::{ReferenceResolver, Usage};
use crate::revisions::RevisionStore;
use crate::store::CascadePolicy;
use crate::transaction::Transaction;
use crate::types::{ChildReference, HostRef, ItemId};

/// Bring `item_id` in line with how the revisions of `host` reference it:
/// delete it when unused, archive it when only history keeps it, restore
/// it when the default revision references it.
pub(super) fn dispose(
    tx: &mut Transaction<'_>,
    host: &HostRef,
    item_id: ItemId,
    cascade: CascadePolicy,
) -> Result<Usage> {
    if !tx.revisions().contains(item_id) {
        return Ok(Usage::Unused);
    }

    let usage = ReferenceResolver::usage(&tx.host_revisions(host), item_id);
    match usage {
        Usage::Unused => delete_child(tx, item_id, cascade)?,
        Usage::UsedByNonDefaultOnly => set_archived(tx, host, item_id, true)?,
        Usage::UsedByDefault => set_archived(tx, host, item_id, false)?,
    }
    Ok(usage)
}

fn set_archived(
    tx: &mut Transaction<'_>,
    host: &HostRef,
    item_id: ItemId,
    archived: bool,
) -> Result<()> {
    let current = tx
        .revisions()
        .item(item_id)
        .map(|r| r.archived)
        .unwrap_or(archived);
    if current == archived {
        return Ok(());
    }

    tx.mark_archived(item_id, archived)?;
    if archived {
        tracing::debug!(item_id = %item_id, host = %host, "archived child");
        tx.emit(LifecycleEvent::ChildArchived {
            host: host.clone(),
            item_id,
        });
    } else {
        tracing::debug!(item_id = %item_id, host = %host, "restored child");
        tx.emit(LifecycleEvent::ChildRestored {
            host: host.clone(),
            item_id,
        });
    }
    Ok(())
}

/// Delete every revision of a child. Refused if any host revision still
/// references it.
pub(super) fn delete_child(
    tx: &mut Transaction<'_>,
    item_id: ItemId,
    cascade: CascadePolicy,
) -> Result<()> {
    let Some(host) = tx.revisions().item(item_id).map(|r| r.host()) else {
        return Ok(());
    };

    if let Some(host) = &host {
        if let Some(revision) = tx
            .host_revisions(host)
            .into_iter()
            .find(|r| r.references_item(item_id))
        {
            tracing::error!(
                item_id = %item_id,
                host = %host,
                host_revision_id = %revision.host_revision_id,
                "refusing to delete a referenced child"
            );
            return Err(TetherError::OrphanDeleteConflict {
                item_id,
                host: host.clone(),
                host_revision_id: revision.host_revision_id,
            });
        }
    }

    tx.delete_entity(item_id)?;
    tracing::debug!(item_id = %item_id, "deleted child");
    tx.emit(LifecycleEvent::ChildDeleted { host, item_id });

    if cascade == CascadePolicy::Recursive {
        delete_host(tx, &HostRef::child_as_host(item_id), cascade)?;
    }
    Ok(())
}

/// Delete a host's revisions and every child it owns, unconditionally.
/// Returns the number of children deleted; zero for an unknown host.
pub(super) fn delete_host(
    tx: &mut Transaction<'_>,
    host: &HostRef,
    cascade: CascadePolicy,
) -> Result<usize> {
    let items = tx.revisions().items_of_host(host);
    if items.is_empty() && !tx.hosts().contains(host) {
        return Ok(0);
    }

    tx.delete_host(host)?;
    for &item_id in &items {
        tx.delete_entity(item_id)?;
        tx.emit(LifecycleEvent::ChildDeleted {
            host: Some(host.clone()),
            item_id,
        });
        if cascade == CascadePolicy::Recursive {
            delete_host(tx, &HostRef::child_as_host(item_id), cascade)?;
        }
    }

    tracing::debug!(host = %host, children = items.len(), "deleted host");
    tx.emit(LifecycleEvent::HostDeleted { host: host.clone() });
    Ok(items.len())
}

/// Remove every reference matching `unlink` from the revisions of `host`,
/// in place. Returns how many host revisions changed.
pub(super) fn strip_links<F>(tx: &mut Transaction<'_>, host: &HostRef, unlink: F) -> Result<usize>
where
    F: Fn(&ChildReference) -> bool,
{
    let mut changed = 0;
    for mut revision in tx.host_revisions(host) {
        if !revision.all_references().any(&unlink) {
            continue;
        }
        for references in revision.fields.values_mut() {
            references.retain(|r| !unlink(r));
        }
        revision.fields.retain(|_, references| !references.is_empty());
        tx.put_host_revision(revision)?;
        changed += 1;
    }
    Ok(changed)
}

/// Delete revisions of `item_id` that `removed` referenced and that no
/// remaining host revision references. The item keeps at least one
/// revision.
pub(super) fn prune_revisions(
    tx: &mut Transaction<'_>,
    host: &HostRef,
    removed: &[ChildReference],
    item_id: ItemId,
) -> Result<usize> {
    let remaining = tx.host_revisions(host);
    let mut pruned = 0;

    for reference in removed.iter().filter(|r| r.item_id == item_id) {
        let revision_ids = tx.revision_ids(item_id);
        if revision_ids.len() <= 1 || !revision_ids.contains(&reference.revision_id) {
            continue;
        }
        if ReferenceResolver::revision_usage(&remaining, *reference) != Usage::Unused {
            continue;
        }
        tx.delete_revision(item_id, reference.revision_id)?;
        tracing::debug!(
            item_id = %item_id,
            revision_id = %reference.revision_id,
            "pruned child revision"
        );
        pruned += 1;
    }
    Ok(pruned)
}
