//! Host revisions and the reference lists they store.

use crate::error::{Result, TetherError};
use crate::types::{HostId, HostRef, HostRevision, HostRevisionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// All stored revisions of one host.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub revisions: BTreeMap<HostRevisionId, HostRevision>,
}

impl HostRecord {
    pub fn default_revision(&self) -> Option<&HostRevision> {
        self.revisions.values().find(|r| r.is_default)
    }
}

/// Id counters for hosts and host revisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostCounters {
    pub next_host_id: u64,
    pub next_host_revision_id: u64,
}

/// Index of host revisions keyed by host.
pub struct HostIndex {
    hosts: HashMap<HostRef, HostRecord>,
    counters: HostCounters,
}

impl Default for HostIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl HostIndex {
    pub fn new() -> Self {
        Self {
            hosts: HashMap::new(),
            counters: HostCounters {
                next_host_id: 1,
                next_host_revision_id: 1,
            },
        }
    }

    pub fn host(&self, host: &HostRef) -> Option<&HostRecord> {
        self.hosts.get(host)
    }

    pub fn contains(&self, host: &HostRef) -> bool {
        self.hosts.contains_key(host)
    }

    /// Revisions of a host, oldest first.
    pub fn revisions(&self, host: &HostRef) -> Vec<HostRevision> {
        self.hosts
            .get(host)
            .map(|r| r.revisions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn revision(&self, host: &HostRef, id: HostRevisionId) -> Option<&HostRevision> {
        self.hosts.get(host)?.revisions.get(&id)
    }

    pub fn default_revision(&self, host: &HostRef) -> Option<&HostRevision> {
        self.hosts.get(host)?.default_revision()
    }

    pub fn hosts(&self) -> Vec<HostRef> {
        let mut hosts: Vec<_> = self.hosts.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn count(&self) -> usize {
        self.hosts.len()
    }

    pub fn counters(&self) -> HostCounters {
        self.counters
    }

    pub fn restore_counters(&mut self, counters: HostCounters) {
        self.counters = counters;
    }

    /// Next unused host id.
    pub fn peek_host_id(&self) -> HostId {
        HostId(self.counters.next_host_id)
    }

    /// Next unused host revision id.
    pub fn peek_host_revision_id(&self) -> HostRevisionId {
        HostRevisionId(self.counters.next_host_revision_id)
    }

    // --- Mutation primitives ---

    /// Register a host identity. Existing hosts are left untouched.
    pub fn register(&mut self, host: &HostRef) {
        self.hosts.entry(host.clone()).or_default();
        self.counters.next_host_id = self.counters.next_host_id.max(host.host_id.0 + 1);
    }

    /// Insert or replace a host revision. A default revision demotes every
    /// other revision of the same host.
    pub fn put_revision(&mut self, revision: HostRevision) {
        let id = revision.host_revision_id;
        let host = revision.host();
        let record = self.hosts.entry(host.clone()).or_default();

        if revision.is_default {
            for other in record.revisions.values_mut() {
                other.is_default = false;
            }
        }
        record.revisions.insert(id, revision);

        self.counters.next_host_id = self.counters.next_host_id.max(host.host_id.0 + 1);
        self.counters.next_host_revision_id = self.counters.next_host_revision_id.max(id.0 + 1);
    }

    pub fn remove_revision(&mut self, host: &HostRef, id: HostRevisionId) -> Result<HostRevision> {
        self.hosts
            .get_mut(host)
            .and_then(|r| r.revisions.remove(&id))
            .ok_or_else(|| TetherError::NotFound(format!("host {} revision {}", host, id)))
    }

    /// Remove a host with all its revisions. No-op if absent.
    pub fn remove_host(&mut self, host: &HostRef) -> Option<HostRecord> {
        self.hosts.remove(host)
    }

    pub fn restore_host(&mut self, host: &HostRef, image: Option<HostRecord>) {
        match image {
            Some(record) => {
                self.hosts.insert(host.clone(), record);
            }
            None => {
                self.hosts.remove(host);
            }
        }
    }
}
