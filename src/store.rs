//! Main Store struct tying all components together.

use crate::error::{Result, TetherError};
use crate::events::{EventBus, EventFilter, Subscription, SubscriptionId};
use crate::journal::{Journal, MAX_FRAME_LEN};
use crate::transaction::{StoreState, Transaction};
use crate::types::{ChildEntity, HostRef, HostRevision, ItemId, RevisionId};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

/// How many children one field of a host may hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cardinality {
    Limited(usize),
    Unlimited,
}

impl Cardinality {
    pub fn allows(self, count: usize) -> bool {
        match self {
            Cardinality::Limited(limit) => count <= limit,
            Cardinality::Unlimited => true,
        }
    }
}

/// Per-field settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSettings {
    pub cardinality: Cardinality,
}

impl FieldSettings {
    pub fn limited(limit: usize) -> Self {
        Self {
            cardinality: Cardinality::Limited(limit),
        }
    }
}

/// Whether deleting a child also deletes the children it hosts itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CascadePolicy {
    #[default]
    Shallow,
    Recursive,
}

/// When a saved host revision gives its children new revisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NewRevisionPolicy {
    /// Only children whose payload changed.
    #[default]
    OnChange,
    /// Every child the host lists.
    Always,
}

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync the journal on every commit.
    pub sync_every_commit: bool,

    /// Settings per field (bundle).
    pub fields: HashMap<String, FieldSettings>,

    /// Cardinality of fields without settings.
    pub default_cardinality: Cardinality,

    pub cascade: CascadePolicy,

    pub new_revision_policy: NewRevisionPolicy,

    /// Buffered events per subscriber before it is dropped.
    pub event_buffer: usize,

    /// Largest encoded journal entry. A commit over it fails and rolls
    /// back; compaction spreads its snapshot over several entries.
    pub max_entry_bytes: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            create_if_missing: true,
            sync_every_commit: true,
            fields: HashMap::new(),
            default_cardinality: Cardinality::Unlimited,
            cascade: CascadePolicy::Shallow,
            new_revision_policy: NewRevisionPolicy::OnChange,
            event_buffer: 1024,
            max_entry_bytes: MAX_FRAME_LEN,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, bundle: impl Into<String>, settings: FieldSettings) -> Self {
        self.fields.insert(bundle.into(), settings);
        self
    }

    pub fn cardinality(&self, bundle: &str) -> Cardinality {
        self.fields
            .get(bundle)
            .map(|f| f.cardinality)
            .unwrap_or(self.default_cardinality)
    }
}

/// Store statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreStats {
    pub items: usize,
    pub revisions: usize,
    pub hosts: usize,
    pub journal_entries: usize,
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"TTH\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const JOURNAL_FILE: &str = "journal.log";

/// Durable home of child revisions and host revisions.
///
/// All writes happen inside a [`Transaction`]; reads take a shared lock
/// and never observe an uncommitted transaction.
pub struct Store {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    state: RwLock<StoreState>,

    journal: Mutex<Journal>,

    events: EventBus,
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(TetherError::StoreUnavailable(format!(
                "no store at {}",
                config.path.display()
            )))
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let (journal, _) = Journal::open(config.path.join(JOURNAL_FILE), config.sync_every_commit)?;
        let journal = journal.with_entry_limit(config.max_entry_bytes);
        tracing::info!(path = %config.path.display(), "created store");

        Ok(Self::assemble(config, lock_file, StoreState::new(), journal))
    }

    /// Open an existing store, replaying its journal.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let (journal, entries) =
            Journal::open(config.path.join(JOURNAL_FILE), config.sync_every_commit)?;
        let journal = journal.with_entry_limit(config.max_entry_bytes);

        let mut state = StoreState::new();
        for entry in &entries {
            for mutation in &entry.mutations {
                state.apply(mutation).map_err(|e| {
                    TetherError::Corruption(format!("journal entry {} does not apply: {}", entry.seq, e))
                })?;
            }
        }

        tracing::info!(
            path = %config.path.display(),
            entries = entries.len(),
            items = state.revisions.count(),
            hosts = state.hosts.count(),
            "opened store"
        );

        Ok(Self::assemble(config, lock_file, state, journal))
    }

    fn assemble(config: StoreConfig, lock_file: File, state: StoreState, journal: Journal) -> Self {
        let events = EventBus::new(config.event_buffer);
        Self {
            config,
            _lock_file: lock_file,
            state: RwLock::new(state),
            journal: Mutex::new(journal),
            events,
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // --- Transactions ---

    /// Start a transaction. Blocks while another one is running. Events
    /// returned by its commit are left to the caller.
    pub fn begin(&self) -> Transaction<'_> {
        Transaction::begin(self.state.write(), &self.journal)
    }

    /// Run `f` in a transaction. Commits if it returns `Ok`, rolls every
    /// change back if it returns `Err`. Events are published after commit.
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T>,
    {
        let mut tx = self.begin();
        match f(&mut tx) {
            Ok(value) => {
                let events = tx.commit()?;
                self.events.publish(&events);
                Ok(value)
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    mutations = tx.mutations().len(),
                    "transaction rolled back"
                );
                tx.rollback();
                Err(e)
            }
        }
    }

    // --- Reads ---

    pub fn get(&self, item_id: ItemId, revision_id: RevisionId) -> Result<ChildEntity> {
        self.state.read().revisions.get(item_id, revision_id)
    }

    /// Default revision of a child.
    pub fn get_child(&self, item_id: ItemId) -> Result<ChildEntity> {
        self.state.read().revisions.get_default(item_id)
    }

    pub fn contains(&self, item_id: ItemId) -> bool {
        self.state.read().revisions.contains(item_id)
    }

    pub fn revision_ids(&self, item_id: ItemId) -> Vec<RevisionId> {
        self.state.read().revisions.revision_ids(item_id)
    }

    /// Children of `bundle` in the default revision of `host`, in delta
    /// order, at the exact revisions referenced.
    pub fn children(&self, host: &HostRef, bundle: &str) -> Result<Vec<ChildEntity>> {
        let state = self.state.read();
        let Some(revision) = state.hosts.default_revision(host) else {
            return Ok(Vec::new());
        };
        revision
            .references(bundle)
            .iter()
            .map(|r| state.revisions.get(r.item_id, r.revision_id))
            .collect()
    }

    /// Items owned by `host`, whether referenced or not.
    pub fn items_of_host(&self, host: &HostRef) -> Vec<ItemId> {
        self.state.read().revisions.items_of_host(host)
    }

    /// Children still waiting for their host to obtain an identity. Empty
    /// outside of a running save.
    pub fn provisional_items(&self) -> Vec<ItemId> {
        self.state.read().revisions.provisional_items()
    }

    /// Every stored revision of `host`, oldest first.
    pub fn host_revisions(&self, host: &HostRef) -> Vec<HostRevision> {
        self.state.read().hosts.revisions(host)
    }

    pub fn default_host_revision(&self, host: &HostRef) -> Option<HostRevision> {
        self.state.read().hosts.default_revision(host).cloned()
    }

    pub fn hosts(&self) -> Vec<HostRef> {
        self.state.read().hosts.hosts()
    }

    pub fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            items: state.revisions.count(),
            revisions: state.revisions.revision_count(),
            hosts: state.hosts.count(),
            journal_entries: self.journal.lock().entry_count(),
        }
    }

    // --- Events ---

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.events.subscribe(filter)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id)
    }

    // --- Maintenance ---

    /// Rewrite the journal as the fewest entries that rebuild the current
    /// state.
    pub fn compact(&self) -> Result<()> {
        let state = self.state.write();
        let snapshot = state.snapshot();
        let mut journal = self.journal.lock();
        let before = journal.entry_count();
        journal.rewrite(&snapshot)?;
        tracing::info!(
            before,
            after = journal.entry_count(),
            mutations = snapshot.len(),
            "compacted journal"
        );
        Ok(())
    }

    // --- Internal ---

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(TetherError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(TetherError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| TetherError::Locked)?;

        Ok(lock_file)
    }
}
