//! RocksDB-backed task store: a durable [`LockJournal`] plus
//! [`TaskCatalog`] in one keyspace.
//!
//! Layout: three column families. `leases` holds one record per
//! `(task, version, interval)` keyed so that a prefix scan over a task id
//! yields its leases in version order; `tasks` holds active task
//! descriptors; `metadata` holds the storage manifest that guards against
//! opening a database written by an incompatible version.

use crate::errors::CoordError;
use crate::journal::LockJournal;
use crate::journal::TaskCatalog;
use crate::model::{Lease, Task, TaskId};
use anyhow::{anyhow, Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

const CF_LEASES: &str = "leases";
const CF_TASKS: &str = "tasks";
const CF_METADATA: &str = "metadata";

const KEY_MANIFEST: &[u8] = b"manifest";
const STORAGE_FORMAT_VERSION: u32 = 1;

/// Key component separator; never appears in version strings or millis.
const SEP: u8 = 0x00;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

pub struct PersistentTaskStore {
    db: DB,
}

impl PersistentTaskStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoordError> {
        let db = open_db(path.as_ref()).map_err(|source| CoordError::JournalFailure { source })?;
        validate_or_init_manifest(&db).map_err(|source| CoordError::JournalFailure { source })?;
        Ok(Self { db })
    }

    /// Register an active task. Overwrites any previous descriptor.
    pub fn store_task(&self, task: &Task) -> Result<(), CoordError> {
        let value = serde_json::to_vec(task)
            .context("serialize task")
            .map_err(|source| CoordError::JournalFailure { source })?;
        self.db
            .put_cf(self.cf(CF_TASKS), task.id.0.as_bytes(), value)
            .context("store task")
            .map_err(|source| CoordError::JournalFailure { source })
    }

    /// Drop a task descriptor; its lease records are removed with it.
    pub fn remove_task(&self, id: &TaskId) -> Result<(), CoordError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_TASKS), id.0.as_bytes());
        for key in self.lease_keys_for_task(id)? {
            batch.delete_cf(self.cf(CF_LEASES), key);
        }
        self.db
            .write(batch)
            .context("remove task")
            .map_err(|source| CoordError::JournalFailure { source })
    }

    fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(name)
            .expect("column family is created at open")
    }

    fn lease_key(task_id: &TaskId, lease: &Lease) -> Vec<u8> {
        let mut key = Vec::with_capacity(task_id.0.len() + lease.version.len() + 40);
        key.extend_from_slice(task_id.0.as_bytes());
        key.push(SEP);
        key.extend_from_slice(lease.version.as_bytes());
        key.push(SEP);
        key.extend_from_slice(&lease.interval.start.to_be_bytes());
        key.extend_from_slice(&lease.interval.end.to_be_bytes());
        key
    }

    fn task_prefix(task_id: &TaskId) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(task_id.0.len() + 1);
        prefix.extend_from_slice(task_id.0.as_bytes());
        prefix.push(SEP);
        prefix
    }

    fn lease_keys_for_task(&self, task_id: &TaskId) -> Result<Vec<Vec<u8>>, CoordError> {
        let prefix = Self::task_prefix(task_id);
        let mut keys = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_LEASES),
            IteratorMode::From(&prefix, Direction::Forward),
        );
        for entry in iter {
            let (key, _) = entry
                .context("scan leases")
                .map_err(|source| CoordError::JournalFailure { source })?;
            if !key.starts_with(&prefix) {
                break;
            }
            keys.push(key.to_vec());
        }
        Ok(keys)
    }
}

impl LockJournal for PersistentTaskStore {
    fn append(&self, task_id: &TaskId, lease: &Lease) -> Result<(), CoordError> {
        let value = serde_json::to_vec(lease)
            .context("serialize lease")
            .map_err(|source| CoordError::JournalFailure { source })?;
        self.db
            .put_cf(self.cf(CF_LEASES), Self::lease_key(task_id, lease), value)
            .context("append lease")
            .map_err(|source| CoordError::JournalFailure { source })
    }

    fn replace(&self, task_id: &TaskId, old: &Lease, new: &Lease) -> Result<(), CoordError> {
        let value = serde_json::to_vec(new)
            .context("serialize lease")
            .map_err(|source| CoordError::JournalFailure { source })?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_LEASES), Self::lease_key(task_id, old));
        batch.put_cf(self.cf(CF_LEASES), Self::lease_key(task_id, new), value);
        self.db
            .write(batch)
            .context("replace lease")
            .map_err(|source| CoordError::JournalFailure { source })
    }

    fn remove(&self, task_id: &TaskId, lease: &Lease) -> Result<(), CoordError> {
        self.db
            .delete_cf(self.cf(CF_LEASES), Self::lease_key(task_id, lease))
            .context("remove lease")
            .map_err(|source| CoordError::JournalFailure { source })
    }

    fn leases_for_task(&self, task_id: &TaskId) -> Result<Vec<Lease>, CoordError> {
        let prefix = Self::task_prefix(task_id);
        let mut leases = Vec::new();
        let iter = self.db.iterator_cf(
            self.cf(CF_LEASES),
            IteratorMode::From(&prefix, Direction::Forward),
        );
        for entry in iter {
            let (key, value) = entry
                .context("scan leases")
                .map_err(|source| CoordError::JournalFailure { source })?;
            if !key.starts_with(&prefix) {
                break;
            }
            let lease: Lease = serde_json::from_slice(&value)
                .context("deserialize lease")
                .map_err(|source| CoordError::JournalFailure { source })?;
            leases.push(lease);
        }
        // Keys sort by version within the task prefix, but re-sorting keeps
        // the contract independent of the key encoding.
        leases.sort_by(|a, b| a.version.cmp(&b.version));
        Ok(leases)
    }
}

impl TaskCatalog for PersistentTaskStore {
    fn task_by_id(&self, id: &TaskId) -> Option<Task> {
        let value = self.db.get_cf(self.cf(CF_TASKS), id.0.as_bytes()).ok()??;
        serde_json::from_slice(&value).ok()
    }

    fn active_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .db
            .iterator_cf(self.cf(CF_TASKS), IteratorMode::Start)
            .filter_map(|entry| entry.ok())
            .filter_map(|(_, value)| serde_json::from_slice(&value).ok())
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        tasks
    }
}

fn open_db(path: &Path) -> Result<DB> {
    let mut opts = Options::default();
    opts.create_if_missing(true);
    opts.create_missing_column_families(true);

    let cf_descriptors = vec![
        ColumnFamilyDescriptor::new(CF_LEASES, Options::default()),
        ColumnFamilyDescriptor::new(CF_TASKS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
    ];
    DB::open_cf_descriptors(&opts, path, cf_descriptors)
        .with_context(|| format!("open task store at {}", path.display()))
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("metadata column family missing"))?;
    match db.get_cf(cf, KEY_MANIFEST)? {
        Some(bytes) => {
            let manifest: StorageManifest =
                serde_json::from_slice(&bytes).context("deserialize storage manifest")?;
            if manifest.format_version != STORAGE_FORMAT_VERSION {
                return Err(anyhow!(
                    "task store format version {} is not supported (expected {})",
                    manifest.format_version,
                    STORAGE_FORMAT_VERSION
                ));
            }
            Ok(())
        }
        None => {
            let manifest = StorageManifest {
                format_version: STORAGE_FORMAT_VERSION,
                app_version: env!("CARGO_PKG_VERSION").to_string(),
            };
            db.put_cf(cf, KEY_MANIFEST, serde_json::to_vec(&manifest)?)?;
            Ok(())
        }
    }
}
