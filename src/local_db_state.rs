//! Persistent store on top of LMDB.
//!
//! [`AppDbState`] owns the LMDB environment and one named database per [`Table`] plus one
//! per secondary [`Index`]. Records are serde JSON values keyed by their id. Index keys
//! are `value \0 sort \0 primary-key` and map back to the primary key, so a prefix scan
//! over `value \0` yields a table's records in `sort` order.
//!
//! This is the only module that touches LMDB. It knows nothing about versions, working
//! copies or conflicts; those rules live in the repository layers above it.

use std::fmt;
use std::path::{Path, PathBuf};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, RwTransaction, Transaction, WriteFlags};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::StoreConfig;
use crate::error::{ApdResult, ErrorContext, StorageError, StorageResultExt};

const MAX_DBS: u32 = 16;
const KEY_SEPARATOR: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Documents,
    Versions,
    WorkingCopies,
    FieldChanges,
    Projects,
    VersionTombstones,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Documents,
        Table::Versions,
        Table::WorkingCopies,
        Table::FieldChanges,
        Table::Projects,
        Table::VersionTombstones,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Documents => "documents",
            Self::Versions => "versions",
            Self::WorkingCopies => "working_copies",
            Self::FieldChanges => "field_changes",
            Self::Projects => "projects",
            Self::VersionTombstones => "version_tombstones",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Index {
    DocumentsByProject,
    DocumentsByUpdatedAt,
    VersionsByDocument,
    FieldChangesByDocument,
    TombstonesByDocument,
}

impl Index {
    pub const ALL: [Index; 5] = [
        Index::DocumentsByProject,
        Index::DocumentsByUpdatedAt,
        Index::VersionsByDocument,
        Index::FieldChangesByDocument,
        Index::TombstonesByDocument,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::DocumentsByProject => "idx_documents_project",
            Self::DocumentsByUpdatedAt => "idx_documents_updated_at",
            Self::VersionsByDocument => "idx_versions_document_sequence",
            Self::FieldChangesByDocument => "idx_field_changes_document_timestamp",
            Self::TombstonesByDocument => "idx_tombstones_document_sequence",
        }
    }

    pub fn table(self) -> Table {
        match self {
            Self::DocumentsByProject | Self::DocumentsByUpdatedAt => Table::Documents,
            Self::VersionsByDocument => Table::Versions,
            Self::FieldChangesByDocument => Table::FieldChanges,
            Self::TombstonesByDocument => Table::VersionTombstones,
        }
    }
}

/// One secondary index entry contributed by a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub index: Index,
    pub value: String,
    pub sort: String,
}

impl IndexEntry {
    pub fn new(index: Index, value: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            index,
            value: value.into(),
            sort: sort.into(),
        }
    }

    fn encode(&self, primary_key: &str) -> Vec<u8> {
        let mut key = index_prefix(&self.value);
        key.extend_from_slice(self.sort.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(primary_key.as_bytes());
        key
    }
}

fn index_prefix(value: &str) -> Vec<u8> {
    let mut prefix = value.as_bytes().to_vec();
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// A value stored in one table, keyed by [`Record::key`].
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: Table;

    fn key(&self) -> String;

    fn index_entries(&self) -> Vec<IndexEntry> {
        Vec::new()
    }
}

struct Databases {
    tables: [Database; 6],
    indexes: [Database; 5],
}

impl Databases {
    fn create(env: &Environment) -> Result<Self, StorageError> {
        let mut tables = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            tables.push(env.create_db(Some(table.name()), DatabaseFlags::empty())?);
        }
        let mut indexes = Vec::with_capacity(Index::ALL.len());
        for index in Index::ALL {
            indexes.push(env.create_db(Some(index.name()), DatabaseFlags::empty())?);
        }
        Ok(Self {
            tables: [tables[0], tables[1], tables[2], tables[3], tables[4], tables[5]],
            indexes: [indexes[0], indexes[1], indexes[2], indexes[3], indexes[4]],
        })
    }

    fn table(&self, table: Table) -> Database {
        self.tables[table as usize]
    }

    fn index(&self, index: Index) -> Database {
        self.indexes[index as usize]
    }

    fn all(&self) -> impl Iterator<Item = Database> + '_ {
        self.tables.iter().chain(self.indexes.iter()).copied()
    }
}

/// Handle on one open LMDB environment.
///
/// Construct one per process at startup and share it (`Arc`) with every component;
/// LMDB forbids opening the same environment twice in one process.
pub struct AppDbState {
    env: Environment,
    dbs: Databases,
    path: PathBuf,
}

impl AppDbState {
    pub fn open(config: &StoreConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.path)?;
        let env = Environment::new()
            .set_max_dbs(MAX_DBS)
            .set_max_readers(config.max_readers)
            .set_map_size(config.map_size_bytes)
            .open(&config.path)?;
        let dbs = Databases::create(&env)?;
        info!("Opened LMDB store at {}", config.path.display());
        Ok(Self {
            env,
            dbs,
            path: config.path.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get<R: Record>(&self, key: &str) -> Result<R, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        read_required(&txn, &self.dbs, key)
    }

    pub fn find<R: Record>(&self, key: &str) -> Result<Option<R>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        read_record(&txn, &self.dbs, key)
    }

    pub fn all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        read_all(&txn, &self.dbs)
    }

    pub fn query_by_index<R: Record>(
        &self,
        index: Index,
        value: &str,
    ) -> Result<Vec<R>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        read_index::<R, _>(&txn, &self.dbs, index, Some(value))
    }

    /// Every record reachable through `index`, in index order.
    pub fn scan_index<R: Record>(&self, index: Index) -> Result<Vec<R>, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        read_index::<R, _>(&txn, &self.dbs, index, None)
    }

    pub fn put<R: Record>(&self, record: &R) -> Result<(), StorageError> {
        let mut txn = self.env.begin_rw_txn()?;
        write_record(&mut txn, &self.dbs, record)?;
        txn.commit()?;
        Ok(())
    }

    pub fn delete<R: Record>(&self, key: &str) -> Result<bool, StorageError> {
        let mut txn = self.env.begin_rw_txn()?;
        let removed = remove_record::<R>(&mut txn, &self.dbs, key)?;
        txn.commit()?;
        Ok(removed)
    }

    /// Runs `f` inside one write transaction. Everything `f` wrote is committed when it
    /// returns `Ok`; nothing is when it returns `Err`.
    ///
    /// LMDB allows a single writer per environment, across processes too, so reads done
    /// inside `f` cannot be invalidated before the commit.
    pub fn transact<T>(
        &self,
        context: &ErrorContext,
        f: impl FnOnce(&mut StoreTxn<'_>) -> ApdResult<T>,
    ) -> ApdResult<T> {
        let txn = self
            .env
            .begin_rw_txn()
            .map_err(StorageError::from)
            .within(context)?;
        let mut store_txn = StoreTxn {
            txn,
            dbs: &self.dbs,
        };
        match f(&mut store_txn) {
            Ok(value) => {
                store_txn
                    .txn
                    .commit()
                    .map_err(StorageError::from)
                    .within(context)?;
                Ok(value)
            }
            Err(err) => {
                debug!("Aborting transaction for {context}: {err}");
                store_txn.txn.abort();
                Err(err)
            }
        }
    }

    /// Bytes held by keys and values across every table and index.
    pub fn usage_bytes(&self) -> Result<u64, StorageError> {
        let txn = self.env.begin_ro_txn()?;
        let mut total = 0u64;
        for db in self.dbs.all() {
            for (key, value) in scan_prefix(&txn, db, &[])? {
                total += (key.len() + value.len()) as u64;
            }
        }
        Ok(total)
    }

    /// Forces dirty pages to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.env.sync(true)?;
        Ok(())
    }

    /// Flushes and closes the environment.
    pub fn close_database(self) -> Result<(), StorageError> {
        let result = self.env.sync(true);
        if let Err(e) = &result {
            warn!("Final sync of {} failed: {e}", self.path.display());
        }
        info!("Closed LMDB store at {}", self.path.display());
        result.map_err(StorageError::from)
    }
}

/// A write transaction handed to [`AppDbState::transact`].
pub struct StoreTxn<'env> {
    txn: RwTransaction<'env>,
    dbs: &'env Databases,
}

impl StoreTxn<'_> {
    pub fn get<R: Record>(&self, key: &str) -> Result<R, StorageError> {
        read_required(&self.txn, self.dbs, key)
    }

    pub fn find<R: Record>(&self, key: &str) -> Result<Option<R>, StorageError> {
        read_record(&self.txn, self.dbs, key)
    }

    pub fn contains<R: Record>(&self, key: &str) -> Result<bool, StorageError> {
        Ok(read_raw(&self.txn, self.dbs.table(R::TABLE), key.as_bytes())?.is_some())
    }

    pub fn all<R: Record>(&self) -> Result<Vec<R>, StorageError> {
        read_all(&self.txn, self.dbs)
    }

    pub fn query_by_index<R: Record>(
        &self,
        index: Index,
        value: &str,
    ) -> Result<Vec<R>, StorageError> {
        read_index::<R, _>(&self.txn, self.dbs, index, Some(value))
    }

    pub fn put<R: Record>(&mut self, record: &R) -> Result<(), StorageError> {
        write_record(&mut self.txn, self.dbs, record)
    }

    pub fn delete<R: Record>(&mut self, key: &str) -> Result<bool, StorageError> {
        remove_record::<R>(&mut self.txn, self.dbs, key)
    }
}

fn read_raw<T: Transaction>(
    txn: &T,
    db: Database,
    key: &[u8],
) -> Result<Option<Vec<u8>>, StorageError> {
    match txn.get(db, &key) {
        Ok(bytes) => Ok(Some(bytes.to_vec())),
        Err(lmdb::Error::NotFound) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn decode<R: Record>(key: &str, bytes: &[u8]) -> Result<R, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::Corrupt {
        location: format!("{}/{key}", R::TABLE),
        reason: e.to_string(),
    })
}

fn read_record<R: Record, T: Transaction>(
    txn: &T,
    dbs: &Databases,
    key: &str,
) -> Result<Option<R>, StorageError> {
    match read_raw(txn, dbs.table(R::TABLE), key.as_bytes())? {
        Some(bytes) => decode(key, &bytes).map(Some),
        None => Ok(None),
    }
}

fn read_required<R: Record, T: Transaction>(
    txn: &T,
    dbs: &Databases,
    key: &str,
) -> Result<R, StorageError> {
    read_record(txn, dbs, key)?.ok_or_else(|| StorageError::NotFound {
        table: R::TABLE,
        key: key.to_owned(),
    })
}

fn read_all<R: Record, T: Transaction>(txn: &T, dbs: &Databases) -> Result<Vec<R>, StorageError> {
    scan_prefix(txn, dbs.table(R::TABLE), &[])?
        .into_iter()
        .map(|(key, value)| decode(&String::from_utf8_lossy(&key), &value))
        .collect()
}

fn read_index<R: Record, T: Transaction>(
    txn: &T,
    dbs: &Databases,
    index: Index,
    value: Option<&str>,
) -> Result<Vec<R>, StorageError> {
    debug_assert_eq!(index.table(), R::TABLE);
    let prefix = value.map(index_prefix).unwrap_or_default();
    let mut records = Vec::new();
    for (index_key, primary_key) in scan_prefix(txn, dbs.index(index), &prefix)? {
        let primary_key = String::from_utf8_lossy(&primary_key).into_owned();
        match read_record(txn, dbs, &primary_key)? {
            Some(record) => records.push(record),
            None => {
                return Err(StorageError::Corrupt {
                    location: format!("{}/{}", index.name(), String::from_utf8_lossy(&index_key)),
                    reason: format!("index points at missing record '{primary_key}'"),
                })
            }
        }
    }
    Ok(records)
}

fn scan_prefix<T: Transaction>(
    txn: &T,
    db: Database,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
    // Positioned iterators (`iter_start`, `iter_from`) panic on an empty range. A fresh
    // cursor's MDB_NEXT starts at the first key and ends cleanly.
    let mut cursor = txn.open_ro_cursor(db)?;
    let entries = cursor
        .iter()
        .skip_while(|(key, _)| *key < prefix)
        .take_while(|(key, _)| key.starts_with(prefix))
        .map(|(key, value)| (key.to_vec(), value.to_vec()))
        .collect();
    Ok(entries)
}

fn write_record<R: Record>(
    txn: &mut RwTransaction<'_>,
    dbs: &Databases,
    record: &R,
) -> Result<(), StorageError> {
    let key = record.key();
    remove_index_entries::<R>(txn, dbs, &key)?;

    let bytes = serde_json::to_vec(record).map_err(|e| StorageError::Corrupt {
        location: format!("{}/{key}", R::TABLE),
        reason: format!("record does not serialize: {e}"),
    })?;
    txn.put(dbs.table(R::TABLE), &key.as_bytes(), &bytes, WriteFlags::empty())?;
    for entry in record.index_entries() {
        txn.put(
            dbs.index(entry.index),
            &entry.encode(&key),
            &key.as_bytes(),
            WriteFlags::empty(),
        )?;
    }
    Ok(())
}

fn remove_record<R: Record>(
    txn: &mut RwTransaction<'_>,
    dbs: &Databases,
    key: &str,
) -> Result<bool, StorageError> {
    if !remove_index_entries::<R>(txn, dbs, key)? {
        return Ok(false);
    }
    txn.del(dbs.table(R::TABLE), &key.as_bytes(), None)?;
    Ok(true)
}

/// Drops the index entries of the currently stored record under `key`, if any.
fn remove_index_entries<R: Record>(
    txn: &mut RwTransaction<'_>,
    dbs: &Databases,
    key: &str,
) -> Result<bool, StorageError> {
    let Some(previous) = read_record::<R, _>(&*txn, dbs, key)? else {
        return Ok(false);
    };
    for entry in previous.index_entries() {
        match txn.del(dbs.index(entry.index), &entry.encode(key), None) {
            Ok(()) | Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}
