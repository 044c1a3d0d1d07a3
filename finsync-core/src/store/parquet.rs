//! Parquet-backed store: one file per collection.
//!
//! Layout: `{root}/{collection}.parquet`
//!
//! - Lazy load on first access, then served from memory
//! - Write-through on upsert; atomic writes (write to .tmp, fsync, rename)
//! - Integrity validation on load; corrupt files are quarantined
//!   (`{collection}.parquet.quarantined`) and the collection starts empty

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::NaiveDate;
use polars::prelude::*;
use tracing::{debug, warn};

use super::{DocumentStore, Filter, MemoryStore};
use crate::error::DataError;
use crate::frame::{self, TableFrame};

pub struct ParquetStore {
    root: PathBuf,
    cache: MemoryStore,
    io: Mutex<()>,
}

impl ParquetStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, DataError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| DataError::Storage(format!("failed to create {}: {e}", root.display())))?;
        Ok(Self {
            root,
            cache: MemoryStore::new(),
            io: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        let safe: String = collection
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.parquet"))
    }

    /// Names of the collections persisted under the root.
    pub fn collections(&self) -> Result<Vec<String>, DataError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| DataError::Storage(format!("read dir: {e}")))?;
        let mut names = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| DataError::Storage(format!("dir entry: {e}")))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn lock_io(&self) -> Result<MutexGuard<'_, ()>, DataError> {
        self.io
            .lock()
            .map_err(|_| DataError::Storage("parquet store lock poisoned".into()))
    }

    fn ensure_loaded(&self, collection: &str) -> Result<(), DataError> {
        if self.cache.contains(collection) {
            return Ok(());
        }
        let _guard = self.lock_io()?;
        self.load_locked(collection)
    }

    /// Caller holds `io`. An upsert that finished while we waited for the
    /// lock has already cached the merged frame, which must win over disk.
    fn load_locked(&self, collection: &str) -> Result<(), DataError> {
        if self.cache.contains(collection) {
            return Ok(());
        }
        let path = self.collection_path(collection);
        if !path.exists() {
            return Ok(());
        }

        match load_and_validate(&path) {
            Ok(df) => {
                debug!(collection, rows = df.height(), "loaded collection from disk");
                self.cache.put(collection, df)
            }
            Err(e) => {
                let quarantine = path.with_extension("parquet.quarantined");
                warn!(
                    path = %path.display(),
                    error = %e,
                    "quarantining corrupt collection file"
                );
                fs::rename(&path, &quarantine).map_err(|re| {
                    DataError::Storage(format!("failed to quarantine {}: {re}", path.display()))
                })
            }
        }
    }
}

impl DocumentStore for ParquetStore {
    fn query(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Option<&[String]>,
    ) -> Result<Option<TableFrame>, DataError> {
        self.ensure_loaded(collection)?;
        self.cache.query(collection, filter, fields)
    }

    fn upsert(
        &self,
        collection: &str,
        frame: &TableFrame,
        keys: &[String],
    ) -> Result<bool, DataError> {
        if frame.height() == 0 {
            return Ok(false);
        }
        let _guard = self.lock_io()?;
        self.load_locked(collection)?;

        let existing = self.cache.collection(collection);
        let mut merged = frame::upsert(existing.as_ref(), frame, keys)?;
        write_atomic(&mut merged, &self.collection_path(collection))?;
        self.cache.put(collection, merged)?;
        Ok(true)
    }

    fn range_of(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<(Option<NaiveDate>, Option<NaiveDate>), DataError> {
        self.ensure_loaded(collection)?;
        self.cache.range_of(collection, field, filter)
    }

    fn distinct_values(&self, collection: &str, field: &str) -> Result<Vec<String>, DataError> {
        self.ensure_loaded(collection)?;
        self.cache.distinct_values(collection, field)
    }
}

fn write_atomic(df: &mut DataFrame, path: &Path) -> Result<(), DataError> {
    let tmp_path = path.with_extension("parquet.tmp");
    let mut file = fs::File::create(&tmp_path)
        .map_err(|e| DataError::Storage(format!("create {}: {e}", tmp_path.display())))?;
    ParquetWriter::new(&mut file)
        .finish(df)
        .map_err(|e| DataError::Storage(format!("write parquet: {e}")))?;
    file.sync_all()
        .map_err(|e| DataError::Storage(format!("fsync: {e}")))?;

    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        DataError::Storage(format!("atomic rename failed: {e}"))
    })
}

fn load_and_validate(path: &Path) -> Result<DataFrame, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::Storage(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::Storage(format!("read: {e}")))?;

    if df.width() == 0 {
        return Err(DataError::Validation("parquet file has no columns".into()));
    }
    Ok(df)
}
