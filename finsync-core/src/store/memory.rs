//! In-process store: one frame per collection behind a lock.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::NaiveDate;

use super::{DocumentStore, Filter};
use crate::error::DataError;
use crate::frame::{self, TableFrame};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, TableFrame>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a whole collection.
    pub fn collection(&self, name: &str) -> Option<TableFrame> {
        self.read().ok()?.get(name).cloned()
    }

    /// Replace a collection wholesale; used when loading from disk.
    pub fn put(&self, name: &str, frame: TableFrame) -> Result<(), DataError> {
        self.write()?.insert(name.to_string(), frame);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().map(|c| c.contains_key(name)).unwrap_or(false)
    }

    /// Merge `frame` into `collection` and return the merged result.
    pub(crate) fn merge(
        &self,
        collection: &str,
        frame: &TableFrame,
        keys: &[String],
    ) -> Result<TableFrame, DataError> {
        let mut collections = self.write()?;
        let merged = frame::upsert(collections.get(collection), frame, keys)?;
        collections.insert(collection.to_string(), merged.clone());
        Ok(merged)
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, TableFrame>>, DataError> {
        self.collections
            .read()
            .map_err(|_| DataError::Storage("memory store lock poisoned".into()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, TableFrame>>, DataError> {
        self.collections
            .write()
            .map_err(|_| DataError::Storage("memory store lock poisoned".into()))
    }
}

impl DocumentStore for MemoryStore {
    fn query(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Option<&[String]>,
    ) -> Result<Option<TableFrame>, DataError> {
        let collections = self.read()?;
        let Some(df) = collections.get(collection) else {
            return Ok(None);
        };
        let mut hit = frame::filter_rows(df, filter)?;
        if hit.height() == 0 {
            return Ok(None);
        }
        if let Some(fields) = fields {
            hit = frame::project(&hit, fields)?;
        }
        Ok(Some(hit))
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
        self.merge(collection, frame, keys)?;
        Ok(true)
    }

    fn range_of(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<(Option<NaiveDate>, Option<NaiveDate>), DataError> {
        let collections = self.read()?;
        let Some(df) = collections.get(collection) else {
            return Ok((None, None));
        };
        let hit = frame::filter_rows(df, filter)?;
        frame::date_bounds(&hit, field)
    }

    fn distinct_values(&self, collection: &str, field: &str) -> Result<Vec<String>, DataError> {
        let collections = self.read()?;
        match collections.get(collection) {
            Some(df) => frame::distinct_text(df, field),
            None => Ok(Vec::new()),
        }
    }
}
