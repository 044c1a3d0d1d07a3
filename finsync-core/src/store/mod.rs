//! Storage collaborator contract.
//!
//! A document-store-like interface over named collections of table frames.
//! The sync engine only needs four operations from it; everything else about
//! the storage engine is left to the implementation.

pub mod memory;
pub mod parquet;

pub use memory::MemoryStore;
pub use parquet::ParquetStore;

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::DataError;
use crate::frame::TableFrame;
use crate::time::TimeRange;

/// A single value a filter can compare a cell against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Scalar {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Scalar::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Scalar::Date(d) => Some(*d),
            _ => None,
        }
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::Text(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::Text(s)
    }
}

impl From<f64> for Scalar {
    fn from(n: f64) -> Self {
        Scalar::Number(n)
    }
}

impl From<NaiveDate> for Scalar {
    fn from(d: NaiveDate) -> Self {
        Scalar::Date(d)
    }
}

/// Per-field match condition: `value`, `(since, until)` or `{"$in": [...]}`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Scalar),
    Between(TimeRange),
    In(Vec<Scalar>),
}

/// Conjunction of per-field conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: BTreeMap<String, Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eq(mut self, field: &str, value: impl Into<Scalar>) -> Self {
        self.insert(field, Condition::Eq(value.into()));
        self
    }

    pub fn with_range(mut self, field: &str, range: TimeRange) -> Self {
        self.insert(field, Condition::Between(range));
        self
    }

    pub fn with_in(mut self, field: &str, values: Vec<Scalar>) -> Self {
        self.insert(field, Condition::In(values));
        self
    }

    pub fn insert(&mut self, field: &str, condition: Condition) {
        self.conditions.insert(field.to_string(), condition);
    }

    /// Add every condition of `other`; `other` wins on shared fields.
    pub fn extend(&mut self, other: &Filter) {
        for (field, condition) in &other.conditions {
            self.conditions.insert(field.clone(), condition.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Condition)> {
        self.conditions.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

/// The storage engine the sync engine persists into.
pub trait DocumentStore: Send + Sync {
    /// Rows of `collection` matching `filter`, optionally projected onto
    /// `fields`. `Ok(None)` when nothing matches.
    fn query(
        &self,
        collection: &str,
        filter: &Filter,
        fields: Option<&[String]>,
    ) -> Result<Option<TableFrame>, DataError>;

    /// Insert or replace rows keyed by `keys`. Durable on return.
    fn upsert(&self, collection: &str, frame: &TableFrame, keys: &[String])
        -> Result<bool, DataError>;

    /// Earliest and latest date stored in `field` among matching rows.
    fn range_of(
        &self,
        collection: &str,
        field: &str,
        filter: &Filter,
    ) -> Result<(Option<NaiveDate>, Option<NaiveDate>), DataError>;

    /// Distinct values of `field` across the whole collection.
    fn distinct_values(&self, collection: &str, field: &str) -> Result<Vec<String>, DataError>;
}
