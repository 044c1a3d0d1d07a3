//! Series descriptors and the agent that owns a series' storage shape.
//!
//! A [`SeriesDescriptor`] is declared by the plugin that serves the series.
//! The [`SeriesAgent`] pairs it with the storage collaborator and answers
//! every question the sync engine asks about the series: does it serve a
//! URI, how to read it, how to merge fetched rows, what is stored already
//! and what upstream should have.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::error::DataError;
use crate::frame::{self, TableFrame};
use crate::store::{DocumentStore, Filter};
use crate::time::{DurationClass, TimeRange};

pub type UpdateEnumerator = Arc<dyn Fn() -> Vec<String> + Send + Sync>;
pub type ReferenceRangeFn = Arc<dyn Fn(Option<&str>) -> TimeRange + Send + Sync>;
pub type UriPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// How a series decides whether it serves a requested URI.
#[derive(Clone, Default)]
pub enum UriMatcher {
    /// Case-insensitive match against the series' own URI.
    #[default]
    Exact,
    /// Case-insensitive match against one alternative name.
    Alias(String),
    /// Case-insensitive match against any name in the set.
    Set(HashSet<String>),
    Predicate(UriPredicate),
}

impl fmt::Debug for UriMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UriMatcher::Exact => write!(f, "Exact"),
            UriMatcher::Alias(a) => f.debug_tuple("Alias").field(a).finish(),
            UriMatcher::Set(s) => f.debug_tuple("Set").field(s).finish(),
            UriMatcher::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// Immutable per-series configuration.
#[derive(Clone)]
pub struct SeriesDescriptor {
    pub uri: String,
    pub collection: String,
    pub identity_field: Option<String>,
    pub time_field: Option<String>,
    pub duration: DurationClass,
    pub merge_keys: Vec<String>,
    pub matcher: UriMatcher,
    pub required_fields: Vec<String>,
    pub update_enumerator: Option<UpdateEnumerator>,
    pub reference_range: Option<ReferenceRangeFn>,
}

impl fmt::Debug for SeriesDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesDescriptor")
            .field("uri", &self.uri)
            .field("collection", &self.collection)
            .field("identity_field", &self.identity_field)
            .field("time_field", &self.time_field)
            .field("duration", &self.duration)
            .field("merge_keys", &self.merge_keys)
            .field("matcher", &self.matcher)
            .field("required_fields", &self.required_fields)
            .field("update_enumerator", &self.update_enumerator.is_some())
            .field("reference_range", &self.reference_range.is_some())
            .finish()
    }
}

impl SeriesDescriptor {
    pub fn builder(uri: &str) -> SeriesDescriptorBuilder {
        SeriesDescriptorBuilder::new(uri)
    }

    pub fn matches(&self, uri: &str) -> bool {
        let uri = uri.trim();
        match &self.matcher {
            UriMatcher::Exact => uri.eq_ignore_ascii_case(&self.uri),
            UriMatcher::Alias(alias) => {
                uri.eq_ignore_ascii_case(alias) || uri.eq_ignore_ascii_case(&self.uri)
            }
            UriMatcher::Set(names) => {
                names.contains(&uri.to_lowercase()) || uri.eq_ignore_ascii_case(&self.uri)
            }
            UriMatcher::Predicate(p) => p(uri),
        }
    }

    /// Series keyed by neither entity nor time cannot be synced incrementally.
    pub fn is_incremental(&self) -> bool {
        self.identity_field.is_some() || self.time_field.is_some()
    }
}

/// Builder for [`SeriesDescriptor`]. Merge keys default to the identity and
/// time fields; the storage collection defaults to the URI.
pub struct SeriesDescriptorBuilder {
    desc: SeriesDescriptor,
    explicit_keys: bool,
}

impl SeriesDescriptorBuilder {
    fn new(uri: &str) -> Self {
        Self {
            desc: SeriesDescriptor {
                uri: uri.to_string(),
                collection: uri.to_string(),
                identity_field: None,
                time_field: None,
                duration: DurationClass::None,
                merge_keys: Vec::new(),
                matcher: UriMatcher::Exact,
                required_fields: Vec::new(),
                update_enumerator: None,
                reference_range: None,
            },
            explicit_keys: false,
        }
    }

    pub fn collection(mut self, name: &str) -> Self {
        self.desc.collection = name.to_string();
        self
    }

    pub fn identity_field(mut self, field: &str) -> Self {
        self.desc.identity_field = Some(field.to_string());
        self
    }

    pub fn time_field(mut self, field: &str) -> Self {
        self.desc.time_field = Some(field.to_string());
        self
    }

    pub fn duration(mut self, duration: DurationClass) -> Self {
        self.desc.duration = duration;
        self
    }

    pub fn merge_keys(mut self, keys: &[&str]) -> Self {
        self.desc.merge_keys = keys.iter().map(|k| k.to_string()).collect();
        self.explicit_keys = true;
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.desc.matcher = UriMatcher::Alias(alias.to_string());
        self
    }

    pub fn aliases(mut self, names: &[&str]) -> Self {
        self.desc.matcher = UriMatcher::Set(names.iter().map(|n| n.to_lowercase()).collect());
        self
    }

    pub fn matches_when(
        mut self,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.desc.matcher = UriMatcher::Predicate(Arc::new(predicate));
        self
    }

    pub fn required_fields(mut self, fields: &[&str]) -> Self {
        self.desc.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn update_enumerator(
        mut self,
        f: impl Fn() -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.desc.update_enumerator = Some(Arc::new(f));
        self
    }

    pub fn reference_range(
        mut self,
        f: impl Fn(Option<&str>) -> TimeRange + Send + Sync + 'static,
    ) -> Self {
        self.desc.reference_range = Some(Arc::new(f));
        self
    }

    pub fn build(mut self) -> SeriesDescriptor {
        if !self.explicit_keys {
            self.desc.merge_keys = self
                .desc
                .identity_field
                .iter()
                .chain(self.desc.time_field.iter())
                .cloned()
                .collect();
        }
        self.desc
    }
}

/// One logical series bound to the store it persists into.
#[derive(Clone)]
pub struct SeriesAgent {
    desc: SeriesDescriptor,
    store: Arc<dyn DocumentStore>,
}

impl fmt::Debug for SeriesAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesAgent").field("desc", &self.desc).finish()
    }
}

impl SeriesAgent {
    pub fn new(desc: SeriesDescriptor, store: Arc<dyn DocumentStore>) -> Self {
        Self { desc, store }
    }

    pub fn descriptor(&self) -> &SeriesDescriptor {
        &self.desc
    }

    pub fn uri(&self) -> &str {
        &self.desc.uri
    }

    /// Whether this agent serves `uri`.
    pub fn adapt(&self, uri: &str) -> bool {
        self.desc.matches(uri)
    }

    /// Storage filter for an entity and time window, using only the fields
    /// this series is keyed by.
    pub fn filter_for(&self, entity: Option<&str>, range: Option<&TimeRange>) -> Filter {
        let mut filter = Filter::new();
        if let (Some(field), Some(entity)) = (&self.desc.identity_field, entity) {
            filter = filter.with_eq(field, entity);
        }
        if let (Some(field), Some(range)) = (&self.desc.time_field, range) {
            if !range.is_unbounded() {
                filter = filter.with_range(field, range.narrowed());
            }
        }
        filter
    }

    /// Read stored rows. `Ok(None)` when nothing matches.
    pub fn query(
        &self,
        entity: Option<&str>,
        range: Option<&TimeRange>,
        extra: &Filter,
        fields: Option<&[String]>,
    ) -> Result<Option<TableFrame>, DataError> {
        let mut filter = self.filter_for(entity, range);
        filter.extend(extra);
        self.store.query(&self.desc.collection, &filter, fields)
    }

    /// Upsert a fetched frame keyed by the merge keys. Returns `Ok(false)`
    /// without writing when `uri` is not served by this agent.
    pub fn merge(
        &self,
        uri: &str,
        entity: Option<&str>,
        frame: &TableFrame,
    ) -> Result<bool, DataError> {
        if !self.adapt(uri) {
            warn!(uri, series = %self.desc.uri, "refusing to merge data for a foreign uri");
            return Ok(false);
        }

        let stamped;
        let frame = match (&self.desc.identity_field, entity) {
            (Some(field), Some(entity)) if !frame::has_column(frame, field) => {
                stamped = frame::with_constant_text(frame, field, entity)?;
                &stamped
            }
            _ => frame,
        };

        debug!(series = %self.desc.uri, entity, rows = frame.height(), "merging frame");
        self.store
            .upsert(&self.desc.collection, frame, &self.desc.merge_keys)
    }

    /// Actual min/max of the time field in storage.
    pub fn data_range(&self, entity: Option<&str>) -> Result<TimeRange, DataError> {
        let Some(time_field) = &self.desc.time_field else {
            return Ok(TimeRange::unbounded());
        };
        let filter = self.filter_for(entity, None);
        let (since, until) = self
            .store
            .range_of(&self.desc.collection, time_field, &filter)?;
        Ok(TimeRange::new(since, until))
    }

    /// The window upstream should be able to provide; unbounded if unknown.
    pub fn reference_range(&self, entity: Option<&str>) -> TimeRange {
        match &self.desc.reference_range {
            Some(f) => f(entity),
            None => TimeRange::unbounded(),
        }
    }

    /// Entities a full sweep should visit: the declared enumerator, or the
    /// identities already present in storage.
    pub fn update_entities(&self) -> Result<Vec<String>, DataError> {
        if let Some(enumerate) = &self.desc.update_enumerator {
            return Ok(enumerate());
        }
        match &self.desc.identity_field {
            Some(field) => self.store.distinct_values(&self.desc.collection, field),
            None => Ok(Vec::new()),
        }
    }

    /// Required fields missing from `frame`.
    pub fn missing_fields(&self, frame: &TableFrame) -> Vec<String> {
        self.desc
            .required_fields
            .iter()
            .filter(|f| !frame::has_column(frame, f))
            .cloned()
            .collect()
    }

    /// Normalize a date to this series' reporting period.
    pub fn normalize(&self, date: NaiveDate) -> NaiveDate {
        self.desc.duration.normalize(date)
    }
}
