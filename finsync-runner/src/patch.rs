//! The transfer object between fetching a window and committing it.

use std::fmt;

use finsync_core::frame::TableFrame;
use finsync_core::ledger::series_tag;
use finsync_core::series::SeriesDescriptor;
use finsync_core::time::TimeRange;

/// A series, or one entity within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub uri: String,
    pub entity: Option<String>,
}

impl SeriesKey {
    pub fn new(uri: &str, entity: Option<&str>) -> Self {
        Self {
            uri: uri.to_string(),
            entity: entity.map(str::to_string),
        }
    }

    /// Ledger tag of the whole series.
    pub fn series_tag(&self) -> String {
        series_tag(&self.uri, None)
    }

    /// Ledger tag of this entity, when there is one.
    pub fn entity_tag(&self) -> Option<String> {
        self.entity
            .as_deref()
            .map(|e| series_tag(&self.uri, Some(e)))
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{}[{}]", self.uri, entity),
            None => write!(f, "{}", self.uri),
        }
    }
}

/// Result of one fetch-and-validate cycle. Consumed once by
/// `SyncOrchestrator::apply_patch`.
#[derive(Debug, Clone)]
pub struct Patch {
    pub success: bool,
    pub key: SeriesKey,
    pub since: Option<chrono::NaiveDate>,
    pub until: Option<chrono::NaiveDate>,
    /// Unset only when no agent serves the URI.
    pub descriptor: Option<SeriesDescriptor>,
    /// `None` on a no-op; kept on validation failure for diagnostics.
    pub payload: Option<TableFrame>,
    pub error: Option<String>,
}

impl Patch {
    pub fn noop(key: SeriesKey, descriptor: SeriesDescriptor, window: TimeRange) -> Self {
        Self {
            success: true,
            key,
            since: window.since,
            until: window.until,
            descriptor: Some(descriptor),
            payload: None,
            error: None,
        }
    }

    pub fn fetched(
        key: SeriesKey,
        descriptor: SeriesDescriptor,
        window: TimeRange,
        payload: Option<TableFrame>,
    ) -> Self {
        Self {
            payload,
            ..Self::noop(key, descriptor, window)
        }
    }

    pub fn failed(key: SeriesKey, descriptor: Option<SeriesDescriptor>, error: String) -> Self {
        Self {
            success: false,
            key,
            since: None,
            until: None,
            descriptor,
            payload: None,
            error: Some(error),
        }
    }

    pub fn window(&self) -> TimeRange {
        TimeRange::new(self.since, self.until)
    }

    /// Success with nothing to merge.
    pub fn is_noop(&self) -> bool {
        self.success && self.payload.is_none()
    }

    pub fn rows(&self) -> usize {
        self.payload.as_ref().map_or(0, |p| p.height())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_cover_series_and_entity() {
        let key = SeriesKey::new("Finance.BalanceSheet", Some("000001"));
        assert_eq!(key.series_tag(), "Finance.BalanceSheet");
        assert_eq!(key.entity_tag().as_deref(), Some("Finance.BalanceSheet.000001"));
        assert_eq!(key.to_string(), "Finance.BalanceSheet[000001]");
        assert!(SeriesKey::new("Market.Calendar", None).entity_tag().is_none());
    }

    #[test]
    fn noop_and_failed_patches() {
        let desc = SeriesDescriptor::builder("Market.DailyBar").build();
        let key = SeriesKey::new("Market.DailyBar", Some("SPY"));
        let noop = Patch::noop(key.clone(), desc, TimeRange::unbounded());
        assert!(noop.is_noop());
        assert_eq!(noop.rows(), 0);

        let failed = Patch::failed(key, None, "boom".into());
        assert!(!failed.success);
        assert!(!failed.is_noop());
    }
}
