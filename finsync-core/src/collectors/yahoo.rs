//! Yahoo Finance daily bars.
//!
//! Fetches daily OHLCV bars from Yahoo's v8 chart API and serves them as the
//! `Market.DailyBar` series (entity = ticker, time = `date`). Handles rate
//! limiting, retries with exponential backoff, response parsing and the
//! circuit breaker.
//!
//! Yahoo Finance has no official API and is subject to unannounced format
//! changes; parse failures surface as [`DataError::ResponseFormatChanged`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveTime};
use polars::prelude::*;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::circuit_breaker::CircuitBreaker;
use crate::error::DataError;
use crate::frame::{date_column, TableFrame};
use crate::plugin::{FetchParams, Plugin, PluginInfo};
use crate::series::SeriesDescriptor;
use crate::time::{DurationClass, TimeRange};
use crate::universe::Universe;

pub const DAILY_BAR_URI: &str = "Market.DailyBar";

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartResult,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
    adjclose: Option<Vec<AdjCloseData>>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct AdjCloseData {
    adjclose: Vec<Option<f64>>,
}

#[derive(Debug, Default)]
struct BarColumns {
    date: Vec<Option<NaiveDate>>,
    open: Vec<Option<f64>>,
    high: Vec<Option<f64>>,
    low: Vec<Option<f64>>,
    close: Vec<Option<f64>>,
    volume: Vec<Option<u64>>,
    adj_close: Vec<Option<f64>>,
}

impl BarColumns {
    fn into_frame(self) -> Result<TableFrame, DataError> {
        Ok(DataFrame::new(vec![
            date_column("date", &self.date)?,
            Column::new("open".into(), self.open),
            Column::new("high".into(), self.high),
            Column::new("low".into(), self.low),
            Column::new("close".into(), self.close),
            Column::new("volume".into(), self.volume),
            Column::new("adj_close".into(), self.adj_close),
        ])?)
    }
}

/// Parse a chart response. `Ok(None)` when the window holds no trading days.
fn parse_chart(ticker: &str, resp: ChartResponse) -> Result<Option<TableFrame>, DataError> {
    let result = match (resp.chart.result, resp.chart.error) {
        (Some(result), _) => result,
        (None, Some(err)) if err.code == "Not Found" => {
            return Err(DataError::EntityNotFound {
                entity: ticker.to_string(),
            })
        }
        (None, Some(err)) => {
            return Err(DataError::ResponseFormatChanged(format!(
                "{}: {}",
                err.code, err.description
            )))
        }
        (None, None) => {
            return Err(DataError::ResponseFormatChanged(
                "empty result with no error".into(),
            ))
        }
    };

    let data = result
        .into_iter()
        .next()
        .ok_or_else(|| DataError::ResponseFormatChanged("result array is empty".into()))?;

    // No timestamps: the window contains no trading days.
    let Some(timestamps) = data.timestamp else {
        return Ok(None);
    };

    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| DataError::ResponseFormatChanged("no quote data".into()))?;
    let adj_closes = data
        .indicators
        .adjclose
        .and_then(|v| v.into_iter().next())
        .map(|a| a.adjclose);

    let mut bars = BarColumns::default();
    for (i, &ts) in timestamps.iter().enumerate() {
        let date = chrono::DateTime::from_timestamp(ts, 0)
            .map(|dt| dt.naive_utc().date())
            .ok_or_else(|| DataError::ResponseFormatChanged(format!("invalid timestamp: {ts}")))?;

        let open = quote.open.get(i).copied().flatten();
        let high = quote.high.get(i).copied().flatten();
        let low = quote.low.get(i).copied().flatten();
        let close = quote.close.get(i).copied().flatten();
        let volume = quote.volume.get(i).copied().flatten();

        // Holidays come back as all-null rows.
        if open.is_none() && high.is_none() && low.is_none() && close.is_none() && volume.is_none()
        {
            continue;
        }

        bars.date.push(Some(date));
        bars.open.push(open);
        bars.high.push(high);
        bars.low.push(low);
        bars.close.push(close);
        bars.volume.push(volume);
        bars.adj_close
            .push(adj_closes.as_ref().and_then(|v| v.get(i).copied().flatten()));
    }

    if bars.date.is_empty() {
        return Ok(None);
    }
    bars.into_frame().map(Some)
}

fn chart_url(ticker: &str, range: &TimeRange) -> String {
    let start = range
        .since
        .unwrap_or(NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default());
    let end = range.until.unwrap_or_else(|| Local::now().date_naive());
    let start_ts = start.and_time(NaiveTime::MIN).and_utc().timestamp();
    let end_ts = end
        .succ_opt()
        .unwrap_or(end)
        .and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp()
        - 1;
    format!(
        "https://query2.finance.yahoo.com/v8/finance/chart/{ticker}\
         ?period1={start_ts}&period2={end_ts}&interval=1d\
         &includeAdjustedClose=true"
    )
}

pub struct YahooCollector {
    client: reqwest::blocking::Client,
    breaker: Arc<CircuitBreaker>,
    universe: Arc<Universe>,
    max_retries: u32,
    base_delay: Duration,
}

impl YahooCollector {
    pub const ID: &'static str = "yahoo";

    pub fn new(universe: Universe) -> Result<Self, DataError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .map_err(|e| DataError::Other(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            breaker: Arc::new(CircuitBreaker::for_source(Self::ID)),
            universe: Arc::new(universe),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        })
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn fetch_with_retry(
        &self,
        ticker: &str,
        range: &TimeRange,
    ) -> Result<Option<TableFrame>, DataError> {
        if !self.breaker.is_allowed() {
            return Err(DataError::CircuitBreakerTripped);
        }

        let url = chart_url(ticker, range);
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                debug!(ticker, attempt, ?delay, "retrying after backoff");
                std::thread::sleep(delay);
            }
            if !self.breaker.is_allowed() {
                return Err(DataError::CircuitBreakerTripped);
            }

            let resp = match self.client.get(&url).send() {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_error = Some(DataError::NetworkUnreachable(e.to_string()));
                    continue;
                }
                Err(e) => return Err(DataError::NetworkUnreachable(e.to_string())),
            };

            let status = resp.status();
            if status == reqwest::StatusCode::FORBIDDEN {
                self.breaker.trip();
                return Err(DataError::CircuitBreakerTripped);
            }
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                self.breaker.record_failure();
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                warn!(ticker, retry_after, "rate limited");
                last_error = Some(DataError::RateLimited {
                    retry_after_secs: retry_after,
                });
                continue;
            }
            if status == reqwest::StatusCode::NOT_FOUND {
                return Err(DataError::EntityNotFound {
                    entity: ticker.to_string(),
                });
            }
            if !status.is_success() {
                self.breaker.record_failure();
                last_error = Some(DataError::FetchFailed {
                    uri: DAILY_BAR_URI.to_string(),
                    reason: format!("HTTP {status} for {ticker}"),
                });
                continue;
            }

            let chart: ChartResponse = resp.json().map_err(|e| {
                DataError::ResponseFormatChanged(format!(
                    "failed to parse response for {ticker}: {e}"
                ))
            })?;
            let frame = parse_chart(ticker, chart)?;
            self.breaker.record_success();
            return Ok(frame);
        }

        Err(last_error.unwrap_or_else(|| DataError::Other("max retries exceeded".into())))
    }
}

impl Plugin for YahooCollector {
    fn probe(&self) -> PluginInfo {
        let labels: BTreeMap<String, String> = [
            ("open", "Open"),
            ("high", "High"),
            ("low", "Low"),
            ("close", "Close"),
            ("volume", "Volume"),
            ("adj_close", "Adj Close"),
        ]
        .into_iter()
        .map(|(f, l)| (f.to_string(), l.to_string()))
        .collect();

        PluginInfo {
            id: Self::ID.into(),
            name: "Yahoo Finance".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            tags: vec!["collector".into(), "market".into()],
            fields: BTreeMap::from([(DAILY_BAR_URI.to_string(), labels)]),
            methods: vec!["fetch".into()],
            ..Default::default()
        }
    }

    fn series(&self) -> Vec<SeriesDescriptor> {
        let universe = Arc::clone(&self.universe);
        vec![SeriesDescriptor::builder(DAILY_BAR_URI)
            .alias("bars")
            .identity_field("symbol")
            .time_field("date")
            .duration(DurationClass::Daily)
            .required_fields(&["date", "close"])
            .update_enumerator(move || universe.entities())
            .build()]
    }

    fn fetch(
        &self,
        uri: &str,
        entity: Option<&str>,
        range: Option<&TimeRange>,
        _params: &FetchParams,
    ) -> Result<Option<TableFrame>, DataError> {
        if !self.adapts(uri) {
            return Err(DataError::NoSuchSeries {
                uri: uri.to_string(),
            });
        }
        let ticker = entity.ok_or_else(|| {
            DataError::Validation(format!("{DAILY_BAR_URI} requires a ticker"))
        })?;
        let window = range.copied().unwrap_or_default();
        self.fetch_with_retry(ticker, &window)
    }

    fn is_available(&self) -> bool {
        self.breaker.is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::numeric_values;

    fn chart(json: &str) -> ChartResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn parses_bars_and_skips_holidays() {
        let resp = chart(
            r#"{"chart":{"result":[{"timestamp":[1704205800,1704292200,1704378600],
            "indicators":{"quote":[{"open":[1.0,null,3.0],"high":[1.5,null,3.5],
            "low":[0.5,null,2.5],"close":[1.2,null,3.2],"volume":[100,null,300]}],
            "adjclose":[{"adjclose":[1.1,null,3.1]}]}}],"error":null}}"#,
        );
        let frame = parse_chart("SPY", resp).unwrap().unwrap();
        assert_eq!(frame.height(), 2);
        let close = numeric_values(frame.column("close").unwrap()).unwrap();
        assert_eq!(close, vec![Some(1.2), Some(3.2)]);
    }

    #[test]
    fn not_found_maps_to_entity_error() {
        let resp = chart(
            r#"{"chart":{"result":null,
                "error":{"code":"Not Found","description":"No data found"}}}"#,
        );
        assert!(matches!(
            parse_chart("ZZZZ", resp),
            Err(DataError::EntityNotFound { .. })
        ));
    }

    #[test]
    fn empty_window_is_none() {
        let resp = chart(
            r#"{"chart":{"result":[{"indicators":{"quote":[
                {"open":[],"high":[],"low":[],"close":[],"volume":[]}
            ]}}],"error":null}}"#,
        );
        assert!(parse_chart("SPY", resp).unwrap().is_none());
    }

    #[test]
    fn chart_url_covers_inclusive_window() {
        let range = TimeRange::between(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        );
        let url = chart_url("SPY", &range);
        assert!(url.contains("period1=1704067200"));
        assert!(url.contains("period2=1706745599"));
    }

    #[test]
    fn series_uses_universe_enumerator() {
        let collector = YahooCollector::new(Universe::default_us()).unwrap();
        let series = collector.series();
        assert_eq!(series[0].merge_keys, vec!["symbol", "date"]);
        let entities = (series[0].update_enumerator.as_ref().unwrap())();
        assert!(entities.contains(&"SPY".to_string()));
        assert!(collector.adapts("BARS"));
        assert!(collector.is_available());
    }
}
