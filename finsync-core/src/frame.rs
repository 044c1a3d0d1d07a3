//! Table-frame helpers over polars `DataFrame`.
//!
//! Storage backends and the factor evaluator share these: filtering by a
//! storage [`Filter`], keep-last upserts on merge keys, date bounds and
//! alignment of numeric columns on a date key.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use polars::prelude::*;

use crate::error::DataError;
use crate::store::{Condition, Filter, Scalar};
use crate::time::{date_to_days, days_to_date};

/// The tabular payload exchanged between plugins, storage and callers.
pub type TableFrame = DataFrame;

/// Separator used when joining merge-key parts into one row key.
const KEY_SEPARATOR: char = '\u{1f}';

pub fn column_names(df: &DataFrame) -> Vec<String> {
    df.get_columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect()
}

pub fn has_column(df: &DataFrame, name: &str) -> bool {
    df.get_column_index(name).is_some()
}

/// Read a column as dates. Accepts `Date`, `Datetime`, integer days and
/// `%Y-%m-%d` strings.
pub fn date_values(col: &Column) -> Result<Vec<Option<NaiveDate>>, DataError> {
    if col.dtype() == &DataType::String {
        let ca = col.str()?;
        return Ok(ca
            .into_iter()
            .map(|v| v.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok()))
            .collect());
    }
    let days = col.cast(&DataType::Date)?.cast(&DataType::Int32)?;
    let ca = days.i32()?;
    Ok(ca.into_iter().map(|v| v.and_then(days_to_date)).collect())
}

pub fn text_values(col: &Column) -> Result<Vec<Option<String>>, DataError> {
    let cast;
    let col = if col.dtype() == &DataType::String {
        col
    } else {
        cast = col.cast(&DataType::String)?;
        &cast
    };
    Ok(col
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

pub fn numeric_values(col: &Column) -> Result<Vec<Option<f64>>, DataError> {
    let cast = col.cast(&DataType::Float64)?;
    Ok(cast
        .f64()?
        .into_iter()
        .map(|v| v.filter(|x| !x.is_nan()))
        .collect())
}

/// Build a polars `Date` column from optional dates.
pub fn date_column(name: &str, dates: &[Option<NaiveDate>]) -> Result<Column, DataError> {
    let days: Vec<Option<i32>> = dates.iter().map(|d| d.map(date_to_days)).collect();
    Ok(Column::new(name.into(), days).cast(&DataType::Date)?)
}

/// Keep the rows of `df` matching every condition in `filter`.
///
/// A condition on a column the frame does not have matches nothing.
pub fn filter_rows(df: &DataFrame, filter: &Filter) -> Result<DataFrame, DataError> {
    if filter.is_empty() || df.height() == 0 {
        return Ok(df.clone());
    }

    let mut mask = vec![true; df.height()];
    for (field, condition) in filter.iter() {
        let Ok(col) = df.column(field) else {
            return Ok(df.clear());
        };
        let hits = match condition {
            Condition::Eq(value) => scalar_hits(col, std::slice::from_ref(value))?,
            Condition::In(values) => scalar_hits(col, values)?,
            Condition::Between(range) => date_values(col)?
                .into_iter()
                .map(|d| d.is_some_and(|d| range.contains(d)))
                .collect(),
        };
        for (m, hit) in mask.iter_mut().zip(hits) {
            *m = *m && hit;
        }
    }

    let mask = BooleanChunked::from_slice("mask".into(), &mask);
    Ok(df.filter(&mask)?)
}

fn scalar_hits(col: &Column, values: &[Scalar]) -> Result<Vec<bool>, DataError> {
    let mut hits = vec![false; col.len()];
    if values.is_empty() {
        return Ok(hits);
    }

    let texts: Vec<&str> = values.iter().filter_map(Scalar::as_text).collect();
    if !texts.is_empty() {
        for (hit, v) in hits.iter_mut().zip(text_values(col)?) {
            *hit |= v.is_some_and(|v| texts.contains(&v.as_str()));
        }
    }

    let numbers: Vec<f64> = values.iter().filter_map(Scalar::as_number).collect();
    if !numbers.is_empty() {
        for (hit, v) in hits.iter_mut().zip(numeric_values(col)?) {
            *hit |= v.is_some_and(|v| numbers.iter().any(|n| (n - v).abs() < f64::EPSILON));
        }
    }

    let dates: Vec<NaiveDate> = values.iter().filter_map(Scalar::as_date).collect();
    if !dates.is_empty() {
        for (hit, v) in hits.iter_mut().zip(date_values(col)?) {
            *hit |= v.is_some_and(|v| dates.contains(&v));
        }
    }

    Ok(hits)
}

/// Merge `incoming` into `existing`, keeping the last row for each key.
///
/// The schemas are unioned: columns missing on either side are null-filled
/// and incoming columns are cast to the stored dtype. With no merge keys the
/// rows are appended as-is.
pub fn upsert(
    existing: Option<&DataFrame>,
    incoming: &DataFrame,
    keys: &[String],
) -> Result<DataFrame, DataError> {
    let combined = match existing {
        Some(existing) if existing.width() > 0 => stack_aligned(existing, incoming)?,
        _ => incoming.clone(),
    };
    dedupe_last(&combined, keys)
}

fn stack_aligned(top: &DataFrame, bottom: &DataFrame) -> Result<DataFrame, DataError> {
    let mut names = column_names(top);
    for name in column_names(bottom) {
        if !names.contains(&name) {
            names.push(name);
        }
    }

    let mut top_cols = Vec::with_capacity(names.len());
    let mut bottom_cols = Vec::with_capacity(names.len());
    for name in &names {
        let dtype = match top.column(name) {
            Ok(c) => c.dtype().clone(),
            Err(_) => bottom.column(name)?.dtype().clone(),
        };
        top_cols.push(conform(top, name, &dtype)?);
        bottom_cols.push(conform(bottom, name, &dtype)?);
    }

    let top = DataFrame::new(top_cols)?;
    let bottom = DataFrame::new(bottom_cols)?;
    Ok(top.vstack(&bottom)?)
}

fn conform(df: &DataFrame, name: &str, dtype: &DataType) -> Result<Column, DataError> {
    match df.column(name) {
        Ok(c) if c.dtype() == dtype => Ok(c.clone()),
        Ok(c) => Ok(c.cast(dtype)?),
        Err(_) => Ok(Column::full_null(name.into(), df.height(), dtype)),
    }
}

/// Drop earlier duplicates of each merge key, keeping the last occurrence.
pub fn dedupe_last(df: &DataFrame, keys: &[String]) -> Result<DataFrame, DataError> {
    if keys.is_empty() || df.height() == 0 {
        return Ok(df.clone());
    }

    let mut parts = Vec::with_capacity(keys.len());
    for key in keys {
        let col = df
            .column(key)
            .map_err(|_| DataError::Validation(format!("merge key '{key}' missing from frame")))?;
        parts.push(text_values(col)?);
    }

    let height = df.height();
    let mut keep = vec![false; height];
    let mut seen: HashSet<String> = HashSet::with_capacity(height);
    for row in (0..height).rev() {
        let mut key = String::new();
        for part in &parts {
            match &part[row] {
                Some(v) => key.push_str(v),
                None => key.push_str("<null>"),
            }
            key.push(KEY_SEPARATOR);
        }
        if seen.insert(key) {
            keep[row] = true;
        }
    }

    if keep.iter().all(|k| *k) {
        return Ok(df.clone());
    }
    let mask = BooleanChunked::from_slice("keep".into(), &keep);
    Ok(df.filter(&mask)?)
}

/// Earliest and latest date in `field`, ignoring nulls.
pub fn date_bounds(
    df: &DataFrame,
    field: &str,
) -> Result<(Option<NaiveDate>, Option<NaiveDate>), DataError> {
    let Ok(col) = df.column(field) else {
        return Ok((None, None));
    };
    let dates = date_values(col)?;
    let min = dates.iter().flatten().min().copied();
    let max = dates.iter().flatten().max().copied();
    Ok((min, max))
}

/// Distinct non-null values of `field`, rendered as text and sorted.
pub fn distinct_text(df: &DataFrame, field: &str) -> Result<Vec<String>, DataError> {
    let Ok(col) = df.column(field) else {
        return Ok(Vec::new());
    };
    let set: BTreeSet<String> = text_values(col)?.into_iter().flatten().collect();
    Ok(set.into_iter().collect())
}

/// Keep only the named columns that exist, in the requested order.
pub fn project(df: &DataFrame, fields: &[String]) -> Result<DataFrame, DataError> {
    let present: Vec<String> = fields
        .iter()
        .filter(|f| has_column(df, f))
        .cloned()
        .collect();
    Ok(df.select(present)?)
}

/// Rename columns per `mapping` (old -> new); absent columns are skipped.
pub fn rename_columns(
    df: &mut DataFrame,
    mapping: &HashMap<String, String>,
) -> Result<(), DataError> {
    for (old, new) in mapping {
        if old != new && has_column(df, old) && !has_column(df, new) {
            df.rename(old, new.as_str().into())?;
        }
    }
    Ok(())
}

/// Add a constant text column, used to stamp the entity on fetched frames.
pub fn with_constant_text(df: &DataFrame, name: &str, value: &str) -> Result<DataFrame, DataError> {
    let mut out = df.clone();
    let values = vec![value; df.height()];
    out.with_column(Column::new(name.into(), values))?;
    Ok(out)
}

/// One input to [`align_numeric`]: a frame, its date column if any, and the
/// fields to lift out of it.
#[derive(Debug, Clone, Copy)]
pub struct FrameSlice<'a> {
    pub frame: &'a DataFrame,
    pub time_field: Option<&'a str>,
    pub fields: &'a [String],
}

/// Numeric columns from several frames joined on their dates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedColumns {
    pub dates: Option<Vec<NaiveDate>>,
    pub len: usize,
    pub columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl AlignedColumns {
    pub fn get(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(|v| v.as_slice())
    }

    /// Insert or replace a column. Shorter inputs are null-padded.
    pub fn insert(&mut self, name: &str, mut values: Vec<Option<f64>>) {
        values.resize(self.len, None);
        self.columns.insert(name.to_string(), values);
    }

    /// Materialize as a frame: the date column (named `time_field`) first,
    /// then every numeric column in name order.
    pub fn to_frame(&self, time_field: &str) -> Result<DataFrame, DataError> {
        let mut cols = Vec::with_capacity(self.columns.len() + 1);
        if let Some(dates) = &self.dates {
            let dates: Vec<Option<NaiveDate>> = dates.iter().copied().map(Some).collect();
            cols.push(date_column(time_field, &dates)?);
        }
        for (name, values) in &self.columns {
            cols.push(Column::new(name.as_str().into(), values.clone()));
        }
        Ok(DataFrame::new(cols)?)
    }

    /// Rebuild from a frame produced by [`AlignedColumns::to_frame`].
    pub fn from_frame(df: &DataFrame, time_field: &str) -> Result<Self, DataError> {
        let dates = match df.column(time_field) {
            Ok(col) => Some(date_values(col)?.into_iter().flatten().collect::<Vec<_>>()),
            Err(_) => None,
        };
        let mut columns = BTreeMap::new();
        for col in df.get_columns() {
            let name = col.name().to_string();
            if name == time_field {
                continue;
            }
            columns.insert(name, numeric_values(col)?);
        }
        Ok(Self {
            dates,
            len: df.height(),
            columns,
        })
    }
}

/// Align the requested fields of several frames on the union of their dates.
///
/// Frames without a date column contribute their last row, broadcast across
/// every date. When no frame is date-keyed the rows are aligned by position.
pub fn align_numeric(inputs: &[FrameSlice<'_>]) -> Result<AlignedColumns, DataError> {
    let mut all_dates: BTreeSet<NaiveDate> = BTreeSet::new();
    let mut row_maps: Vec<Option<HashMap<NaiveDate, usize>>> = Vec::with_capacity(inputs.len());

    for input in inputs {
        match input.time_field.and_then(|f| input.frame.column(f).ok()) {
            Some(col) => {
                let mut rows = HashMap::new();
                for (row, date) in date_values(col)?.into_iter().enumerate() {
                    if let Some(date) = date {
                        all_dates.insert(date);
                        rows.insert(date, row);
                    }
                }
                row_maps.push(Some(rows));
            }
            None => row_maps.push(None),
        }
    }

    let keyed = row_maps.iter().any(Option::is_some);
    let dates: Vec<NaiveDate> = all_dates.into_iter().collect();
    let len = if keyed {
        dates.len()
    } else {
        inputs.iter().map(|i| i.frame.height()).max().unwrap_or(0)
    };

    let mut aligned = AlignedColumns {
        dates: keyed.then(|| dates.clone()),
        len,
        columns: BTreeMap::new(),
    };

    for (input, rows) in inputs.iter().zip(&row_maps) {
        for field in input.fields {
            let Ok(col) = input.frame.column(field) else {
                continue;
            };
            let values = numeric_values(col)?;
            let out = match rows {
                Some(rows) => dates
                    .iter()
                    .map(|d| rows.get(d).and_then(|&r| values[r]))
                    .collect(),
                None if keyed => vec![values.last().copied().flatten(); len],
                None => values,
            };
            aligned.insert(field, out);
        }
    }

    Ok(aligned)
}
