//! Derived fields ("factors") and the dependency graph that orders them.

pub mod expr;
pub mod formula;
pub mod graph;

use std::fmt;
use std::sync::Arc;

use polars::prelude::PolarsError;
use thiserror::Error;

use crate::error::DataError;
use crate::frame::TableFrame;
use crate::time::TimeRange;

pub use formula::{Formula, FormulaPlugin};
pub use graph::{topo_sort, FactorGraph, RegisteredFactor, ResolvedPlan};

#[derive(Debug, Error)]
pub enum FactorError {
    #[error("cyclic dependency among: {}", nodes.join(", "))]
    CyclicDependency { nodes: Vec<String> },

    #[error("no provider registered for factor '{0}'")]
    UnknownFactor(String),

    #[error("factor '{factor}' failed: {reason}")]
    Compute { factor: String, reason: String },

    #[error(transparent)]
    Data(#[from] DataError),
}

impl From<PolarsError> for FactorError {
    fn from(e: PolarsError) -> Self {
        FactorError::Data(DataError::from(e))
    }
}

/// Compute callback: `(entity, window, input frame) -> frame with the
/// provided columns`, one output row per input row.
pub type ComputeFn = Arc<
    dyn Fn(Option<&str>, &TimeRange, &TableFrame) -> Result<TableFrame, FactorError>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct FactorDescriptor {
    pub provides: Vec<String>,
    pub depends: Vec<String>,
    pub comments: String,
    compute: ComputeFn,
}

impl fmt::Debug for FactorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactorDescriptor")
            .field("provides", &self.provides)
            .field("depends", &self.depends)
            .field("comments", &self.comments)
            .finish_non_exhaustive()
    }
}

impl FactorDescriptor {
    pub fn new(
        provides: &[&str],
        depends: &[&str],
        compute: impl Fn(Option<&str>, &TimeRange, &TableFrame) -> Result<TableFrame, FactorError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            provides: provides.iter().map(|s| s.to_string()).collect(),
            depends: depends.iter().map(|s| s.to_string()).collect(),
            comments: String::new(),
            compute: Arc::new(compute),
        }
    }

    pub fn from_parts(provides: Vec<String>, depends: Vec<String>, compute: ComputeFn) -> Self {
        Self {
            provides,
            depends,
            comments: String::new(),
            compute,
        }
    }

    pub fn with_comments(mut self, comments: &str) -> Self {
        self.comments = comments.to_string();
        self
    }

    pub fn compute(
        &self,
        entity: Option<&str>,
        range: &TimeRange,
        inputs: &TableFrame,
    ) -> Result<TableFrame, FactorError> {
        (self.compute)(entity, range, inputs)
    }
}

/// Content-addressed factor id: BLAKE3 of the owning plugin id and the
/// provided names.
pub fn factor_id(plugin_id: &str, provides: &[String]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(plugin_id.as_bytes());
    for name in provides {
        hasher.update(b"\0");
        hasher.update(name.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
