//! User-authored formula factors: `[C] = [A] + [B]; [D] = [C] * 2;`

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use polars::prelude::*;
use tracing::warn;

use super::expr::{evaluate, parse_expression, Expr, ExprError};
use super::{topo_sort, FactorDescriptor, FactorError};
use crate::frame::{numeric_values, AlignedColumns, TableFrame};
use crate::plugin::{Plugin, PluginInfo};
use crate::time::TimeRange;

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub target: String,
    pub expr: Expr,
}

/// Parse one `[Target] = expression` clause.
pub fn parse_clause(text: &str) -> Result<Clause, ExprError> {
    let malformed = |reason: &str| ExprError::MalformedExpression {
        clause: text.trim().to_string(),
        reason: reason.to_string(),
    };

    if text.matches('=').count() != 1 {
        return Err(malformed("expected exactly one '='"));
    }
    let (lhs, rhs) = text.split_once('=').ok_or_else(|| malformed("missing '='"))?;

    let lhs = lhs.trim();
    let target = lhs
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.contains(['[', ']']))
        .ok_or_else(|| malformed("left side must be exactly one [field]"))?;

    let expr = parse_expression(rhs).map_err(|e| malformed(&e.to_string()))?;
    if expr.references().is_empty() {
        return Err(malformed("right side references no [field]"));
    }

    Ok(Clause {
        target: target.to_string(),
        expr,
    })
}

/// A compiled formula: clauses in evaluation order plus its external
/// inputs and produced columns.
#[derive(Debug, Clone)]
pub struct Formula {
    name: String,
    clauses: Vec<Clause>,
    provides: Vec<String>,
    depends: Vec<String>,
    rejected: Vec<ExprError>,
}

impl Formula {
    /// Compile `;`-separated clauses. Malformed clauses are dropped with a
    /// warning; the formula fails only when nothing valid is left or the
    /// clauses reference each other cyclically.
    pub fn compile(name: &str, text: &str) -> Result<Self, ExprError> {
        let mut by_target: HashMap<String, Clause> = HashMap::new();
        let mut provides = Vec::new();
        let mut rejected = Vec::new();

        for raw in text.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            match parse_clause(raw) {
                Ok(clause) => {
                    if by_target.contains_key(&clause.target) {
                        warn!(
                            formula = name,
                            target = %clause.target,
                            "clause redefined, keeping the later one"
                        );
                    } else {
                        provides.push(clause.target.clone());
                    }
                    by_target.insert(clause.target.clone(), clause);
                }
                Err(e) => {
                    warn!(formula = name, error = %e, "dropping malformed clause");
                    rejected.push(e);
                }
            }
        }

        if by_target.is_empty() {
            return Err(ExprError::Empty);
        }

        let order = topo_sort(&provides, |target| {
            by_target
                .get(target)
                .map(|c| {
                    c.expr
                        .references()
                        .into_iter()
                        .filter(|r| by_target.contains_key(r))
                        .collect()
                })
                .unwrap_or_default()
        })
        .map_err(|e| match e {
            FactorError::CyclicDependency { nodes } => ExprError::Cyclic(nodes),
            other => ExprError::MalformedExpression {
                clause: name.to_string(),
                reason: other.to_string(),
            },
        })?;

        let depends: BTreeSet<String> = by_target
            .values()
            .flat_map(|c| c.expr.references())
            .filter(|r| !by_target.contains_key(r))
            .collect();

        let clauses = order
            .into_iter()
            .filter_map(|target| by_target.remove(&target))
            .collect();

        Ok(Self {
            name: name.to_string(),
            clauses,
            provides,
            depends: depends.into_iter().collect(),
            rejected,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Left-hand-side names, in the order written.
    pub fn provides(&self) -> &[String] {
        &self.provides
    }

    /// Referenced names that no clause defines.
    pub fn depends(&self) -> &[String] {
        &self.depends
    }

    /// Clauses in evaluation order.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn rejected(&self) -> &[ExprError] {
        &self.rejected
    }

    /// The evaluation script, one clause per line.
    pub fn script(&self) -> String {
        self.clauses
            .iter()
            .map(|c| format!("[{}] = {};", c.target, c.expr))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Evaluate every clause in order, binding each result into `env`.
    pub fn evaluate(&self, env: &mut AlignedColumns) -> Result<(), ExprError> {
        for clause in &self.clauses {
            let values = evaluate(&clause.expr, env)?;
            env.insert(&clause.target, values);
        }
        Ok(())
    }

    /// Wrap as a factor whose compute reads the inputs from the frame.
    pub fn into_descriptor(self) -> FactorDescriptor {
        let provides = self.provides.clone();
        let depends = self.depends.clone();
        let comments = format!("formula '{}'", self.name);
        let formula = Arc::new(self);

        let compute = move |_: Option<&str>,
                            _: &TimeRange,
                            inputs: &TableFrame|
              -> Result<TableFrame, FactorError> {
            let fail = |reason: String| FactorError::Compute {
                factor: formula.name.clone(),
                reason,
            };

            let mut env = AlignedColumns {
                dates: None,
                len: inputs.height(),
                columns: BTreeMap::new(),
            };
            for dep in &formula.depends {
                let col = inputs
                    .column(dep)
                    .map_err(|_| fail(format!("missing input [{dep}]")))?;
                env.insert(dep, numeric_values(col)?);
            }
            formula.evaluate(&mut env).map_err(|e| fail(e.to_string()))?;

            let columns = formula
                .provides
                .iter()
                .map(|p| Column::new(p.as_str().into(), env.get(p).unwrap_or_default().to_vec()))
                .collect();
            Ok(DataFrame::new(columns)?)
        };

        FactorDescriptor::from_parts(provides, depends, Arc::new(compute)).with_comments(&comments)
    }
}

/// Exposes the `[formulas]` section of the config as factors.
#[derive(Debug, Default)]
pub struct FormulaPlugin {
    formulas: Vec<Formula>,
}

impl FormulaPlugin {
    pub const ID: &'static str = "formula";

    /// Compile every `name -> text` entry; entries that fail to compile are
    /// skipped with a warning.
    pub fn new(sources: &BTreeMap<String, String>) -> Self {
        let formulas = sources
            .iter()
            .filter_map(|(name, text)| match Formula::compile(name, text) {
                Ok(f) => Some(f),
                Err(e) => {
                    warn!(formula = %name, error = %e, "skipping formula");
                    None
                }
            })
            .collect();
        Self { formulas }
    }

    pub fn formulas(&self) -> &[Formula] {
        &self.formulas
    }
}

impl Plugin for FormulaPlugin {
    fn probe(&self) -> PluginInfo {
        PluginInfo {
            id: Self::ID.into(),
            name: "Formula factors".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            tags: vec!["factor".into()],
            factors: self
                .formulas
                .iter()
                .flat_map(|f| f.provides.iter().cloned())
                .collect(),
            ..Default::default()
        }
    }

    fn adapts(&self, _uri: &str) -> bool {
        false
    }

    fn factors(&self) -> Vec<FactorDescriptor> {
        self.formulas.iter().cloned().map(Formula::into_descriptor).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clause_shape_rules() {
        assert!(parse_clause("[C] = [A] + [B]").is_ok());
        for bad in [
            "[C] [A] + [B]",
            "[C] = [A] = [B]",
            "C = [A]",
            "[C] + 1 = [A]",
            "[C] = 1 + 2",
            "[C] = [A] +",
        ] {
            assert!(
                matches!(parse_clause(bad), Err(ExprError::MalformedExpression { .. })),
                "accepted: {bad}"
            );
        }
    }

    #[test]
    fn intermediate_clauses_evaluate_first() {
        let f = Formula::compile("chain", "[D] = [C] * 2; [C] = [A] + [B];").unwrap();
        assert_eq!(f.provides(), ["D", "C"]);
        assert_eq!(f.depends(), ["A", "B"]);
        assert_eq!(f.clauses()[0].target, "C");
        assert_eq!(f.script(), "[C] = ([A] + [B]);\n[D] = ([C] * 2);");
    }

    #[test]
    fn malformed_clauses_are_dropped() {
        let f = Formula::compile("partial", "[X] = [A] * 2; garbage; [Y] = ;").unwrap();
        assert_eq!(f.provides(), ["X"]);
        assert_eq!(f.rejected().len(), 2);

        assert_eq!(Formula::compile("none", "nope; also nope").unwrap_err(), ExprError::Empty);
    }

    #[test]
    fn cyclic_clauses_fail() {
        let err = Formula::compile("loop", "[A] = [B] + 1; [B] = [A] * 2").unwrap_err();
        assert_eq!(err, ExprError::Cyclic(vec!["A".into(), "B".into()]));
    }

    #[test]
    fn descriptor_computes_from_frame() {
        let desc = Formula::compile("ratio", "[R] = [A] / [B]").unwrap().into_descriptor();
        let inputs = DataFrame::new(vec![
            Column::new("A".into(), vec![1.0, 6.0]),
            Column::new("B".into(), vec![0.0, 3.0]),
        ])
        .unwrap();
        let out = desc.compute(None, &TimeRange::unbounded(), &inputs).unwrap();
        let r = numeric_values(out.column("R").unwrap()).unwrap();
        assert_eq!(r, vec![None, Some(2.0)]);

        let missing = DataFrame::new(vec![Column::new("A".into(), vec![1.0])]).unwrap();
        assert!(matches!(
            desc.compute(None, &TimeRange::unbounded(), &missing),
            Err(FactorError::Compute { .. })
        ));
    }

    #[test]
    fn plugin_skips_broken_formulas() {
        let mut sources = BTreeMap::new();
        sources.insert("good".to_string(), "[G] = [x] + 1".to_string());
        sources.insert("bad".to_string(), "[B] = [B] + 1".to_string());
        let plugin = FormulaPlugin::new(&sources);
        assert_eq!(plugin.probe().factors, vec!["G"]);
        assert_eq!(plugin.factors().len(), 1);
    }
}
