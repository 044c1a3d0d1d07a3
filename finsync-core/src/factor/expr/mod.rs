//! Arithmetic expressions over named columns.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := number | '[' name ']' | ident '(' expr (',' expr)* ')' | '(' expr ')'
//! ```
//!
//! Expressions are parsed once into an [`Expr`] tree and evaluated against a
//! column binding; nothing is ever executed as code.

mod eval;
mod parser;

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

pub use eval::evaluate;
pub use parser::parse_expression;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("malformed expression '{clause}': {reason}")]
    MalformedExpression { clause: String, reason: String },

    #[error("unexpected {found} at offset {pos}")]
    UnexpectedToken { pos: usize, found: String },

    #[error("unexpected end of expression")]
    UnexpectedEnd,

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{func}() takes {expected} argument(s), got {found}")]
    Arity {
        func: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{func}(): {reason}")]
    InvalidArgument { func: &'static str, reason: String },

    #[error("unbound field [{0}]")]
    UnboundField(String),

    #[error("formula clauses depend on each other cyclically: {}", .0.join(", "))]
    Cyclic(Vec<String>),

    #[error("formula has no valid clauses")]
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Abs,
    Sqrt,
    Ln,
    Exp,
    Pow,
    Min,
    Max,
    /// `shift(x, n)`: value `n` rows earlier (later when negative).
    Shift,
    /// `mean(x, n)`: trailing mean over `n` rows.
    Mean,
}

impl Func {
    pub fn lookup(name: &str) -> Option<Func> {
        Some(match name.to_ascii_lowercase().as_str() {
            "abs" => Func::Abs,
            "sqrt" => Func::Sqrt,
            "ln" => Func::Ln,
            "exp" => Func::Exp,
            "pow" => Func::Pow,
            "min" => Func::Min,
            "max" => Func::Max,
            "shift" => Func::Shift,
            "mean" => Func::Mean,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Func::Abs => "abs",
            Func::Sqrt => "sqrt",
            Func::Ln => "ln",
            Func::Exp => "exp",
            Func::Pow => "pow",
            Func::Min => "min",
            Func::Max => "max",
            Func::Shift => "shift",
            Func::Mean => "mean",
        }
    }

    pub fn arity(self) -> usize {
        match self {
            Func::Abs | Func::Sqrt | Func::Ln | Func::Exp => 1,
            Func::Pow | Func::Min | Func::Max | Func::Shift | Func::Mean => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call { func: Func, args: Vec<Expr> },
}

impl Expr {
    /// Every `[field]` referenced, deduplicated.
    pub fn references(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Field(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_refs(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.collect_refs(out)),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{n}"),
            Expr::Field(name) => write!(f, "[{name}]"),
            Expr::Neg(inner) => write!(f, "-({inner})"),
            Expr::Binary { op, lhs, rhs } => {
                let sym = match op {
                    BinaryOp::Add => '+',
                    BinaryOp::Sub => '-',
                    BinaryOp::Mul => '*',
                    BinaryOp::Div => '/',
                };
                write!(f, "({lhs} {sym} {rhs})")
            }
            Expr::Call { func, args } => {
                write!(f, "{}(", func.name())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
        }
    }
}
