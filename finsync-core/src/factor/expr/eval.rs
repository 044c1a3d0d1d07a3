use super::{BinaryOp, Expr, ExprError, Func};
use crate::frame::AlignedColumns;

#[derive(Debug, Clone)]
enum Value {
    Scalar(Option<f64>),
    Column(Vec<Option<f64>>),
}

fn finite(v: f64) -> Option<f64> {
    v.is_finite().then_some(v)
}

fn map_unary(value: Value, f: impl Fn(f64) -> Option<f64>) -> Value {
    match value {
        Value::Scalar(x) => Value::Scalar(x.and_then(&f)),
        Value::Column(xs) => Value::Column(xs.into_iter().map(|x| x.and_then(&f)).collect()),
    }
}

fn map_binary(lhs: Value, rhs: Value, f: impl Fn(f64, f64) -> Option<f64>) -> Value {
    let both = |a: Option<f64>, b: Option<f64>| match (a, b) {
        (Some(a), Some(b)) => f(a, b),
        _ => None,
    };
    match (lhs, rhs) {
        (Value::Scalar(a), Value::Scalar(b)) => Value::Scalar(both(a, b)),
        (Value::Column(xs), Value::Scalar(b)) => {
            Value::Column(xs.into_iter().map(|a| both(a, b)).collect())
        }
        (Value::Scalar(a), Value::Column(ys)) => {
            Value::Column(ys.into_iter().map(|b| both(a, b)).collect())
        }
        (Value::Column(xs), Value::Column(ys)) => {
            Value::Column(xs.into_iter().zip(ys).map(|(a, b)| both(a, b)).collect())
        }
    }
}

/// Windows are limited to the `i32` range.
fn window_arg(func: Func, value: Value) -> Result<i64, ExprError> {
    match value {
        Value::Scalar(Some(n)) if n.fract() == 0.0 => {
            if n.abs() > f64::from(i32::MAX) {
                return Err(ExprError::InvalidArgument {
                    func: func.name(),
                    reason: format!("window {n} is out of range"),
                });
            }
            Ok(n as i64)
        }
        _ => Err(ExprError::InvalidArgument {
            func: func.name(),
            reason: "window must be an integer constant".into(),
        }),
    }
}

fn shift(xs: Vec<Option<f64>>, n: i64) -> Vec<Option<f64>> {
    let len = xs.len() as i64;
    (0..len)
        .map(|i| {
            match i.checked_sub(n) {
                Some(src) if (0..len).contains(&src) => xs[src as usize],
                _ => None,
            }
        })
        .collect()
}

fn rolling_mean(xs: &[Option<f64>], n: usize) -> Vec<Option<f64>> {
    (0..xs.len())
        .map(|i| {
            if i + 1 < n {
                return None;
            }
            let window = &xs[i + 1 - n..=i];
            let sum: Option<f64> = window.iter().copied().sum();
            sum.map(|s| s / n as f64)
        })
        .collect()
}

fn eval_value(expr: &Expr, env: &AlignedColumns) -> Result<Value, ExprError> {
    Ok(match expr {
        Expr::Number(n) => Value::Scalar(Some(*n)),
        Expr::Field(name) => Value::Column(
            env.get(name)
                .ok_or_else(|| ExprError::UnboundField(name.clone()))?
                .to_vec(),
        ),
        Expr::Neg(inner) => map_unary(eval_value(inner, env)?, |x| Some(-x)),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval_value(lhs, env)?;
            let rhs = eval_value(rhs, env)?;
            match op {
                BinaryOp::Add => map_binary(lhs, rhs, |a, b| finite(a + b)),
                BinaryOp::Sub => map_binary(lhs, rhs, |a, b| finite(a - b)),
                BinaryOp::Mul => map_binary(lhs, rhs, |a, b| finite(a * b)),
                BinaryOp::Div => map_binary(lhs, rhs, |a, b| {
                    if b == 0.0 {
                        None
                    } else {
                        finite(a / b)
                    }
                }),
            }
        }
        Expr::Call { func, args } => {
            let mut values = args
                .iter()
                .map(|a| eval_value(a, env))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter();
            let (Some(first), second) = (values.next(), values.next()) else {
                return Err(ExprError::Arity {
                    func: func.name(),
                    expected: func.arity(),
                    found: 0,
                });
            };
            call(*func, first, second)?
        }
    })
}

fn call(func: Func, x: Value, y: Option<Value>) -> Result<Value, ExprError> {
    let second = |y: Option<Value>| {
        y.ok_or(ExprError::Arity {
            func: func.name(),
            expected: 2,
            found: 1,
        })
    };
    Ok(match func {
        Func::Abs => map_unary(x, |v| Some(v.abs())),
        Func::Sqrt => map_unary(x, |v| (v >= 0.0).then(|| v.sqrt())),
        Func::Ln => map_unary(x, |v| (v > 0.0).then(|| v.ln())),
        Func::Exp => map_unary(x, |v| finite(v.exp())),
        Func::Pow => map_binary(x, second(y)?, |a, b| finite(a.powf(b))),
        Func::Min => map_binary(x, second(y)?, |a, b| Some(a.min(b))),
        Func::Max => map_binary(x, second(y)?, |a, b| Some(a.max(b))),
        Func::Shift => {
            let n = window_arg(func, second(y)?)?;
            match x {
                Value::Column(xs) => Value::Column(shift(xs, n)),
                scalar => scalar,
            }
        }
        Func::Mean => {
            let n = window_arg(func, second(y)?)?;
            if n < 1 {
                return Err(ExprError::InvalidArgument {
                    func: func.name(),
                    reason: format!("window must be at least 1, got {n}"),
                });
            }
            match x {
                Value::Column(xs) => Value::Column(rolling_mean(&xs, n as usize)),
                scalar => scalar,
            }
        }
    })
}

/// Evaluate `expr` against `env`, producing one value per row of `env`.
/// Nulls propagate; division by zero and non-finite results become null.
pub fn evaluate(expr: &Expr, env: &AlignedColumns) -> Result<Vec<Option<f64>>, ExprError> {
    Ok(match eval_value(expr, env)? {
        Value::Scalar(v) => vec![v; env.len],
        Value::Column(mut xs) => {
            xs.resize(env.len, None);
            xs
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factor::expr::parse_expression;

    fn env(cols: &[(&str, Vec<Option<f64>>)]) -> AlignedColumns {
        let len = cols.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        let mut env = AlignedColumns {
            len,
            ..Default::default()
        };
        for (name, values) in cols {
            env.insert(name, values.clone());
        }
        env
    }

    fn eval(text: &str, env: &AlignedColumns) -> Vec<Option<f64>> {
        evaluate(&parse_expression(text).unwrap(), env).unwrap()
    }

    #[test]
    fn arithmetic_broadcasts_scalars() {
        let e = env(&[("A", vec![Some(1.0), Some(2.0)]), ("B", vec![Some(10.0), None])]);
        assert_eq!(eval("[A] * 2 + [B]", &e), vec![Some(12.0), None]);
        assert_eq!(eval("-[A]", &e), vec![Some(-1.0), Some(-2.0)]);
        assert_eq!(eval("3", &e), vec![Some(3.0), Some(3.0)]);
    }

    #[test]
    fn division_by_zero_is_null() {
        let e = env(&[("A", vec![Some(1.0), Some(4.0)]), ("B", vec![Some(0.0), Some(2.0)])]);
        assert_eq!(eval("[A] / [B]", &e), vec![None, Some(2.0)]);
    }

    #[test]
    fn domain_errors_are_null() {
        let e = env(&[("A", vec![Some(-1.0), Some(4.0)])]);
        assert_eq!(eval("sqrt([A])", &e), vec![None, Some(2.0)]);
        assert_eq!(eval("ln([A])", &e)[0], None);
        assert_eq!(eval("abs([A])", &e), vec![Some(1.0), Some(4.0)]);
    }

    #[test]
    fn shift_and_mean() {
        let e = env(&[("P", vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0)])]);
        assert_eq!(eval("shift([P], 1)", &e), vec![None, Some(1.0), Some(2.0), Some(3.0)]);
        assert_eq!(eval("shift([P], -1)", &e), vec![Some(2.0), Some(3.0), Some(4.0), None]);
        assert_eq!(eval("mean([P], 2)", &e), vec![None, Some(1.5), Some(2.5), Some(3.5)]);
        let returns = eval("[P] / shift([P], 1) - 1", &e);
        assert_eq!(returns[..3], [None, Some(1.0), Some(0.5)]);
        assert!((returns[3].unwrap() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn min_max_pow() {
        let e = env(&[("A", vec![Some(2.0)]), ("B", vec![Some(3.0)])]);
        assert_eq!(eval("pow([A], [B])", &e), vec![Some(8.0)]);
        assert_eq!(eval("min([A], [B])", &e), vec![Some(2.0)]);
        assert_eq!(eval("max([A], [B])", &e), vec![Some(3.0)]);
    }

    #[test]
    fn bad_window_and_unbound_field() {
        let e = env(&[("A", vec![Some(1.0)])]);
        let err = evaluate(&parse_expression("mean([A], [A])").unwrap(), &e).unwrap_err();
        assert!(matches!(err, ExprError::InvalidArgument { func: "mean", .. }));
        let err = evaluate(&parse_expression("mean([A], 0)").unwrap(), &e).unwrap_err();
        assert!(matches!(err, ExprError::InvalidArgument { .. }));
        let err = evaluate(&parse_expression("[Z] + 1").unwrap(), &e).unwrap_err();
        assert_eq!(err, ExprError::UnboundField("Z".into()));
    }

    #[test]
    fn huge_windows_are_rejected() {
        let e = env(&[("P", vec![Some(1.0), Some(2.0), Some(3.0)])]);
        for text in ["shift([P], -1e19)", "shift([P], 1e19)", "mean([P], 1e12)"] {
            let err = evaluate(&parse_expression(text).unwrap(), &e).unwrap_err();
            assert!(matches!(err, ExprError::InvalidArgument { .. }), "{text}");
        }
        assert_eq!(eval("shift([P], 1000000)", &e), vec![None, None, None]);
        assert_eq!(eval("shift([P], -1000000)", &e), vec![None, None, None]);
    }
}
