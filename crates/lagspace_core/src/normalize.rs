//! Time-offset normalization.
//!
//! Rewrites time operators (`lag`, `lead`, `diff`, `dlog` and the moving
//! sum/average family) into plain arithmetic over `Series` references, so
//! that every time reference in the output is `x[t+k]` for a fixed integer
//! `k`. Bare identifiers that name model variables become `x[t]`.

use crate::equation_engine::Expr;
use crate::errors::SyntaxError;

/// Coefficients smaller than this are dropped from expanded sums.
const DROP_TOLERANCE: f64 = 1e-12;

/// Normalizes `expr`. `is_variable` decides whether a bare identifier is a
/// model variable (and hence means `name[t]`).
pub fn normalize<F>(expr: &Expr, is_variable: &F) -> Result<Expr, SyntaxError>
where
    F: Fn(&str) -> bool,
{
    match expr {
        Expr::Number(_) | Expr::Series(..) | Expr::SteadyState(_) => Ok(expr.clone()),
        Expr::Symbol(name) if is_variable(name) => Ok(Expr::Series(name.clone(), 0)),
        Expr::Symbol(_) => Ok(expr.clone()),
        Expr::Indexed(name, indices) => match indices.as_slice() {
            [index] => Ok(Expr::Series(name.clone(), time_offset(index)?)),
            _ => Err(SyntaxError::MultipleTimeIndices(name.clone())),
        },
        Expr::Unary(op, e) => Ok(Expr::Unary(*op, Box::new(normalize(e, is_variable)?))),
        Expr::Binary(l, op, r) => Ok(Expr::binary(
            normalize(l, is_variable)?,
            *op,
            normalize(r, is_variable)?,
        )),
        Expr::Call(name, args) => expand_call(name, args, is_variable),
    }
}

/// Shifts every time reference in an already normalized expression by `k`.
pub fn shift(expr: &Expr, k: i32) -> Result<Expr, SyntaxError> {
    Ok(match expr {
        Expr::Series(name, offset) => {
            let shifted = offset
                .checked_add(k)
                .filter(|o| *o != i32::MIN)
                .ok_or_else(|| SyntaxError::OffsetOutOfRange(name.clone()))?;
            Expr::Series(name.clone(), shifted)
        }
        Expr::Unary(op, e) => Expr::Unary(*op, Box::new(shift(e, k)?)),
        Expr::Binary(l, op, r) => Expr::binary(shift(l, k)?, *op, shift(r, k)?),
        Expr::Call(name, args) => Expr::Call(
            name.clone(),
            args.iter()
                .map(|a| shift(a, k))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Expr::Indexed(name, idx) => Expr::Indexed(name.clone(), idx.clone()),
        Expr::Number(_) | Expr::Symbol(_) | Expr::SteadyState(_) => expr.clone(),
    })
}

/// Coefficients of the `n`-th difference, combined with one seasonal
/// difference of period `s` when `s > 0`. Entry `i` multiplies lag `i`.
pub fn difference_coefficients(n: usize, s: usize) -> Vec<f64> {
    let mut coefs = vec![1.0];
    for _ in 0..n {
        coefs = convolve(&coefs, &[1.0, -1.0]);
    }
    if s > 0 {
        let mut seasonal = vec![0.0; s + 1];
        seasonal[0] = 1.0;
        seasonal[s] = -1.0;
        coefs = convolve(&coefs, &seasonal);
    }
    coefs
}

fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

/// `t`, `t+k`, `t-k` or `k+t` with integer `k`.
fn time_offset(index: &Expr) -> Result<i32, SyntaxError> {
    let unsupported = || SyntaxError::UnsupportedTimeIndex(index.to_string());
    let is_t = |e: &Expr| matches!(e, Expr::Symbol(s) if s == "t");
    let integer = |e: &Expr| {
        e.constant_value()
            .filter(|v| v.is_finite() && v.fract() == 0.0 && v.abs() <= i32::MAX as f64)
            .map(|v| v as i32)
    };

    match index {
        e if is_t(e) => Ok(0),
        Expr::Binary(l, '+', r) if is_t(l) => integer(r).ok_or_else(unsupported),
        Expr::Binary(l, '-', r) if is_t(l) => integer(r).map(|k| -k).ok_or_else(unsupported),
        Expr::Binary(l, '+', r) if is_t(r) => integer(l).ok_or_else(unsupported),
        _ => Err(unsupported()),
    }
}

fn bad_argument(name: &str, reason: impl Into<String>) -> SyntaxError {
    SyntaxError::BadMacroArgument {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn constant_arg(name: &str, arg: &Expr) -> Result<f64, SyntaxError> {
    arg.constant_value()
        .ok_or_else(|| bad_argument(name, format!("`{arg}` is not a numeric constant")))
}

fn count_arg(name: &str, arg: &Expr) -> Result<usize, SyntaxError> {
    let value = constant_arg(name, arg)?;
    if value.fract() != 0.0 || value < 0.0 || value > i32::MAX as f64 {
        return Err(bad_argument(
            name,
            format!("`{arg}` is not a non-negative integer"),
        ));
    }
    Ok(value as usize)
}

fn expand_call<F>(name: &str, args: &[Expr], is_variable: &F) -> Result<Expr, SyntaxError>
where
    F: Fn(&str) -> bool,
{
    let arity = |range: std::ops::RangeInclusive<usize>| {
        if range.contains(&args.len()) {
            Ok(())
        } else {
            Err(bad_argument(
                name,
                format!(
                    "expected {} to {} arguments, got {}",
                    range.start(),
                    range.end(),
                    args.len()
                ),
            ))
        }
    };

    match name {
        "lag" | "lead" => {
            arity(1..=2)?;
            let n = match args.get(1) {
                Some(arg) => count_arg(name, arg)? as i32,
                None => 1,
            };
            let inner = normalize(&args[0], is_variable)?;
            shift(&inner, if name == "lag" { -n } else { n })
        }
        "diff" | "dlog" => {
            arity(1..=3)?;
            let n = match args.get(1) {
                Some(arg) => count_arg(name, arg)?,
                None => 1,
            };
            let s = match args.get(2) {
                Some(arg) => count_arg(name, arg)?,
                None => 0,
            };
            let mut inner = normalize(&args[0], is_variable)?;
            if name == "dlog" {
                inner = Expr::Call("log".to_string(), vec![inner]);
            }
            weighted_sum(name, &inner, &difference_coefficients(n, s))
        }
        "movsum" | "movavg" => {
            arity(2..=2)?;
            let n = positive_count(name, &args[1])?;
            let inner = normalize(&args[0], is_variable)?;
            let weights = vec![1.0; n];
            finish_moving(name, name == "movavg", &inner, &weights)
        }
        "movsumw" | "movavgw" => {
            if args.len() < 3 {
                return Err(bad_argument(name, "expected an expression, a count and weights"));
            }
            let n = positive_count(name, &args[1])?;
            if args.len() - 2 != n {
                return Err(bad_argument(
                    name,
                    format!("expected {n} weights, got {}", args.len() - 2),
                ));
            }
            let weights = args[2..]
                .iter()
                .map(|w| constant_arg(name, w))
                .collect::<Result<Vec<_>, _>>()?;
            let inner = normalize(&args[0], is_variable)?;
            finish_moving(name, name == "movavgw", &inner, &weights)
        }
        "movsumew" | "movavgew" => {
            arity(3..=3)?;
            let n = positive_count(name, &args[1])?;
            let r = constant_arg(name, &args[2])?;
            let weights: Vec<f64> = (0..n).map(|i| r.powi(i as i32)).collect();
            let inner = normalize(&args[0], is_variable)?;
            finish_moving(name, name == "movavgew", &inner, &weights)
        }
        _ => {
            let args = args
                .iter()
                .map(|a| normalize(a, is_variable))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::Call(name.to_string(), args))
        }
    }
}

fn positive_count(name: &str, arg: &Expr) -> Result<usize, SyntaxError> {
    match count_arg(name, arg)? {
        0 => Err(bad_argument(name, "window length must be positive")),
        n => Ok(n),
    }
}

fn finish_moving(
    name: &str,
    average: bool,
    inner: &Expr,
    weights: &[f64],
) -> Result<Expr, SyntaxError> {
    let sum = weighted_sum(name, inner, weights)?;
    if !average {
        return Ok(sum);
    }
    let total: f64 = weights.iter().sum();
    Ok(Expr::binary(sum, '/', Expr::Number(total)))
}

/// `Σ weights[i] * lag(inner, i)`, written without unit multipliers.
fn weighted_sum(name: &str, inner: &Expr, weights: &[f64]) -> Result<Expr, SyntaxError> {
    let mut terms = Vec::with_capacity(weights.len());
    for (i, &w) in weights.iter().enumerate() {
        if !w.is_finite() {
            return Err(bad_argument(name, format!("coefficient of lag {i} is not finite")));
        }
        if w.abs() < DROP_TOLERANCE {
            continue;
        }
        let lagged = shift(inner, -(i as i32))?;
        let term = if w.abs() == 1.0 {
            lagged
        } else {
            Expr::binary(Expr::Number(w.abs()), '*', lagged)
        };
        terms.push((w < 0.0, term));
    }
    Ok(balanced_sum(terms))
}

/// Adds signed terms by pairwise reduction, so the tree depth grows with
/// the logarithm of the term count. A pair keeps the sign of its left term.
fn balanced_sum(mut terms: Vec<(bool, Expr)>) -> Expr {
    while terms.len() > 1 {
        let mut next = Vec::with_capacity(terms.len().div_ceil(2));
        let mut iter = terms.into_iter();
        while let Some((negative, left)) = iter.next() {
            match iter.next() {
                Some((right_negative, right)) => {
                    let op = if negative == right_negative { '+' } else { '-' };
                    next.push((negative, Expr::binary(left, op, right)));
                }
                None => next.push((negative, left)),
            }
        }
        terms = next;
    }
    match terms.pop() {
        Some((true, sum)) => Expr::Unary('-', Box::new(sum)),
        Some((false, sum)) => sum,
        None => Expr::Number(0.0),
    }
}
