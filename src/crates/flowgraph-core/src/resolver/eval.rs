//! Expression evaluation.
//!
//! Evaluation is pure and never fails: an unresolvable sub-expression
//! evaluates to `None` (missing), operators fold missing into their
//! coalescing/truthiness rules, and the surface degrades everything else to
//! `null`.

use serde_json::Value;

use super::parser::{BinOp, Expr};
use super::path;
use super::{LoopFrame, ParallelFrame};
use crate::context::ExecutionContext;

/// Evaluate an expression. `None` means the expression is unresolved (a
/// missing path, or a coalescing chain ending in one); callers preserve the
/// original template hole in that case.
pub(crate) fn evaluate(
    expr: &Expr,
    ctx: &ExecutionContext,
    loop_frame: Option<&LoopFrame>,
    parallel_frame: Option<&ParallelFrame>,
) -> Option<Value> {
    match expr {
        Expr::Literal(value) => Some(value.clone()),
        Expr::Path(segments) => {
            path::lookup(ctx, segments, loop_frame, parallel_frame).map(|(value, _)| value)
        }
        Expr::Not(inner) => {
            let value = evaluate(inner, ctx, loop_frame, parallel_frame);
            Some(Value::Bool(!is_truthy(value.as_ref())))
        }
        Expr::Binary { op, lhs, rhs } => {
            evaluate_binary(*op, lhs, rhs, ctx, loop_frame, parallel_frame)
        }
        Expr::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            let cond_value = evaluate(cond, ctx, loop_frame, parallel_frame);
            if is_truthy(cond_value.as_ref()) {
                evaluate(then_branch, ctx, loop_frame, parallel_frame)
            } else {
                evaluate(else_branch, ctx, loop_frame, parallel_frame)
            }
        }
    }
}

fn evaluate_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &ExecutionContext,
    loop_frame: Option<&LoopFrame>,
    parallel_frame: Option<&ParallelFrame>,
) -> Option<Value> {
    match op {
        // `||` is null-coalescing: the left operand is kept when it is
        // defined and non-null, so 0, "" and false do not fall through.
        // Short-circuits: the right side is untouched when the left is kept.
        BinOp::Or => {
            let left = evaluate(lhs, ctx, loop_frame, parallel_frame);
            if matches!(left, Some(ref v) if !v.is_null()) {
                return left;
            }
            evaluate(rhs, ctx, loop_frame, parallel_frame)
        }
        // `&&` returns the right operand when the left is truthy, else the
        // left operand; the right side is untouched when the left is falsy.
        BinOp::And => {
            let left = evaluate(lhs, ctx, loop_frame, parallel_frame);
            if is_truthy(left.as_ref()) {
                evaluate(rhs, ctx, loop_frame, parallel_frame)
            } else {
                left
            }
        }
        BinOp::Eq | BinOp::Ne => {
            let left = evaluate(lhs, ctx, loop_frame, parallel_frame);
            let right = evaluate(rhs, ctx, loop_frame, parallel_frame);
            let equal = weak_eq(left.as_ref(), right.as_ref());
            Some(Value::Bool(if op == BinOp::Eq { equal } else { !equal }))
        }
        BinOp::Gt | BinOp::Ge | BinOp::Lt | BinOp::Le => {
            let left = evaluate(lhs, ctx, loop_frame, parallel_frame);
            let right = evaluate(rhs, ctx, loop_frame, parallel_frame);
            match (as_number(left.as_ref()), as_number(right.as_ref())) {
                (Some(a), Some(b)) => Some(Value::Bool(match op {
                    BinOp::Gt => a > b,
                    BinOp::Ge => a >= b,
                    BinOp::Lt => a < b,
                    BinOp::Le => a <= b,
                    _ => unreachable!(),
                })),
                // Ordering over non-numerics yields null, not an error.
                _ => Some(Value::Null),
            }
        }
    }
}

/// Truthiness: non-null, non-false, non-zero, non-empty string. Arrays and
/// objects are truthy; a missing value is falsy.
pub(crate) fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Equality with weak numeric coercion: when one side is a number and the
/// other a string that parses as one, compare numerically ("5" == 5).
/// Missing compares equal to null.
fn weak_eq(left: Option<&Value>, right: Option<&Value>) -> bool {
    let left = left.unwrap_or(&Value::Null);
    let right = right.unwrap_or(&Value::Null);
    match (left, right) {
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            match (coerce_number(left), coerce_number(right)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => a == b,
            }
        }
        _ => left == right,
    }
}

fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Numeric coercion for ordering: numbers and numeric strings only.
fn as_number(value: Option<&Value>) -> Option<f64> {
    value.and_then(coerce_number)
}
