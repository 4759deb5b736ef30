//! Variable resolution and template interpolation.
//!
//! Node configs reference upstream data through a small, side-effect-free
//! expression language. Two operations make up the public surface:
//!
//! - [`resolve`] evaluates a single expression against an
//!   [`ExecutionContext`] and optional loop/parallel frames, reporting the
//!   value and where it came from.
//! - [`interpolate`] replaces every `{{ expr }}` hole in a template with
//!   the stringified value of `expr`, preserving unresolved holes.
//!
//! # Grammar
//!
//! An expression is a dotted path with optional bracket indexing
//! (`a.b[0]`, `a['k-1']`), a literal (`42`, `-1.5`, `'text'`, `true`,
//! `false`, `null`), a unary negation (`!expr`), a binary expression over
//! `||`, `&&`, `==`, `!=`, `>`, `>=`, `<`, `<=`, a ternary
//! (`cond ? a : b`), or a parenthesised grouping. Precedence low to high:
//! `?:`, `||`, `&&`, comparisons, `!`, parentheses.
//!
//! `||` is null-coalescing rather than boolean: the left operand is kept
//! whenever it is defined and non-null, so `0`, `""`, and `false` do not
//! fall through. `&&` keys on truthiness (non-null, non-false, non-zero,
//! non-empty string). `==` applies weak numeric coercion (`"5" == 5`);
//! ordering operators coerce both sides to numbers and yield `null` when
//! either side is non-numeric.
//!
//! # Lookup order
//!
//! Paths resolve in this order, first hit wins: `loop.*` against a
//! supplied [`LoopFrame`], `parallel.*` against a [`ParallelFrame`],
//! `shared.*` against shared memory, workflow variables, node outputs,
//! workflow inputs. Traversal is purely structural; expressions never
//! evaluate host code, and malformed expressions resolve to `null` instead
//! of raising.
//!
//! # Examples
//!
//! ```rust
//! use flowgraph_core::context::ExecutionContext;
//! use flowgraph_core::resolver::{interpolate, resolve, ValueSource};
//! use serde_json::json;
//! use std::collections::HashMap;
//!
//! let ctx = ExecutionContext::new(HashMap::from([
//!     ("entityId".to_string(), json!("user-123")),
//! ]));
//! let ctx = ctx
//!     .store_node_output("http", json!({"statusCode": 200}))
//!     .unwrap();
//!
//! let hit = resolve(&ctx, "http.statusCode", None, None).unwrap();
//! assert_eq!(hit.value, json!(200));
//! assert_eq!(hit.source, ValueSource::NodeOutput);
//!
//! let rendered = interpolate(&ctx, "GET /users/{{entityId}}", None, None);
//! assert_eq!(rendered, "GET /users/user-123");
//! ```

mod eval;
mod interpolate;
mod lexer;
mod parser;
mod path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;

/// Transient bindings for `loop.*` paths, scoped to one loop iteration.
///
/// Frames are passed as parameters rather than stored in the context so
/// that nested iterations never alias each other's `loop.index`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoopFrame {
    pub index: usize,
    pub item: Value,
    pub total: usize,
    /// Results accumulated from prior iterations.
    pub results: Value,
}

/// Transient bindings for `parallel.*` paths, scoped to one branch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ParallelFrame {
    pub index: usize,
    pub branch_id: String,
    pub current_item: Value,
}

/// Where a resolved value was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueSource {
    Loop,
    Parallel,
    Shared,
    WorkflowVariable,
    NodeOutput,
    Input,
    /// A computed (non-path) expression.
    Expression,
}

/// A successful resolution: the value and its source.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub value: Value,
    pub source: ValueSource,
}

/// Resolve a single expression against the context and optional frames.
///
/// Returns `None` when the expression is malformed or evaluates to a
/// missing value. Plain paths report the source they were found in;
/// computed expressions report [`ValueSource::Expression`].
pub fn resolve(
    ctx: &ExecutionContext,
    expression: &str,
    loop_frame: Option<&LoopFrame>,
    parallel_frame: Option<&ParallelFrame>,
) -> Option<Resolved> {
    let expr = parser::parse(expression).ok()?;
    match &expr {
        parser::Expr::Path(segments) => path::lookup(ctx, segments, loop_frame, parallel_frame)
            .map(|(value, source)| Resolved { value, source }),
        _ => eval::evaluate(&expr, ctx, loop_frame, parallel_frame).map(|value| Resolved {
            value,
            source: ValueSource::Expression,
        }),
    }
}

/// Interpolate every `{{ expr }}` occurrence in `template`.
///
/// Unresolved expressions are left verbatim (braces included) so the
/// unfilled hole stays visible downstream; non-string values stringify as
/// compact JSON. A template without holes is returned unchanged.
pub fn interpolate(
    ctx: &ExecutionContext,
    template: &str,
    loop_frame: Option<&LoopFrame>,
    parallel_frame: Option<&ParallelFrame>,
) -> String {
    interpolate::interpolate(ctx, template, loop_frame, parallel_frame)
}

/// Truthiness as the expression language defines it: non-null, non-false,
/// non-zero, non-empty string. Handlers use this to agree with `&&`/`!`.
pub fn is_truthy(value: &Value) -> bool {
    eval::is_truthy(Some(value))
}
