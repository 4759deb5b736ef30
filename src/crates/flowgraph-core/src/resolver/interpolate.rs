//! `{{ … }}` template interpolation.
//!
//! Every `{{ expr }}` occurrence is replaced by the stringified value of
//! `expr`. An expression that cannot be resolved is left verbatim in the
//! output so downstream debugging sees the unfilled hole. Closing braces
//! inside string literals do not terminate an expression.

use serde_json::Value;

use super::parser::parse;
use super::{eval, LoopFrame, ParallelFrame};
use crate::context::ExecutionContext;

pub(crate) fn interpolate(
    ctx: &ExecutionContext,
    template: &str,
    loop_frame: Option<&LoopFrame>,
    parallel_frame: Option<&ParallelFrame>,
) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match find_close(after_open) {
            Some(close) => {
                let raw = &after_open[..close];
                match resolve_expression(ctx, raw, loop_frame, parallel_frame) {
                    Some(value) => out.push_str(&stringify(&value)),
                    None => {
                        // Preserve the hole, braces included.
                        out.push_str(&rest[open..open + 2 + close + 2]);
                    }
                }
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated expression: keep the remainder literally.
                out.push_str(&rest[open..]);
                return out;
            }
        }
    }

    out.push_str(rest);
    out
}

fn resolve_expression(
    ctx: &ExecutionContext,
    raw: &str,
    loop_frame: Option<&LoopFrame>,
    parallel_frame: Option<&ParallelFrame>,
) -> Option<Value> {
    let expr = parse(raw).ok()?;
    eval::evaluate(&expr, ctx, loop_frame, parallel_frame)
}

/// Find the index of the closing `}}` relative to `src`, skipping string
/// literals. Returns `None` when the expression is unterminated.
fn find_close(src: &str) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut i = 0;
    let mut quote: Option<u8> = None;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => {
                if b == b'\'' || b == b'"' {
                    quote = Some(b);
                } else if b == b'}' && bytes.get(i + 1) == Some(&b'}') {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

/// Strings interpolate as-is; everything else as compact JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}
