//! Path lookup against the execution context and transient frames.
//!
//! Lookup order, first hit wins: loop frame, parallel frame, shared memory,
//! workflow variables, node outputs, workflow inputs. Traversal is purely
//! structural — a key only resolves if the data literally contains it, so
//! reflective names (`__proto__`, `constructor`, `process`) are inert
//! unless user data carries them.

use serde_json::{json, Value};

use super::parser::Segment;
use super::{LoopFrame, ParallelFrame, ValueSource};
use crate::context::ExecutionContext;

pub(crate) fn lookup(
    ctx: &ExecutionContext,
    segments: &[Segment],
    loop_frame: Option<&LoopFrame>,
    parallel_frame: Option<&ParallelFrame>,
) -> Option<(Value, ValueSource)> {
    let first = match segments.first()? {
        Segment::Key(key) => key.as_str(),
        Segment::Index(_) => return None,
    };
    let rest = &segments[1..];

    if first == "loop" {
        if let Some(frame) = loop_frame {
            let root = json!({
                "index": frame.index,
                "item": frame.item,
                "total": frame.total,
                "results": frame.results,
            });
            return traverse(&root, rest).map(|v| (v.clone(), ValueSource::Loop));
        }
    }

    if first == "parallel" {
        if let Some(frame) = parallel_frame {
            let root = json!({
                "index": frame.index,
                "branchId": frame.branch_id,
                "currentItem": frame.current_item,
            });
            return traverse(&root, rest).map(|v| (v.clone(), ValueSource::Parallel));
        }
    }

    if first == "shared" {
        let key = match rest.first()? {
            Segment::Key(key) => key.as_str(),
            Segment::Index(_) => return None,
        };
        let value = ctx.shared_value(key)?;
        return traverse(value, &rest[1..]).map(|v| (v.clone(), ValueSource::Shared));
    }

    if let Some(value) = ctx.variable(first) {
        if let Some(found) = traverse(value, rest) {
            return Some((found.clone(), ValueSource::WorkflowVariable));
        }
    }

    if let Some(value) = ctx.node_output(first) {
        if let Some(found) = traverse(value, rest) {
            return Some((found.clone(), ValueSource::NodeOutput));
        }
    }

    if let Some(value) = ctx.input(first) {
        if let Some(found) = traverse(value, rest) {
            return Some((found.clone(), ValueSource::Input));
        }
    }

    None
}

/// Walk `segments` into `root`. Indexing past bounds, missing keys, and
/// descent through scalars or `null` all yield `None`.
fn traverse<'a>(root: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (current, segment) {
            (Value::Object(map), Segment::Key(key)) => map.get(key)?,
            (Value::Array(items), Segment::Index(i)) => {
                if *i < 0 {
                    return None;
                }
                items.get(*i as usize)?
            }
            (Value::Object(map), Segment::Index(i)) => map.get(&i.to_string())?,
            (Value::Array(items), Segment::Key(key)) => {
                let index = key.parse::<usize>().ok()?;
                items.get(index)?
            }
            _ => return None,
        };
    }
    Some(current)
}
