//! Reassembles a streamed chat-completion message from its delta fragments.
//!
//! Streaming backends send the assistant message piecewise: `content` arrives
//! a few characters at a time, and each tool call is spread over many
//! fragments addressed by an `index` field (name first, then `arguments`
//! character by character). [`reduce`] folds one fragment into the
//! accumulator; folding every fragment in arrival order yields the complete
//! message.

use serde_json::{Map, Value};
use tracing::warn;

use crate::llm::types::ChoiceMessage;

/// String keys whose value is reissued verbatim rather than continued.
pub const IDENTITY_KEYS: [&str; 3] = ["id", "type", "name"];

/// Per-element ordinal the streaming protocol attaches to array entries.
const INDEX_KEY: &str = "index";

/// How far past the current end an `index` may point before it is treated as
/// a plain append.
const MAX_INDEX_GAP: usize = 16;

/// Folds `delta` into `acc` and returns the updated accumulator.
///
/// The accumulator is taken by value and updated in place, so subtrees it
/// already owns are never copied; only values adopted from `delta` are cloned.
pub fn reduce(mut acc: Value, delta: &Value) -> Value {
    merge_value(&mut acc, delta);
    acc
}

/// Converts a fully reduced accumulator into the typed assistant message.
pub fn into_choice_message(acc: Value) -> ChoiceMessage {
    match serde_json::from_value::<ChoiceMessage>(acc.clone()) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "reduced stream message has unexpected shape; salvaging content");
            ChoiceMessage {
                role: Some("assistant".into()),
                content: acc
                    .get("content")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                tool_calls: acc
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .map(|calls| {
                        calls
                            .iter()
                            .filter_map(|c| serde_json::from_value(c.clone()).ok())
                            .collect()
                    })
                    .unwrap_or_default(),
            }
        }
    }
}

fn merge_value(acc: &mut Value, delta: &Value) {
    match (acc, delta) {
        (Value::Object(a), Value::Object(d)) => merge_object(a, d, false),
        (acc, delta) => adopt(acc, delta),
    }
}

fn merge_object(acc: &mut Map<String, Value>, delta: &Map<String, Value>, skip_index: bool) {
    for (key, dv) in delta {
        if skip_index && key == INDEX_KEY {
            continue;
        }
        match acc.get_mut(key) {
            None => {
                let mut v = dv.clone();
                strip_indices(&mut v);
                acc.insert(key.clone(), v);
            }
            Some(slot) => merge_key(key, slot, dv),
        }
    }
}

fn merge_key(key: &str, slot: &mut Value, dv: &Value) {
    if dv.is_null() {
        return;
    }
    if slot.is_null() {
        adopt(slot, dv);
        return;
    }
    match (slot, dv) {
        (Value::String(s), Value::String(d)) => {
            if IDENTITY_KEYS.contains(&key) {
                s.clear();
            }
            s.push_str(d);
        }
        (Value::Array(a), Value::Array(d)) => {
            merge_array(a, d);
            for el in a.iter_mut() {
                if let Value::Object(obj) = el {
                    obj.remove(INDEX_KEY);
                }
            }
        }
        (Value::Object(a), Value::Object(d)) => merge_object(a, d, false),
        (slot, dv) => adopt(slot, dv),
    }
}

fn merge_array(acc: &mut Vec<Value>, delta: &[Value]) {
    for (pos, el) in delta.iter().enumerate() {
        let mut target = el
            .get(INDEX_KEY)
            .and_then(Value::as_u64)
            .map(|i| usize::try_from(i).unwrap_or(usize::MAX))
            .unwrap_or(pos);
        if target > acc.len() + MAX_INDEX_GAP {
            warn!(index = target, len = acc.len(), "delta index out of range; appending");
            target = acc.len();
        }
        if acc.len() <= target {
            acc.resize(target + 1, Value::Null);
        }
        match (&mut acc[target], el) {
            (Value::Object(a), Value::Object(d)) => merge_object(a, d, true),
            (slot, el) => adopt(slot, el),
        }
    }
}

fn adopt(slot: &mut Value, dv: &Value) {
    let mut v = dv.clone();
    strip_indices(&mut v);
    *slot = v;
}

fn strip_indices(v: &mut Value) {
    match v {
        Value::Array(items) => {
            for item in items.iter_mut() {
                if let Value::Object(obj) = item {
                    obj.remove(INDEX_KEY);
                }
            }
        }
        Value::Object(obj) => {
            for child in obj.values_mut() {
                if child.is_array() {
                    strip_indices(child);
                }
            }
        }
        _ => {}
    }
}
