//! Structured run state and reflect-decision parsing.
//!
//! `state.json` is a JSON object with the conventional keys `todo`,
//! `evidence`, and `notes`; other keys are preserved. The Frame stage
//! initializes it and Reflect merges updates into it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Where the loop goes after a reflect decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStage {
    Plan,
    Act,
    Done,
}

/// Parsed output of the Reflect stage.
///
/// Models rarely emit clean JSON, so parsing is tiered: strict JSON, then the
/// outermost `{...}` slice, then a fallback carrying the raw text as summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReflectDecision {
    #[serde(default)]
    pub next_stage: Option<String>,
    /// Legacy completion flag; superseded by `next_stage`.
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub next_focus: String,
    #[serde(default)]
    pub memory_update: String,
    #[serde(default)]
    pub updated_state: Option<Value>,
}

impl ReflectDecision {
    /// Resolve the stage to enter next. `next_stage` wins when it names a
    /// known stage; otherwise the legacy `done` flag maps to `Done`, and
    /// anything else restarts at `Plan`.
    pub fn resolved_next_stage(&self) -> NextStage {
        match self.next_stage.as_deref() {
            Some("plan") => NextStage::Plan,
            Some("act") => NextStage::Act,
            Some("done") => NextStage::Done,
            _ if self.done => NextStage::Done,
            _ => NextStage::Plan,
        }
    }
}

/// Parse reflect output into a decision, never failing.
pub fn parse_reflect_decision(raw: &str) -> ReflectDecision {
    let text = raw.trim();
    if text.is_empty() {
        return ReflectDecision::default();
    }

    if let Ok(decision) = serde_json::from_str::<ReflectDecision>(text) {
        return decision;
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Ok(decision) = serde_json::from_str::<ReflectDecision>(&text[start..=end]) {
                return decision;
            }
        }
    }

    ReflectDecision {
        summary: text.to_string(),
        ..ReflectDecision::default()
    }
}

/// Convert arbitrary stage output into a JSON object.
///
/// Strict parse first, then the outermost `{...}` slice, then a synthesized
/// object carrying the raw text as a note. The result is always an object.
pub fn normalize_state_json(raw: &str) -> Value {
    let text = raw.trim();
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(text) {
        return Value::Object(obj);
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if end > start {
            if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Value::Object(obj);
            }
        }
    }
    json!({
        "todo": [],
        "evidence": [],
        "notes": if text.is_empty() { Vec::<String>::new() } else { vec![text.to_string()] },
    })
}

/// Merge a reflect `updated_state` object into the existing state.
///
/// - `todo`: list-merge by `id`: update existing entries field-wise, append
///   new ones, stable order by first appearance.
/// - `evidence`, `notes`: append with de-duplication, preserving first-seen
///   order and dropping empty strings.
/// - Any other key: last-write-wins overwrite.
pub fn merge_state_json(existing: &Value, updated: &Value) -> Value {
    let mut merged = match existing {
        Value::Object(obj) => obj.clone(),
        _ => Map::new(),
    };
    let Value::Object(updates) = updated else {
        return Value::Object(merged);
    };

    for (key, value) in updates {
        match key.as_str() {
            "todo" => {
                let base = merged.get("todo").cloned().unwrap_or(Value::Array(vec![]));
                merged.insert(key.clone(), merge_todo(&base, value));
            }
            "evidence" | "notes" => {
                let base = merged.get(key).cloned().unwrap_or(Value::Array(vec![]));
                merged.insert(key.clone(), merge_string_list(&base, value));
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }

    Value::Object(merged)
}

fn merge_todo(existing: &Value, updated: &Value) -> Value {
    let mut items: Vec<Value> = existing
        .as_array()
        .map(|a| a.to_vec())
        .unwrap_or_default();

    let Some(updates) = updated.as_array() else {
        return Value::Array(items);
    };

    for update in updates {
        let Some(update_obj) = update.as_object() else {
            continue;
        };
        let id = update_obj.get("id").cloned();

        let position = id.as_ref().and_then(|id| {
            items
                .iter()
                .position(|item| item.get("id") == Some(id))
        });

        match position {
            Some(idx) => {
                if let Some(target) = items[idx].as_object_mut() {
                    for (k, v) in update_obj {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
            None => items.push(update.clone()),
        }
    }

    Value::Array(items)
}

fn merge_string_list(existing: &Value, updated: &Value) -> Value {
    let mut seen = Vec::new();
    let mut out = Vec::new();

    let mut push = |value: &Value| {
        if let Some(s) = value.as_str() {
            if s.is_empty() || seen.contains(&s.to_string()) {
                return;
            }
            seen.push(s.to_string());
            out.push(Value::String(s.to_string()));
        }
    };

    for list in [existing, updated] {
        if let Some(items) = list.as_array() {
            for item in items {
                push(item);
            }
        }
    }

    Value::Array(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_passes_valid_object_through() {
        let state = normalize_state_json(r#"{"todo":[],"evidence":["e"],"notes":[]}"#);
        assert_eq!(state["evidence"][0], "e");
    }

    #[test]
    fn normalize_extracts_embedded_object() {
        let raw = "Here is the state:\n{\"todo\": [], \"notes\": [\"n\"]}\nthanks";
        let state = normalize_state_json(raw);
        assert_eq!(state["notes"][0], "n");
    }

    #[test]
    fn normalize_falls_back_to_notes() {
        let raw = "plain text frame output";
        let state = normalize_state_json(raw);
        assert!(state.is_object());
        assert_eq!(state["notes"][0], raw);
        assert_eq!(state["todo"], json!([]));
        assert_eq!(state["evidence"], json!([]));
    }

    #[test]
    fn normalize_always_returns_object() {
        for raw in ["", "[1,2,3]", "42", "\"quoted\"", "{broken"] {
            assert!(normalize_state_json(raw).is_object(), "input: {raw:?}");
        }
    }

    #[test]
    fn merge_updates_todo_by_id_and_appends_new() {
        let existing = json!({
            "todo": [{"id": "T1", "task": "first", "done": false}],
            "evidence": ["e1"],
            "notes": ["n1"],
        });
        let updated = json!({
            "todo": [{"id": "T1", "done": true}, {"id": "T2", "task": "second", "done": false}],
            "evidence": ["e2", "e1"],
            "notes": ["n2"],
        });

        let merged = merge_state_json(&existing, &updated);
        let todo = merged["todo"].as_array().unwrap();
        assert_eq!(todo.len(), 2);
        assert_eq!(todo[0]["id"], "T1");
        assert_eq!(todo[0]["task"], "first");
        assert_eq!(todo[0]["done"], true);
        assert_eq!(todo[1]["id"], "T2");

        let evidence = merged["evidence"].as_array().unwrap();
        assert_eq!(evidence.len(), 2);
        assert_eq!(evidence[0], "e1");
        assert_eq!(evidence[1], "e2");

        let notes = merged["notes"].as_array().unwrap();
        assert_eq!(notes.len(), 2);
    }

    #[test]
    fn merge_is_idempotent_for_todo() {
        let existing = json!({"todo": [{"id": "T1", "done": false}]});
        let updated = json!({"todo": [{"id": "T1", "done": true}]});
        let once = merge_state_json(&existing, &updated);
        let twice = merge_state_json(&once, &updated);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_drops_empty_strings_from_unions() {
        let existing = json!({"notes": ["a"]});
        let updated = json!({"notes": ["", "b", "a"]});
        let merged = merge_state_json(&existing, &updated);
        assert_eq!(merged["notes"], json!(["a", "b"]));
    }

    #[test]
    fn merge_other_keys_last_write_wins() {
        let existing = json!({"focus": "old", "todo": []});
        let updated = json!({"focus": "new"});
        let merged = merge_state_json(&existing, &updated);
        assert_eq!(merged["focus"], "new");
        assert_eq!(merged["todo"], json!([]));
    }

    #[test]
    fn reflect_decision_strict_json() {
        let decision =
            parse_reflect_decision(r#"{"next_stage":"done","summary":"all finished"}"#);
        assert_eq!(decision.resolved_next_stage(), NextStage::Done);
        assert_eq!(decision.summary, "all finished");
    }

    #[test]
    fn reflect_decision_embedded_json() {
        let raw = "Reflection complete.\n{\"next_stage\": \"act\", \"next_focus\": \"retry\"}";
        let decision = parse_reflect_decision(raw);
        assert_eq!(decision.resolved_next_stage(), NextStage::Act);
        assert_eq!(decision.next_focus, "retry");
    }

    #[test]
    fn reflect_decision_fallback_keeps_raw_summary() {
        let decision = parse_reflect_decision("not json at all");
        assert_eq!(decision.resolved_next_stage(), NextStage::Plan);
        assert_eq!(decision.summary, "not json at all");
        assert!(!decision.done);
    }

    #[test]
    fn reflect_decision_legacy_done_flag() {
        let decision = parse_reflect_decision(r#"{"done": true, "summary": "legacy"}"#);
        assert_eq!(decision.resolved_next_stage(), NextStage::Done);

        let decision = parse_reflect_decision(r#"{"done": false}"#);
        assert_eq!(decision.resolved_next_stage(), NextStage::Plan);
    }

    #[test]
    fn reflect_decision_unknown_next_stage_defaults_to_plan() {
        let decision = parse_reflect_decision(r#"{"next_stage": "ponder"}"#);
        assert_eq!(decision.resolved_next_stage(), NextStage::Plan);
    }
}
