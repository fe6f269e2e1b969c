//! Event stream payloads and content fingerprints.
//!
//! The SSE layer detects change by polling the store and comparing content
//! fingerprints, not by change notifications. A fingerprint is a pure function
//! of the listed fields: equal field tuples produce equal fingerprints.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{Run, RunStatus, Step};

/// One event on a run's SSE stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "snapshot")]
    Snapshot {
        timestamp: String,
        run_id: String,
        run: Run,
        steps: Vec<Step>,
    },
    #[serde(rename = "run.updated")]
    RunUpdated {
        timestamp: String,
        run_id: String,
        run: Run,
    },
    #[serde(rename = "step.created")]
    StepCreated {
        timestamp: String,
        run_id: String,
        step: Step,
    },
    #[serde(rename = "step.updated")]
    StepUpdated {
        timestamp: String,
        run_id: String,
        step: Step,
    },
    #[serde(rename = "stream.closed")]
    StreamClosed {
        timestamp: String,
        run_id: String,
        status: RunStatus,
    },
    #[serde(rename = "error")]
    Error {
        timestamp: String,
        run_id: String,
        error: String,
    },
}

impl StreamEvent {
    /// SSE `event:` name for this payload.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::RunUpdated { .. } => "run.updated",
            Self::StepCreated { .. } => "step.created",
            Self::StepUpdated { .. } => "step.updated",
            Self::StreamClosed { .. } => "stream.closed",
            Self::Error { .. } => "error",
        }
    }

    pub fn snapshot(run: Run, steps: Vec<Step>) -> Self {
        Self::Snapshot {
            timestamp: now_rfc3339_nanos(),
            run_id: run.id.to_string(),
            run,
            steps,
        }
    }

    pub fn run_updated(run: Run) -> Self {
        Self::RunUpdated {
            timestamp: now_rfc3339_nanos(),
            run_id: run.id.to_string(),
            run,
        }
    }

    pub fn step_created(run_id: &str, step: Step) -> Self {
        Self::StepCreated {
            timestamp: now_rfc3339_nanos(),
            run_id: run_id.to_string(),
            step,
        }
    }

    pub fn step_updated(run_id: &str, step: Step) -> Self {
        Self::StepUpdated {
            timestamp: now_rfc3339_nanos(),
            run_id: run_id.to_string(),
            step,
        }
    }

    pub fn stream_closed(run_id: &str, status: RunStatus) -> Self {
        Self::StreamClosed {
            timestamp: now_rfc3339_nanos(),
            run_id: run_id.to_string(),
            status,
        }
    }

    pub fn error(run_id: &str, error: impl Into<String>) -> Self {
        Self::Error {
            timestamp: now_rfc3339_nanos(),
            run_id: run_id.to_string(),
            error: error.into(),
        }
    }
}

fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn format_time(t: &Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339_opts(SecondsFormat::Nanos, true))
        .unwrap_or_default()
}

fn format_json(v: &Option<serde_json::Value>) -> String {
    v.as_ref()
        .map(|v| v.to_string())
        .unwrap_or_default()
}

fn sha256_hex(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Content fingerprint of a run, over the fields the stream reports on.
pub fn run_fingerprint(run: &Run) -> String {
    let raw = format!(
        "{}|{}|{}|{}|{}",
        run.id,
        run.status.as_str(),
        run.summary.as_deref().unwrap_or_default(),
        run.error.as_deref().unwrap_or_default(),
        run.updated_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
    );
    sha256_hex(&raw)
}

/// Content fingerprint of a step.
pub fn step_fingerprint(step: &Step) -> String {
    let raw = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        step.id,
        step.step_num,
        step.phase.as_str(),
        step.status.as_str(),
        step.tool.as_deref().unwrap_or_default(),
        format_json(&step.tool_input),
        format_json(&step.tool_output),
        step.error.as_deref().unwrap_or_default(),
        format_time(&step.started_at),
        format_time(&step.completed_at),
    );
    sha256_hex(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Id, StepPhase, StepStatus};

    fn sample_run() -> Run {
        let now = Utc::now();
        Run {
            id: Id::from_string("run-1"),
            wake_id: None,
            goal: "goal".to_string(),
            context: None,
            constraints: None,
            status: RunStatus::Queued,
            summary: None,
            error: None,
            started_at: None,
            completed_at: None,
            updated_at: now,
            created_at: now,
        }
    }

    fn sample_step() -> Step {
        Step {
            id: Id::from_string("step-1"),
            run_id: Id::from_string("run-1"),
            step_num: 1,
            phase: StepPhase::Frame,
            tool: None,
            tool_input: None,
            tool_output: None,
            status: StepStatus::Pending,
            attempt: 1,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn run_fingerprint_is_stable_for_identical_values() {
        let run = sample_run();
        let copy = run.clone();
        assert_eq!(run_fingerprint(&run), run_fingerprint(&copy));
    }

    #[test]
    fn run_fingerprint_changes_on_status() {
        let run = sample_run();
        let mut changed = run.clone();
        changed.status = RunStatus::Running;
        assert_ne!(run_fingerprint(&run), run_fingerprint(&changed));
    }

    #[test]
    fn run_fingerprint_changes_on_summary_and_error() {
        let run = sample_run();
        let mut with_summary = run.clone();
        with_summary.summary = Some("done".to_string());
        let mut with_error = run.clone();
        with_error.error = Some("boom".to_string());
        assert_ne!(run_fingerprint(&run), run_fingerprint(&with_summary));
        assert_ne!(run_fingerprint(&run), run_fingerprint(&with_error));
        assert_ne!(
            run_fingerprint(&with_summary),
            run_fingerprint(&with_error)
        );
    }

    #[test]
    fn step_fingerprint_changes_on_output() {
        let step = sample_step();
        let mut changed = step.clone();
        changed.tool_output = Some(serde_json::json!({"content": "hello"}));
        assert_ne!(step_fingerprint(&step), step_fingerprint(&changed));
    }

    #[test]
    fn step_fingerprint_changes_on_lifecycle_fields() {
        let step = sample_step();
        let mut running = step.clone();
        running.status = StepStatus::Running;
        running.started_at = Some(Utc::now());
        assert_ne!(step_fingerprint(&step), step_fingerprint(&running));
    }

    #[test]
    fn event_names_match_wire_format() {
        let run = sample_run();
        assert_eq!(
            StreamEvent::snapshot(run.clone(), Vec::new()).name(),
            "snapshot"
        );
        assert_eq!(StreamEvent::run_updated(run.clone()).name(), "run.updated");
        assert_eq!(
            StreamEvent::stream_closed("run-1", RunStatus::Done).name(),
            "stream.closed"
        );
    }

    #[test]
    fn event_json_carries_type_tag() {
        let event = StreamEvent::stream_closed("run-1", RunStatus::Done);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stream.closed");
        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["status"], "done");
    }
}
