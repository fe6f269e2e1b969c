//! Per-run filesystem workspace.
//!
//! Each run owns `<workspace_root>/<run_id>/` holding the prompt snapshot,
//! run-level and loop-level memory files, and the structured `state.json`.
//! Workspace writes are best-effort from the executor's point of view: a
//! failed write is logged and the run continues on in-memory state.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("create workspace: {0}")]
    Create(std::io::Error),
    #[error("write {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

/// A run's workspace directory and its standard files.
pub struct Workspace {
    dir: PathBuf,
    run_memory_path: PathBuf,
    loop_memory_path: PathBuf,
    prompt_path: PathBuf,
    state_path: PathBuf,
}

impl Workspace {
    /// Create (or reopen) the workspace directory for a run.
    pub fn new(base_dir: &Path, run_id: &str) -> Result<Self> {
        let dir = base_dir.join(run_id);
        std::fs::create_dir_all(&dir).map_err(WorkspaceError::Create)?;
        Ok(Self {
            run_memory_path: dir.join("run_memory.md"),
            loop_memory_path: dir.join("loop_memory.md"),
            prompt_path: dir.join("prompt.md"),
            state_path: dir.join("state.json"),
            dir,
        })
    }

    /// Workspace root; workspace file tools use this as their sandbox base.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// One-shot human-readable snapshot of what the run was asked to do.
    pub fn write_prompt_snapshot(
        &self,
        goal: &str,
        context: Option<&serde_json::Value>,
        constraints: Option<&serde_json::Value>,
        system_prompt: &str,
    ) -> Result<()> {
        let mut out = String::new();
        out.push_str("# Prompt Snapshot\n\nGenerated: ");
        out.push_str(&now_stamp());
        out.push_str("\n\n## Goal\n\n");
        out.push_str(goal);
        out.push_str("\n\n## Context\n\n```json\n");
        out.push_str(&json_or_null(context));
        out.push_str("\n```\n\n## Constraints\n\n```json\n");
        out.push_str(&json_or_null(constraints));
        out.push_str("\n```\n\n## System Prompt\n\n```text\n");
        out.push_str(system_prompt);
        out.push_str("\n```\n");

        self.write_file(&self.prompt_path, &out)
    }

    /// Append the rendered prompt for one stage of one iteration.
    pub fn append_stage_prompt(&self, iteration: u32, stage: &str, prompt: &str) -> Result<()> {
        let entry = format!("\n## Iteration {iteration} - {stage} Prompt\n\n```text\n{prompt}\n```\n");
        self.append_file(&self.prompt_path, &entry)
    }

    /// Record a tool invocation into the per-iteration transcript.
    pub fn append_loop_tool_call(
        &self,
        tool: &str,
        input: &str,
        output: &str,
        status: &str,
    ) -> Result<()> {
        let entry = format!(
            "## {} — {}\n**Status:** {}\n**Input:**\n```json\n{}\n```\n**Output:**\n```json\n{}\n```\n\n",
            now_stamp(),
            tool,
            status,
            input,
            output,
        );
        self.append_file(&self.loop_memory_path, &entry)
    }

    /// Full contents of the loop transcript; empty when absent.
    pub fn read_loop_memory(&self) -> String {
        std::fs::read_to_string(&self.loop_memory_path).unwrap_or_default()
    }

    /// Truncate loop memory so the next iteration starts clean.
    pub fn clear_loop_memory(&self) -> Result<()> {
        self.write_file(&self.loop_memory_path, "")
    }

    /// Copy the current loop transcript to `loop_memory_iter_{iter}.md`.
    /// A no-op when the transcript is empty.
    pub fn archive_loop_memory(&self, iter: u32) -> Result<()> {
        let data = self.read_loop_memory();
        if data.trim().is_empty() {
            return Ok(());
        }
        let dst = self.dir.join(format!("loop_memory_iter_{iter}.md"));
        self.write_file(&dst, &data)
    }

    /// Append distilled cross-iteration memory. Skips empty text.
    pub fn append_run_memory(&self, iteration: u32, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let entry = format!("## Iteration {iteration} — {}\n{text}\n\n", now_stamp());
        self.append_file(&self.run_memory_path, &entry)
    }

    /// Full contents of persistent run memory; empty when absent.
    pub fn read_run_memory(&self) -> String {
        std::fs::read_to_string(&self.run_memory_path).unwrap_or_default()
    }

    /// Raw contents of `state.json`; empty when absent.
    pub fn read_state(&self) -> String {
        std::fs::read_to_string(&self.state_path).unwrap_or_default()
    }

    /// Overwrite `state.json`.
    pub fn write_state(&self, json: &str) -> Result<()> {
        self.write_file(&self.state_path, json)
    }

    fn write_file(&self, path: &Path, content: &str) -> Result<()> {
        std::fs::write(path, content).map_err(|source| WorkspaceError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    fn append_file(&self, path: &Path, content: &str) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(|source| WorkspaceError::Write {
                path: path.display().to_string(),
                source,
            })?;
        file.write_all(content.as_bytes())
            .map_err(|source| WorkspaceError::Write {
                path: path.display().to_string(),
                source,
            })
    }
}

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn json_or_null(v: Option<&serde_json::Value>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string())
}
