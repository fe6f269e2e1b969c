//! The completion-signal tool.
//!
//! A run may only terminate `done` after the model has called this tool with a
//! non-empty summary and evidence. The executor observes the successful call
//! and opens the completion gate.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::llm::ToolSpec;
use crate::tools::{object_schema, Result, Tool, ToolError};

pub const REPORT_SUCCESS_TOOL: &str = "report_success";

/// Tool the agent must call to claim success.
pub struct ReportSuccessTool;

#[async_trait]
impl Tool for ReportSuccessTool {
    async fn info(&self) -> Result<ToolSpec> {
        Ok(ToolSpec {
            name: REPORT_SUCCESS_TOOL.to_string(),
            description: "Report that the goal has been accomplished. Required before the run \
                          can complete. Provide a summary of what was done and the evidence \
                          supporting it."
                .to_string(),
            parameters: object_schema(&[
                ("summary", "string", "What was accomplished"),
                ("evidence", "string", "Evidence that the goal is satisfied"),
            ]),
        })
    }

    async fn invoke(&self, arguments: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            summary: String,
            #[serde(default)]
            evidence: String,
        }
        let args: Args = serde_json::from_str(arguments)?;
        let summary = args.summary.trim();
        let evidence = args.evidence.trim();

        if summary.is_empty() {
            return Err(ToolError::Invalid("summary is required".to_string()));
        }
        if evidence.is_empty() {
            return Err(ToolError::Invalid("evidence is required".to_string()));
        }

        Ok(json!({
            "status": "ok",
            "accepted": true,
            "summary": summary,
            "evidence": evidence,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_complete_reports() {
        let tool = ReportSuccessTool;
        let out = tool
            .invoke(r#"{"summary": "did the thing", "evidence": "output captured"}"#)
            .await
            .unwrap();
        let resp: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(resp["accepted"], true);
        assert_eq!(resp["summary"], "did the thing");
        assert_eq!(resp["evidence"], "output captured");
    }

    #[tokio::test]
    async fn rejects_missing_summary() {
        let tool = ReportSuccessTool;
        let err = tool
            .invoke(r#"{"evidence": "output captured"}"#)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("summary is required"));
    }

    #[tokio::test]
    async fn rejects_blank_evidence() {
        let tool = ReportSuccessTool;
        let err = tool
            .invoke(r#"{"summary": "done", "evidence": "   "}"#)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("evidence is required"));
    }
}
