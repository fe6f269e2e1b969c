//! Ductile plugin-gateway client and its synthesized tools.
//!
//! Each allowlisted `plugin/command` becomes a tool named
//! `ductile_{plugin}_{command}`. Commands run as asynchronous gateway jobs:
//! trigger returns a job id, and the tool polls the job until it reaches a
//! terminal state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::llm::ToolSpec;
use crate::tools::{Tool, ToolError};

const POLL_START_INTERVAL: Duration = Duration::from_secs(2);
const POLL_MAX_BACKOFF: Duration = Duration::from_secs(30);
const POLL_MAX_ATTEMPTS: u32 = 60;

#[derive(Debug, Error)]
pub enum DuctileError {
    #[error("{context}: {source}")]
    Http {
        context: String,
        source: reqwest::Error,
    },
    #[error("{context}: status {status}: {body}")]
    Status {
        context: String,
        status: u16,
        body: String,
    },
    #[error("parse {context}: {source}")]
    Parse {
        context: String,
        source: serde_json::Error,
    },
    #[error("poll job {0}: max attempts (60) exhausted")]
    PollExhausted(String),
}

pub type Result<T> = std::result::Result<T, DuctileError>;

/// Gateway response to a command trigger.
#[derive(Debug, Deserialize)]
pub struct TriggerResponse {
    pub job_id: String,
    #[serde(default)]
    pub status: String,
}

/// Gateway job status.
#[derive(Debug, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl JobStatus {
    fn is_terminal(&self) -> bool {
        matches!(
            self.status.as_str(),
            "succeeded" | "failed" | "timed_out" | "dead"
        )
    }
}

/// Plugin discovery payload.
#[derive(Debug, Deserialize)]
pub struct PluginDetail {
    #[serde(default)]
    pub commands: Vec<PluginCommand>,
}

#[derive(Debug, Deserialize)]
pub struct PluginCommand {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
}

/// HTTP client for the Ductile gateway.
pub struct Client {
    base_url: String,
    token: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// POST `/plugin/{plugin}/{command}`, returning the job id.
    pub async fn trigger(
        &self,
        plugin: &str,
        command: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<String> {
        let context = format!("trigger {plugin}/{command}");
        let url = format!("{}/plugin/{plugin}/{command}", self.base_url);
        let body = match payload {
            Some(p) => json!({"payload": p}),
            None => json!({}),
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|source| DuctileError::Http {
                context: context.clone(),
                source,
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.as_u16() != 202 {
            return Err(DuctileError::Status {
                context,
                status: status.as_u16(),
                body: text,
            });
        }

        let parsed: TriggerResponse =
            serde_json::from_str(&text).map_err(|source| DuctileError::Parse {
                context: "trigger response".to_string(),
                source,
            })?;
        Ok(parsed.job_id)
    }

    /// GET `/job/{job_id}`.
    pub async fn get_job(&self, job_id: &str) -> Result<JobStatus> {
        let context = format!("get job {job_id}");
        let url = format!("{}/job/{job_id}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|source| DuctileError::Http {
                context: context.clone(),
                source,
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DuctileError::Status {
                context,
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|source| DuctileError::Parse {
            context: "job response".to_string(),
            source,
        })
    }

    /// Poll a job until it reaches a terminal state.
    ///
    /// Exponential backoff starting at the given interval, doubled per
    /// attempt, capped at 30 s, at most 60 attempts.
    pub async fn poll_job(&self, job_id: &str, poll_interval: Duration) -> Result<JobStatus> {
        let mut interval = poll_interval;
        for _ in 0..POLL_MAX_ATTEMPTS {
            let status = self.get_job(job_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(POLL_MAX_BACKOFF);
        }
        Err(DuctileError::PollExhausted(job_id.to_string()))
    }

    /// GET `/plugin/{plugin}` discovery metadata.
    pub async fn plugin_detail(&self, plugin: &str) -> Result<PluginDetail> {
        let context = format!("get plugin {plugin}");
        let url = format!("{}/plugin/{plugin}", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|source| DuctileError::Http {
                context: context.clone(),
                source,
            })?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(DuctileError::Status {
                context,
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|source| DuctileError::Parse {
            context: "plugin detail".to_string(),
            source,
        })
    }

    /// Best-effort completion webhook POST.
    pub async fn callback(&self, callback_url: &str, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(callback_url)
            .bearer_auth(&self.token)
            .json(payload)
            .send()
            .await
            .map_err(|source| DuctileError::Http {
                context: "callback".to_string(),
                source,
            })?;

        let status = response.status();
        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(DuctileError::Status {
                context: "callback".to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// One allowlisted gateway command exposed as a tool.
pub struct DuctileTool {
    client: Arc<Client>,
    plugin: String,
    command: String,
    discovered: OnceCell<Option<PluginCommand>>,
}

impl DuctileTool {
    fn tool_name(&self) -> String {
        format!("ductile_{}_{}", self.plugin, self.command)
    }

    /// Discovery result for this command, fetched once and cached. `None`
    /// when the gateway has no discovery for it.
    async fn discover(&self) -> &Option<PluginCommand> {
        self.discovered
            .get_or_init(|| async {
                match self.client.plugin_detail(&self.plugin).await {
                    Ok(detail) => detail
                        .commands
                        .into_iter()
                        .find(|c| c.name == self.command),
                    Err(e) => {
                        debug!(plugin = %self.plugin, command = %self.command, error = %e,
                            "plugin discovery unavailable; falling back to opaque payload");
                        None
                    }
                }
            })
            .await
    }
}

#[async_trait]
impl Tool for DuctileTool {
    async fn info(&self) -> crate::tools::Result<ToolSpec> {
        let fallback_description = format!(
            "Execute Ductile plugin '{}' command '{}'. Sends a payload to the Ductile gateway \
             and returns the result.",
            self.plugin, self.command
        );
        let fallback_schema = json!({
            "type": "object",
            "properties": {
                "payload": {
                    "type": "object",
                    "description": "JSON payload to send to the plugin command",
                },
            },
        });

        let (description, parameters) = match self.discover().await {
            Some(command) => (
                if command.description.is_empty() {
                    fallback_description
                } else {
                    command.description.clone()
                },
                command
                    .input_schema
                    .clone()
                    .unwrap_or(fallback_schema),
            ),
            None => (fallback_description, fallback_schema),
        };

        Ok(ToolSpec {
            name: self.tool_name(),
            description,
            parameters,
        })
    }

    async fn invoke(&self, arguments: &str) -> crate::tools::Result<String> {
        // Some models wrap arguments as {"payload": {...}}, others send the
        // argument object bare. Forward the inner object when a payload key is
        // present, else the whole object.
        let parsed: serde_json::Value = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments)?
        };
        let payload = match parsed.get("payload") {
            Some(inner) => Some(inner.clone()),
            None if parsed.as_object().map(|o| o.is_empty()).unwrap_or(true) => None,
            None => Some(parsed),
        };

        let job_id = self
            .client
            .trigger(&self.plugin, &self.command, payload.as_ref())
            .await
            .map_err(|e| ToolError::Gateway(e.to_string()))?;

        let result = self
            .client
            .poll_job(&job_id, POLL_START_INTERVAL)
            .await
            .map_err(|e| ToolError::Gateway(e.to_string()))?;

        if result.status != "succeeded" {
            return Ok(json!({
                "status": result.status,
                "job_id": job_id,
                "error": "job did not succeed",
            })
            .to_string());
        }

        Ok(json!({
            "status": result.status,
            "job_id": job_id,
            "result": result.result,
        })
        .to_string())
    }
}

/// Build tools from the allowlist. Entries are `plugin/command`; malformed
/// entries are skipped.
pub fn build_ductile_tools(client: Arc<Client>, allowlist: &[String]) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
    for entry in allowlist {
        let Some((plugin, command)) = entry.split_once('/') else {
            continue;
        };
        if plugin.is_empty() || command.is_empty() {
            continue;
        }
        tools.push(Arc::new(DuctileTool {
            client: Arc::clone(&client),
            plugin: plugin.to_string(),
            command: command.to_string(),
            discovered: OnceCell::new(),
        }));
    }
    tools
}
