//! Tool contracts and the bundled local tools.
//!
//! A tool is a capability pair: `info` describes it to the model, `invoke`
//! executes it. Tools differ only in behavior, not in shape; observer wrapping
//! is the one structural variant.

pub mod report;
pub mod sys;
pub mod workspace;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm::ToolSpec;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("parse arguments: {0}")]
    Arguments(#[from] serde_json::Error),
    #[error("{0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("gateway error: {0}")]
    Gateway(String),
}

pub type Result<T> = std::result::Result<T, ToolError>;

/// A tool the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Metadata for model planning: name, description, argument schema.
    async fn info(&self) -> Result<ToolSpec>;

    /// Execute with a JSON argument string, returning a JSON result string.
    async fn invoke(&self, arguments: &str) -> Result<String>;
}

/// Callback recording each invocation: `(tool, input, output, status)`.
pub type Observer = Arc<dyn Fn(&str, &str, &str, &str) + Send + Sync>;

/// A tool wrapped with an invocation observer.
///
/// Errors are rendered into a `{"status":"error","error":...}` payload so the
/// observer (and the model) always sees a JSON observation; the error itself
/// still propagates to the caller.
pub struct ObservedTool {
    inner: Arc<dyn Tool>,
    observer: Observer,
}

impl ObservedTool {
    pub fn new(inner: Arc<dyn Tool>, observer: Observer) -> Self {
        Self { inner, observer }
    }
}

#[async_trait]
impl Tool for ObservedTool {
    async fn info(&self) -> Result<ToolSpec> {
        self.inner.info().await
    }

    async fn invoke(&self, arguments: &str) -> Result<String> {
        let result = self.inner.invoke(arguments).await;
        let name = match self.inner.info().await {
            Ok(spec) => spec.name,
            Err(_) => "unknown".to_string(),
        };
        match &result {
            Ok(output) => (self.observer)(&name, arguments, output, "ok"),
            Err(e) => {
                let rendered = serde_json::json!({
                    "status": "error",
                    "error": e.to_string(),
                })
                .to_string();
                (self.observer)(&name, arguments, &rendered, "error");
            }
        }
        result
    }
}

/// Wrap every tool in the set with the same observer.
pub fn observe_all(tools: Vec<Arc<dyn Tool>>, observer: Observer) -> Vec<Arc<dyn Tool>> {
    tools
        .into_iter()
        .map(|t| Arc::new(ObservedTool::new(t, Arc::clone(&observer))) as Arc<dyn Tool>)
        .collect()
}

/// Build an object JSON schema from `(name, type, description)` property
/// triples, in the shape providers expect for tool parameters.
pub fn object_schema(properties: &[(&str, &str, &str)]) -> serde_json::Value {
    let mut props = serde_json::Map::new();
    for (name, ty, desc) in properties {
        props.insert(
            (*name).to_string(),
            serde_json::json!({"type": ty, "description": desc}),
        );
    }
    serde_json::json!({"type": "object", "properties": props})
}
