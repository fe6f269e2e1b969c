//! Stage prompt rendering.
//!
//! Prompts are minijinja templates rendered against the current stage state.
//! Rendering never fails a run: template or render errors degrade to the raw
//! template string.

use minijinja::Environment;
use serde::Serialize;

/// Everything a stage prompt can reference.
///
/// Available placeholders: `goal`, `context`, `constraints`, `memory`,
/// `state`, `loop_memory`, `frame`, `plan`, `act`, `next_focus`,
/// `available_tools`, `success_reported`, `success_summary`, `iteration`,
/// `max_loops`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageState {
    pub goal: String,
    pub context: String,
    pub constraints: String,
    pub memory: String,
    pub state: String,
    pub loop_memory: String,
    pub frame: String,
    pub plan: String,
    pub act: String,
    pub next_focus: String,
    pub available_tools: String,
    pub success_reported: bool,
    pub success_summary: String,
    pub iteration: u32,
    pub max_loops: u32,
}

/// Render a stage prompt template; on any failure, return the template as-is.
pub fn render(template: &str, state: &StageState) -> String {
    let mut env = Environment::new();
    if env.add_template("stage", template).is_err() {
        return template.to_string();
    }
    let tmpl = match env.get_template("stage") {
        Ok(t) => t,
        Err(_) => return template.to_string(),
    };
    tmpl.render(state).unwrap_or_else(|_| template.to_string())
}
