//! The staged loop executor: Frame -> Plan -> Act -> Reflect for one run.
//!
//! Created per run by the runner and does not outlive it. Persists every stage
//! as a step, splices tool calls into the model dialogue during Act, enforces
//! the completion gate, and tracks token usage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tracing::{error, info, warn};

use cadence_core::config::AgentConfig;
use cadence_core::prompt::{self, StageState};
use cadence_core::state::{merge_state_json, normalize_state_json, parse_reflect_decision, NextStage};
use cadence_core::{Run, RunStatus, StepPhase, StepStatus, TokenUsage, ToolTokenUsage};

use crate::ductile;
use crate::llm::{ChatModel, LlmError, Message, ToolSpec};
use crate::storage::{Storage, StorageError};
use crate::tools::report::REPORT_SUCCESS_TOOL;
use crate::tools::{observe_all, Observer, Tool};
use crate::workspace::Workspace;

/// Budget for terminal writes on failure paths, independent of the run's
/// deadline.
const TERMINAL_WRITE_BUDGET: Duration = Duration::from_secs(5);

/// Memory and state are clipped to this many bytes before templating.
const STATE_CLIP_BYTES: usize = 12_000;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("mark run running: {0}")]
    MarkRunning(#[source] StorageError),
    #[error("mark run done: {0}")]
    MarkDone(#[source] StorageError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("tool info: {0}")]
    ToolInfo(String),
    #[error("{stage} stage: {message}")]
    Stage { stage: &'static str, message: String },
    #[error("context cancelled: {0}")]
    Cancelled(String),
    #[error("max loops exhausted without required report_success call")]
    GateUnsatisfied,
    #[error("max loops exhausted without completion")]
    LoopsExhausted,
    #[error("{cause}; persisting failed status also failed: {persist}")]
    TerminalPersist {
        cause: Box<ExecutorError>,
        persist: String,
    },
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Drives one run through the staged loop.
pub struct Executor {
    storage: Arc<Storage>,
    chat_model: Arc<dyn ChatModel>,
    base_tools: Vec<Arc<dyn Tool>>,
    gateway: Option<Arc<ductile::Client>>,
    cfg: AgentConfig,
}

struct Toolset {
    model: Arc<dyn ChatModel>,
    by_name: HashMap<String, Arc<dyn Tool>>,
    catalog: String,
}

struct ActResult {
    summary: String,
    success_reported: bool,
    reported_summary: String,
}

impl Executor {
    pub fn new(
        storage: Arc<Storage>,
        chat_model: Arc<dyn ChatModel>,
        base_tools: Vec<Arc<dyn Tool>>,
        gateway: Option<Arc<ductile::Client>>,
        cfg: AgentConfig,
    ) -> Self {
        Self {
            storage,
            chat_model,
            base_tools,
            gateway,
            cfg,
        }
    }

    /// Execute the staged loop for a run. Persists steps and the run's
    /// terminal status.
    pub async fn execute(&self, run: &Run, callback_url: Option<&str>) -> Result<()> {
        let run_id = run.id.to_string();
        info!(run_id = %run_id, goal = %run.goal, "starting agent loop");

        self.storage
            .update_run_status(&run_id, RunStatus::Running, None, None)
            .await
            .map_err(ExecutorError::MarkRunning)?;

        let workspace = match Workspace::new(&self.cfg.workspace_dir, &run_id) {
            Ok(ws) => Some(Arc::new(ws)),
            Err(e) => {
                error!(run_id = %run_id, error = %e, "failed to create workspace");
                None
            }
        };

        let (max_loops, deadline) = self.limits_from_constraints(run);

        let outcome = tokio::time::timeout(
            deadline,
            self.drive(run, &run_id, workspace.as_ref(), max_loops, callback_url),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                Err(self
                    .fail_run(
                        &run_id,
                        callback_url,
                        ExecutorError::Cancelled("deadline exceeded".to_string()),
                    )
                    .await)
            }
        }
    }

    /// Resolve `max_loops` and the run deadline from constraints, with config
    /// defaults.
    fn limits_from_constraints(&self, run: &Run) -> (u32, Duration) {
        let mut max_loops = self.cfg.default_max_loops;
        let mut deadline = self.cfg.default_deadline;

        if let Some(constraints) = &run.constraints {
            if let Some(n) = constraints.get("max_loops").and_then(|v| v.as_u64()) {
                if n > 0 {
                    max_loops = n as u32;
                }
            }
            if let Some(raw) = constraints.get("deadline").and_then(|v| v.as_str()) {
                if let Ok(d) = humantime::parse_duration(raw) {
                    deadline = d;
                }
            }
        }

        (max_loops, deadline)
    }

    async fn drive(
        &self,
        run: &Run,
        run_id: &str,
        workspace: Option<&Arc<Workspace>>,
        max_loops: u32,
        callback_url: Option<&str>,
    ) -> Result<()> {
        let mut step_num = self.storage.max_step_num(run_id).await?;

        let mut state = StageState {
            goal: run.goal.clone(),
            context: json_or_null(&run.context),
            constraints: json_or_null(&run.constraints),
            max_loops,
            ..StageState::default()
        };

        if let Some(ws) = workspace {
            state.memory = clip_text(&ws.read_run_memory(), STATE_CLIP_BYTES);
            if let Err(e) = ws.write_prompt_snapshot(
                &run.goal,
                run.context.as_ref(),
                run.constraints.as_ref(),
                "staged-prompts: frame, plan, act, reflect",
            ) {
                error!(run_id = %run_id, error = %e, "failed to write prompt snapshot");
            }
        }

        let active_tools = self.active_tools(workspace);
        let toolset = match self.build_toolset(active_tools).await {
            Ok(toolset) => toolset,
            Err(e) => return Err(self.fail_run(run_id, callback_url, e).await),
        };
        state.available_tools = toolset.catalog.clone();

        let mut next_stage = LoopStage::Frame;

        for iter in 1..=max_loops {
            state.iteration = iter;
            if let Some(ws) = workspace {
                state.memory = clip_text(&ws.read_run_memory(), STATE_CLIP_BYTES);
                state.state = clip_text(&ws.read_state(), STATE_CLIP_BYTES);
                if self.cfg.save_loop_memory && iter > 1 {
                    if let Err(e) = ws.archive_loop_memory(iter - 1) {
                        error!(run_id = %run_id, iteration = iter, error = %e,
                            "failed to archive loop memory");
                    }
                }
                if let Err(e) = ws.clear_loop_memory() {
                    error!(run_id = %run_id, iteration = iter, error = %e,
                        "failed to clear loop memory");
                }
            }

            if next_stage == LoopStage::Frame {
                let frame_prompt = prompt::render(&self.cfg.prompts.frame, &state);
                if let Some(ws) = workspace {
                    ws.append_stage_prompt(iter, "frame", &frame_prompt).ok();
                }
                let frame_out = match self
                    .run_text_stage(
                        run_id,
                        &mut step_num,
                        StepPhase::Frame,
                        "frame",
                        &frame_prompt,
                        "Produce the frame now.",
                    )
                    .await
                {
                    Ok(out) => out,
                    Err(e) => return Err(self.fail_run(run_id, callback_url, e).await),
                };
                state.frame = frame_out.clone();

                // Frame output seeds the structured state.
                let normalized = normalize_state_json(&frame_out);
                if let Some(ws) = workspace {
                    if let Err(e) = ws.write_state(&normalized.to_string()) {
                        error!(run_id = %run_id, error = %e, "failed to write state");
                    }
                    state.state = clip_text(&ws.read_state(), STATE_CLIP_BYTES);
                } else {
                    state.state = clip_text(&normalized.to_string(), STATE_CLIP_BYTES);
                }
            }

            if matches!(next_stage, LoopStage::Frame | LoopStage::Plan) {
                let plan_prompt = prompt::render(&self.cfg.prompts.plan, &state);
                if let Some(ws) = workspace {
                    ws.append_stage_prompt(iter, "plan", &plan_prompt).ok();
                }
                state.plan = match self
                    .run_text_stage(
                        run_id,
                        &mut step_num,
                        StepPhase::Plan,
                        "plan",
                        &plan_prompt,
                        "Produce the plan now.",
                    )
                    .await
                {
                    Ok(out) => out,
                    Err(e) => return Err(self.fail_run(run_id, callback_url, e).await),
                };
            }

            let act_prompt = prompt::render(&self.cfg.prompts.act, &state);
            if let Some(ws) = workspace {
                ws.append_stage_prompt(iter, "act", &act_prompt).ok();
            }
            let act = match self
                .run_act_stage(run_id, &mut step_num, &toolset, &act_prompt)
                .await
            {
                Ok(act) => act,
                Err(e) => return Err(self.fail_run(run_id, callback_url, e).await),
            };
            state.act = act.summary.clone();
            if act.success_reported {
                state.success_reported = true;
                if !act.reported_summary.is_empty() {
                    state.success_summary = act.reported_summary.clone();
                }
            }
            if let Some(ws) = workspace {
                state.loop_memory = clip_text(&ws.read_loop_memory(), STATE_CLIP_BYTES);
            }

            let reflect_prompt = prompt::render(&self.cfg.prompts.reflect, &state);
            if let Some(ws) = workspace {
                ws.append_stage_prompt(iter, "reflect", &reflect_prompt).ok();
            }
            let reflect_out = match self
                .run_text_stage(
                    run_id,
                    &mut step_num,
                    StepPhase::Reflect,
                    "reflect",
                    &reflect_prompt,
                    "Return reflection JSON now.",
                )
                .await
            {
                Ok(out) => out,
                Err(e) => return Err(self.fail_run(run_id, callback_url, e).await),
            };

            let decision = parse_reflect_decision(&reflect_out);

            if let Some(ws) = workspace {
                let memory_update = if decision.memory_update.trim().is_empty() {
                    decision.next_focus.trim()
                } else {
                    decision.memory_update.trim()
                };
                if !memory_update.is_empty() {
                    if let Err(e) = ws.append_run_memory(iter, memory_update) {
                        error!(run_id = %run_id, iteration = iter, error = %e,
                            "failed to append run memory");
                    }
                }
                if let Some(updated) = &decision.updated_state {
                    let existing = normalize_state_json(&ws.read_state());
                    let merged = merge_state_json(&existing, updated);
                    if let Err(e) = ws.write_state(&merged.to_string()) {
                        error!(run_id = %run_id, error = %e, "failed to write merged state");
                    }
                }
            }

            match decision.resolved_next_stage() {
                NextStage::Done => {
                    // Completion gate: done is only honored after a successful
                    // report_success call.
                    if !state.success_reported {
                        state.next_focus = "Call report_success with summary and evidence before \
                                            declaring done."
                            .to_string();
                        next_stage = LoopStage::Plan;
                        info!(run_id = %run_id, iteration = iter,
                            "reflect requested done but report_success not yet called; continuing");
                        continue;
                    }

                    let summary = [
                        decision.summary.trim(),
                        state.success_summary.trim(),
                        state.act.trim(),
                    ]
                    .into_iter()
                    .find(|s| !s.is_empty())
                    .unwrap_or_default()
                    .to_string();

                    let persisted = tokio::time::timeout(
                        TERMINAL_WRITE_BUDGET,
                        self.storage.update_run_status(
                            run_id,
                            RunStatus::Done,
                            Some(&summary),
                            None,
                        ),
                    )
                    .await;
                    match persisted {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(ExecutorError::MarkDone(e)),
                        Err(_) => {
                            return Err(ExecutorError::Cancelled(
                                "mark run done timed out".to_string(),
                            ))
                        }
                    }

                    step_num += 1;
                    if let Err(e) = self
                        .append_completed_step(run_id, step_num, StepPhase::Done, &summary)
                        .await
                    {
                        error!(run_id = %run_id, error = %e, "failed to persist done step");
                    }

                    self.emit_callback(callback_url, run_id, "done", Some(&summary), None)
                        .await;
                    info!(run_id = %run_id, iteration = iter, "agent loop completed");
                    return Ok(());
                }
                NextStage::Plan => {
                    state.next_focus = decision.next_focus.clone();
                    next_stage = LoopStage::Plan;
                }
                NextStage::Act => {
                    state.next_focus = decision.next_focus.clone();
                    next_stage = LoopStage::Act;
                }
            }
        }

        let cause = if state.success_reported {
            ExecutorError::LoopsExhausted
        } else {
            ExecutorError::GateUnsatisfied
        };
        Err(self.fail_run(run_id, callback_url, cause).await)
    }

    /// Base tools plus workspace file tools, all wrapped with the loop-memory
    /// observer when a workspace exists.
    fn active_tools(&self, workspace: Option<&Arc<Workspace>>) -> Vec<Arc<dyn Tool>> {
        let mut tools = self.base_tools.clone();
        let Some(ws) = workspace else {
            return tools;
        };

        tools.extend(crate::tools::workspace::build_workspace_tools(ws.dir()));

        let ws_for_observer = Arc::clone(ws);
        let observer: Observer = Arc::new(move |tool, input, output, status| {
            if let Err(e) = ws_for_observer.append_loop_tool_call(tool, input, output, status) {
                error!(tool = %tool, error = %e, "failed to write loop memory");
            }
        });
        observe_all(tools, observer)
    }

    /// Collect tool infos, bind them into the model, and index tools by name.
    async fn build_toolset(&self, tools: Vec<Arc<dyn Tool>>) -> Result<Toolset> {
        let mut infos: Vec<ToolSpec> = Vec::with_capacity(tools.len());
        let mut by_name = HashMap::with_capacity(tools.len());

        for tool in tools {
            let info = tool
                .info()
                .await
                .map_err(|e| ExecutorError::ToolInfo(e.to_string()))?;
            by_name.insert(info.name.clone(), tool);
            infos.push(info);
        }

        let catalog = infos
            .iter()
            .map(|i| format!("{}: {}", i.name, i.description))
            .collect::<Vec<_>>()
            .join("\n");

        let model = self.chat_model.with_tools(&infos);
        Ok(Toolset {
            model,
            by_name,
            catalog,
        })
    }

    /// Run one text stage (frame/plan/reflect) as a fully persisted step.
    async fn run_text_stage(
        &self,
        run_id: &str,
        step_num: &mut i64,
        phase: StepPhase,
        stage: &'static str,
        prompt_text: &str,
        directive: &str,
    ) -> Result<String> {
        *step_num += 1;
        let step = self
            .storage
            .append_step(run_id, *step_num, phase, None, None)
            .await?;
        self.storage
            .update_step_status(step.id.as_ref(), StepStatus::Running, None, None, 1)
            .await?;

        let messages = vec![Message::system(prompt_text), Message::user(directive)];
        let generated = tokio::time::timeout(
            self.cfg.step_timeout,
            self.generate_with_retries(&self.chat_model, &messages, stage),
        )
        .await;

        match generated {
            Ok(Ok((reply, usage, attempts))) => {
                let content = reply.content.trim().to_string();
                let mut output = json!({"content": content});
                if !usage.is_zero() {
                    output["token_usage"] = serde_json::to_value(usage).unwrap_or_default();
                }
                self.storage
                    .update_step_status(
                        step.id.as_ref(),
                        StepStatus::Ok,
                        Some(&output),
                        None,
                        attempts,
                    )
                    .await?;
                Ok(content)
            }
            Ok(Err((e, attempts))) => {
                let message = e.to_string();
                self.storage
                    .update_step_status(
                        step.id.as_ref(),
                        StepStatus::Error,
                        None,
                        Some(&message),
                        attempts,
                    )
                    .await?;
                Err(ExecutorError::Stage { stage, message })
            }
            Err(_) => {
                let message = "step timeout elapsed".to_string();
                self.storage
                    .update_step_status(
                        step.id.as_ref(),
                        StepStatus::Error,
                        None,
                        Some(&message),
                        1,
                    )
                    .await?;
                Err(ExecutorError::Stage { stage, message })
            }
        }
    }

    /// Generate with up to `max_retry_per_step` attempts and exponential
    /// backoff between them.
    async fn generate_with_retries(
        &self,
        model: &Arc<dyn ChatModel>,
        messages: &[Message],
        stage: &str,
    ) -> std::result::Result<(Message, TokenUsage, i64), (LlmError, i64)> {
        let max_retries = self.cfg.max_retry_per_step.max(1);
        let mut usage = TokenUsage::default();

        for attempt in 1..=max_retries {
            match model.generate(messages).await {
                Ok(reply) => {
                    if let Some(u) = reply.usage {
                        usage.add(u);
                    }
                    return Ok((reply, usage, attempt as i64));
                }
                Err(e) if attempt < max_retries => {
                    let backoff = Duration::from_secs(1u64 << (attempt - 1));
                    warn!(stage = %stage, attempt, backoff = ?backoff, error = %e,
                        "stage LLM error, retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err((e, max_retries as i64)),
            }
        }
        unreachable!("retry loop always returns")
    }

    /// The Act stage: a multi-round tool dispatch loop persisted as one step.
    async fn run_act_stage(
        &self,
        run_id: &str,
        step_num: &mut i64,
        toolset: &Toolset,
        prompt_text: &str,
    ) -> Result<ActResult> {
        *step_num += 1;
        let step = self
            .storage
            .append_step(run_id, *step_num, StepPhase::Act, None, None)
            .await?;
        self.storage
            .update_step_status(step.id.as_ref(), StepStatus::Running, None, None, 1)
            .await?;

        let rounds = tokio::time::timeout(
            self.cfg.step_timeout,
            self.run_act_rounds(toolset, prompt_text),
        )
        .await;

        match rounds {
            Ok(Ok((result, usage, tool_usage))) => {
                let mut output = json!({"content": result.summary});
                if !usage.is_zero() {
                    output["token_usage"] = serde_json::to_value(usage).unwrap_or_default();
                }
                if !tool_usage.is_empty() {
                    output["tool_token_usage"] =
                        serde_json::to_value(&tool_usage).unwrap_or_default();
                    output["tool_token_usage_estimated"] = json!(true);
                }
                self.storage
                    .update_step_status(step.id.as_ref(), StepStatus::Ok, Some(&output), None, 1)
                    .await?;
                Ok(result)
            }
            Ok(Err((e, attempts))) => {
                let message = e.to_string();
                self.storage
                    .update_step_status(
                        step.id.as_ref(),
                        StepStatus::Error,
                        None,
                        Some(&message),
                        attempts,
                    )
                    .await?;
                Err(ExecutorError::Stage {
                    stage: "act",
                    message,
                })
            }
            Err(_) => {
                let message = "step timeout elapsed".to_string();
                self.storage
                    .update_step_status(
                        step.id.as_ref(),
                        StepStatus::Error,
                        None,
                        Some(&message),
                        1,
                    )
                    .await?;
                Err(ExecutorError::Stage {
                    stage: "act",
                    message,
                })
            }
        }
    }

    async fn run_act_rounds(
        &self,
        toolset: &Toolset,
        prompt_text: &str,
    ) -> std::result::Result<
        (ActResult, TokenUsage, HashMap<String, ToolTokenUsage>),
        (LlmError, i64),
    > {
        let mut messages = vec![
            Message::system(prompt_text),
            Message::user(
                "Execute the action now. Use tools when needed, then summarize what you \
                 accomplished.",
            ),
        ];

        let mut result = ActResult {
            summary: String::new(),
            success_reported: false,
            reported_summary: String::new(),
        };
        let mut transcript = String::new();
        let mut total_usage = TokenUsage::default();
        let mut tool_usage: HashMap<String, ToolTokenUsage> = HashMap::new();
        let max_rounds = self.cfg.max_act_rounds.max(1);
        let mut tool_seq = 0usize;

        for _round in 1..=max_rounds {
            let (reply, round_usage, _attempts) = self
                .generate_with_retries(&toolset.model, &messages, "act")
                .await?;
            total_usage.add(round_usage);
            messages.push(reply.clone());

            if reply.tool_calls.is_empty() {
                let content = reply.content.trim();
                if !content.is_empty() {
                    if !transcript.is_empty() {
                        transcript.push_str("\n\n");
                    }
                    transcript.push_str(content);
                }
                result.summary = if transcript.trim().is_empty() {
                    "No actionable output produced.".to_string()
                } else {
                    transcript.trim().to_string()
                };
                return Ok((result, total_usage, tool_usage));
            }

            let shares = split_round_usage(
                reply.usage.unwrap_or_default(),
                reply.tool_calls.len(),
            );

            for (i, call) in reply.tool_calls.iter().enumerate() {
                tool_seq += 1;
                let call_id = if call.id.is_empty() {
                    format!("{}-{}", call.name, tool_seq)
                } else {
                    call.id.clone()
                };
                let arguments = normalize_json(&call.arguments);

                let share = tool_usage.entry(call.name.clone()).or_default();
                share.prompt_tokens += shares[i].prompt_tokens;
                share.completion_tokens += shares[i].completion_tokens;
                share.total_tokens += shares[i].total_tokens;
                share.calls += 1;

                let observation = match toolset.by_name.get(&call.name) {
                    None => {
                        let err_msg = format!("unknown tool: {}", call.name);
                        transcript.push_str(&format!("Tool {} error: {}\n", call.name, err_msg));
                        json!({"error": err_msg})
                    }
                    Some(tool) => match tool.invoke(arguments.get()).await {
                        Ok(out) => {
                            if call.name == REPORT_SUCCESS_TOOL {
                                result.success_reported = true;
                                if let Some(summary) = extract_summary(arguments.get()) {
                                    result.reported_summary = summary;
                                }
                            }
                            let parsed = normalize_json(&out).into_value();
                            transcript.push_str(&format!(
                                "Tool {} output:\n{}\n",
                                call.name, parsed
                            ));
                            parsed
                        }
                        Err(e) => {
                            let parsed = json!({"error": e.to_string()});
                            transcript.push_str(&format!(
                                "Tool {} output:\n{}\n",
                                call.name, parsed
                            ));
                            parsed
                        }
                    },
                };

                messages.push(Message::tool(observation.to_string(), call_id));
            }
        }

        result.summary = transcript.trim().to_string();
        Ok((result, total_usage, tool_usage))
    }

    /// Append a step that is already complete (used for the synthetic `done`
    /// step).
    async fn append_completed_step(
        &self,
        run_id: &str,
        step_num: i64,
        phase: StepPhase,
        content: &str,
    ) -> Result<()> {
        let step = self
            .storage
            .append_step(run_id, step_num, phase, None, None)
            .await?;
        let output = json!({"content": content});
        self.storage
            .update_step_status(step.id.as_ref(), StepStatus::Ok, Some(&output), None, 1)
            .await?;
        Ok(())
    }

    /// Persist `failed` under a fresh budget so a spent deadline cannot lose
    /// the terminal write, fire the callback, and return the composite error.
    async fn fail_run(
        &self,
        run_id: &str,
        callback_url: Option<&str>,
        cause: ExecutorError,
    ) -> ExecutorError {
        let message = cause.to_string();
        let persisted = tokio::time::timeout(
            TERMINAL_WRITE_BUDGET,
            self.storage
                .update_run_status(run_id, RunStatus::Failed, None, Some(&message)),
        )
        .await;

        self.emit_callback(callback_url, run_id, "failed", None, Some(&message))
            .await;

        match persisted {
            Ok(Ok(())) => cause,
            Ok(Err(e)) => ExecutorError::TerminalPersist {
                cause: Box::new(cause),
                persist: e.to_string(),
            },
            Err(_) => ExecutorError::TerminalPersist {
                cause: Box::new(cause),
                persist: "terminal write timed out".to_string(),
            },
        }
    }

    /// Best-effort completion callback with its own 5 s budget.
    async fn emit_callback(
        &self,
        callback_url: Option<&str>,
        run_id: &str,
        status: &str,
        summary: Option<&str>,
        error_msg: Option<&str>,
    ) {
        let (Some(url), Some(client)) = (callback_url.filter(|u| !u.is_empty()), &self.gateway)
        else {
            return;
        };

        let mut payload = json!({"run_id": run_id, "status": status});
        if let Some(summary) = summary {
            payload["summary"] = json!(summary);
        }
        if let Some(error_msg) = error_msg {
            payload["error"] = json!(error_msg);
        }

        let sent =
            tokio::time::timeout(TERMINAL_WRITE_BUDGET, client.callback(url, &payload)).await;
        match sent {
            Ok(Ok(())) => {
                info!(run_id = %run_id, url = %url, status = %status, "callback emitted");
            }
            Ok(Err(e)) => {
                error!(run_id = %run_id, url = %url, error = %e, "failed to emit callback");
            }
            Err(_) => {
                error!(run_id = %run_id, url = %url, "callback timed out");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopStage {
    Frame,
    Plan,
    Act,
}

/// A JSON argument payload normalized to something parseable.
struct NormalizedJson(String);

impl NormalizedJson {
    fn get(&self) -> &str {
        &self.0
    }

    fn into_value(self) -> serde_json::Value {
        serde_json::from_str(&self.0).unwrap_or_else(|_| json!({"raw": self.0}))
    }
}

/// Identity for valid JSON; otherwise wrap the trimmed text as `{"raw": ...}`.
fn normalize_json(raw: &str) -> NormalizedJson {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return NormalizedJson(json!({"raw": ""}).to_string());
    }
    if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
        return NormalizedJson(trimmed.to_string());
    }
    NormalizedJson(json!({"raw": trimmed}).to_string())
}

fn extract_summary(arguments: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(arguments).ok()?;
    let summary = value.get("summary")?.as_str()?.trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

/// Split one round's usage evenly across `n` tool calls; the remainder goes to
/// the earliest calls.
fn split_round_usage(usage: TokenUsage, n: usize) -> Vec<TokenUsage> {
    if n == 0 {
        return Vec::new();
    }
    let n64 = n as u64;
    let split = |total: u64, i: u64| -> u64 {
        let base = total / n64;
        let remainder = total % n64;
        base + u64::from(i < remainder)
    };
    (0..n64)
        .map(|i| TokenUsage {
            prompt_tokens: split(usage.prompt_tokens, i),
            completion_tokens: split(usage.completion_tokens, i),
            total_tokens: split(usage.total_tokens, i),
        })
        .collect()
}

fn json_or_null(value: &Option<serde_json::Value>) -> String {
    value
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "null".to_string())
}

/// Clip to at most `max` bytes on a char boundary, marking the truncation.
fn clip_text(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n...[truncated]", &s[..end])
}
