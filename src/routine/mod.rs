pub mod condition;
pub mod control;
pub mod external;
pub mod plan;
pub mod template;
pub mod validation;

pub use condition::{Condition, ConditionOp, OnFalse};
pub use control::{ControlFlow, ValueSource};
pub use external::{ExternalDependency, ExternalKind, ExternalWaits};
pub use plan::{
    Concurrency, ConcurrencyStrategy, ExecutionSpec, FailureMode, Plan, PlanStatus, PlanUpdate,
    Task, TaskPatch, TaskResult, TaskSpec, TaskStatus, ValidationSpec,
};
pub use template::Bindings;
pub use validation::ValidationOutcome;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{AgentError, MemoryError};
use crate::estimate::{HeuristicEstimator, TokenEstimator};
use crate::events::{EventBus, RuntimeEvent};
use crate::hooks::{FnHook, HookDirective, HookPoint};
use crate::memory::{MemoryStorage, Priority, Scope, SetOptions};
use crate::{Agent, AgentResult};

use validation::{build_validation_prompt, collect_tool_log, parse_validation_reply};

/// Executor-wide settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub min_completion_score: u32,
    /// Agent reasoning cycles per task unless the task overrides it.
    pub default_task_max_iterations: usize,
    /// Dependency results under this estimate go to in-context memory;
    /// larger ones go to working memory under `findings.`.
    pub small_result_token_limit: u32,
    pub validation_temperature: f32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_completion_score: 80,
            default_task_max_iterations: 50,
            small_result_token_limit: 5_000,
            validation_temperature: 0.1,
        }
    }
}

/// What `execute` hands back.
#[derive(Debug, Clone)]
pub struct RoutineOutcome {
    pub status: PlanStatus,
    pub progress: f32,
    pub completed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
}

/// Serialized execution snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutineState {
    pub plan: Plan,
    pub status: PlanStatus,
    pub progress: f32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

enum TaskRun {
    Terminal(TaskStatus),
    /// Condition said wait: the task stays pending.
    StillPending,
}

/// Drives a plan through an agent: dependency-ordered selection, per-task
/// retry and validation, control-flow operators, and external waits.
pub struct RoutineExecutor {
    agent: Agent,
    plan: Plan,
    config: ExecutorConfig,
    waits: Arc<ExternalWaits>,
    events: EventBus,
    plan_cancel: CancellationToken,
    destroy_agent: bool,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl RoutineExecutor {
    pub fn new(agent: Agent, plan: Plan) -> Self {
        let events = agent.events().clone();
        Self {
            agent,
            plan,
            config: ExecutorConfig::default(),
            waits: Arc::new(ExternalWaits::new()),
            events,
            plan_cancel: CancellationToken::new(),
            destroy_agent: true,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    /// Caller keeps the agent: the epilogue only unregisters the hooks the
    /// executor added instead of destroying it.
    pub fn preserve_agent(mut self) -> Self {
        self.destroy_agent = false;
        self
    }

    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    pub fn progress(&self) -> f32 {
        self.plan.progress()
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    pub fn into_agent(self) -> Agent {
        self.agent
    }

    /// Handle for delivering webhook / manual completions from elsewhere.
    pub fn external_waits(&self) -> Arc<ExternalWaits> {
        self.waits.clone()
    }

    pub fn trigger_external(&self, webhook_id: &str, data: Value) -> bool {
        self.waits.trigger(webhook_id, data)
    }

    pub fn complete_task_manually(&self, task_id: &str, data: Value) -> bool {
        self.waits.complete(task_id, data)
    }

    /// Token that cancels the whole plan; cascades into the running agent.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.plan_cancel.clone()
    }

    /// Apply a dynamic plan diff between tasks. Same rules as
    /// `Plan::update`: the plan must allow dynamic tasks, in-progress tasks
    /// need `force_remove`, and a diff introducing a cycle is rejected whole.
    pub fn update_plan(
        &mut self,
        diff: PlanUpdate,
        force_remove: bool,
    ) -> Result<(), crate::error::PlanError> {
        self.plan.update(diff, force_remove)
    }

    pub fn state(&self) -> RoutineState {
        RoutineState {
            plan: self.plan.clone(),
            status: self.plan.status,
            progress: self.plan.progress(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            last_updated_at: Utc::now(),
            error: self.error.clone(),
        }
    }

    pub async fn save_state(
        &self,
        storage: &dyn MemoryStorage,
        key: &str,
    ) -> Result<(), MemoryError> {
        let doc = serde_json::to_value(self.state())
            .map_err(|e| MemoryError::Storage(e.to_string()))?;
        storage.save(key, &doc).await
    }

    /// Run the plan to a terminal state.
    pub async fn execute(&mut self) -> Result<RoutineOutcome, AgentError> {
        self.plan.status = PlanStatus::Running;
        self.started_at = Utc::now();

        'drive: loop {
            if self.plan_cancel.is_cancelled() {
                self.cancel_remaining();
                self.plan.status = PlanStatus::Cancelled;
                break;
            }

            let batch = self.select_batch();
            if batch.is_empty() {
                if self.plan.is_terminal() {
                    break;
                }
                if !self.cascade_unrunnable() {
                    // Nothing ready, nothing in flight, nothing to cascade:
                    // wait-conditions that can no longer be satisfied.
                    self.fail_stalled();
                }
                continue;
            }

            let mut progressed = false;
            for task_id in batch {
                if self.plan_cancel.is_cancelled() {
                    continue 'drive;
                }
                let run = self.run_task(&task_id).await;
                if matches!(run, TaskRun::Terminal(_)) {
                    progressed = true;
                }
                let failed = matches!(run, TaskRun::Terminal(TaskStatus::Failed));
                if failed && self.plan.concurrency.failure_mode == FailureMode::FailFast {
                    self.cancel_remaining();
                    break 'drive;
                }
            }
            if !progressed && !self.cascade_unrunnable() {
                // Every selected task is waiting on memory that nothing
                // left in the plan can change.
                self.fail_stalled();
            }
        }

        if self.plan.status != PlanStatus::Cancelled {
            self.plan.resolve_status();
        }
        self.completed_at = Some(Utc::now());
        self.plan.current_task_id = None;

        let failed_tasks: Vec<String> = self
            .plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.name.clone())
            .collect();
        let completed_tasks: Vec<String> = self
            .plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.name.clone())
            .collect();
        if !failed_tasks.is_empty() {
            self.error = Some(format!("failed tasks: {}", failed_tasks.join(", ")));
        }

        self.agent.memory().plan_completed();
        self.events.publish(RuntimeEvent::PlanCompleted {
            plan_id: self.plan.id.clone(),
            failed_tasks: failed_tasks.len(),
        });
        info!(
            plan = %self.plan.id,
            status = ?self.plan.status,
            failed = failed_tasks.len(),
            "plan finished"
        );

        if self.destroy_agent {
            self.agent.destroy();
        }

        Ok(RoutineOutcome {
            status: self.plan.status,
            progress: self.plan.progress(),
            completed_tasks,
            failed_tasks,
        })
    }

    /// Ready tasks ordered by the concurrency strategy, capped at
    /// `max_parallel_tasks`. The bundled driver runs the batch members one
    /// at a time; the batch boundary is where a parallel driver would fan
    /// out.
    fn select_batch(&self) -> Vec<String> {
        let mut ready: Vec<&Task> = self.plan.ready_tasks();
        match self.plan.concurrency.strategy {
            ConcurrencyStrategy::Priority => {
                ready.sort_by_key(|t| {
                    std::cmp::Reverse(t.execution.as_ref().map(|e| e.priority).unwrap_or(0))
                });
            }
            // shortest-first is reserved; creation order is the fallback.
            ConcurrencyStrategy::Fifo | ConcurrencyStrategy::ShortestFirst => {}
        }
        ready
            .into_iter()
            .take(self.plan.concurrency.max_parallel_tasks.max(1))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Fail pending tasks whose dependencies can no longer complete.
    /// Returns true if anything changed.
    fn cascade_unrunnable(&mut self) -> bool {
        let doomed: Vec<(String, String)> = self
            .plan
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter_map(|t| {
                let blocker = t.depends_on.iter().find(|dep| {
                    self.plan
                        .task(dep)
                        .map(|d| d.is_terminal() && d.status != TaskStatus::Completed)
                        .unwrap_or(true)
                })?;
                let blocker_name = self
                    .plan
                    .task(blocker)
                    .map(|d| d.name.clone())
                    .unwrap_or_else(|| blocker.clone());
                Some((t.id.clone(), blocker_name))
            })
            .collect();

        let changed = !doomed.is_empty();
        for (task_id, blocker) in doomed {
            if let Some(task) = self.plan.task_mut(&task_id) {
                task.result = Some(TaskResult {
                    error: Some(format!("dependency {blocker} did not complete")),
                    ..Default::default()
                });
            }
            self.set_status(&task_id, TaskStatus::Failed);
        }
        changed
    }

    /// Nothing is runnable and nothing can cascade: wait-conditions that
    /// will never be satisfied. Fail them so the plan terminates.
    fn fail_stalled(&mut self) {
        let stalled: Vec<String> = self
            .plan
            .tasks
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for task_id in stalled {
            if let Some(task) = self.plan.task_mut(&task_id) {
                task.result = Some(TaskResult {
                    error: Some("no executable path: condition never satisfied".into()),
                    ..Default::default()
                });
            }
            self.set_status(&task_id, TaskStatus::Failed);
        }
    }

    fn cancel_remaining(&mut self) {
        let remaining: Vec<String> = self
            .plan
            .tasks
            .iter()
            .filter(|t| !t.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        for task_id in remaining {
            self.set_status(&task_id, TaskStatus::Cancelled);
        }
    }

    /// The single status mutation point on the executor side: updates the
    /// task, notifies memory on terminal transitions, publishes events.
    fn set_status(&mut self, task_id: &str, status: TaskStatus) {
        let reason = if let Some(task) = self.plan.task_mut(task_id) {
            task.update_status(status);
            task.result.as_ref().and_then(|r| r.error.clone())
        } else {
            None
        };
        if status.is_terminal() {
            self.agent.memory().task_completed(task_id);
        }
        match status {
            TaskStatus::Completed => {
                self.events.publish(RuntimeEvent::TaskCompleted { task_id: task_id.to_string() });
            }
            TaskStatus::Failed => {
                self.events.publish(RuntimeEvent::TaskFailed {
                    task_id: task_id.to_string(),
                    reason: reason.unwrap_or_default(),
                });
            }
            _ => {}
        }
    }

    async fn run_task(&mut self, task_id: &str) -> TaskRun {
        let Some(task) = self.plan.task(task_id).cloned() else {
            return TaskRun::StillPending;
        };
        self.plan.current_task_id = Some(task_id.to_string());

        // 1. Condition gate.
        if let Some(ref condition) = task.condition {
            if !condition.evaluate(self.agent.memory()) {
                return match condition.on_false {
                    OnFalse::Skip => {
                        self.set_status(task_id, TaskStatus::Skipped);
                        TaskRun::Terminal(TaskStatus::Skipped)
                    }
                    OnFalse::Fail => {
                        if let Some(t) = self.plan.task_mut(task_id) {
                            t.result = Some(TaskResult {
                                error: Some(format!("condition on {} was false", condition.key)),
                                ..Default::default()
                            });
                        }
                        self.set_status(task_id, TaskStatus::Failed);
                        TaskRun::Terminal(TaskStatus::Failed)
                    }
                    OnFalse::Wait => TaskRun::StillPending,
                };
            }
        }

        // External gate, before any LLM work.
        if let Some(ref dependency) = task.external_dependency {
            if let Some(t) = self.plan.task_mut(task_id) {
                t.update_status(TaskStatus::WaitingExternal);
            }
            match self.wait_external(&task, dependency).await {
                Ok(payload) => {
                    let key = format!("external.{}", sanitize_key_segment(&task.name));
                    let note = json!({"data": payload, "received_at": Utc::now()});
                    if let Err(e) = self.agent.memory().set(
                        &key,
                        &format!("external event for task {}", task.name),
                        note,
                        SetOptions::default(),
                    ) {
                        warn!(key, error = %e, "could not record external payload");
                    }
                }
                Err(reason) => {
                    if let Some(t) = self.plan.task_mut(task_id) {
                        t.result =
                            Some(TaskResult { error: Some(reason), ..Default::default() });
                    }
                    self.set_status(task_id, TaskStatus::Failed);
                    return TaskRun::Terminal(TaskStatus::Failed);
                }
            }
        }

        // 2. Routine context into memory.
        self.inject_context(&task);

        // 3. Placeholder resolution.
        let bindings = Bindings::from_params(&self.plan.params);

        // Control-flow parents drive sub-tasks instead of a direct run.
        if let Some(ref flow) = task.control_flow {
            if let Some(t) = self.plan.task_mut(task_id) {
                t.update_status(TaskStatus::InProgress);
            }
            self.events.publish(RuntimeEvent::TaskStarted {
                task_id: task_id.to_string(),
                attempt: 1,
            });
            let outcome = self.run_control_flow(flow, &bindings).await;
            let status = match outcome {
                Ok(result) => {
                    if let Some(t) = self.plan.task_mut(task_id) {
                        t.result = Some(TaskResult {
                            output: result.to_string(),
                            ..Default::default()
                        });
                    }
                    TaskStatus::Completed
                }
                Err(reason) => {
                    if let Some(t) = self.plan.task_mut(task_id) {
                        t.result = Some(TaskResult { error: Some(reason), ..Default::default() });
                    }
                    TaskStatus::Failed
                }
            };
            self.finish_task(task_id, status);
            return TaskRun::Terminal(status);
        }

        let prompt = self.task_prompt(&task, &bindings);

        // 4. Per-task iteration cap via pause:check.
        let max_iterations = task
            .execution
            .as_ref()
            .and_then(|e| e.max_iterations)
            .unwrap_or(self.config.default_task_max_iterations);
        let hook_id = self.agent.hooks_mut().register(Arc::new(FnHook::new(
            vec![HookPoint::PauseCheck],
            move |event| {
                if event.iteration >= max_iterations {
                    HookDirective::Cancel { reason: "task iteration limit".into() }
                } else {
                    HookDirective::Continue
                }
            },
        )));

        // 5–6. Run with retries and validation.
        let status = loop {
            if let Some(t) = self.plan.task_mut(task_id) {
                t.update_status(TaskStatus::InProgress);
            }
            let attempts = self.plan.task(task_id).map(|t| t.attempts).unwrap_or(0);
            let max_attempts = task.max_attempts;
            self.events.publish(RuntimeEvent::TaskStarted {
                task_id: task_id.to_string(),
                attempt: attempts,
            });
            self.agent.set_cancel_token(self.plan_cancel.child_token());

            match self.agent.run(&prompt).await {
                Ok(result) => match self.validate(&task, &result).await {
                    None => {
                        if let Some(t) = self.plan.task_mut(task_id) {
                            t.result = Some(TaskResult {
                                output: result.output_text,
                                ..Default::default()
                            });
                        }
                        break TaskStatus::Completed;
                    }
                    Some(verdict) => {
                        let min_score = task
                            .validation
                            .as_ref()
                            .and_then(|v| v.min_completion_score)
                            .unwrap_or(self.config.min_completion_score);
                        let passed = verdict.is_complete && verdict.completion_score >= min_score;
                        if let Some(t) = self.plan.task_mut(task_id) {
                            t.result = Some(TaskResult {
                                output: result.output_text,
                                validation_score: Some(verdict.completion_score),
                                error: (!passed).then(|| verdict.explanation.clone()),
                            });
                        }
                        if passed {
                            break TaskStatus::Completed;
                        }
                        if attempts < max_attempts {
                            info!(task = %task.name, score = verdict.completion_score, "validation failed, retrying");
                            self.agent.context_mut().clear_conversation();
                            continue;
                        }
                        break TaskStatus::Failed;
                    }
                },
                Err(AgentError::Cancelled) if self.plan_cancel.is_cancelled() => {
                    break TaskStatus::Cancelled;
                }
                Err(e) if e.is_transient() && attempts < task.max_attempts => {
                    warn!(task = %task.name, error = %e, "transient failure, retrying");
                    self.agent.reset_cancellation();
                    self.agent.context_mut().clear_conversation();
                    continue;
                }
                Err(e) => {
                    if let Some(t) = self.plan.task_mut(task_id) {
                        t.result = Some(TaskResult {
                            error: Some(e.to_string()),
                            ..Default::default()
                        });
                    }
                    break TaskStatus::Failed;
                }
            }
        };

        // 7. Epilogue, always.
        self.agent.hooks_mut().unregister(hook_id);
        self.finish_task(task_id, status);
        TaskRun::Terminal(status)
    }

    /// Shared task epilogue: conversation cleared (memory persists), the
    /// agent's cancellation reset, terminal status recorded.
    fn finish_task(&mut self, task_id: &str, status: TaskStatus) {
        self.agent.context_mut().clear_conversation();
        self.agent.reset_cancellation();
        self.set_status(task_id, status);
    }

    fn task_prompt(&self, task: &Task, bindings: &Bindings) -> String {
        let mut prompt = bindings.resolve(&task.description);
        if let Some(ref expected) = task.expected_output {
            prompt.push_str("\n\nExpected output: ");
            prompt.push_str(&bindings.resolve(expected));
        }
        if !task.suggested_tools.is_empty() {
            prompt.push_str("\n\nSuggested tools: ");
            prompt.push_str(&task.suggested_tools.join(", "));
        }
        prompt
    }

    /// Plan overview plus dependency results: small results pinned
    /// in-context, large ones in working memory under `findings.`, with a
    /// note naming where each landed.
    fn inject_context(&self, task: &Task) {
        let mut overview = format!("Plan goal: {}\nTasks:\n", self.plan.goal);
        for t in &self.plan.tasks {
            overview.push_str(&format!("- [{:?}] {}\n", t.status, t.name));
        }
        let in_context = self.agent.in_context_memory();
        in_context.set("plan.overview", json!(overview), Some(Priority::High));

        let estimator = HeuristicEstimator;
        let mut notes = Vec::new();
        for dep_id in &task.depends_on {
            let Some(dep) = self.plan.task(dep_id) else { continue };
            let Some(ref result) = dep.result else { continue };
            let value: Value = serde_json::from_str(&result.output)
                .unwrap_or_else(|_| Value::String(result.output.clone()));
            let segment = sanitize_key_segment(&dep.name);

            if estimator.estimate_text(&result.output) < self.config.small_result_token_limit {
                let key = format!("task.{segment}.result");
                in_context.set(&key, value, Some(Priority::High));
                notes.push(format!("result of {} is pinned in context at {key}", dep.name));
            } else {
                let key = format!("findings.task.{segment}");
                match self.agent.memory().set(
                    &key,
                    &format!("result of task {}", dep.name),
                    value,
                    SetOptions::scope(Scope::Plan),
                ) {
                    Ok(()) => notes
                        .push(format!("result of {} is in working memory at {key}", dep.name)),
                    Err(e) => warn!(key, error = %e, "could not stash dependency result"),
                }
            }
        }
        if !notes.is_empty() {
            in_context.set("plan.dependency_results", json!(notes.join("\n")), Some(Priority::High));
        }
    }

    async fn validate(&self, task: &Task, result: &AgentResult) -> Option<ValidationOutcome> {
        let spec = task.validation.as_ref()?;
        if !spec.enabled() {
            return None;
        }
        let tool_log = collect_tool_log(self.agent.context().conversation());
        let prompt = build_validation_prompt(
            &spec.completion_criteria,
            &result.output_text,
            &self.agent.in_context_memory().snapshot(),
            &self.agent.memory().render_index(),
            &tool_log,
        );
        let outcome = match self
            .agent
            .run_direct(&prompt, self.config.validation_temperature)
            .await
        {
            Ok(reply) => parse_validation_reply(&reply),
            Err(e) => {
                warn!(task = %task.name, error = %e, "validator call failed");
                ValidationOutcome::parse_failure()
            }
        };
        Some(outcome)
    }

    // --- external waits ---

    async fn wait_external(
        &mut self,
        task: &Task,
        dependency: &ExternalDependency,
    ) -> Result<Value, String> {
        let timeout = dependency.timeout_ms.map(Duration::from_millis);
        match &dependency.kind {
            ExternalKind::Webhook { webhook_id } => {
                let rx = self.waits.register_webhook(webhook_id);
                await_with_timeout(rx, timeout).await
            }
            ExternalKind::Manual => {
                let rx = self.waits.register_manual(&task.id);
                await_with_timeout(rx, timeout).await
            }
            ExternalKind::Scheduled { at } => {
                let delay = (*at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                if let Some(limit) = timeout {
                    if delay > limit {
                        return Err("timeout".into());
                    }
                }
                tokio::time::sleep(delay).await;
                Ok(Value::Null)
            }
            ExternalKind::Poll { tool, interval_ms } => {
                let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
                loop {
                    match self.agent.call_tool(tool, json!({})).await {
                        Ok(result) if result.get("done").and_then(Value::as_bool) == Some(true) => {
                            return Ok(result);
                        }
                        Ok(_) => {}
                        Err(e) => warn!(tool, error = %e, "poll attempt failed"),
                    }
                    let sleep = Duration::from_millis(*interval_ms);
                    match deadline {
                        Some(deadline) if tokio::time::Instant::now() + sleep >= deadline => {
                            return Err("timeout".into());
                        }
                        _ => tokio::time::sleep(sleep).await,
                    }
                }
            }
        }
    }

    // --- control flow ---

    async fn run_control_flow(
        &mut self,
        flow: &ControlFlow,
        bindings: &Bindings,
    ) -> Result<Value, String> {
        match flow {
            ControlFlow::Map { source, tasks, result_key, max_iterations, iteration_timeout_ms } => {
                let items = source
                    .resolve(self.agent.memory(), &self.plan)
                    .and_then(|v| v.as_array().cloned())
                    .ok_or_else(|| "map source did not resolve to an array".to_string())?;
                if let Some(cap) = max_iterations {
                    if items.len() > *cap {
                        return Err(format!(
                            "map over {} elements exceeds max_iterations {cap}",
                            items.len()
                        ));
                    }
                }
                let total = items.len();
                let mut accumulator = Vec::with_capacity(total);
                for (index, item) in items.into_iter().enumerate() {
                    let mut iteration = bindings.clone();
                    iteration.set("map.item", item);
                    iteration.set("map.index", json!(index));
                    iteration.set("map.total", json!(total));
                    match self.run_subtasks(tasks, &iteration, *iteration_timeout_ms).await {
                        Ok(output) => accumulator.push(output),
                        Err(reason) => {
                            warn!(index, reason, "map iteration failed");
                            accumulator.push(Value::Null);
                        }
                    }
                }
                let result = Value::Array(accumulator);
                self.store_flow_result(result_key, &result)?;
                Ok(result)
            }
            ControlFlow::Fold { source, tasks, initial_value, result_key } => {
                let items = source
                    .resolve(self.agent.memory(), &self.plan)
                    .and_then(|v| v.as_array().cloned())
                    .ok_or_else(|| "fold source did not resolve to an array".to_string())?;
                let total = items.len();
                let mut accumulator = initial_value.clone();
                for (index, item) in items.into_iter().enumerate() {
                    let mut iteration = bindings.clone();
                    iteration.set("map.item", item);
                    iteration.set("map.index", json!(index));
                    iteration.set("map.total", json!(total));
                    iteration.set("fold.accumulator", accumulator.clone());
                    accumulator = self.run_subtasks(tasks, &iteration, None).await?;
                }
                self.store_flow_result(result_key, &accumulator)?;
                Ok(accumulator)
            }
            ControlFlow::Until { tasks, condition, max_iterations, iteration_key } => {
                for index in 0..*max_iterations {
                    let mut iteration = bindings.clone();
                    iteration.set(iteration_key.clone(), json!(index));
                    self.run_subtasks(tasks, &iteration, None).await?;
                    if condition.evaluate(self.agent.memory()) {
                        return Ok(json!({"iterations": index + 1}));
                    }
                }
                Err(format!("until loop exceeded max_iterations {max_iterations}"))
            }
        }
    }

    fn store_flow_result(&self, key: &str, value: &Value) -> Result<(), String> {
        self.agent
            .memory()
            .set(key, "control-flow result", value.clone(), SetOptions::scope(Scope::Plan))
            .map_err(|e| format!("could not store result at {key}: {e}"))
    }

    /// One iteration of a sub-task sequence. The iteration's output is the
    /// last sub-task's output, parsed as JSON when possible. A per-iteration
    /// timeout soft-cancels the agent: in-flight work observes the token and
    /// stops, later iterations run on a fresh one.
    async fn run_subtasks(
        &mut self,
        specs: &[TaskSpec],
        bindings: &Bindings,
        timeout_ms: Option<u64>,
    ) -> Result<Value, String> {
        let mut output = Value::Null;
        for spec in specs {
            let mut prompt = bindings.resolve(&spec.description);
            if let Some(ref expected) = spec.expected_output {
                prompt.push_str("\n\nExpected output: ");
                prompt.push_str(&bindings.resolve(expected));
            }

            self.agent.set_cancel_token(self.plan_cancel.child_token());
            let watchdog = timeout_ms.map(|ms| {
                let token = self.agent.cancel_token();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    token.cancel();
                })
            });

            let run = self.agent.run(&prompt).await;
            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }
            self.agent.context_mut().clear_conversation();
            self.agent.reset_cancellation();

            match run {
                Ok(result) => {
                    output = serde_json::from_str(&result.output_text)
                        .unwrap_or(Value::String(result.output_text));
                }
                Err(AgentError::Cancelled) if self.plan_cancel.is_cancelled() => {
                    return Err("plan cancelled".into());
                }
                Err(AgentError::Cancelled) => return Err("iteration timed out".into()),
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(output)
    }
}

/// Task names become memory-key segments; anything outside the key alphabet
/// collapses to '_'.
fn sanitize_key_segment(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if out.is_empty() {
        out.push('_');
    }
    out
}

async fn await_with_timeout(
    rx: tokio::sync::oneshot::Receiver<Value>,
    timeout: Option<Duration>,
) -> Result<Value, String> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, rx).await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(_)) => Err("external wait channel closed".into()),
            Err(_) => Err("timeout".into()),
        },
        None => rx.await.map_err(|_| "external wait channel closed".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProvider;
    use crate::types::InferenceResponse;
    use crate::{Agent, AgentConfig};
    use serde_json::json;

    fn agent_with(provider: MockProvider) -> Agent {
        Agent::new(provider, AgentConfig { model: "test-model".into(), ..Default::default() })
    }

    fn texts(responses: &[&str]) -> Vec<InferenceResponse> {
        responses.iter().map(|t| MockProvider::text_response(t)).collect()
    }

    #[tokio::test]
    async fn linear_three_task_plan_completes_in_order() {
        // S1: A → B → C, one LLM call each.
        let provider = MockProvider::new(texts(&["did A", "did B", "did C"]));
        let log = provider.request_log();
        let plan = Plan::new(
            "three steps",
            vec![
                TaskSpec::new("A", "do step A"),
                TaskSpec::new("B", "do step B").depends_on(vec!["A"]),
                TaskSpec::new("C", "do step C").depends_on(vec!["B"]),
            ],
        )
        .unwrap();

        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Completed);
        assert_eq!(outcome.progress, 1.0);
        assert_eq!(outcome.completed_tasks, vec!["A", "B", "C"]);

        // Prompts went out in dependency order.
        let prompts = crate::testing::request_prompts(&log).await;
        assert!(prompts[0].contains("do step A"));
        assert!(prompts[1].contains("do step B"));
        assert!(prompts[2].contains("do step C"));
    }

    #[tokio::test]
    async fn dependency_results_flow_into_context() {
        let provider = MockProvider::new(texts(&["result of A", "done"]));
        let plan = Plan::new(
            "two steps",
            vec![
                TaskSpec::new("A", "produce"),
                TaskSpec::new("B", "consume").depends_on(vec!["A"]),
            ],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        executor.execute().await.unwrap();

        let in_context = executor.agent().in_context_memory();
        assert_eq!(in_context.get("task.A.result"), Some(json!("result of A")));
        assert!(in_context.get("plan.overview").is_some());
    }

    #[tokio::test]
    async fn large_dependency_result_lands_in_working_memory() {
        let big = "x".repeat(30_000); // ~7.5k tokens, over the 5k limit
        let provider = MockProvider::new(texts(&[&big, "done"]));
        let plan = Plan::new(
            "two steps",
            vec![
                TaskSpec::new("A", "produce"),
                TaskSpec::new("B", "consume").depends_on(vec!["A"]),
            ],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        executor.execute().await.unwrap();

        assert!(executor.agent().in_context_memory().get("task.A.result").is_none());
        // Plan-scoped entries are cleared when the plan finishes, so the
        // note is observable through the dependency-results summary.
        let notes = executor.agent().in_context_memory().get("plan.dependency_results").unwrap();
        assert!(notes.as_str().unwrap().contains("findings.task.A"));
    }

    #[tokio::test]
    async fn transient_error_retried_then_succeeds() {
        let provider = MockProvider::scripted(vec![
            Err(crate::error::InferenceError::RateLimited("busy".into())),
            Ok(MockProvider::text_response("recovered")),
        ]);
        let plan = Plan::new("retry", vec![TaskSpec::new("A", "flaky step")]).unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Completed);
        let task = executor.plan().task_by_name("A").unwrap();
        assert_eq!(task.attempts, 2);
        assert!(task.attempts <= task.max_attempts);
    }

    #[tokio::test]
    async fn permanent_error_fails_without_retry() {
        let provider = MockProvider::scripted(vec![
            Err(crate::error::InferenceError::Auth("bad key".into())),
            Ok(MockProvider::text_response("never used")),
        ]);
        let plan = Plan::new("doomed", vec![TaskSpec::new("A", "step")]).unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Failed);
        let task = executor.plan().task_by_name("A").unwrap();
        assert_eq!(task.attempts, 1, "permanent errors are not retried");
        assert!(task.result.as_ref().unwrap().error.as_ref().unwrap().contains("authentication"));
    }

    #[tokio::test]
    async fn validation_retry_then_fail() {
        // S5: validator scores below 80 twice; maxAttempts 2 → failed.
        let provider = MockProvider::scripted(vec![
            Ok(MockProvider::text_response("no number here")),
            Ok(MockProvider::text_response(
                r#"{"isComplete": false, "completionScore": 20, "explanation": "missing 42"}"#,
            )),
            Ok(MockProvider::text_response("still no number")),
            Ok(MockProvider::text_response(
                r#"{"isComplete": false, "completionScore": 30, "explanation": "still missing"}"#,
            )),
        ]);
        let plan = Plan::new(
            "validated",
            vec![TaskSpec::new("A", "produce the number")
                .validation(ValidationSpec::reflect(vec!["contains number 42".into()]))
                .max_attempts(2)],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Failed);
        let task = executor.plan().task_by_name("A").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 2, "two in_progress transitions");
        assert!(task.result.as_ref().unwrap().validation_score.unwrap() < 80);
    }

    #[tokio::test]
    async fn validation_pass_completes() {
        let provider = MockProvider::scripted(vec![
            Ok(MockProvider::text_response("the answer is 42")),
            Ok(MockProvider::text_response(
                r#"{"isComplete": true, "completionScore": 95, "explanation": "found it"}"#,
            )),
        ]);
        let plan = Plan::new(
            "validated",
            vec![TaskSpec::new("A", "produce the number")
                .validation(ValidationSpec::reflect(vec!["contains number 42".into()]))],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
        let task = executor.plan().task_by_name("A").unwrap();
        assert_eq!(task.result.as_ref().unwrap().validation_score, Some(95));
    }

    #[tokio::test]
    async fn validation_parse_failure_counts_as_zero() {
        let provider = MockProvider::scripted(vec![
            Ok(MockProvider::text_response("output")),
            Ok(MockProvider::text_response("I cannot judge this")),
            Ok(MockProvider::text_response("output again")),
            Ok(MockProvider::text_response("still prose")),
        ]);
        let plan = Plan::new(
            "validated",
            vec![TaskSpec::new("A", "step")
                .validation(ValidationSpec::reflect(vec!["anything".into()]))
                .max_attempts(2)],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Failed);
        let task = executor.plan().task_by_name("A").unwrap();
        assert_eq!(task.result.as_ref().unwrap().validation_score, Some(0));
    }

    #[tokio::test]
    async fn fail_fast_cancels_remaining() {
        let provider = MockProvider::scripted(vec![Err(
            crate::error::InferenceError::Auth("nope".into()),
        )]);
        let plan = Plan::new(
            "fan",
            vec![TaskSpec::new("A", "first"), TaskSpec::new("B", "second")],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Failed);
        assert_eq!(executor.plan().task_by_name("A").unwrap().status, TaskStatus::Failed);
        assert_eq!(executor.plan().task_by_name("B").unwrap().status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn continue_mode_runs_remaining() {
        let provider = MockProvider::scripted(vec![
            Err(crate::error::InferenceError::Auth("nope".into())),
            Ok(MockProvider::text_response("B done")),
        ]);
        let plan = Plan::new(
            "fan",
            vec![TaskSpec::new("A", "first"), TaskSpec::new("B", "second")],
        )
        .unwrap()
        .with_concurrency(Concurrency {
            failure_mode: FailureMode::Continue,
            ..Default::default()
        });
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Failed, "one failure fails the plan");
        assert_eq!(executor.plan().task_by_name("B").unwrap().status, TaskStatus::Completed);
        assert_eq!(outcome.failed_tasks, vec!["A"]);
    }

    #[tokio::test]
    async fn failed_dependency_cascades() {
        let provider = MockProvider::scripted(vec![Err(
            crate::error::InferenceError::Auth("nope".into()),
        )]);
        let plan = Plan::new(
            "chain",
            vec![TaskSpec::new("A", "first"), TaskSpec::new("B", "second").depends_on(vec!["A"])],
        )
        .unwrap()
        .with_concurrency(Concurrency {
            failure_mode: FailureMode::Continue,
            ..Default::default()
        });
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Failed);
        let b = executor.plan().task_by_name("B").unwrap();
        assert_eq!(b.status, TaskStatus::Failed);
        assert!(b.result.as_ref().unwrap().error.as_ref().unwrap().contains("dependency"));
    }

    #[tokio::test]
    async fn condition_skip_and_fail() {
        let provider = MockProvider::new(texts(&["unused"]));
        let plan = Plan::new(
            "gated",
            vec![
                TaskSpec::new("skipme", "never runs").condition(
                    Condition::new("missing.key", ConditionOp::Exists).on_false(OnFalse::Skip),
                ),
                TaskSpec::new("failme", "never runs").condition(
                    Condition::new("missing.key", ConditionOp::Exists).on_false(OnFalse::Fail),
                ),
            ],
        )
        .unwrap()
        .with_concurrency(Concurrency {
            failure_mode: FailureMode::Continue,
            ..Default::default()
        });
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(executor.plan().task_by_name("skipme").unwrap().status, TaskStatus::Skipped);
        assert_eq!(executor.plan().task_by_name("failme").unwrap().status, TaskStatus::Failed);
        assert_eq!(outcome.status, PlanStatus::Failed);
    }

    #[tokio::test]
    async fn condition_met_runs_task() {
        let provider = MockProvider::new(texts(&["ran"]));
        let agent = agent_with(provider);
        agent.memory().set("go", "flag", json!(true), SetOptions::default()).unwrap();
        let plan = Plan::new(
            "gated",
            vec![TaskSpec::new("A", "run when ready")
                .condition(Condition::new("go", ConditionOp::Truthy))],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent, plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn param_placeholders_resolve_in_prompts() {
        let provider = MockProvider::new(texts(&["done"]));
        let log = provider.request_log();
        let mut params = serde_json::Map::new();
        params.insert("city".into(), json!("Lisbon"));
        let plan = Plan::new(
            "trip",
            vec![TaskSpec::new("A", "plan a trip to {{param.city}}")],
        )
        .unwrap()
        .with_params(params);
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        executor.execute().await.unwrap();

        let prompts = crate::testing::request_prompts(&log).await;
        assert!(prompts[0].contains("Lisbon"), "{}", prompts[0]);
    }

    #[tokio::test]
    async fn map_flow_accumulates_results() {
        let provider = MockProvider::new(texts(&["one", "two", "three"]));
        let log = provider.request_log();
        let agent = agent_with(provider);
        agent.memory().set("items", "d", json!([1, 2, 3]), SetOptions::default()).unwrap();

        let plan = Plan::new(
            "mapped",
            vec![TaskSpec::new("parent", "iterate items").control_flow(ControlFlow::Map {
                source: ValueSource::Key { key: "items".into() },
                tasks: vec![TaskSpec::new("per_item", "handle {{map.item}} ({{map.index}}/{{map.total}})")],
                result_key: "map.results".into(),
                max_iterations: None,
                iteration_timeout_ms: None,
            })],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent, plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Completed);
        let parent = executor.plan().task_by_name("parent").unwrap();
        assert_eq!(parent.result.as_ref().unwrap().output, r#"["one","two","three"]"#);

        let prompts = crate::testing::request_prompts(&log).await;
        assert!(prompts[0].contains("handle 1 (0/3)"));
        assert!(prompts[2].contains("handle 3 (2/3)"));
    }

    #[tokio::test]
    async fn map_flow_over_cap_fails_parent() {
        let provider = MockProvider::new(texts(&[]));
        let agent = agent_with(provider);
        agent.memory().set("items", "d", json!([1, 2, 3]), SetOptions::default()).unwrap();

        let plan = Plan::new(
            "mapped",
            vec![TaskSpec::new("parent", "iterate").control_flow(ControlFlow::Map {
                source: ValueSource::Key { key: "items".into() },
                tasks: vec![TaskSpec::new("per_item", "handle {{map.item}}")],
                result_key: "map.results".into(),
                max_iterations: Some(2),
                iteration_timeout_ms: None,
            })],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent, plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Failed);
        let parent = executor.plan().task_by_name("parent").unwrap();
        assert!(parent.result.as_ref().unwrap().error.as_ref().unwrap().contains("max_iterations"));
    }

    #[tokio::test]
    async fn fold_flow_threads_accumulator() {
        // Each iteration returns the new accumulator as JSON.
        let provider = MockProvider::new(texts(&["10", "30"]));
        let log = provider.request_log();
        let agent = agent_with(provider);
        agent.memory().set("nums", "d", json!([10, 20]), SetOptions::default()).unwrap();

        let plan = Plan::new(
            "folded",
            vec![TaskSpec::new("parent", "sum").control_flow(ControlFlow::Fold {
                source: ValueSource::Key { key: "nums".into() },
                tasks: vec![TaskSpec::new(
                    "add",
                    "add {{map.item}} to {{fold.accumulator}}",
                )],
                initial_value: json!(0),
                result_key: "fold.result".into(),
            })],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent, plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Completed);
        let prompts = crate::testing::request_prompts(&log).await;
        assert!(prompts[0].contains("add 10 to 0"));
        assert!(prompts[1].contains("add 20 to 10"), "{}", prompts[1]);
        let parent = executor.plan().task_by_name("parent").unwrap();
        assert_eq!(parent.result.as_ref().unwrap().output, "30");
    }

    #[tokio::test]
    async fn until_flow_stops_when_condition_met() {
        // Iteration 1 stores nothing; iteration 2 stores the flag via tool.
        let provider = MockProvider::new(vec![
            MockProvider::text_response("not yet"),
            MockProvider::tool_response(
                "c1",
                "memory_store",
                json!({"key": "flag", "value": true, "description": "done flag"}),
            ),
            MockProvider::text_response("flag set"),
        ]);
        let plan = Plan::new(
            "looped",
            vec![TaskSpec::new("parent", "loop").control_flow(ControlFlow::Until {
                tasks: vec![TaskSpec::new("step", "attempt {{until.iteration}}")],
                condition: Condition::new("flag", ConditionOp::Exists),
                max_iterations: 5,
                iteration_key: "until.iteration".into(),
            })],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Completed);
        let parent = executor.plan().task_by_name("parent").unwrap();
        assert!(parent.result.as_ref().unwrap().output.contains("\"iterations\":2"));
    }

    #[tokio::test]
    async fn until_flow_exceeding_cap_fails() {
        let provider = MockProvider::new(texts(&["nope", "nope"]));
        let plan = Plan::new(
            "looped",
            vec![TaskSpec::new("parent", "loop").control_flow(ControlFlow::Until {
                tasks: vec![TaskSpec::new("step", "try")],
                condition: Condition::new("never", ConditionOp::Exists),
                max_iterations: 2,
                iteration_key: "i".into(),
            })],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Failed);
    }

    #[tokio::test]
    async fn webhook_wait_resumes_with_payload() {
        // S6: task blocks on a webhook; the trigger arrives within the
        // timeout and the payload lands in memory with received_at.
        let provider = MockProvider::new(texts(&["handled the event"]));
        let plan = Plan::new(
            "webhook",
            vec![TaskSpec::new("wait_task", "act on the event")
                .external(ExternalDependency::webhook("w1", 60_000))],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let waits = executor.external_waits();

        let driver = tokio::spawn(async move {
            let outcome = executor.execute().await.unwrap();
            (executor, outcome)
        });

        // Deliver once the task is actually waiting.
        for _ in 0..100 {
            if waits.trigger("w1", json!({"ok": true})) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (executor, outcome) = driver.await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
        let task = executor.plan().task_by_name("wait_task").unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        let note = executor.agent().memory().peek("external.wait_task").unwrap();
        assert_eq!(note["data"], json!({"ok": true}));
        assert!(note["received_at"].is_string());
    }

    #[tokio::test(start_paused = true)]
    async fn webhook_timeout_fails_task() {
        let provider = MockProvider::new(texts(&["never used"]));
        let plan = Plan::new(
            "webhook",
            vec![TaskSpec::new("wait_task", "act")
                .external(ExternalDependency::webhook("w1", 1_000))],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Failed);
        let task = executor.plan().task_by_name("wait_task").unwrap();
        assert_eq!(task.result.as_ref().unwrap().error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn manual_completion_resumes() {
        let provider = MockProvider::new(texts(&["done after approval"]));
        let plan = Plan::new(
            "manual",
            vec![TaskSpec::new("gated", "act").external(ExternalDependency::manual())],
        )
        .unwrap();
        let task_id = plan.task_by_name("gated").unwrap().id.clone();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        let waits = executor.external_waits();

        let driver = tokio::spawn(async move {
            let outcome = executor.execute().await.unwrap();
            (executor, outcome)
        });
        for _ in 0..100 {
            if waits.complete(&task_id, json!("approved")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let (_, outcome) = driver.await.unwrap();
        assert_eq!(outcome.status, PlanStatus::Completed);
    }

    #[tokio::test]
    async fn plan_cancellation_marks_remaining_cancelled() {
        let provider = MockProvider::new(texts(&["A done", "unused"]));
        let plan = Plan::new(
            "cancellable",
            vec![
                TaskSpec::new("A", "first"),
                TaskSpec::new("B", "second").depends_on(vec!["A"]),
            ],
        )
        .unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        executor.cancel_handle().cancel();
        let outcome = executor.execute().await.unwrap();

        assert_eq!(outcome.status, PlanStatus::Cancelled);
        assert!(executor
            .plan()
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn plan_scoped_memory_cleared_on_finish() {
        let provider = MockProvider::new(texts(&["done"]));
        let agent = agent_with(provider);
        agent
            .memory()
            .set("scratch", "plan scoped", json!(1), SetOptions::scope(Scope::Plan))
            .unwrap();
        let plan = Plan::new("p", vec![TaskSpec::new("A", "step")]).unwrap();
        let mut executor = RoutineExecutor::new(agent, plan).preserve_agent();
        executor.execute().await.unwrap();
        assert!(!executor.agent().memory().has("scratch"));
    }

    #[tokio::test]
    async fn routine_state_roundtrips_through_storage() {
        use crate::memory::FileMemoryStorage;
        let provider = MockProvider::new(texts(&["done"]));
        let plan = Plan::new("persisted", vec![TaskSpec::new("A", "step")]).unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        executor.execute().await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let storage = FileMemoryStorage::new(dir.path());
        executor.save_state(&storage, "routine1").await.unwrap();

        let doc = storage.load("routine1").await.unwrap().unwrap();
        let state: RoutineState = serde_json::from_value(doc).unwrap();
        assert_eq!(state.status, PlanStatus::Completed);
        assert_eq!(state.progress, 1.0);
        assert!(state.completed_at.is_some());
    }

    #[tokio::test]
    async fn priority_strategy_orders_batch() {
        let provider = MockProvider::new(texts(&["hi", "lo"]));
        let log = provider.request_log();
        let plan = Plan::new(
            "prioritized",
            vec![
                TaskSpec::new("lo", "low priority work")
                    .execution(ExecutionSpec { priority: 1, ..Default::default() }),
                TaskSpec::new("hi", "high priority work")
                    .execution(ExecutionSpec { priority: 9, ..Default::default() }),
            ],
        )
        .unwrap()
        .with_concurrency(Concurrency {
            strategy: ConcurrencyStrategy::Priority,
            ..Default::default()
        });
        let mut executor = RoutineExecutor::new(agent_with(provider), plan).preserve_agent();
        executor.execute().await.unwrap();

        let prompts = crate::testing::request_prompts(&log).await;
        assert!(prompts[0].contains("high priority work"));
        assert!(prompts[1].contains("low priority work"));
    }

    #[tokio::test]
    async fn owned_agent_destroyed_on_finish() {
        let provider = MockProvider::new(texts(&["done"]));
        let plan = Plan::new("owned", vec![TaskSpec::new("A", "step")]).unwrap();
        let mut executor = RoutineExecutor::new(agent_with(provider), plan);
        executor.execute().await.unwrap();
        assert!(executor.agent().is_destroyed());
    }
}
