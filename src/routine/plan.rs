use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlanError;

use super::condition::Condition;
use super::control::ControlFlow;
use super::external::ExternalDependency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    InProgress,
    WaitingExternal,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConcurrencyStrategy {
    Fifo,
    Priority,
    /// Declared but reserved; selection falls back to fifo.
    ShortestFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureMode {
    FailFast,
    Continue,
    FailAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concurrency {
    pub max_parallel_tasks: usize,
    pub strategy: ConcurrencyStrategy,
    pub failure_mode: FailureMode,
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 1,
            strategy: ConcurrencyStrategy::Fifo,
            failure_mode: FailureMode::FailFast,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSpec {
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub priority: i32,
    /// Agent reasoning cycles allowed for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Reflection runs only when this is explicitly false and criteria exist.
    #[serde(default = "default_true")]
    pub skip_reflection: bool,
    #[serde(default)]
    pub completion_criteria: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_completion_score: Option<u32>,
}

fn default_true() -> bool {
    true
}

impl ValidationSpec {
    /// Opt in to reflection with the given criteria.
    pub fn reflect(criteria: Vec<String>) -> Self {
        Self { skip_reflection: false, completion_criteria: criteria, min_completion_score: None }
    }

    pub fn enabled(&self) -> bool {
        !self.skip_reflection && !self.completion_criteria.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Input shape for building tasks. `depends_on` entries may name a task by
/// id or by name; both resolve at plan construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_flow: Option<Box<ControlFlow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_dependency: Option<ExternalDependency>,
    #[serde(default)]
    pub suggested_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    3
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            depends_on: Vec::new(),
            condition: None,
            control_flow: None,
            validation: None,
            execution: None,
            external_dependency: None,
            suggested_tools: Vec::new(),
            expected_output: None,
            max_attempts: default_max_attempts(),
        }
    }

    pub fn depends_on(mut self, deps: Vec<&str>) -> Self {
        self.depends_on = deps.into_iter().map(String::from).collect();
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn control_flow(mut self, flow: ControlFlow) -> Self {
        self.control_flow = Some(Box::new(flow));
        self
    }

    pub fn validation(mut self, validation: ValidationSpec) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn execution(mut self, execution: ExecutionSpec) -> Self {
        self.execution = Some(execution);
        self
    }

    pub fn external(mut self, dependency: ExternalDependency) -> Self {
        self.external_dependency = Some(dependency);
        self
    }

    pub fn expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

/// One unit of LLM-driven work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    /// Resolved task ids.
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_flow: Option<Box<ControlFlow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_dependency: Option<ExternalDependency>,
    #[serde(default)]
    pub suggested_tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_updated_at: DateTime<Utc>,
}

impl Task {
    fn from_spec(spec: TaskSpec, id: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: spec.name,
            description: spec.description,
            status: TaskStatus::Pending,
            depends_on: spec.depends_on,
            condition: spec.condition,
            control_flow: spec.control_flow,
            validation: spec.validation,
            execution: spec.execution,
            external_dependency: spec.external_dependency,
            suggested_tools: spec.suggested_tools,
            expected_output: spec.expected_output,
            result: None,
            attempts: 0,
            max_attempts: spec.max_attempts,
            created_at: now,
            started_at: None,
            completed_at: None,
            last_updated_at: now,
        }
    }

    /// The single mutation point for status. Each transition to
    /// `InProgress` counts an attempt; `started_at` is set once, on the
    /// first such transition; terminal transitions stamp `completed_at`.
    pub fn update_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        if status == TaskStatus::InProgress {
            self.attempts += 1;
            if self.started_at.is_none() {
                self.started_at = Some(now);
            }
        }
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(now);
        }
        self.status = status;
        self.last_updated_at = now;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
}

/// Patch for one existing task in a dynamic plan update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

/// Mid-execution plan diff.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanUpdate {
    #[serde(default)]
    pub add_tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub update_tasks: Vec<TaskPatch>,
    #[serde(default)]
    pub remove_tasks: Vec<String>,
}

impl PlanUpdate {
    pub fn is_empty(&self) -> bool {
        self.add_tasks.is_empty() && self.update_tasks.is_empty() && self.remove_tasks.is_empty()
    }
}

/// An acyclic set of tasks with dependencies and a concurrency policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub concurrency: Concurrency,
    #[serde(default)]
    pub allow_dynamic_tasks: bool,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    /// Inputs referenced by `{{param.X}}` placeholders.
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
    #[serde(default)]
    next_ordinal: u64,
}

impl Plan {
    pub fn new(goal: impl Into<String>, specs: Vec<TaskSpec>) -> Result<Self, PlanError> {
        let goal = goal.into();
        let mut plan = Self {
            id: generate_plan_id(),
            goal,
            tasks: Vec::new(),
            concurrency: Concurrency::default(),
            allow_dynamic_tasks: false,
            status: PlanStatus::Pending,
            suspended_reason: None,
            current_task_id: None,
            metadata: Value::Null,
            params: serde_json::Map::new(),
            next_ordinal: 0,
        };
        plan.insert_specs(specs)?;
        plan.validate_graph()?;
        Ok(plan)
    }

    pub fn with_concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_dynamic_tasks(mut self) -> Self {
        self.allow_dynamic_tasks = true;
        self
    }

    pub fn with_params(mut self, params: serde_json::Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    fn insert_specs(&mut self, specs: Vec<TaskSpec>) -> Result<(), PlanError> {
        for spec in &specs {
            if self.tasks.iter().any(|t| t.name == spec.name)
                || specs.iter().filter(|s| s.name == spec.name).count() > 1
            {
                return Err(PlanError::DuplicateTask(spec.name.clone()));
            }
        }
        // Ids are assigned first so forward references among the new specs
        // resolve.
        let mut new_tasks: Vec<Task> = specs
            .into_iter()
            .map(|spec| {
                self.next_ordinal += 1;
                let id = format!("{}-t{}", self.id, self.next_ordinal);
                Task::from_spec(spec, id)
            })
            .collect();

        for i in 0..new_tasks.len() {
            let mut resolved = Vec::with_capacity(new_tasks[i].depends_on.len());
            for dep in new_tasks[i].depends_on.clone() {
                let found = self
                    .tasks
                    .iter()
                    .chain(new_tasks.iter())
                    .find(|t| t.id == dep || t.name == dep)
                    .map(|t| t.id.clone());
                match found {
                    Some(id) => resolved.push(id),
                    None => {
                        return Err(PlanError::DependencyMissing {
                            task: new_tasks[i].name.clone(),
                            missing: dep,
                        })
                    }
                }
            }
            new_tasks[i].depends_on = resolved;
        }
        self.tasks.extend(new_tasks);
        Ok(())
    }

    /// Reject cycles, reporting the offending path by task name.
    fn validate_graph(&self) -> Result<(), PlanError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Grey,
            Black,
        }

        fn visit(
            plan: &Plan,
            id: &str,
            marks: &mut std::collections::HashMap<String, Mark>,
            stack: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            marks.insert(id.to_string(), Mark::Grey);
            stack.push(id.to_string());
            if let Some(task) = plan.tasks.iter().find(|t| t.id == id) {
                for dep in &task.depends_on {
                    match marks.get(dep).copied().unwrap_or(Mark::White) {
                        Mark::Grey => {
                            let start = stack.iter().position(|s| s == dep).unwrap_or(0);
                            let mut cycle: Vec<String> = stack[start..]
                                .iter()
                                .map(|id| plan.task_name(id).to_string())
                                .collect();
                            cycle.push(plan.task_name(dep).to_string());
                            return Some(cycle);
                        }
                        Mark::White => {
                            if let Some(cycle) = visit(plan, dep, marks, stack) {
                                return Some(cycle);
                            }
                        }
                        Mark::Black => {}
                    }
                }
            }
            stack.pop();
            marks.insert(id.to_string(), Mark::Black);
            None
        }

        let mut marks = std::collections::HashMap::new();
        for task in &self.tasks {
            if marks.get(&task.id).copied().unwrap_or(Mark::White) == Mark::White {
                let mut stack = Vec::new();
                if let Some(cycle) = visit(self, &task.id, &mut marks, &mut stack) {
                    return Err(PlanError::DependencyCycle { cycle });
                }
            }
        }
        Ok(())
    }

    fn task_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.tasks.iter().find(|t| t.id == id).map(|t| t.name.as_str()).unwrap_or(id)
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn task_by_name(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Every `depends_on` id completed.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.task(dep).map(|t| t.status == TaskStatus::Completed).unwrap_or(false)
        })
    }

    /// Pending tasks whose dependencies are all completed, in creation order.
    pub fn ready_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending && self.dependencies_met(t))
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.tasks.iter().all(Task::is_terminal)
    }

    /// Terminal tasks over total. An empty plan is complete.
    pub fn progress(&self) -> f32 {
        if self.tasks.is_empty() {
            return 1.0;
        }
        let done = self.tasks.iter().filter(|t| t.is_terminal()).count();
        done as f32 / self.tasks.len() as f32
    }

    /// Once every task is terminal: completed iff every task completed.
    pub fn resolve_status(&mut self) {
        if self.status == PlanStatus::Cancelled || !self.is_terminal() {
            return;
        }
        self.status = if self.tasks.iter().all(|t| t.status == TaskStatus::Completed) {
            PlanStatus::Completed
        } else {
            PlanStatus::Failed
        };
    }

    /// Apply a dynamic diff. An empty diff is a no-op even when dynamic
    /// tasks are disabled.
    pub fn update(&mut self, diff: PlanUpdate, force_remove: bool) -> Result<(), PlanError> {
        if diff.is_empty() {
            return Ok(());
        }
        if !self.allow_dynamic_tasks {
            return Err(PlanError::DynamicTasksDisabled);
        }

        // Validate against a scratch copy so a bad diff leaves the plan
        // untouched.
        let mut draft = self.clone();
        for name in &diff.remove_tasks {
            let task = draft
                .task_by_name(name)
                .or_else(|| draft.task(name))
                .ok_or_else(|| PlanError::UnknownTask(name.clone()))?;
            if task.status == TaskStatus::InProgress && !force_remove {
                return Err(PlanError::TaskInProgress(name.clone()));
            }
            let id = task.id.clone();
            if let Some(dependent) = draft
                .tasks
                .iter()
                .find(|t| t.id != id && t.depends_on.contains(&id) && !diff.remove_tasks.contains(&t.name))
            {
                return Err(PlanError::DependencyMissing {
                    task: dependent.name.clone(),
                    missing: name.clone(),
                });
            }
            draft.tasks.retain(|t| t.id != id);
        }
        for patch in &diff.update_tasks {
            let task = draft
                .tasks
                .iter_mut()
                .find(|t| t.name == patch.name)
                .ok_or_else(|| PlanError::UnknownTask(patch.name.clone()))?;
            if let Some(ref description) = patch.description {
                task.description = description.clone();
            }
            if let Some(ref expected) = patch.expected_output {
                task.expected_output = Some(expected.clone());
            }
            if let Some(max_attempts) = patch.max_attempts {
                task.max_attempts = max_attempts;
            }
            task.last_updated_at = Utc::now();
        }
        draft.insert_specs(diff.add_tasks.clone())?;
        draft.validate_graph()?;

        *self = draft;
        Ok(())
    }
}

fn generate_plan_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("plan_{ts:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_plan() -> Plan {
        Plan::new(
            "ship it",
            vec![
                TaskSpec::new("a", "first"),
                TaskSpec::new("b", "second").depends_on(vec!["a"]),
                TaskSpec::new("c", "third").depends_on(vec!["b"]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn dependencies_resolve_by_name() {
        let plan = linear_plan();
        let b = plan.task_by_name("b").unwrap();
        assert_eq!(b.depends_on, vec![plan.task_by_name("a").unwrap().id.clone()]);
    }

    #[test]
    fn cycle_rejected_with_path() {
        let err = Plan::new(
            "impossible",
            vec![
                TaskSpec::new("X", "x").depends_on(vec!["Y"]),
                TaskSpec::new("Y", "y").depends_on(vec!["X"]),
            ],
        )
        .unwrap_err();
        match err {
            PlanError::DependencyCycle { cycle } => {
                assert_eq!(cycle.len(), 3);
                assert_eq!(cycle.first(), cycle.last());
                assert!(cycle.contains(&"X".to_string()) && cycle.contains(&"Y".to_string()));
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err =
            Plan::new("selfish", vec![TaskSpec::new("a", "a").depends_on(vec!["a"])]).unwrap_err();
        assert!(matches!(err, PlanError::DependencyCycle { .. }));
    }

    #[test]
    fn missing_dependency_rejected() {
        let err = Plan::new("broken", vec![TaskSpec::new("a", "a").depends_on(vec!["ghost"])])
            .unwrap_err();
        assert!(matches!(err, PlanError::DependencyMissing { .. }));
    }

    #[test]
    fn duplicate_names_rejected() {
        let err =
            Plan::new("dupes", vec![TaskSpec::new("a", "1"), TaskSpec::new("a", "2")]).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateTask(_)));
    }

    #[test]
    fn in_progress_counts_attempts_and_sets_started_once() {
        let mut plan = linear_plan();
        let id = plan.task_by_name("a").unwrap().id.clone();
        let task = plan.task_mut(&id).unwrap();

        task.update_status(TaskStatus::InProgress);
        let first_start = task.started_at.unwrap();
        assert_eq!(task.attempts, 1);

        task.update_status(TaskStatus::Pending);
        task.update_status(TaskStatus::InProgress);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.started_at.unwrap(), first_start, "started_at set only once");
    }

    #[test]
    fn ready_tasks_respect_dependencies() {
        let mut plan = linear_plan();
        let ready: Vec<&str> = plan.ready_tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(ready, vec!["a"]);

        let a = plan.task_by_name("a").unwrap().id.clone();
        plan.task_mut(&a).unwrap().update_status(TaskStatus::Completed);
        let ready: Vec<&str> = plan.ready_tasks().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(ready, vec!["b"]);
    }

    #[test]
    fn failed_dependency_blocks_forever() {
        let mut plan = linear_plan();
        let a = plan.task_by_name("a").unwrap().id.clone();
        plan.task_mut(&a).unwrap().update_status(TaskStatus::Failed);
        assert!(plan.ready_tasks().is_empty());
    }

    #[test]
    fn progress_and_status_resolution() {
        let mut plan = linear_plan();
        assert_eq!(plan.progress(), 0.0);
        for id in plan.tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>() {
            plan.task_mut(&id).unwrap().update_status(TaskStatus::Completed);
        }
        assert_eq!(plan.progress(), 1.0);
        plan.resolve_status();
        assert_eq!(plan.status, PlanStatus::Completed);
    }

    #[test]
    fn any_failed_task_fails_plan() {
        let mut plan = linear_plan();
        let ids: Vec<String> = plan.tasks.iter().map(|t| t.id.clone()).collect();
        plan.task_mut(&ids[0]).unwrap().update_status(TaskStatus::Completed);
        plan.task_mut(&ids[1]).unwrap().update_status(TaskStatus::Failed);
        plan.task_mut(&ids[2]).unwrap().update_status(TaskStatus::Skipped);
        plan.resolve_status();
        assert_eq!(plan.status, PlanStatus::Failed);
    }

    #[test]
    fn empty_update_is_noop_even_when_dynamic_disabled() {
        let mut plan = linear_plan();
        assert!(!plan.allow_dynamic_tasks);
        plan.update(PlanUpdate::default(), false).unwrap();
    }

    #[test]
    fn update_rejected_when_dynamic_disabled() {
        let mut plan = linear_plan();
        let diff = PlanUpdate {
            add_tasks: vec![TaskSpec::new("d", "new")],
            ..Default::default()
        };
        assert!(matches!(plan.update(diff, false), Err(PlanError::DynamicTasksDisabled)));
    }

    #[test]
    fn update_adds_and_removes() {
        let mut plan = linear_plan().with_dynamic_tasks();
        let diff = PlanUpdate {
            add_tasks: vec![TaskSpec::new("d", "fourth").depends_on(vec!["c"])],
            remove_tasks: vec![],
            update_tasks: vec![TaskPatch {
                name: "a".into(),
                description: Some("rewritten".into()),
                ..Default::default()
            }],
        };
        plan.update(diff, false).unwrap();
        assert_eq!(plan.tasks.len(), 4);
        assert_eq!(plan.task_by_name("a").unwrap().description, "rewritten");
    }

    #[test]
    fn removing_in_progress_task_needs_force() {
        let mut plan = linear_plan().with_dynamic_tasks();
        let c = plan.task_by_name("c").unwrap().id.clone();
        plan.task_mut(&c).unwrap().update_status(TaskStatus::InProgress);
        let diff = PlanUpdate { remove_tasks: vec!["c".into()], ..Default::default() };
        assert!(matches!(plan.update(diff.clone(), false), Err(PlanError::TaskInProgress(_))));
        plan.update(diff, true).unwrap();
        assert!(plan.task_by_name("c").is_none());
    }

    #[test]
    fn update_introducing_cycle_rejected_atomically() {
        let mut plan = linear_plan().with_dynamic_tasks();
        let diff = PlanUpdate {
            add_tasks: vec![
                TaskSpec::new("d", "d").depends_on(vec!["e"]),
                TaskSpec::new("e", "e").depends_on(vec!["d"]),
            ],
            ..Default::default()
        };
        assert!(matches!(plan.update(diff, false), Err(PlanError::DependencyCycle { .. })));
        assert_eq!(plan.tasks.len(), 3, "failed diff must not change the plan");
    }

    #[test]
    fn removing_a_depended_on_task_rejected() {
        let mut plan = linear_plan().with_dynamic_tasks();
        let diff = PlanUpdate { remove_tasks: vec!["a".into()], ..Default::default() };
        assert!(matches!(plan.update(diff, false), Err(PlanError::DependencyMissing { .. })));
    }

    #[test]
    fn plan_serde_roundtrip() {
        let plan = linear_plan();
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tasks.len(), 3);
        assert_eq!(back.task_by_name("b").unwrap().depends_on.len(), 1);
    }
}
