use std::sync::Arc;

use serde_json::Value;

/// Named extension points in the agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    BeforeExecution,
    AfterExecution,
    BeforeLlm,
    AfterLlm,
    BeforeTool,
    AfterTool,
    ApproveTool,
    PauseCheck,
}

impl HookPoint {
    pub fn name(self) -> &'static str {
        match self {
            Self::BeforeExecution => "before:execution",
            Self::AfterExecution => "after:execution",
            Self::BeforeLlm => "before:llm",
            Self::AfterLlm => "after:llm",
            Self::BeforeTool => "before:tool",
            Self::AfterTool => "after:tool",
            Self::ApproveTool => "approve:tool",
            Self::PauseCheck => "pause:check",
        }
    }
}

/// What a hook sees. Fields are populated per point: tool fields around tool
/// calls, response text after LLM calls.
#[derive(Debug, Clone, Copy)]
pub struct HookEvent<'a> {
    pub point: HookPoint,
    pub iteration: usize,
    pub tool_name: Option<&'a str>,
    pub tool_input: Option<&'a Value>,
    pub response_text: Option<&'a str>,
}

impl<'a> HookEvent<'a> {
    pub fn new(point: HookPoint, iteration: usize) -> Self {
        Self { point, iteration, tool_name: None, tool_input: None, response_text: None }
    }

    pub fn with_tool(mut self, name: &'a str, input: &'a Value) -> Self {
        self.tool_name = Some(name);
        self.tool_input = Some(input);
        self
    }

    pub fn with_response(mut self, text: &'a str) -> Self {
        self.response_text = Some(text);
        self
    }
}

/// A hook's verdict. Anything but `Continue` short-circuits the remaining
/// hooks at that point.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HookDirective {
    #[default]
    Continue,
    Pause { reason: String },
    Cancel { reason: String },
    Deny { reason: String },
}

/// Synchronous observer/interceptor. Hooks run to completion; keep them fast.
pub trait Hook: Send + Sync {
    fn points(&self) -> &[HookPoint];
    fn on_event(&self, event: &HookEvent<'_>) -> HookDirective;
}

/// Closure adapter for one-off hooks.
pub struct FnHook<F> {
    points: Vec<HookPoint>,
    f: F,
}

impl<F> FnHook<F>
where
    F: Fn(&HookEvent<'_>) -> HookDirective + Send + Sync,
{
    pub fn new(points: Vec<HookPoint>, f: F) -> Self {
        Self { points, f }
    }
}

impl<F> Hook for FnHook<F>
where
    F: Fn(&HookEvent<'_>) -> HookDirective + Send + Sync,
{
    fn points(&self) -> &[HookPoint] {
        &self.points
    }

    fn on_event(&self, event: &HookEvent<'_>) -> HookDirective {
        (self.f)(event)
    }
}

/// Handle for unregistering a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

/// Ordered hook pipeline. Dispatch walks hooks in registration order and
/// returns the first non-`Continue` directive.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<(HookId, Arc<dyn Hook>)>,
    next_id: u64,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) -> HookId {
        let id = HookId(self.next_id);
        self.next_id += 1;
        self.hooks.push((id, hook));
        id
    }

    pub fn unregister(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(hid, _)| *hid != id);
        self.hooks.len() != before
    }

    pub fn dispatch(&self, event: &HookEvent<'_>) -> HookDirective {
        for (_, hook) in &self.hooks {
            if !hook.points().contains(&event.point) {
                continue;
            }
            match hook.on_event(event) {
                HookDirective::Continue => continue,
                directive => return directive,
            }
        }
        HookDirective::Continue
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn clear(&mut self) {
        self.hooks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_hook(
        point: HookPoint,
        hits: Arc<std::sync::atomic::AtomicUsize>,
        verdict: HookDirective,
    ) -> Arc<dyn Hook> {
        Arc::new(FnHook::new(vec![point], move |_| {
            hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            verdict.clone()
        }))
    }

    #[test]
    fn dispatch_only_matching_point() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let hits = Arc::new(AtomicUsize::new(0));
        let mut reg = HookRegistry::new();
        reg.register(counting_hook(HookPoint::BeforeTool, hits.clone(), HookDirective::Continue));

        reg.dispatch(&HookEvent::new(HookPoint::BeforeLlm, 0));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        reg.dispatch(&HookEvent::new(HookPoint::BeforeTool, 0));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn first_non_continue_short_circuits() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let mut reg = HookRegistry::new();
        reg.register(counting_hook(
            HookPoint::PauseCheck,
            first.clone(),
            HookDirective::Cancel { reason: "limit".into() },
        ));
        reg.register(counting_hook(HookPoint::PauseCheck, second.clone(), HookDirective::Continue));

        let directive = reg.dispatch(&HookEvent::new(HookPoint::PauseCheck, 3));
        assert_eq!(directive, HookDirective::Cancel { reason: "limit".into() });
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0, "later hook must not run");
    }

    #[test]
    fn unregister_removes_hook() {
        let mut reg = HookRegistry::new();
        let id = reg.register(Arc::new(FnHook::new(vec![HookPoint::ApproveTool], |_| {
            HookDirective::Deny { reason: "no".into() }
        })));
        assert!(reg.unregister(id));
        assert!(!reg.unregister(id));
        let directive = reg.dispatch(&HookEvent::new(HookPoint::ApproveTool, 0));
        assert_eq!(directive, HookDirective::Continue);
    }
}
