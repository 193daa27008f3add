use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::estimate::TokenEstimator;
use crate::types::{ConversationMessage, MessagePart};

use super::plugin::ContextPlugin;

/// What a strategy may see and mutate during compaction. Protection of the
/// most recent messages and the in-flight input is enforced here, not left
/// to strategy discipline.
pub struct StrategyContext<'a> {
    conversation: &'a mut Vec<ConversationMessage>,
    current_input: &'a [ConversationMessage],
    plugins: &'a [Arc<dyn ContextPlugin>],
    estimator: &'a dyn TokenEstimator,
    protect_recent: usize,
}

impl<'a> StrategyContext<'a> {
    pub(crate) fn new(
        conversation: &'a mut Vec<ConversationMessage>,
        current_input: &'a [ConversationMessage],
        plugins: &'a [Arc<dyn ContextPlugin>],
        estimator: &'a dyn TokenEstimator,
        protect_recent: usize,
    ) -> Self {
        Self { conversation, current_input, plugins, estimator, protect_recent }
    }

    pub fn conversation(&self) -> &[ConversationMessage] {
        self.conversation
    }

    pub fn current_input(&self) -> &[ConversationMessage] {
        self.current_input
    }

    pub fn estimator(&self) -> &dyn TokenEstimator {
        self.estimator
    }

    pub fn message_tokens(&self, index: usize) -> u32 {
        self.conversation
            .get(index)
            .and_then(|m| serde_json::to_value(m).ok())
            .map(|v| self.estimator.estimate_data(&v))
            .unwrap_or(0)
    }

    /// Indices at or past this point are protected from removal.
    pub fn removable_limit(&self) -> usize {
        self.conversation.len().saturating_sub(self.protect_recent)
    }

    /// `(name, compactable, compaction_priority)` for each plugin.
    pub fn plugin_summaries(&self) -> Vec<(String, bool, u8)> {
        self.plugins
            .iter()
            .map(|p| (p.name().to_string(), p.is_compactable(), p.compaction_priority()))
            .collect()
    }

    /// Remove the given conversation messages. Protected indices are
    /// silently skipped. Returns estimated tokens freed.
    pub fn remove_messages(&mut self, indices: &[usize]) -> u32 {
        let limit = self.removable_limit();
        let doomed: HashSet<usize> = indices.iter().copied().filter(|&i| i < limit).collect();
        if doomed.is_empty() {
            return 0;
        }

        let mut freed = 0;
        for &i in &doomed {
            freed += self.message_tokens(i);
        }
        let mut index = 0;
        self.conversation.retain(|_| {
            let keep = !doomed.contains(&index);
            index += 1;
            keep
        });
        freed
    }

    /// Ask a plugin to free tokens. Returns what it actually freed.
    pub fn compact_plugin(&mut self, name: &str, target_tokens: u32) -> u32 {
        match self.plugins.iter().find(|p| p.name() == name) {
            Some(p) if p.is_compactable() => p.compact(target_tokens),
            _ => 0,
        }
    }

    /// Replace a stale tool-result body with a short stub. Returns tokens
    /// freed (0 if the message is protected or has no tool result).
    pub fn stub_tool_results(&mut self, index: usize) -> u32 {
        if index >= self.removable_limit() {
            return 0;
        }
        let before = self.message_tokens(index);
        let Some(msg) = self.conversation.get_mut(index) else {
            return 0;
        };
        let mut changed = false;
        for part in &mut msg.parts {
            if let MessagePart::ToolResult { name, content, .. } = part {
                if content.starts_with("[tool result pruned") {
                    continue;
                }
                *content = format!("[tool result pruned — {name}: {} bytes]", content.len());
                changed = true;
            }
        }
        if !changed {
            return 0;
        }
        before.saturating_sub(self.message_tokens(index))
    }
}

/// Outcome of an emergency `compact` pass.
#[derive(Debug, Clone, Default)]
pub struct CompactionReport {
    pub tokens_freed: u32,
    pub messages_removed: usize,
    pub plugins_compacted: Vec<String>,
    pub log: Vec<String>,
}

/// Outcome of a post-cycle `consolidate` pass.
#[derive(Debug, Clone, Default)]
pub struct ConsolidationReport {
    pub performed: bool,
    /// Negative when tokens were freed.
    pub tokens_changed: i64,
    pub actions: Vec<String>,
}

/// Pluggable compaction policy. `compact` runs mid-prepare and must be
/// fast; `consolidate` runs after a full agent cycle and may be expensive.
pub trait CompactionStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Utilization fraction at which `prepare` invokes `compact`.
    fn threshold(&self) -> f32;

    fn required_plugins(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn compact(&self, ctx: &mut StrategyContext<'_>, target_to_free: u32) -> CompactionReport;

    fn consolidate(&self, _ctx: &mut StrategyContext<'_>) -> ConsolidationReport {
        ConsolidationReport::default()
    }
}

/// The bundled strategy: compact plugins first (highest compaction priority
/// first), then drop the oldest conversation messages, always keeping a
/// tool_use message and its tool_result message together. Consolidation
/// stubs out stale tool-result bodies.
pub struct AlgorithmicStrategy {
    threshold: f32,
    keep_recent: usize,
    keep_recent_tool_results: usize,
}

impl AlgorithmicStrategy {
    pub fn new() -> Self {
        Self { threshold: 0.8, keep_recent: 4, keep_recent_tool_results: 3 }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_keep_recent(mut self, keep_recent: usize) -> Self {
        self.keep_recent = keep_recent;
        self
    }

    /// Oldest-first removal groups. A message whose tool_use ids are
    /// answered by the following message forms an atomic two-message group;
    /// a group is only returned whole and only below `limit`.
    fn removal_groups(conversation: &[ConversationMessage], limit: usize) -> Vec<Vec<usize>> {
        let mut groups = Vec::new();
        let mut i = 0;
        while i < limit {
            let msg = &conversation[i];
            if msg.has_tool_use() {
                let paired = conversation
                    .get(i + 1)
                    .is_some_and(|next| next.has_tool_result());
                if paired {
                    if i + 1 >= limit {
                        // The result half is protected; removing the call
                        // half would orphan it.
                        break;
                    }
                    groups.push(vec![i, i + 1]);
                    i += 2;
                    continue;
                }
            }
            groups.push(vec![i]);
            i += 1;
        }
        groups
    }
}

impl Default for AlgorithmicStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactionStrategy for AlgorithmicStrategy {
    fn name(&self) -> &str {
        "algorithmic"
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }

    fn compact(&self, ctx: &mut StrategyContext<'_>, target_to_free: u32) -> CompactionReport {
        let mut report = CompactionReport::default();

        // Phase 1: plugins, highest compaction priority first.
        let mut plugins = ctx.plugin_summaries();
        plugins.retain(|(_, compactable, _)| *compactable);
        plugins.sort_by_key(|(_, _, priority)| std::cmp::Reverse(*priority));
        for (name, _, _) in plugins {
            if report.tokens_freed >= target_to_free {
                break;
            }
            let freed = ctx.compact_plugin(&name, target_to_free - report.tokens_freed);
            if freed > 0 {
                report.tokens_freed += freed;
                report.log.push(format!("plugin {name} freed {freed} tokens"));
                report.plugins_compacted.push(name);
            }
        }

        // Phase 2: drop oldest messages, tool pairs as a unit.
        if report.tokens_freed < target_to_free {
            let groups = Self::removal_groups(ctx.conversation(), ctx.removable_limit());
            let mut doomed = Vec::new();
            let mut expected: u32 = 0;
            for group in groups {
                if report.tokens_freed + expected >= target_to_free {
                    break;
                }
                expected += group.iter().map(|&i| ctx.message_tokens(i)).sum::<u32>();
                doomed.extend(group);
            }
            if !doomed.is_empty() {
                let removed = doomed.len();
                let freed = ctx.remove_messages(&doomed);
                report.tokens_freed += freed;
                report.messages_removed = removed;
                report.log.push(format!("removed {removed} oldest messages ({freed} tokens)"));
            }
        }

        debug!(
            freed = report.tokens_freed,
            target = target_to_free,
            removed = report.messages_removed,
            "compaction pass"
        );
        report
    }

    /// Post-cycle cleanup: stub out all but the most recent tool results.
    fn consolidate(&self, ctx: &mut StrategyContext<'_>) -> ConsolidationReport {
        let result_indices: Vec<usize> = ctx
            .conversation()
            .iter()
            .enumerate()
            .filter(|(_, m)| m.has_tool_result())
            .map(|(i, _)| i)
            .collect();
        if result_indices.len() <= self.keep_recent_tool_results {
            return ConsolidationReport::default();
        }

        let prune_count = result_indices.len() - self.keep_recent_tool_results;
        let mut report = ConsolidationReport::default();
        for &index in &result_indices[..prune_count] {
            let freed = ctx.stub_tool_results(index);
            if freed > 0 {
                report.performed = true;
                report.tokens_changed -= freed as i64;
                report.actions.push(format!("stubbed tool results in message {index}"));
            }
        }
        report
    }
}
