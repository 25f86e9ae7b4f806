// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `bool::default()`
/// (i.e. `false`), so enabled-by-default fields need a named function.
fn default_true() -> bool {
    true
}

fn default_delegation_depth() -> usize {
    2
}

fn default_compaction_threshold() -> f32 {
    0.60
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

fn default_tool_result_cap_bytes() -> usize {
    200_000
}

fn default_diff_similarity_threshold() -> f64 {
    0.85
}

fn default_max_steps() -> u32 {
    100
}

/// The kind of agent driving a task.
///
/// Each kind carries a hard-coded tool allow-list and a fixed set of
/// delegation targets; see `quill-tools::gate` and `quill-core::delegate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Decomposes work and delegates to the other kinds.
    Planner,
    /// Full read/write/execute access; the only kind that edits files.
    Coder,
    /// Read-only exploration and summarisation.
    Researcher,
    /// Read-only verification of completed work.
    Reviewer,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentKind::Planner => "planner",
            AgentKind::Coder => "coder",
            AgentKind::Researcher => "researcher",
            AgentKind::Reviewer => "reviewer",
        };
        write!(f, "{s}")
    }
}

/// When the runner asks the user before executing a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalMode {
    /// Never ask; every gated call runs.
    Autonomous,
    /// Ask for writes, execution, and dangerous calls; reads run freely.
    AutoApproveReads,
    /// Ask for everything except tools explicitly auto-approved below.
    ApproveAll,
}

/// Per-category auto-approve switches layered on top of [`ApprovalMode`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoApprove {
    #[serde(default = "default_true")]
    pub reads: bool,
    #[serde(default)]
    pub writes: bool,
    #[serde(default)]
    pub execute: bool,
    /// Auto-approve tools exposed by MCP servers.
    #[serde(default)]
    pub mcp: bool,
}

impl Default for AutoApprove {
    fn default() -> Self {
        Self {
            reads: true,
            writes: false,
            execute: false,
            mcp: false,
        }
    }
}

/// Options consumed by a single Tool Runner invocation.
///
/// The shell deserialises this from wherever it keeps settings and passes it
/// in; nothing here touches the filesystem. Call [`RunnerConfig::validated`]
/// after deserialisation — out-of-range values are clamped, not rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "RunnerConfig::default_approval_mode")]
    pub approval_mode: ApprovalMode,
    #[serde(default)]
    pub auto_approve: AutoApprove,
    /// Maximum agent-to-agent delegation depth, clamped to 1..=5.
    #[serde(default = "default_delegation_depth")]
    pub max_delegation_depth: usize,
    /// Fraction of the context budget at which proactive condensation fires.
    #[serde(default = "default_compaction_threshold")]
    pub proactive_compaction_threshold: f32,
    /// Wall-clock budget for one task, in milliseconds.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Byte cap applied to each tool result before it enters the transcript.
    #[serde(default = "default_tool_result_cap_bytes")]
    pub tool_result_cap_bytes: usize,
    /// Minimum similarity for a fuzzy diff match to be accepted.
    #[serde(default = "default_diff_similarity_threshold")]
    pub diff_similarity_threshold: f64,
    /// Absolute cap on loop iterations per task.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

impl RunnerConfig {
    fn default_approval_mode() -> ApprovalMode {
        ApprovalMode::AutoApproveReads
    }

    /// Clamp every field into its documented range.
    pub fn validated(mut self) -> Self {
        if !(1..=5).contains(&self.max_delegation_depth) {
            warn!(
                depth = self.max_delegation_depth,
                "max_delegation_depth out of range; clamping to 1..=5"
            );
            self.max_delegation_depth = self.max_delegation_depth.clamp(1, 5);
        }
        if !(self.proactive_compaction_threshold > 0.0
            && self.proactive_compaction_threshold < 1.0)
        {
            warn!(
                threshold = self.proactive_compaction_threshold,
                "proactive_compaction_threshold out of range; using default"
            );
            self.proactive_compaction_threshold = default_compaction_threshold();
        }
        if !(self.diff_similarity_threshold > 0.0 && self.diff_similarity_threshold <= 1.0) {
            warn!(
                threshold = self.diff_similarity_threshold,
                "diff_similarity_threshold out of range; using default"
            );
            self.diff_similarity_threshold = default_diff_similarity_threshold();
        }
        if self.max_steps == 0 {
            self.max_steps = default_max_steps();
        }
        self
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            approval_mode: Self::default_approval_mode(),
            auto_approve: AutoApprove::default(),
            max_delegation_depth: default_delegation_depth(),
            proactive_compaction_threshold: default_compaction_threshold(),
            task_timeout_ms: default_task_timeout_ms(),
            tool_result_cap_bytes: default_tool_result_cap_bytes(),
            diff_similarity_threshold: default_diff_similarity_threshold(),
            max_steps: default_max_steps(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
