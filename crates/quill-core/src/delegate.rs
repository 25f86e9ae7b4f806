// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;
use thiserror::Error;

use quill_config::AgentKind;

/// Virtual tool keys intercepted by the runner before dispatch.
pub const DELEGATE_TOOL: &str = "agent::delegate";
pub const DELEGATE_PARALLEL_TOOL: &str = "agent::delegate_parallel";

/// Upper bound on concurrent sub-tasks per fan-out call.
pub const MAX_PARALLEL_SUBTASKS: usize = 5;

/// Which agent kinds each kind may delegate to.  The graph is static: the
/// planner decomposes, the coder may farm out research, and the leaf kinds
/// delegate to nobody.
pub fn allowed_targets(kind: AgentKind) -> &'static [AgentKind] {
    match kind {
        AgentKind::Planner => &[AgentKind::Coder, AgentKind::Researcher, AgentKind::Reviewer],
        AgentKind::Coder => &[AgentKind::Researcher],
        AgentKind::Researcher => &[],
        AgentKind::Reviewer => &[],
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationError {
    #[error("agent kind '{from}' may not delegate to '{to}'")]
    EdgeNotAllowed { from: AgentKind, to: AgentKind },
    #[error("delegation depth exceeded: depth {depth} has reached the cap of {cap}")]
    DepthExceeded { depth: usize, cap: usize },
    #[error("an agent may not delegate to its own kind")]
    SelfDelegation,
    #[error("unknown agent kind '{0}'")]
    UnknownKind(String),
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("a parallel fan-out carries at most {MAX_PARALLEL_SUBTASKS} sub-tasks, got {0}")]
    TooManySubtasks(usize),
}

/// One requested sub-task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTaskRequest {
    pub agent: AgentKind,
    pub task: String,
}

/// Terminal status of a task or sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Partial,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Success => "success",
            TaskStatus::Partial => "partial",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// What a finished sub-task reported back to its parent.
#[derive(Debug, Clone)]
pub struct SubTaskReport {
    pub agent: AgentKind,
    pub status: TaskStatus,
    pub result: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Validates delegation requests against the static graph and the depth cap.
#[derive(Debug, Clone, Copy)]
pub struct DelegationController {
    cap: usize,
}

impl DelegationController {
    /// `cap` is clamped to 1..=5 (the config layer warns on out-of-range).
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.clamp(1, 5),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// A delegation is allowed iff the edge exists, the depth cap is not
    /// reached, and the target differs from the delegating kind.
    pub fn validate(
        &self,
        from: AgentKind,
        to: AgentKind,
        current_depth: usize,
    ) -> Result<(), DelegationError> {
        if current_depth >= self.cap {
            return Err(DelegationError::DepthExceeded {
                depth: current_depth,
                cap: self.cap,
            });
        }
        if from == to {
            return Err(DelegationError::SelfDelegation);
        }
        if !allowed_targets(from).contains(&to) {
            return Err(DelegationError::EdgeNotAllowed { from, to });
        }
        Ok(())
    }
}

// ─── Request parsing ─────────────────────────────────────────────────────────

fn parse_kind(name: &str) -> Result<AgentKind, DelegationError> {
    match name {
        "planner" => Ok(AgentKind::Planner),
        "coder" => Ok(AgentKind::Coder),
        "researcher" => Ok(AgentKind::Researcher),
        "reviewer" => Ok(AgentKind::Reviewer),
        other => Err(DelegationError::UnknownKind(other.to_string())),
    }
}

/// Parse the arguments of the serial delegation tool.
pub fn parse_serial_request(args: &Value) -> Result<SubTaskRequest, DelegationError> {
    let agent = args
        .get("agent")
        .and_then(Value::as_str)
        .ok_or(DelegationError::MissingField("agent"))?;
    let task = args
        .get("task")
        .and_then(Value::as_str)
        .ok_or(DelegationError::MissingField("task"))?;
    Ok(SubTaskRequest {
        agent: parse_kind(agent)?,
        task: task.to_string(),
    })
}

/// Parse the arguments of the parallel fan-out tool.
pub fn parse_parallel_request(args: &Value) -> Result<Vec<SubTaskRequest>, DelegationError> {
    let subtasks = args
        .get("subtasks")
        .and_then(Value::as_array)
        .ok_or(DelegationError::MissingField("subtasks"))?;
    if subtasks.len() > MAX_PARALLEL_SUBTASKS {
        return Err(DelegationError::TooManySubtasks(subtasks.len()));
    }
    subtasks.iter().map(parse_serial_request).collect()
}

/// Concatenate sub-task reports (and per-request rejections) into the single
/// tool result returned to the parent.
pub fn aggregate_reports(
    reports: &[SubTaskReport],
    rejected: &[(SubTaskRequest, DelegationError)],
) -> String {
    let mut out = String::new();
    for r in reports {
        out.push_str(&format!(
            "[agent: {} | status: {}]\n{}\n\n",
            r.agent, r.status, r.result
        ));
    }
    for (req, err) in rejected {
        out.push_str(&format!(
            "[agent: {} | status: rejected]\n{err}\n\n",
            req.agent
        ));
    }
    out.trim_end().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
