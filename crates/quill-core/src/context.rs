// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-task runtime context.
//!
//! Separate from [`quill_config::RunnerConfig`], which holds only settings:
//! the context carries values created at spawn time — ids, the cancellation
//! token, delegation capabilities — and is shared read-mostly.  The
//! cancellation token is the only mutation that crosses threads.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use quill_config::AgentKind;

use crate::delegate::{SubTaskReport, SubTaskRequest};

/// Runs one validated sub-task to completion.  The embedder wires this to a
/// fresh Tool Runner for the target agent kind.
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn run_subtask(&self, request: SubTaskRequest, parent: AgentContext) -> SubTaskReport;
}

/// Shared scratch space where sub-task results are recorded by agent name.
pub trait Blackboard: Send + Sync {
    fn record(&self, agent: &str, result: &str);
}

/// Capability handles injected by the embedder.  Absent handles disable the
/// corresponding feature (delegation tools report failure, blackboard writes
/// are skipped).
#[derive(Clone, Default)]
pub struct Capabilities {
    pub delegate: Option<Arc<dyn Delegate>>,
    pub blackboard: Option<Arc<dyn Blackboard>>,
}

/// Everything a Tool Runner needs to know about the task it is driving.
#[derive(Clone)]
pub struct AgentContext {
    pub task_id: String,
    pub agent: AgentKind,
    /// Description of the parent task, for sub-agents.
    pub parent_task: Option<String>,
    /// Results of already-finished sibling sub-tasks, keyed by agent name.
    pub sibling_results: HashMap<String, String>,
    pub cancel: CancellationToken,
    pub workdir: PathBuf,
    /// Current delegation depth; the root task runs at 0.
    pub depth: usize,
    pub capabilities: Capabilities,
}

impl AgentContext {
    pub fn new(agent: AgentKind, workdir: PathBuf) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            agent,
            parent_task: None,
            sibling_results: HashMap::new(),
            cancel: CancellationToken::new(),
            workdir,
            depth: 0,
            capabilities: Capabilities::default(),
        }
    }

    /// Context for a sub-task spawned from this one.  The child gets its own
    /// task id and a child cancellation token (cancelling the parent cancels
    /// every descendant), one level deeper.
    pub fn child(&self, agent: AgentKind, parent_task: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            agent,
            parent_task: Some(parent_task.into()),
            sibling_results: HashMap::new(),
            cancel: self.cancel.child_token(),
            workdir: self.workdir.clone(),
            depth: self.depth + 1,
            capabilities: self.capabilities.clone(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
