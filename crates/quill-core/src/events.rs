// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use tokio::sync::mpsc;

use quill_config::AgentKind;

use crate::delegate::TaskStatus;

/// Events emitted by the runner while driving a task.
/// Consumers (UI, logging) subscribe to these to render progress.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    /// The model produced visible reasoning or prose before acting.
    Thinking { text: String },
    /// A tool call is about to execute.
    Acting { tool_key: String, summary: String },
    /// A raw text chunk from the streaming protocol.
    StreamChunk { text: String },
    /// A tool call finished.
    ToolResult {
        tool_key: String,
        success: bool,
        content: String,
    },
    /// The task reached a terminal state.
    Completed { status: TaskStatus, message: String },
    /// A non-fatal error the task recovered from (or died on).
    Error { message: String },
}

/// A tagged event as delivered to consumers.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub task_id: String,
    pub agent: AgentKind,
    pub event: RunnerEvent,
}

/// Sender half that stamps every event with the task id and agent kind.
/// Dropped receivers are fine; emission is best-effort.
#[derive(Clone)]
pub struct EventSink {
    task_id: String,
    agent: AgentKind,
    tx: Option<mpsc::Sender<TaggedEvent>>,
}

impl EventSink {
    pub fn new(task_id: String, agent: AgentKind, tx: mpsc::Sender<TaggedEvent>) -> Self {
        Self {
            task_id,
            agent,
            tx: Some(tx),
        }
    }

    /// A sink that drops everything; for embeddings without a UI.
    pub fn disabled(task_id: String, agent: AgentKind) -> Self {
        Self {
            task_id,
            agent,
            tx: None,
        }
    }

    pub async fn emit(&self, event: RunnerEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx
                .send(TaggedEvent {
                    task_id: self.task_id.clone(),
                    agent: self.agent,
                    event,
                })
                .await;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
