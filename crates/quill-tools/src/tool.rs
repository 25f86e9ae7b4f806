// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier from the model (forwarded verbatim).
    pub id: String,
    /// Resolved hierarchical tool key, e.g. `local::file_read`.
    pub key: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// The observed outcome of executing a tool.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    pub content: String,
    /// True when the tool failed non-fatally (the message is for the model).
    pub is_error: bool,
}

impl ToolOutput {
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            content: msg.into(),
            is_error: true,
        }
    }
}

/// Side-effect classification used by the approval gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCategory {
    /// Read-only; eligible for the parallel-read fast path.
    #[default]
    Safe,
    /// Mutates files or other local state.
    Write,
    /// Runs external processes.
    Execute,
    /// Irreversible or high-blast-radius; always prompts unless autonomous.
    Dangerous,
}

/// One entry in the tool catalog.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Hierarchical key: `local::file_read`, `server-id::tool-name`, …
    pub key: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub input_schema: Value,
    pub category: ToolCategory,
}

impl ToolSpec {
    pub fn new(
        key: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        category: ToolCategory,
    ) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            input_schema,
            category,
        }
    }

    /// True for tools the runner may dispatch concurrently.
    pub fn is_read_only(&self) -> bool {
        self.category == ToolCategory::Safe
    }

    /// True for tools exposed by an MCP server (any non-reserved namespace).
    pub fn is_mcp(&self) -> bool {
        !self.key.starts_with("local::") && !self.key.starts_with("agent::")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
