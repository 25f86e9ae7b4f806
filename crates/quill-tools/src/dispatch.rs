// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

/// What the dispatcher observed while running a tool.
///
/// Failure is in-band: `success = false` with a message the model can read.
/// The runner never interprets `content` beyond truncation and caching.
#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub success: bool,
    pub content: String,
}

impl DispatchResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
        }
    }

    pub fn fail(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
        }
    }
}

/// The external collaborator that owns tool I/O (files, shell, HTTP, MCP
/// sub-processes).  Must be thread-safe; the runner may call it from the
/// parallel-read fast path with several calls in flight.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, tool_key: &str, args: &Value) -> DispatchResult;
}
