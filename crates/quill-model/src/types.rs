// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

// ─── Content blocks ───────────────────────────────────────────────────────────

/// One typed block in a structured-protocol message.
///
/// Assistant messages carry `Text`, `Thinking`, and `ToolUse` blocks; user
/// messages carry `Text` and `ToolResult` blocks. Every `ToolUse` id is
/// answered by exactly one `ToolResult` in a later user message unless the
/// task terminates first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Opaque hidden-reasoning payload. Carried verbatim in the transcript
    /// and never routed through the summary pipeline — providers reject
    /// transcripts whose thinking blocks were altered.
    Thinking {
        payload: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            id: id.into(),
            content: content.into(),
            is_error,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Message content — a plain text blob on the legacy text protocol, or an
/// ordered block list on the structured protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A single message in the conversation transcript.
///
/// The system prompt is not a message; it travels in the
/// [`CompletionRequest`] so the transcript invariant "first message is the
/// task definition" holds on both protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    pub fn assistant_blocks(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// The plain text of this message when it is a single text blob.
    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            MessageContent::Text(t) => Some(t),
            MessageContent::Blocks(blocks) if blocks.len() == 1 => match &blocks[0] {
                ContentBlock::Text { text } => Some(text),
                _ => None,
            },
            _ => None,
        }
    }

    /// All text visible to a human reader, blocks flattened.
    /// Thinking payloads are excluded; tool blocks render as short markers.
    pub fn display_text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.clone()),
                    ContentBlock::Thinking { .. } => None,
                    ContentBlock::ToolUse { name, .. } => Some(format!("[tool_use: {name}]")),
                    ContentBlock::ToolResult { content, .. } => {
                        Some(format!("[tool_result: {content}]"))
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    /// Approximate token count used for context management.
    ///
    /// Uses the 4-chars-per-token heuristic with a minimum of 1.  Precision
    /// is secondary to monotonicity — the budgeter only needs estimates that
    /// grow with content.
    pub fn approx_tokens(&self) -> usize {
        let chars = match &self.content {
            MessageContent::Text(t) => t.len(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len(),
                    ContentBlock::Thinking { payload } => payload.len(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        name.len() + input.to_string().len()
                    }
                    ContentBlock::ToolResult { content, .. } => content.len(),
                })
                .sum(),
        };
        (chars / 4).max(1)
    }
}

// ─── Requests and responses ───────────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    /// Must be exactly 1.0 when the model interleaves hidden reasoning.
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model stopped naturally.
    EndTurn,
    /// The model stopped to call tools.
    ToolUse,
    /// The response hit the output-token ceiling.
    MaxTokens,
}

/// Provider-side prompt-cache accounting, when the provider reports it.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    pub read_tokens: u32,
    pub write_tokens: u32,
}

/// One structured completion.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub blocks: Vec<ContentBlock>,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub finish_reason: FinishReason,
    pub cache: Option<CacheMetrics>,
}

impl CompletionResponse {
    /// Convenience: a text-only end-of-turn response (mostly for mocks).
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![ContentBlock::text(text)],
            tokens_in: 0,
            tokens_out: 0,
            finish_reason: FinishReason::EndTurn,
            cache: None,
        }
    }

    /// Convenience: a single tool-use response (mostly for mocks).
    pub fn tool_use(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            blocks: vec![ContentBlock::tool_use(id, name, input)],
            tokens_in: 0,
            tokens_out: 0,
            finish_reason: FinishReason::ToolUse,
            cache: None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
