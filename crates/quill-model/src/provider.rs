// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

use crate::{CompletionRequest, CompletionResponse};

/// Chunk stream for the legacy text-XML protocol.
pub type TextStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// The model under a task, consumed as a black box.
///
/// Two shapes, per protocol:
/// - structured: [`complete`](ModelProvider::complete) returns typed content
///   blocks and usage counters in one response;
/// - text streaming: [`stream`](ModelProvider::stream) yields raw text chunks
///   that the runner feeds through the streaming XML parser.
///
/// A provider implements whichever shapes it supports; the defaults report
/// the missing protocol as an error rather than panicking, so the runner can
/// surface a configuration mistake as a task failure.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for logs and events.
    fn name(&self) -> &str;

    /// Context window of the underlying model, in tokens.
    fn context_window(&self) -> usize;

    /// True when the model interleaves hidden reasoning blocks.
    ///
    /// Thinking models need a larger response reserve, a temperature pinned
    /// to exactly 1.0, and verbatim transcript round-tripping of thinking
    /// payloads.
    fn emits_thinking(&self) -> bool {
        false
    }

    /// True when tool definitions are passed as first-class request
    /// parameters and replies carry `tool_use` blocks. When false, the
    /// runner appends the catalog to the system prompt and parses the
    /// streamed reply for XML tool blocks.
    fn supports_native_tools(&self) -> bool {
        true
    }

    /// One structured completion.
    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        let _ = req;
        anyhow::bail!(
            "provider '{}' does not implement the structured protocol",
            self.name()
        )
    }

    /// One streamed text completion.
    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<TextStream> {
        let _ = req;
        anyhow::bail!(
            "provider '{}' does not implement text streaming",
            self.name()
        )
    }
}
