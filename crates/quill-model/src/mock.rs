// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::TextStream, CompletionRequest, CompletionResponse, ModelProvider,
};

/// A pre-scripted structured-protocol provider.  Each call to `complete`
/// pops the next response from the front of the queue, so tests can specify
/// exact block sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<CompletionResponse>>>,
    context_window: usize,
    thinking: bool,
    /// The last `CompletionRequest` seen by this provider.
    /// Written on each `complete()` call so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<CompletionResponse>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            context_window: 128_000,
            thinking: false,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Shrink the claimed context window so budget paths fire in tests.
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    /// Declare this mock a thinking model (larger reserve, temperature 1.0).
    pub fn with_thinking(mut self) -> Self {
        self.thinking = true;
        self
    }

    /// Number of scripted responses not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn emits_thinking(&self) -> bool {
        self.thinking
    }

    async fn complete(&self, req: CompletionRequest) -> anyhow::Result<CompletionResponse> {
        *self.last_request.lock().unwrap() = Some(req);
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Default fallback when all scripts are consumed.
            return Ok(CompletionResponse::text("[no more scripts]"));
        }
        Ok(scripts.remove(0))
    }
}

/// A pre-scripted text-streaming provider for the legacy XML protocol.
///
/// Each call to `stream` pops the next reply and yields it in fixed-size
/// character chunks, so tests can exercise the parser's chunk-boundary
/// handling (down to one character per chunk).
pub struct ScriptedStreamProvider {
    scripts: Arc<Mutex<Vec<String>>>,
    chunk_chars: usize,
    context_window: usize,
    pub last_request: Arc<Mutex<Option<CompletionRequest>>>,
}

impl ScriptedStreamProvider {
    pub fn new(scripts: Vec<String>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            chunk_chars: 64,
            context_window: 128_000,
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Set how many characters each streamed chunk carries.
    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars.max(1);
        self
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }
}

#[async_trait]
impl ModelProvider for ScriptedStreamProvider {
    fn name(&self) -> &str {
        "scripted-stream-mock"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn supports_native_tools(&self) -> bool {
        false
    }

    async fn stream(&self, req: CompletionRequest) -> anyhow::Result<TextStream> {
        *self.last_request.lock().unwrap() = Some(req);
        let reply = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                String::new()
            } else {
                scripts.remove(0)
            }
        };
        let chunk_chars = self.chunk_chars;
        let chars: Vec<char> = reply.chars().collect();
        let chunks: Vec<anyhow::Result<String>> = chars
            .chunks(chunk_chars)
            .map(|c| Ok(c.iter().collect::<String>()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
