// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use futures::{future::join_all, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

use quill_config::RunnerConfig;
use quill_model::{
    CompletionRequest, CompletionResponse, ContentBlock, FinishReason, Message, ModelProvider,
    ToolSchema,
};
use quill_tools::{
    agent_allows, matcher_for_root, relative_to_root, sanitize_key, ApprovalGate, Resolution,
    ToolCatalog, ToolDispatcher, ToolSpec, COMPLETION_TOOL, IGNORE_FILE_NAME,
};

use crate::budget::{TokenBudget, AGGRESSIVE_RATIO, HEURISTIC_RATIO};
use crate::compact::{condensation_request, progressive_compact};
use crate::context::AgentContext;
use crate::conversation::Conversation;
use crate::delegate::{
    aggregate_reports, parse_parallel_request, parse_serial_request, DelegationController,
    SubTaskReport, SubTaskRequest, TaskStatus, DELEGATE_PARALLEL_TOOL, DELEGATE_TOOL,
};
use crate::detector::{MisbehaviorCounter, RepetitionDetector, RepetitionVerdict};
use crate::events::{EventSink, RunnerEvent};
use crate::files::{FileRegistry, FileTracker, ToolCallRecord};
use crate::stream_parser::{ParsedToolUse, StreamingXmlParser};

/// Response-token request ceilings per model family.
const PLAIN_MAX_TOKENS: u32 = 8_192;
const THINKING_MAX_TOKENS: u32 = 32_768;

/// Keys whose results feed the file registry and tracker.
const FILE_READ_TOOL: &str = "local::file_read";
const FILE_WRITE_TOOL: &str = "local::file_write";
const FILE_EDIT_TOOLS: &[&str] = &["local::file_edit", "local::apply_patch"];

/// Terminal report of one Tool Runner invocation.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub message: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub steps: u32,
}

enum StepResult {
    Continue,
    Done(TaskOutcome),
}

/// One requested tool call, before name resolution.
#[derive(Debug, Clone)]
struct PendingCall {
    id: String,
    api_name: String,
    args: Value,
}

/// Drives one task through the think → call tool → observe loop.
///
/// Owns the conversation, file caches, and detectors for exactly one task;
/// everything external (model, dispatcher, approval UI, delegation) is
/// reached through the injected handles.  Recoverable conditions never
/// escape the loop — they become messages the model can read and react to.
pub struct ToolRunner {
    provider: Arc<dyn ModelProvider>,
    /// Separate model handle for condensation summaries.
    summarizer: Arc<dyn ModelProvider>,
    dispatcher: Arc<dyn ToolDispatcher>,
    catalog: Arc<RwLock<ToolCatalog>>,
    gate: ApprovalGate,
    config: RunnerConfig,
    ctx: AgentContext,
    events: EventSink,
    conversation: Conversation,
    detector: RepetitionDetector,
    misbehavior: MisbehaviorCounter,
    registry: FileRegistry,
    tracker: FileTracker,
    records: Vec<ToolCallRecord>,
    delegation: DelegationController,
    step: u32,
    compaction_level: u8,
    any_success: bool,
    tokens_in: u64,
    tokens_out: u64,
}

impl ToolRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        summarizer: Arc<dyn ModelProvider>,
        dispatcher: Arc<dyn ToolDispatcher>,
        catalog: Arc<RwLock<ToolCatalog>>,
        gate: ApprovalGate,
        config: RunnerConfig,
        ctx: AgentContext,
        events: EventSink,
    ) -> Self {
        let config = config.validated();
        let budget = TokenBudget::new(provider.context_window(), provider.emits_thinking());
        let conversation = Conversation::new(budget, config.tool_result_cap_bytes);
        let delegation = DelegationController::new(config.max_delegation_depth);
        Self {
            provider,
            summarizer,
            dispatcher,
            catalog,
            gate,
            config,
            ctx,
            events,
            conversation,
            detector: RepetitionDetector::new(),
            misbehavior: MisbehaviorCounter::new(),
            registry: FileRegistry::new(),
            tracker: FileTracker::new(),
            records: Vec::new(),
            delegation,
            step: 0,
            compaction_level: 0,
            any_success: false,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    /// Transcript accessor for embedders that persist sessions.
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Run `task` to a terminal outcome.
    pub async fn run(&mut self, task: &str) -> TaskOutcome {
        self.conversation.append(Message::user(task));
        let started = Instant::now();
        let deadline = Duration::from_millis(self.config.task_timeout_ms);

        loop {
            self.step += 1;
            if self.step > self.config.max_steps {
                return self
                    .finish(
                        self.valve_status(),
                        format!("step cap of {} reached", self.config.max_steps),
                    )
                    .await;
            }

            // Pre-flight: cancellation and wall clock.
            if self.ctx.cancel.is_cancelled() {
                return self.finish(self.valve_status(), "task cancelled".into()).await;
            }
            if started.elapsed() >= deadline {
                return self
                    .finish(
                        self.valve_status(),
                        format!("task timed out after {:?}", deadline),
                    )
                    .await;
            }

            // Budget maintenance before the model call.
            self.maintain_budget().await;

            let result = if self.provider.supports_native_tools() {
                self.structured_step().await
            } else {
                self.text_step().await
            };

            if self.step % 5 == 0 {
                debug!(
                    step = self.step,
                    tokens = self.conversation.total_tokens(),
                    fraction = self.conversation.budget().fraction(self.conversation.total_tokens()),
                    condensations = self.conversation.condensations(),
                    "context usage"
                );
            }

            match result {
                StepResult::Continue => continue,
                StepResult::Done(outcome) => return outcome,
            }
        }
    }

    /// Status for timeout / cancellation / safety-valve exits.
    fn valve_status(&self) -> TaskStatus {
        if self.any_success {
            TaskStatus::Partial
        } else {
            TaskStatus::Failed
        }
    }

    async fn finish(&mut self, status: TaskStatus, message: String) -> TaskOutcome {
        self.events
            .emit(RunnerEvent::Completed {
                status,
                message: message.clone(),
            })
            .await;
        TaskOutcome {
            status,
            message,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            steps: self.step,
        }
    }

    async fn complete_task(&mut self, completion_text: String) -> StepResult {
        let status = if self.any_success {
            TaskStatus::Success
        } else {
            TaskStatus::Partial
        };
        StepResult::Done(self.finish(status, completion_text).await)
    }

    // ─── Budget maintenance ──────────────────────────────────────────────────

    /// Condense via the summarizer at the proactive ratio, then escalate
    /// progressive compaction while still past the aggressive ratio.
    async fn maintain_budget(&mut self) {
        if self
            .conversation
            .near_budget(self.config.proactive_compaction_threshold)
        {
            self.condense_via_summarizer().await;
        }
        if self.conversation.near_budget(AGGRESSIVE_RATIO) && self.compaction_level < 3 {
            self.compaction_level += 1;
            // Past the heuristic ratio there is no room for gradual
            // escalation; go straight to the most aggressive level.
            if self.conversation.near_budget(HEURISTIC_RATIO) {
                self.compaction_level = 3;
            }
            debug!(level = self.compaction_level, "progressive compaction");
            progressive_compact(self.compaction_level, &mut self.records, &mut self.registry);
        }
    }

    async fn condense_via_summarizer(&mut self) {
        let range = self.conversation.condensable_range();
        if range.is_empty() {
            return;
        }
        let request_text = condensation_request(range);
        let req = CompletionRequest {
            system: String::new(),
            messages: vec![Message::user(request_text)],
            tools: vec![],
            temperature: 0.0,
            max_tokens: PLAIN_MAX_TOKENS,
        };
        match self.summarizer.complete(req).await {
            Ok(resp) => {
                self.tokens_in += resp.tokens_in as u64;
                self.tokens_out += resp.tokens_out as u64;
                let summary = text_of(&resp.blocks);
                if summary.trim().is_empty() {
                    warn!("condensation returned an empty summary; keeping transcript");
                    return;
                }
                let folded = self.registry.signatures();
                self.conversation.condense(&summary, folded.as_deref());
            }
            Err(e) => {
                // Budget exhaustion is survivable: continue at risk and let a
                // model-side context error surface as task failure.
                warn!(error = %e, "condensation model call failed; continuing at risk");
            }
        }
    }

    // ─── Structured protocol ─────────────────────────────────────────────────

    async fn structured_step(&mut self) -> StepResult {
        let req = CompletionRequest {
            system: self.system_prompt(),
            messages: self.conversation.snapshot(),
            tools: self.tool_schemas(),
            temperature: if self.provider.emits_thinking() { 1.0 } else { 0.0 },
            max_tokens: self.max_response_tokens(),
        };

        let cancel = self.ctx.cancel.clone();
        let provider = Arc::clone(&self.provider);
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return StepResult::Done(
                    self.finish(self.valve_status(), "task cancelled".into()).await,
                );
            }
            r = provider.complete(req) => r,
        };

        let response = match response.context("model completion failed") {
            Ok(r) => r,
            Err(e) => {
                self.events
                    .emit(RunnerEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return StepResult::Done(self.finish(TaskStatus::Failed, e.to_string()).await);
            }
        };
        self.tokens_in += response.tokens_in as u64;
        self.tokens_out += response.tokens_out as u64;

        self.handle_structured_reply(response).await
    }

    async fn handle_structured_reply(&mut self, response: CompletionResponse) -> StepResult {
        let visible = text_of(&response.blocks);
        if !visible.is_empty() {
            self.events
                .emit(RunnerEvent::Thinking {
                    text: visible.clone(),
                })
                .await;
        }

        // The whole reply — thinking blocks included — is carried verbatim.
        self.conversation
            .append(Message::assistant_blocks(response.blocks.clone()));

        let mut calls: Vec<PendingCall> = Vec::new();
        for block in &response.blocks {
            if let ContentBlock::ToolUse { id, name, input } = block {
                calls.push(PendingCall {
                    id: id.clone(),
                    api_name: name.clone(),
                    args: coerce_args(input.clone()),
                });
            }
        }

        // Completion signal wins over everything else in the reply.
        if let Some(call) = self.find_completion(&calls) {
            let text = call
                .args
                .get("result")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| visible.trim().to_string());
            return self.complete_task(text).await;
        }

        if calls.is_empty() {
            if response.finish_reason == FinishReason::EndTurn && !visible.trim().is_empty() {
                // Natural stop with a text answer is a completion.
                return self.complete_task(visible.trim().to_string()).await;
            }
            return self.nudge_toward_tools().await;
        }

        self.process_tool_calls(calls).await
    }

    fn find_completion<'a>(&self, calls: &'a [PendingCall]) -> Option<&'a PendingCall> {
        let catalog = self.catalog.read().unwrap();
        calls.iter().find(|c| {
            matches!(
                catalog.resolve(&c.api_name),
                Resolution::Known(ref key) if key == COMPLETION_TOOL
            )
        })
    }

    async fn nudge_toward_tools(&mut self) -> StepResult {
        if self.misbehavior.bump() {
            return StepResult::Done(
                self.finish(
                    TaskStatus::Failed,
                    "model repeatedly replied without usable tool calls".into(),
                )
                .await,
            );
        }
        self.conversation.append(Message::user(
            "You did not call any tool. Use one of the available tools to make \
             progress, or declare the task finished with the completion tool.",
        ));
        StepResult::Continue
    }

    // ─── Text-XML protocol ───────────────────────────────────────────────────

    async fn text_step(&mut self) -> StepResult {
        let req = CompletionRequest {
            system: format!("{}\n\n{}", self.system_prompt(), self.catalog_prompt()),
            messages: self.conversation.snapshot(),
            tools: vec![],
            temperature: 0.0,
            max_tokens: self.max_response_tokens(),
        };

        let cancel = self.ctx.cancel.clone();
        let provider = Arc::clone(&self.provider);
        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return StepResult::Done(
                    self.finish(self.valve_status(), "task cancelled".into()).await,
                );
            }
            s = provider.stream(req) => s,
        };
        let mut stream = match stream.context("model stream failed") {
            Ok(s) => s,
            Err(e) => {
                self.events
                    .emit(RunnerEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return StepResult::Done(self.finish(TaskStatus::Failed, e.to_string()).await);
            }
        };

        let mut parser = StreamingXmlParser::new(self.parser_names());
        let mut raw_reply = String::new();
        let mut display = String::new();
        let mut tools: Vec<ParsedToolUse> = Vec::new();
        let mut completion: Option<String> = None;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return StepResult::Done(
                        self.finish(self.valve_status(), "task cancelled".into()).await,
                    );
                }
                c = stream.next() => c,
            };
            let chunk = match chunk {
                None => break,
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    // A broken stream with text already accumulated is a
                    // partial reply; without any text it is fatal.
                    if raw_reply.is_empty() {
                        return StepResult::Done(
                            self.finish(TaskStatus::Failed, e.to_string()).await,
                        );
                    }
                    warn!(error = %e, "model stream broke mid-reply; using partial text");
                    break;
                }
            };
            raw_reply.push_str(&chunk);
            let out = parser.push_chunk(&chunk);
            if !out.display_text.is_empty() {
                display.push_str(&out.display_text);
                self.events
                    .emit(RunnerEvent::StreamChunk {
                        text: out.display_text,
                    })
                    .await;
            }
            tools.extend(out.completed_tools);
            if completion.is_none() {
                completion = out.completion_result;
            }
        }
        let tail = parser.finalize();
        display.push_str(&tail.display_text);
        tools.extend(tail.completed_tools);
        if completion.is_none() {
            completion = tail.completion_result;
        }

        // The raw reply (tool markup included) is the assistant turn.
        if !raw_reply.is_empty() {
            self.conversation.append(Message::assistant(raw_reply));
        }

        if let Some(result) = completion {
            return self.complete_task(result).await;
        }

        if tools.is_empty() {
            // Lenient tolerance: a JSON-shaped tool call written into prose
            // is executed anyway, with a nudge to use the XML format.
            if let Some((name, args)) = extract_json_tool_call(&display) {
                self.conversation.append(Message::user(
                    "Tool calls must use the XML block format, not inline JSON. \
                     The call was executed this time; use XML blocks from now on.",
                ));
                let calls = vec![PendingCall {
                    id: format!("json-{}", self.step),
                    api_name: self.lower_tag(name),
                    args,
                }];
                return self.process_tool_calls(calls).await;
            }
            if !display.trim().is_empty() {
                // Natural stop with a plain answer.
                return self.complete_task(display.trim().to_string()).await;
            }
            return self.nudge_toward_tools().await;
        }

        let calls: Vec<PendingCall> = tools
            .into_iter()
            .enumerate()
            .map(|(i, t)| PendingCall {
                id: format!("xml-{}-{}", self.step, i),
                api_name: self.lower_tag(t.name),
                args: params_to_args(t.params),
            })
            .collect();
        self.process_tool_calls(calls).await
    }

    /// Lower a streamed tag name to its canonical key; a tag the catalog
    /// cannot lower is passed through untouched and takes the normal
    /// hallucination path in name resolution.
    fn lower_tag(&self, tag: String) -> String {
        self.catalog
            .read()
            .unwrap()
            .canonical_for_tag(&tag)
            .unwrap_or(tag)
    }

    // ─── Shared tool-call pipeline ───────────────────────────────────────────

    async fn process_tool_calls(&mut self, calls: Vec<PendingCall>) -> StepResult {
        let catalog = self.catalog.read().unwrap().clone();
        let mut results: Vec<ContentBlock> = Vec::new();
        let mut warning: Option<String> = None;

        // Resolve names first; hallucinations produce corrective results
        // without touching the dispatcher.
        let mut resolved: Vec<(PendingCall, ToolSpec)> = Vec::new();
        for call in calls {
            match catalog.resolve(&call.api_name) {
                Resolution::Known(key) => {
                    // The tool spec is cloned out of the snapshot; the
                    // shared catalog may grow while tools run.
                    let spec = catalog.get(&key).cloned().expect("resolved key registered");
                    resolved.push((PendingCall { api_name: key, ..call }, spec));
                }
                Resolution::Hallucinated { suggestions } => {
                    let hint = if suggestions.is_empty() {
                        String::new()
                    } else {
                        format!(" Closest available tools: {}.", suggestions.join(", "))
                    };
                    results.push(ContentBlock::tool_result(
                        call.id.clone(),
                        format!(
                            "Unknown tool '{}'.{hint} Use one of the registered tools.",
                            call.api_name
                        ),
                        true,
                    ));
                    if self.misbehavior.bump() {
                        self.conversation.append_tool_results(results);
                        return StepResult::Done(
                            self.finish(
                                TaskStatus::Failed,
                                "model kept calling unknown tools".into(),
                            )
                            .await,
                        );
                    }
                }
            }
        }

        // Repetition accounting happens before any gate so that denied calls
        // repeated forever still trip the loop valve.
        for (call, spec) in &resolved {
            match self
                .detector
                .record(&call.api_name, &call.args, spec.is_read_only())
            {
                RepetitionVerdict::Ok => {}
                RepetitionVerdict::Warn { reason } => {
                    warning = Some(reason);
                }
                RepetitionVerdict::Loop { reason } => {
                    self.conversation.append_tool_results(results);
                    return StepResult::Done(
                        self.finish(TaskStatus::Failed, format!("loop detected: {reason}")).await,
                    );
                }
            }
        }

        // Parallel read fast path: only when every call is read-only.
        let all_read_only =
            resolved.len() > 1 && resolved.iter().all(|(c, s)| s.is_read_only() && !is_delegation(&c.api_name));
        if all_read_only {
            results.extend(self.run_parallel_reads(&resolved).await);
        } else {
            for (call, spec) in &resolved {
                if self.ctx.cancel.is_cancelled() {
                    self.conversation.append_tool_results(results);
                    return StepResult::Done(
                        self.finish(self.valve_status(), "task cancelled".into()).await,
                    );
                }
                let block = self.run_one_call(call, spec).await;
                results.push(block);
            }
        }

        self.conversation.append_tool_results(results);
        if let Some(reason) = warning {
            self.conversation.append(Message::user(format!(
                "[loop warning] {reason}. Change approach instead of repeating the same call."
            )));
        }
        StepResult::Continue
    }

    /// Gate and dispatch a single call, producing its tool-result block.
    async fn run_one_call(&mut self, call: &PendingCall, spec: &ToolSpec) -> ContentBlock {
        if let Some(denial) = self.gate_call(call, spec).await {
            return denial;
        }

        if is_delegation(&call.api_name) {
            return self.run_delegation(call).await;
        }

        self.events
            .emit(RunnerEvent::Acting {
                tool_key: call.api_name.clone(),
                summary: args_summary(&call.args),
            })
            .await;

        // Read-through cache: a repeated read of an unchanged file skips the
        // dispatcher entirely.
        if call.api_name == FILE_READ_TOOL {
            if let Some(path) = call.args.get("path").and_then(Value::as_str) {
                if let Some(entry) = self.registry.get(path) {
                    let content = entry.content.clone();
                    debug!(path, "file read served from registry cache");
                    self.tracker.record_read(path, self.step, now_ts());
                    return self.record_result(call, true, content).await;
                }
            }
        }

        let dispatched = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => {
                return ContentBlock::tool_result(
                    call.id.clone(),
                    "tool call aborted: task cancelled",
                    true,
                );
            }
            r = self.dispatcher.dispatch(&call.api_name, &call.args) => r,
        };

        self.update_file_state(call, dispatched.success, &dispatched.content);
        self.record_result(call, dispatched.success, dispatched.content)
            .await
    }

    /// Permission → ignore → approval, in that order.  `None` means the call
    /// may run.
    async fn gate_call(&mut self, call: &PendingCall, spec: &ToolSpec) -> Option<ContentBlock> {
        if let Err(reason) = agent_allows(self.ctx.agent, spec) {
            return Some(
                self.record_result(call, false, format!("PERMISSION DENIED: {reason}"))
                    .await,
            );
        }

        if let Some(path) = call.args.get("path").and_then(Value::as_str) {
            if let Some(rel) = relative_to_root(&self.ctx.workdir, path) {
                let matcher = matcher_for_root(&self.ctx.workdir);
                if matcher.is_ignored(&rel) {
                    return Some(
                        self.record_result(
                            call,
                            false,
                            format!(
                                "ACCESS BLOCKED: '{rel}' is excluded by {IGNORE_FILE_NAME}"
                            ),
                        )
                        .await,
                    );
                }
            }
        }

        if self.gate.needs_approval(spec) {
            let response = self
                .gate
                .request(&call.api_name, args_summary(&call.args))
                .await;
            if !response.approved {
                let mut msg = response
                    .reason
                    .unwrap_or_else(|| "the user rejected this call".to_string());
                if let Some(feedback) = response.feedback {
                    msg.push_str(&format!(" ({feedback})"));
                }
                return Some(self.record_result(call, false, msg).await);
            }
        }
        None
    }

    /// Dispatch a batch of read-only calls concurrently, packing results in
    /// emission order.  Gates still apply per call.
    async fn run_parallel_reads(
        &mut self,
        resolved: &[(PendingCall, ToolSpec)],
    ) -> Vec<ContentBlock> {
        let mut blocks: Vec<Option<ContentBlock>> = vec![None; resolved.len()];
        let mut to_dispatch: Vec<(usize, PendingCall)> = Vec::new();

        for (i, (call, spec)) in resolved.iter().enumerate() {
            if let Some(denial) = self.gate_call(call, spec).await {
                blocks[i] = Some(denial);
            } else if call.api_name == FILE_READ_TOOL
                && call
                    .args
                    .get("path")
                    .and_then(Value::as_str)
                    .and_then(|p| self.registry.get(p))
                    .is_some()
            {
                let path = call.args.get("path").and_then(Value::as_str).unwrap();
                let content = self.registry.get(path).unwrap().content.clone();
                self.tracker.record_read(path, self.step, now_ts());
                blocks[i] = Some(self.record_result(call, true, content).await);
            } else {
                self.events
                    .emit(RunnerEvent::Acting {
                        tool_key: call.api_name.clone(),
                        summary: args_summary(&call.args),
                    })
                    .await;
                to_dispatch.push((i, call.clone()));
            }
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let futures: Vec<_> = to_dispatch
            .iter()
            .map(|(_, call)| {
                let dispatcher = Arc::clone(&dispatcher);
                let key = call.api_name.clone();
                let args = call.args.clone();
                async move { dispatcher.dispatch(&key, &args).await }
            })
            .collect();
        let outputs = join_all(futures).await;

        for ((i, call), output) in to_dispatch.into_iter().zip(outputs) {
            self.update_file_state(&call, output.success, &output.content);
            blocks[i] = Some(self.record_result(&call, output.success, output.content).await);
        }

        blocks.into_iter().flatten().collect()
    }

    /// Track bookkeeping shared by every produced result.
    async fn record_result(
        &mut self,
        call: &PendingCall,
        success: bool,
        content: String,
    ) -> ContentBlock {
        self.records.push(ToolCallRecord {
            tool_key: call.api_name.clone(),
            success,
            content: content.clone(),
        });
        if success {
            self.any_success = true;
        }
        self.events
            .emit(RunnerEvent::ToolResult {
                tool_key: call.api_name.clone(),
                success,
                content: content.clone(),
            })
            .await;
        ContentBlock::tool_result(call.id.clone(), content, !success)
    }

    fn update_file_state(&mut self, call: &PendingCall, success: bool, content: &str) {
        if !success {
            return;
        }
        let Some(path) = call.args.get("path").and_then(Value::as_str) else {
            return;
        };
        if call.api_name == FILE_READ_TOOL {
            self.registry.insert(path, content.to_string(), self.step);
            self.tracker.record_read(path, self.step, now_ts());
        } else if call.api_name == FILE_WRITE_TOOL {
            // The write payload is the post-write content.
            if let Some(written) = call.args.get("content").and_then(Value::as_str) {
                self.registry.insert(path, written.to_string(), self.step);
            }
            self.tracker.record_edit(path, self.step, now_ts());
        } else if FILE_EDIT_TOOLS.contains(&call.api_name.as_str()) {
            // The cached copy is stale after an in-place edit.
            self.registry.remove(path);
            self.tracker.record_edit(path, self.step, now_ts());
        }
    }

    // ─── Delegation ──────────────────────────────────────────────────────────

    async fn run_delegation(&mut self, call: &PendingCall) -> ContentBlock {
        let Some(delegate) = self.ctx.capabilities.delegate.clone() else {
            return self
                .record_result(call, false, "delegation is not available in this session".into())
                .await;
        };

        let requests = if call.api_name == DELEGATE_TOOL {
            parse_serial_request(&call.args).map(|r| vec![r])
        } else {
            parse_parallel_request(&call.args)
        };
        let requests = match requests {
            Ok(r) => r,
            Err(e) => return self.record_result(call, false, e.to_string()).await,
        };

        let mut accepted: Vec<SubTaskRequest> = Vec::new();
        let mut rejected: Vec<(SubTaskRequest, crate::delegate::DelegationError)> = Vec::new();
        for req in requests {
            match self
                .delegation
                .validate(self.ctx.agent, req.agent, self.ctx.depth)
            {
                Ok(()) => accepted.push(req),
                Err(e) => rejected.push((req, e)),
            }
        }

        if accepted.is_empty() {
            let text = aggregate_reports(&[], &rejected);
            return self.record_result(call, false, text).await;
        }

        let cancel = self.ctx.cancel.clone();
        let reports: Vec<SubTaskReport> = if call.api_name == DELEGATE_TOOL {
            let req = accepted.remove(0);
            let child = self.ctx.child(req.agent, req.task.clone());
            let sub = delegate.run_subtask(req, child);
            vec![tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self
                        .record_result(call, false, "delegation aborted: task cancelled".into())
                        .await;
                }
                r = sub => r,
            }]
        } else {
            // Parallel fan-out: each sub-agent sees only its own sub-task
            // description, never the parent transcript.
            let futures: Vec<_> = accepted
                .into_iter()
                .map(|req| {
                    let child = self.ctx.child(req.agent, req.task.clone());
                    let delegate = Arc::clone(&delegate);
                    async move { delegate.run_subtask(req, child).await }
                })
                .collect();
            let fanout = join_all(futures);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self
                        .record_result(call, false, "delegation aborted: task cancelled".into())
                        .await;
                }
                r = fanout => r,
            }
        };

        for report in &reports {
            self.tokens_in += report.tokens_in;
            self.tokens_out += report.tokens_out;
            if let Some(blackboard) = &self.ctx.capabilities.blackboard {
                blackboard.record(&report.agent.to_string(), &report.result);
            }
        }

        let any_ok = reports.iter().any(|r| r.status != TaskStatus::Failed);
        let text = aggregate_reports(&reports, &rejected);
        self.record_result(call, any_ok, text).await
    }

    // ─── Prompt assembly ─────────────────────────────────────────────────────

    fn system_prompt(&self) -> String {
        let mut prompt = format!(
            "You are a {} agent working in {}.",
            self.ctx.agent,
            self.ctx.workdir.display()
        );
        if let Some(parent) = &self.ctx.parent_task {
            prompt.push_str(&format!("\n\nParent task: {parent}"));
        }
        if !self.ctx.sibling_results.is_empty() {
            prompt.push_str("\n\nResults from sibling sub-tasks:");
            let mut keys: Vec<&String> = self.ctx.sibling_results.keys().collect();
            keys.sort();
            for k in keys {
                prompt.push_str(&format!("\n- {k}: {}", self.ctx.sibling_results[k]));
            }
        }
        prompt
    }

    fn tool_schemas(&self) -> Vec<ToolSchema> {
        self.catalog
            .read()
            .unwrap()
            .specs()
            .map(|s| ToolSchema {
                name: sanitize_key(&s.key),
                description: s.description.clone(),
                parameters: s.input_schema.clone(),
            })
            .collect()
    }

    /// Tool catalog rendered into the system prompt for text-XML models.
    fn catalog_prompt(&self) -> String {
        let catalog = self.catalog.read().unwrap();
        let mut out = String::from(
            "# Tools\n\nCall a tool with an XML block:\n\
             <tool_name>\n<param>value</param>\n</tool_name>\n\n\
             Declare the task finished with:\n\
             <attempt_completion>\n<result>your final answer</result>\n</attempt_completion>\n",
        );
        for spec in catalog.specs() {
            let base = spec.key.rsplit("::").next().unwrap_or(&spec.key);
            out.push_str(&format!("\n## {base}\n{}\n", spec.description));
        }
        out
    }

    /// Names the streaming parser recognises: full keys plus base names.
    fn parser_names(&self) -> Vec<String> {
        let catalog = self.catalog.read().unwrap();
        let mut names = Vec::new();
        for spec in catalog.specs() {
            names.push(spec.key.clone());
            if let Some(base) = spec.key.rsplit("::").next() {
                names.push(base.to_string());
            }
        }
        names
    }

    fn max_response_tokens(&self) -> u32 {
        if self.provider.emits_thinking() {
            THINKING_MAX_TOKENS
        } else {
            PLAIN_MAX_TOKENS
        }
    }
}

// ─── Free helpers ─────────────────────────────────────────────────────────────

fn is_delegation(key: &str) -> bool {
    key == DELEGATE_TOOL || key == DELEGATE_PARALLEL_TOOL
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Visible text of a structured reply (thinking payloads excluded).
fn text_of(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Compact argument rendering for events and approval prompts.
fn args_summary(args: &Value) -> String {
    let mut s = args.to_string();
    if s.len() > 160 {
        let mut cut = 157;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}

/// Convert parsed XML params into a JSON argument object.
fn params_to_args(params: std::collections::BTreeMap<String, String>) -> Value {
    let map: serde_json::Map<String, Value> = params
        .into_iter()
        .map(|(k, v)| (k, Value::String(v)))
        .collect();
    Value::Object(map)
}

/// Tool-use inputs normally arrive as objects.  Some models wrap the object
/// in a JSON string, occasionally with broken escapes; unwrap and repair
/// before treating the call as misbehaviour.
fn coerce_args(input: Value) -> Value {
    match input {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(v @ Value::Object(_)) => v,
            _ => match repair_json(&s) {
                Some(v) => v,
                None => Value::String(s),
            },
        },
        other => other,
    }
}

/// Repair common defects in model-emitted JSON argument strings by
/// re-parsing and patching at the position serde reports: an invalid escape
/// gets its backslash doubled, a truncated payload gets its open string and
/// brackets closed.  Each pass fixes one defect; the pass budget bounds the
/// work on unrepairable garbage.
fn repair_json(raw: &str) -> Option<Value> {
    let mut work = raw.trim().to_string();
    for _ in 0..8 {
        let err = match serde_json::from_str::<Value>(&work) {
            Ok(v @ Value::Object(_)) => return Some(v),
            Ok(_) => return None,
            Err(e) => e,
        };
        if err.is_eof() {
            work = close_open_delimiters(&work)?;
        } else {
            let at = byte_offset(&work, err.line(), err.column());
            work = escape_backslash_before(&work, at)?;
        }
    }
    None
}

/// Byte offset of a 1-based line/column pair as reported by `serde_json`.
fn byte_offset(s: &str, line: usize, column: usize) -> usize {
    let skipped: usize = s
        .split('\n')
        .take(line.saturating_sub(1))
        .map(|l| l.len() + 1)
        .sum();
    (skipped + column.saturating_sub(1)).min(s.len())
}

/// Double the backslash immediately before the reported error position.
/// Returns `None` when the error is not adjacent to an escape sequence —
/// the defect is then something this repair cannot fix.
fn escape_backslash_before(s: &str, at: usize) -> Option<String> {
    let bs = s[..at.min(s.len())].rfind('\\')?;
    if at - bs > 2 {
        return None;
    }
    let mut out = String::with_capacity(s.len() + 1);
    out.push_str(&s[..bs]);
    out.push_str("\\\\");
    out.push_str(&s[bs + 1..]);
    Some(out)
}

/// Close whatever a truncated payload left open: first an unterminated
/// string (completing a dangling escape so the quote is not swallowed),
/// then unbalanced objects and arrays, innermost first.
fn close_open_delimiters(s: &str) -> Option<String> {
    let mut closers: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                closers.pop();
            }
            _ => {}
        }
    }
    if !in_string && closers.is_empty() {
        // Balanced but still EOF-errored: nothing this scan can add.
        return None;
    }
    let mut out = s.to_string();
    if in_string {
        if escaped {
            out.push('\\');
        }
        out.push('"');
    }
    while let Some(c) = closers.pop() {
        out.push(c);
    }
    Some(out)
}

/// Find a JSON-shaped tool call written into prose: an object carrying a
/// tool name under `tool`/`name` and arguments under `args`/`arguments`.
fn extract_json_tool_call(text: &str) -> Option<(String, Value)> {
    for (start, _) in text.match_indices('{') {
        let mut stream =
            serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        let Some(Ok(value)) = stream.next() else {
            continue;
        };
        let Some(obj) = value.as_object() else {
            continue;
        };
        let Some(name) = obj
            .get("tool")
            .or_else(|| obj.get("name"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let args = obj
            .get("args")
            .or_else(|| obj.get("arguments"))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        return Some((name.to_string(), args));
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
