// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use quill_model::{ContentBlock, Message, MessageContent, Role};

use crate::files::{FileRegistry, ToolCallRecord};

/// Prompt for the condensation call made against the summarizer model.
/// Structured sections keep the checkpoint information-dense and diffable.
pub const CONDENSATION_PROMPT: &str = "\
You are a context compaction assistant for a software engineering agent. \
Produce a structured state checkpoint from the conversation history below. \
Use EXACTLY the following Markdown sections. Be information-dense: preserve \
file paths, function names, error messages, and technical decisions verbatim \
where they matter.

## Active Task
Describe in 1-3 sentences what the agent is currently working on.

## Key Decisions & Rationale
List every significant technical decision made and why.

## Files & Artifacts
List every file that was read, modified, or created, with a note on what was done.

## Constraints & Requirements
List every requirement, constraint, or user preference that must be preserved.

## Pending Items
List every unfinished subtask or open question.

## Session Narrative
A dense technical summary of what happened so far.";

/// Serialise a message range into plain text for the condensation prompt.
/// Thinking payloads are never serialised through the summary pipeline.
pub fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
            };
            let text = match &m.content {
                MessageContent::Text(t) => t.clone(),
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.clone()),
                        ContentBlock::Thinking { .. } => None,
                        ContentBlock::ToolUse { name, input, .. } => {
                            Some(format!("[tool_call: {name}({input})]"))
                        }
                        ContentBlock::ToolResult { content, is_error, .. } => Some(format!(
                            "[tool_result{}: {content}]",
                            if *is_error { " (error)" } else { "" }
                        )),
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
            };
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the single-turn request text sent to the summarizer model.
pub fn condensation_request(messages: &[Message]) -> String {
    format!(
        "{CONDENSATION_PROMPT}\n\n---\n\n{}",
        serialize_history(messages)
    )
}

// ─── Progressive compaction ───────────────────────────────────────────────────

/// Files kept by the level-2 eviction pass.
const KEEP_RECENT_FILES: usize = 4;
/// Per-file token cap enforced by the level-3 truncation pass.
const FILE_TOKEN_CAP: usize = 2_000;
/// Tool-call records younger than this many entries keep their full content.
const KEEP_RECENT_RECORDS: usize = 6;

/// Heuristic, non-LLM size reduction applied when condensation alone did not
/// free enough context.  Levels are cumulative and cheap to repeat:
///
/// 1. rewrite old tool-result records to one-line summaries;
/// 2. evict the oldest cached files, keeping the most recent four;
/// 3. head/tail-truncate any cached file above the per-file token cap.
pub fn progressive_compact(
    level: u8,
    records: &mut [ToolCallRecord],
    registry: &mut FileRegistry,
) {
    if level >= 1 {
        summarize_old_records(records, KEEP_RECENT_RECORDS);
    }
    if level >= 2 {
        registry.evict_oldest(KEEP_RECENT_FILES);
    }
    if level >= 3 {
        registry.truncate_large(FILE_TOKEN_CAP);
    }
}

/// Rewrite every record but the `keep_recent` newest to a one-line summary.
fn summarize_old_records(records: &mut [ToolCallRecord], keep_recent: usize) {
    let cutoff = records.len().saturating_sub(keep_recent);
    for record in &mut records[..cutoff] {
        if record.content.len() <= 80 && !record.content.contains('\n') {
            continue;
        }
        let first_line = record.content.lines().next().unwrap_or("");
        let mut summary: String = first_line.chars().take(80).collect();
        summary.push('…');
        record.content = summary;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
