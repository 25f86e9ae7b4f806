// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use quill_model::{ContentBlock, Message};
use tracing::debug;

use crate::budget::TokenBudget;

/// How many trailing messages survive a condensation untouched.
const CONDENSE_KEEP_TAIL: usize = 4;

/// Trim keeps at least this many trailing messages.
const TRIM_MIN_TAIL: usize = 8;

/// The ordered transcript of one task, with per-message token estimates.
///
/// Invariants:
/// - the first message (the task definition) is never removed;
/// - `total` always equals the sum of the per-message estimates;
/// - every trim or condensation reduces the total or leaves it unchanged.
#[derive(Debug)]
pub struct Conversation {
    messages: Vec<Message>,
    tokens: Vec<usize>,
    total: usize,
    budget: TokenBudget,
    /// Byte cap applied to each tool-result payload before packing.
    result_cap_bytes: usize,
    condensations: u32,
}

impl Conversation {
    pub fn new(budget: TokenBudget, result_cap_bytes: usize) -> Self {
        Self {
            messages: Vec::new(),
            tokens: Vec::new(),
            total: 0,
            budget,
            result_cap_bytes,
            condensations: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total
    }

    pub fn condensations(&self) -> u32 {
        self.condensations
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }

    /// True when usage is at or past `ratio` of the input budget.
    pub fn near_budget(&self, ratio: f32) -> bool {
        self.budget.near(self.total, ratio)
    }

    /// Record a message, updating totals; trims when over budget.
    pub fn append(&mut self, message: Message) {
        let t = message.approx_tokens();
        self.messages.push(message);
        self.tokens.push(t);
        self.total += t;
        if self.total > self.budget.budget() {
            self.trim();
        }
    }

    /// Pack tool results into one user message, truncating oversized
    /// payloads, and record it.
    ///
    /// Only `ToolResult` blocks are expected; anything else is a programmer
    /// error upstream and is passed through untouched.
    pub fn append_tool_results(&mut self, results: Vec<ContentBlock>) {
        if results.is_empty() {
            return;
        }
        let cap = self.result_cap_bytes;
        let blocks: Vec<ContentBlock> = results
            .into_iter()
            .map(|b| match b {
                ContentBlock::ToolResult {
                    id,
                    content,
                    is_error,
                } => ContentBlock::ToolResult {
                    id,
                    content: truncate_middle(&content, cap),
                    is_error,
                },
                other => other,
            })
            .collect();
        self.append(Message::user_blocks(blocks));
    }

    /// Immutable view of the transcript.  Callers must not mutate.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    /// Messages between the first one and the preserved tail — the range a
    /// condensation replaces.  Used to build the summarizer request.
    pub fn condensable_range(&self) -> &[Message] {
        if self.messages.len() <= 1 + CONDENSE_KEEP_TAIL {
            return &[];
        }
        &self.messages[1..self.messages.len() - CONDENSE_KEEP_TAIL]
    }

    /// Replace everything between the first message and the last four with a
    /// single notice message carrying `summary` (plus optional file-context
    /// signatures), and bump the condensation counter.
    pub fn condense(&mut self, summary: &str, folded_file_context: Option<&str>) {
        if self.messages.len() <= 1 + CONDENSE_KEEP_TAIL {
            return;
        }
        let tail_start = self.messages.len() - CONDENSE_KEEP_TAIL;
        let mut notice = format!(
            "[Earlier conversation condensed to free context space.]\n\n{summary}"
        );
        if let Some(folded) = folded_file_context {
            notice.push_str("\n\nFile context signatures:\n");
            notice.push_str(folded);
        }

        let mut rebuilt: Vec<Message> = Vec::with_capacity(2 + CONDENSE_KEEP_TAIL);
        rebuilt.push(self.messages[0].clone());
        rebuilt.push(Message::user(notice));
        rebuilt.extend_from_slice(&self.messages[tail_start..]);

        let removed = self.messages.len() - rebuilt.len();
        self.replace_messages(rebuilt);
        self.condensations += 1;
        debug!(
            removed,
            total = self.total,
            condensations = self.condensations,
            "conversation condensed"
        );
    }

    /// Collapse the middle of the transcript while over budget.
    ///
    /// Preserves the first two messages (task definition and the initial
    /// reply) and the last `max(8, ⌊40%·len⌋)`; the middle becomes one
    /// notice naming the count and inviting re-reads.  Recurses while still
    /// over budget and the transcript is long enough to shrink further.
    fn trim(&mut self) {
        let len = self.messages.len();
        let keep_tail = TRIM_MIN_TAIL.max(len * 2 / 5);
        // Nothing to collapse unless at least two middle messages would go
        // (collapsing one into a notice saves nothing).
        if len < 2 + keep_tail + 2 {
            return;
        }
        let tail_start = len - keep_tail;
        let dropped = tail_start - 2;
        let notice = Message::user(format!(
            "[{dropped} earlier messages were removed to fit the context window. \
             Re-read any files you still need.]"
        ));

        let mut rebuilt: Vec<Message> = Vec::with_capacity(3 + keep_tail);
        rebuilt.extend_from_slice(&self.messages[..2]);
        rebuilt.push(notice);
        rebuilt.extend_from_slice(&self.messages[tail_start..]);
        self.replace_messages(rebuilt);
        debug!(dropped, total = self.total, "conversation trimmed");

        if self.total > self.budget.budget() {
            self.trim();
        }
    }

    fn replace_messages(&mut self, messages: Vec<Message>) {
        self.tokens = messages.iter().map(Message::approx_tokens).collect();
        self.total = self.tokens.iter().sum();
        self.messages = messages;
    }

    /// Recompute totals from scratch; used by tests to verify invariant (b).
    #[cfg(test)]
    fn recomputed_total(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }
}

/// Keep the first and last halves of an oversized payload with an explicit
/// elision marker between them.
fn truncate_middle(content: &str, cap_bytes: usize) -> String {
    if cap_bytes == 0 || content.len() <= cap_bytes {
        return content.to_string();
    }
    let half = cap_bytes / 2;
    let head_end = floor_char_boundary(content, half);
    let tail_start = ceil_char_boundary(content, content.len() - half);
    let elided = tail_start - head_end;
    format!(
        "{}\n[... {elided} bytes elided to fit the transcript ...]\n{}",
        &content[..head_end],
        &content[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use quill_model::{ContentBlock, MessageContent, Role};

    fn conv(context_limit: usize) -> Conversation {
        Conversation::new(TokenBudget::new(context_limit, false), 200_000)
    }

    fn roomy() -> Conversation {
        conv(1_000_000)
    }

    // ── Append and totals ─────────────────────────────────────────────────────

    #[test]
    fn append_updates_total() {
        let mut c = roomy();
        c.append(Message::user("12345678")); // 2 tokens
        c.append(Message::assistant("abcd")); // 1 token
        assert_eq!(c.total_tokens(), 3);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn total_matches_recomputed_sum_after_mutations() {
        let mut c = roomy();
        for i in 0..20 {
            c.append(Message::user(format!("message number {i}")));
        }
        assert_eq!(c.total_tokens(), c.recomputed_total());
        c.condense("short summary", None);
        assert_eq!(c.total_tokens(), c.recomputed_total());
    }

    // ── Tool-result packing ───────────────────────────────────────────────────

    #[test]
    fn tool_results_pack_into_one_user_message() {
        let mut c = roomy();
        c.append_tool_results(vec![
            ContentBlock::tool_result("t1", "out one", false),
            ContentBlock::tool_result("t2", "out two", true),
        ]);
        assert_eq!(c.len(), 1);
        let snap = c.snapshot();
        assert_eq!(snap[0].role, Role::User);
        match &snap[0].content {
            MessageContent::Blocks(blocks) => assert_eq!(blocks.len(), 2),
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[test]
    fn empty_result_list_appends_nothing() {
        let mut c = roomy();
        c.append_tool_results(vec![]);
        assert!(c.is_empty());
    }

    #[test]
    fn oversized_result_is_middle_truncated() {
        let mut c = Conversation::new(TokenBudget::new(1_000_000, false), 1_000);
        let big = "A".repeat(600) + &"Z".repeat(600);
        c.append_tool_results(vec![ContentBlock::tool_result("t1", big, false)]);
        let snap = c.snapshot();
        let MessageContent::Blocks(blocks) = &snap[0].content else {
            panic!("expected blocks");
        };
        let ContentBlock::ToolResult { content, .. } = &blocks[0] else {
            panic!("expected tool result");
        };
        assert!(content.contains("bytes elided"));
        assert!(content.starts_with('A'), "head preserved");
        assert!(content.ends_with('Z'), "tail preserved");
        assert!(content.len() < 1_200);
    }

    // ── Snapshot ──────────────────────────────────────────────────────────────

    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let mut c = roomy();
        c.append(Message::user("first"));
        let snap = c.snapshot();
        c.append(Message::assistant("second"));
        assert_eq!(snap.len(), 1);
        assert_eq!(c.len(), 2);
    }

    // ── Condense ──────────────────────────────────────────────────────────────

    fn long_transcript() -> Conversation {
        let mut c = roomy();
        c.append(Message::user("TASK: summarize the project"));
        for i in 0..30 {
            c.append(Message::assistant(format!("thinking about step {i}, at length")));
            c.append(Message::user(format!("observation for step {i}")));
        }
        c
    }

    #[test]
    fn condense_preserves_first_and_last_four() {
        let mut c = long_transcript();
        let before = c.snapshot();
        let tail: Vec<Message> = before[before.len() - 4..].to_vec();
        c.condense("what happened so far", None);

        let after = c.snapshot();
        assert_eq!(after[0].as_text(), Some("TASK: summarize the project"));
        assert_eq!(&after[after.len() - 4..], &tail[..]);
        assert_eq!(after.len(), 6); // first + notice + 4
        assert_eq!(c.condensations(), 1);
    }

    #[test]
    fn condense_strictly_reduces_message_count() {
        let mut c = long_transcript();
        let before = c.len();
        c.condense("s", None);
        assert!(c.len() < before);
    }

    #[test]
    fn condense_reduces_total_tokens_on_long_transcript() {
        let mut c = long_transcript();
        let before = c.total_tokens();
        c.condense("compact summary", None);
        assert!(c.total_tokens() <= before);
    }

    #[test]
    fn condense_short_transcript_is_a_no_op() {
        let mut c = roomy();
        for i in 0..4 {
            c.append(Message::user(format!("m{i}")));
        }
        let before = c.snapshot();
        c.condense("s", None);
        assert_eq!(c.snapshot(), before);
        assert_eq!(c.condensations(), 0);
    }

    #[test]
    fn condense_includes_folded_signatures() {
        let mut c = long_transcript();
        c.condense("summary text", Some("src/lib.rs: pub fn run()"));
        let notice = c.snapshot()[1].clone();
        let text = notice.as_text().unwrap().to_string();
        assert!(text.contains("summary text"));
        assert!(text.contains("src/lib.rs"));
    }

    #[test]
    fn condensation_drops_usage_below_proactive_ratio() {
        // Budget of 10_000 tokens; thirty ~280-token turns put usage past
        // the 75% aggressive ratio without overflowing the window.
        let mut c = conv(8_192 + 10_000);
        c.append(Message::user("TASK: port the parser"));
        for i in 0..30 {
            c.append(Message::assistant(format!(
                "{i}: {}",
                "analysis ".repeat(124)
            )));
        }
        assert!(c.near_budget(0.75), "setup must cross the aggressive ratio");
        let tail: Vec<Message> = c.snapshot()[c.len() - 4..].to_vec();

        c.condense("checkpoint: parser half ported", None);

        assert!(!c.near_budget(0.60), "usage must fall below the proactive ratio");
        let after = c.snapshot();
        assert_eq!(after[0].as_text(), Some("TASK: port the parser"));
        assert_eq!(&after[after.len() - 4..], &tail[..]);
    }

    #[test]
    fn condensable_range_excludes_first_and_tail() {
        let c = long_transcript();
        let range = c.condensable_range();
        assert_eq!(range.len(), c.len() - 5);
        assert_ne!(range[0].as_text(), Some("TASK: summarize the project"));
    }

    // ── Trim ──────────────────────────────────────────────────────────────────

    #[test]
    fn trim_fires_when_over_budget_and_keeps_first_two() {
        // Budget ≈ 1_000 tokens after reserve.
        let mut c = conv(8_192 + 1_000);
        c.append(Message::user("TASK: the task definition"));
        c.append(Message::assistant("initial plan"));
        for i in 0..50 {
            // ~40 tokens each; the transcript overflows partway through.
            c.append(Message::user(format!("{i}: {}", "data ".repeat(32))));
        }
        assert!(c.total_tokens() <= c.budget().budget() + 50);
        let snap = c.snapshot();
        assert_eq!(snap[0].as_text(), Some("TASK: the task definition"));
        assert_eq!(snap[1].as_text(), Some("initial plan"));
        let notice = snap[2].as_text().unwrap();
        assert!(notice.contains("removed to fit the context window"), "{notice}");
        assert!(notice.contains("Re-read"), "{notice}");
    }

    #[test]
    fn trim_is_idempotent_under_budget() {
        let mut c = roomy();
        c.append(Message::user("task"));
        c.append(Message::assistant("plan"));
        for i in 0..20 {
            c.append(Message::user(format!("step {i}")));
        }
        let before = c.snapshot();
        // Under budget: appending a small message must not reshape history.
        c.append(Message::user("one more"));
        let after = c.snapshot();
        assert_eq!(&after[..before.len()], &before[..]);
    }

    #[test]
    fn trim_keeps_at_least_eight_tail_messages() {
        let mut c = conv(8_192 + 200);
        c.append(Message::user("task"));
        c.append(Message::assistant("plan"));
        for i in 0..30 {
            c.append(Message::user(format!("{i}: {}", "x ".repeat(40))));
        }
        // first two + notice + tail
        assert!(c.len() >= 2 + 1 + 8 || c.len() < 11);
    }

    #[test]
    fn first_message_survives_any_squeeze() {
        // Budget so small that even the trimmed transcript overflows.
        let mut c = conv(8_192 + 10);
        c.append(Message::user("the one true task"));
        for i in 0..40 {
            c.append(Message::user(format!("{i}: {}", "y".repeat(200))));
        }
        assert_eq!(c.snapshot()[0].as_text(), Some("the one true task"));
        assert_eq!(c.total_tokens(), c.recomputed_total());
    }

    // ── truncate_middle ───────────────────────────────────────────────────────

    #[test]
    fn truncate_middle_under_cap_is_identity() {
        assert_eq!(truncate_middle("short", 100), "short");
    }

    #[test]
    fn truncate_middle_respects_char_boundaries() {
        // Multi-byte characters around the cut points must not panic.
        let s = "é".repeat(2_000);
        let out = truncate_middle(&s, 1_000);
        assert!(out.contains("bytes elided"));
    }

    #[test]
    fn truncate_middle_zero_cap_is_identity() {
        let s = "x".repeat(10);
        assert_eq!(truncate_middle(&s, 0), s);
    }
}
