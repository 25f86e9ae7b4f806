// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, HashSet};

/// Tag name that signals task completion on the text-XML protocol.
pub const COMPLETION_TAG: &str = "attempt_completion";

/// A potential tag longer than this cannot be a tool name; flush it as text.
const MAX_TAG_LEN: usize = 60;

/// One tool use recognised in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToolUse {
    pub name: String,
    pub params: BTreeMap<String, String>,
}

/// What one chunk of streamed text produced.
#[derive(Debug, Default, Clone)]
pub struct ChunkOutput {
    /// Text to surface to the UI (never part of a tool block).
    pub display_text: String,
    /// Tool blocks completed within this chunk.
    pub completed_tools: Vec<ParsedToolUse>,
    /// Set when the completion signal closed within this chunk.
    pub completion_result: Option<String>,
    /// True when the chunk ended inside an open tool block.
    pub inside_tool_block: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Text,
    PotentialTag,
    InsideTool,
}

/// Incremental detector of tool blocks in a streamed reply.
///
/// A character-oriented state machine over the concatenation of chunks:
/// `text` → `potential-tag` on `<` → `inside-tool` when the accumulated tag
/// names a recognised tool.  The name set is closed, so HTML or code samples
/// in prose never match; it is extensible at runtime for discovered tools.
/// Linear scan, no backtracking; multi-kB parameter values are fine.
#[derive(Debug)]
pub struct StreamingXmlParser {
    names: HashSet<String>,
    state: State,
    /// `potential-tag` accumulation, including the opening `<`.
    tag_buf: String,
    /// Exact raw text of the open tag, for faithful flush on finalize.
    open_raw: String,
    /// Name of the currently open tool block.
    tool_name: String,
    /// Content accumulated inside the open tool block.
    tool_buf: String,
}

impl StreamingXmlParser {
    pub fn new(names: impl IntoIterator<Item = String>) -> Self {
        let mut set: HashSet<String> = names.into_iter().collect();
        set.insert(COMPLETION_TAG.to_string());
        Self {
            names: set,
            state: State::Text,
            tag_buf: String::new(),
            open_raw: String::new(),
            tool_name: String::new(),
            tool_buf: String::new(),
        }
    }

    /// Extend the recognised-name set (MCP discovery mid-session).
    pub fn add_names(&mut self, names: impl IntoIterator<Item = String>) {
        self.names.extend(names);
    }

    /// Feed one chunk; returns everything the chunk completed.
    pub fn push_chunk(&mut self, chunk: &str) -> ChunkOutput {
        let mut out = ChunkOutput::default();
        for c in chunk.chars() {
            self.push_char(c, &mut out);
        }
        out.inside_tool_block = self.state == State::InsideTool;
        out
    }

    /// Flush residual buffers.  An unclosed tool block is display text.
    pub fn finalize(&mut self) -> ChunkOutput {
        let mut out = ChunkOutput::default();
        match self.state {
            State::Text => {}
            State::PotentialTag => {
                out.display_text.push_str(&self.tag_buf);
                self.tag_buf.clear();
            }
            State::InsideTool => {
                out.display_text.push_str(&self.open_raw);
                out.display_text.push_str(&self.tool_buf);
                self.open_raw.clear();
                self.tool_buf.clear();
                self.tool_name.clear();
            }
        }
        self.state = State::Text;
        out
    }

    fn push_char(&mut self, c: char, out: &mut ChunkOutput) {
        match self.state {
            State::Text => {
                if c == '<' {
                    self.state = State::PotentialTag;
                    self.tag_buf.clear();
                    self.tag_buf.push('<');
                } else {
                    out.display_text.push(c);
                }
            }
            State::PotentialTag => {
                self.tag_buf.push(c);
                if c == '>' || c == '\n' {
                    let candidate = &self.tag_buf[1..self.tag_buf.len() - 1];
                    if let Some(name) = self.recognize(candidate) {
                        self.tool_name = name;
                        self.open_raw = std::mem::take(&mut self.tag_buf);
                        self.tool_buf.clear();
                        self.state = State::InsideTool;
                    } else {
                        out.display_text.push_str(&self.tag_buf);
                        self.tag_buf.clear();
                        self.state = State::Text;
                    }
                } else if self.tag_buf.len() > MAX_TAG_LEN {
                    out.display_text.push_str(&self.tag_buf);
                    self.tag_buf.clear();
                    self.state = State::Text;
                }
            }
            State::InsideTool => {
                self.tool_buf.push(c);
                let closing = format!("</{}>", self.tool_name);
                if self.tool_buf.ends_with(&closing) {
                    let inner_len = self.tool_buf.len() - closing.len();
                    let inner = self.tool_buf[..inner_len].to_string();
                    self.complete_tool(&inner, out);
                    self.tool_buf.clear();
                    self.open_raw.clear();
                    self.tool_name.clear();
                    self.state = State::Text;
                }
            }
        }
    }

    fn complete_tool(&mut self, inner: &str, out: &mut ChunkOutput) {
        let params = extract_params(inner);
        if base_name(&self.tool_name) == COMPLETION_TAG {
            let result = params
                .get("result")
                .cloned()
                .unwrap_or_else(|| inner.trim().to_string());
            // The completion signal fires once; later blocks cannot retract it.
            if out.completion_result.is_none() {
                out.completion_result = Some(result);
            }
            return;
        }
        out.completed_tools.push(ParsedToolUse {
            name: self.tool_name.clone(),
            params,
        });
    }

    /// A candidate matches when the set holds it verbatim, or holds the
    /// suffix after its last `::` qualifier.
    fn recognize(&self, candidate: &str) -> Option<String> {
        if candidate.is_empty() || candidate.starts_with('/') {
            return None;
        }
        if self.names.contains(candidate) || self.names.contains(base_name(candidate)) {
            return Some(candidate.to_string());
        }
        None
    }
}

fn base_name(name: &str) -> &str {
    name.rsplit("::").next().unwrap_or(name)
}

/// Extract `<param>value</param>` pairs from a tool block's inner content,
/// stripping one leading and one trailing newline from each value.
fn extract_params(inner: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut rest = inner;
    while let Some(open_at) = rest.find('<') {
        let after_open = &rest[open_at + 1..];
        let Some(gt) = after_open.find('>') else { break };
        let key = &after_open[..gt];
        if key.is_empty()
            || key.starts_with('/')
            || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            rest = &rest[open_at + 1..];
            continue;
        }
        let value_start = open_at + 1 + gt + 1;
        let closing = format!("</{key}>");
        let Some(close_rel) = rest[value_start..].find(&closing) else {
            rest = &rest[open_at + 1..];
            continue;
        };
        let raw = &rest[value_start..value_start + close_rel];
        params.insert(key.to_string(), strip_one_newline(raw).to_string());
        rest = &rest[value_start + close_rel + closing.len()..];
    }
    params
}

fn strip_one_newline(v: &str) -> &str {
    let v = v.strip_prefix('\n').unwrap_or(v);
    v.strip_suffix('\n').unwrap_or(v)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> StreamingXmlParser {
        StreamingXmlParser::new(
            ["read_file", "execute_command", "write_to_file"]
                .into_iter()
                .map(String::from),
        )
    }

    /// Feed `text` in `chunk_size`-char chunks, accumulating all output.
    fn feed(parser: &mut StreamingXmlParser, text: &str, chunk_size: usize) -> ChunkOutput {
        let chars: Vec<char> = text.chars().collect();
        let mut total = ChunkOutput::default();
        for chunk in chars.chunks(chunk_size) {
            let s: String = chunk.iter().collect();
            let out = parser.push_chunk(&s);
            total.display_text.push_str(&out.display_text);
            total.completed_tools.extend(out.completed_tools);
            if total.completion_result.is_none() {
                total.completion_result = out.completion_result;
            }
            total.inside_tool_block = out.inside_tool_block;
        }
        let fin = parser.finalize();
        total.display_text.push_str(&fin.display_text);
        total.completed_tools.extend(fin.completed_tools);
        total
    }

    // ── Basic recognition ─────────────────────────────────────────────────────

    #[test]
    fn plain_text_passes_through() {
        let mut p = parser();
        let out = feed(&mut p, "just words, no tools here", 7);
        assert_eq!(out.display_text, "just words, no tools here");
        assert!(out.completed_tools.is_empty());
    }

    #[test]
    fn single_tool_block_is_extracted() {
        let mut p = parser();
        let text = "I'll read it.\n<read_file>\n<path>README.md</path>\n</read_file>\ndone";
        let out = feed(&mut p, text, 1024);
        assert_eq!(out.completed_tools.len(), 1);
        assert_eq!(out.completed_tools[0].name, "read_file");
        assert_eq!(
            out.completed_tools[0].params.get("path").map(String::as_str),
            Some("README.md")
        );
        assert_eq!(out.display_text, "I'll read it.\n\ndone");
    }

    #[test]
    fn param_values_strip_one_newline_each_side() {
        let mut p = parser();
        let text = "<execute_command>\n<command>\nls -la\n</command>\n</execute_command>";
        let out = feed(&mut p, text, 1024);
        assert_eq!(
            out.completed_tools[0].params.get("command").map(String::as_str),
            Some("ls -la")
        );
    }

    #[test]
    fn inner_newlines_of_values_survive() {
        let mut p = parser();
        let text = "<write_to_file>\n<content>\nline1\nline2\n</content>\n</write_to_file>";
        let out = feed(&mut p, text, 1024);
        assert_eq!(
            out.completed_tools[0].params.get("content").map(String::as_str),
            Some("line1\nline2")
        );
    }

    // ── Chunk-boundary round trip ─────────────────────────────────────────────

    #[test]
    fn char_at_a_time_equals_single_chunk() {
        let text = "prefix <read_file>\n<path>src/a.rs</path>\n</read_file> middle \
                    <execute_command>\n<command>cargo check</command>\n</execute_command> suffix";
        let mut p1 = parser();
        let one = feed(&mut p1, text, text.len());
        let mut p2 = parser();
        let tiny = feed(&mut p2, text, 1);
        assert_eq!(one.display_text, tiny.display_text);
        assert_eq!(one.completed_tools, tiny.completed_tools);
        assert_eq!(one.completion_result, tiny.completion_result);
    }

    #[test]
    fn two_char_chunks_with_completion_signal() {
        // Scenario: 2-char chunks containing one read_file and one
        // attempt_completion block.
        let text = "<read_file>\n<path>README.md</path>\n</read_file>\n\
                    <attempt_completion>\n<result>\nAll done.\n</result>\n</attempt_completion>";
        let mut p = parser();
        let out = feed(&mut p, text, 2);
        assert_eq!(out.completed_tools.len(), 1);
        assert_eq!(out.completed_tools[0].name, "read_file");
        assert_eq!(out.completion_result.as_deref(), Some("All done."));
    }

    // ── Completion signal ─────────────────────────────────────────────────────

    #[test]
    fn completion_without_result_param_uses_inner_text() {
        let mut p = parser();
        let text = "<attempt_completion>\nEverything finished fine.\n</attempt_completion>";
        let out = feed(&mut p, text, 16);
        assert_eq!(
            out.completion_result.as_deref(),
            Some("Everything finished fine.")
        );
    }

    // ── Non-tool tags ─────────────────────────────────────────────────────────

    #[test]
    fn html_in_prose_never_matches() {
        let mut p = parser();
        let text = "use <div>markup</div> and <em>emphasis</em> freely";
        let out = feed(&mut p, text, 5);
        assert_eq!(out.display_text, text);
        assert!(out.completed_tools.is_empty());
    }

    #[test]
    fn code_sample_generics_pass_through() {
        let mut p = parser();
        let text = "a Vec<String> and a HashMap<K, V> appear";
        let out = feed(&mut p, text, 3);
        assert_eq!(out.display_text, text);
    }

    #[test]
    fn overlong_potential_tag_flushes_as_text() {
        let mut p = parser();
        let long = format!("<{}", "x".repeat(80));
        let out = feed(&mut p, &long, 9);
        assert_eq!(out.display_text, long);
    }

    // ── Qualified names ───────────────────────────────────────────────────────

    #[test]
    fn qualified_prefix_matches_on_suffix() {
        let mut p = parser();
        let text = "<local::read_file>\n<path>x.txt</path>\n</local::read_file>";
        let out = feed(&mut p, text, 8);
        assert_eq!(out.completed_tools.len(), 1);
        assert_eq!(out.completed_tools[0].name, "local::read_file");
    }

    // ── Runtime extension ─────────────────────────────────────────────────────

    #[test]
    fn added_names_start_matching() {
        let mut p = parser();
        let text = "<github_search>\n<query>bug</query>\n</github_search>";
        let before = feed(&mut p, text, 16);
        assert!(before.completed_tools.is_empty());

        let mut p2 = parser();
        p2.add_names(["github_search".to_string()]);
        let after = feed(&mut p2, text, 16);
        assert_eq!(after.completed_tools.len(), 1);
    }

    // ── Consecutive blocks and state flags ────────────────────────────────────

    #[test]
    fn consecutive_tool_blocks_both_complete() {
        let mut p = parser();
        let text = "<read_file>\n<path>a</path>\n</read_file><read_file>\n<path>b</path>\n</read_file>";
        let out = feed(&mut p, text, 11);
        assert_eq!(out.completed_tools.len(), 2);
        assert_eq!(
            out.completed_tools[1].params.get("path").map(String::as_str),
            Some("b")
        );
    }

    #[test]
    fn inside_tool_block_flag_reports_open_block() {
        let mut p = parser();
        let out = p.push_chunk("<read_file>\n<path>partial");
        assert!(out.inside_tool_block);
        assert!(out.completed_tools.is_empty());
        let out2 = p.push_chunk("</path>\n</read_file>");
        assert!(!out2.inside_tool_block);
        assert_eq!(out2.completed_tools.len(), 1);
    }

    #[test]
    fn finalize_flushes_unclosed_block_as_text() {
        let mut p = parser();
        let text = "<read_file>\n<path>never closed";
        let mid = p.push_chunk(text);
        assert!(mid.inside_tool_block);
        let fin = p.finalize();
        assert_eq!(fin.display_text, text);
        assert!(fin.completed_tools.is_empty());
    }

    #[test]
    fn finalize_flushes_partial_tag() {
        let mut p = parser();
        let _ = p.push_chunk("text then <read_fi");
        let fin = p.finalize();
        assert_eq!(fin.display_text, "<read_fi");
    }

    // ── Large values ──────────────────────────────────────────────────────────

    #[test]
    fn multi_kilobyte_value_is_preserved() {
        let mut p = parser();
        let body = "x".repeat(64 * 1024);
        let text = format!(
            "<write_to_file>\n<content>\n{body}\n</content>\n</write_to_file>"
        );
        let out = feed(&mut p, &text, 4096);
        assert_eq!(
            out.completed_tools[0].params.get("content").map(String::len),
            Some(body.len())
        );
    }

    // ── Param edge cases ──────────────────────────────────────────────────────

    #[test]
    fn malformed_inner_tags_are_skipped() {
        let mut p = parser();
        let text = "<read_file>\n<path>ok</path>\n<<bad>>\n</read_file>";
        let out = feed(&mut p, text, 32);
        assert_eq!(out.completed_tools.len(), 1);
        assert_eq!(
            out.completed_tools[0].params.get("path").map(String::as_str),
            Some("ok")
        );
    }

    #[test]
    fn newline_terminated_open_tag_is_accepted() {
        let mut p = parser();
        let text = "<read_file\n<path>a.txt</path>\n</read_file>";
        let out = feed(&mut p, text, 1024);
        assert_eq!(out.completed_tools.len(), 1);
    }
}
