// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{BTreeMap, HashMap};

use serde_json::json;
use tracing::debug;

use crate::tool::{ToolCategory, ToolSpec};

/// Reserved key of the completion-signal tool.
pub const COMPLETION_TOOL: &str = "local::attempt_completion";

/// Static table of names models commonly hallucinate, mapped to real keys.
const ALIASES: &[(&str, &str)] = &[
    ("read_file", "local::file_read"),
    ("open_file", "local::file_read"),
    ("cat", "local::file_read"),
    ("write_file", "local::file_write"),
    ("create_file", "local::file_write"),
    ("edit_file", "local::file_edit"),
    ("str_replace", "local::file_edit"),
    ("apply_diff", "local::file_edit"),
    ("apply_patch", "local::apply_patch"),
    ("list_dir", "local::directory_list"),
    ("list_files", "local::directory_list"),
    ("ls", "local::directory_list"),
    ("grep", "local::search_files"),
    ("search", "local::search_files"),
    ("bash", "local::execute_command"),
    ("shell", "local::execute_command"),
    ("run_command", "local::execute_command"),
    ("finish", "local::attempt_completion"),
    ("complete_task", "local::attempt_completion"),
    ("task", "agent::delegate"),
    ("spawn_agent", "agent::delegate"),
];

/// Map a hierarchical key to a name that survives APIs restricted to
/// `[A-Za-z0-9_-]`: `::` becomes `__`, anything else non-identifier `_`.
pub fn sanitize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 2);
    let mut rest = key;
    while let Some(pos) = rest.find("::") {
        push_sanitized(&mut out, &rest[..pos]);
        out.push_str("__");
        rest = &rest[pos + 2..];
    }
    push_sanitized(&mut out, rest);
    out
}

fn push_sanitized(out: &mut String, part: &str) {
    for c in part.chars() {
        if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
            out.push(c);
        } else {
            out.push('_');
        }
    }
}

/// The outcome of resolving a model-supplied tool name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The canonical hierarchical key.
    Known(String),
    /// Unresolvable; up to three closest registered keys for the corrective
    /// message the runner injects.
    Hallucinated { suggestions: Vec<String> },
}

/// The set of tools available to a task, with inverse name resolution.
///
/// The catalog is append-only: MCP discovery registers new specs mid-session
/// and the name map is rebuilt synchronously so later calls in the same step
/// resolve. The runner captures a snapshot (clone) at the top of each loop
/// iteration.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    specs: BTreeMap<String, ToolSpec>,
    /// sanitized name → canonical key
    sanitized: HashMap<String, String>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in tool set of the local assistant.  MCP-discovered tools
    /// are registered on top of this at runtime.
    pub fn builtin() -> Self {
        let mut c = Self::new();
        let path_schema = json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        });
        c.register(ToolSpec::new(
            "local::file_read",
            "Read a file and return its content.",
            path_schema.clone(),
            ToolCategory::Safe,
        ));
        c.register(ToolSpec::new(
            "local::directory_list",
            "List the entries of a directory.",
            path_schema.clone(),
            ToolCategory::Safe,
        ));
        c.register(ToolSpec::new(
            "local::search_files",
            "Search file contents for a regex pattern.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "pattern": { "type": "string" }
                },
                "required": ["pattern"]
            }),
            ToolCategory::Safe,
        ));
        c.register(ToolSpec::new(
            "local::file_write",
            "Create or overwrite a file with the given content.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "content": { "type": "string" }
                },
                "required": ["path", "content"]
            }),
            ToolCategory::Write,
        ));
        c.register(ToolSpec::new(
            "local::file_edit",
            "Apply search/replace diff blocks to a file.",
            json!({
                "type": "object",
                "properties": {
                    "path": { "type": "string" },
                    "diff": { "type": "string" }
                },
                "required": ["path", "diff"]
            }),
            ToolCategory::Write,
        ));
        c.register(ToolSpec::new(
            "local::apply_patch",
            "Apply a multi-file patch (update/add/delete headers with hunks).",
            json!({
                "type": "object",
                "properties": { "input": { "type": "string" } },
                "required": ["input"]
            }),
            ToolCategory::Write,
        ));
        c.register(ToolSpec::new(
            "local::execute_command",
            "Run a shell command in the working directory.",
            json!({
                "type": "object",
                "properties": { "command": { "type": "string" } },
                "required": ["command"]
            }),
            ToolCategory::Execute,
        ));
        c.register(ToolSpec::new(
            COMPLETION_TOOL,
            "Declare the task finished and present the final result to the user.",
            json!({
                "type": "object",
                "properties": { "result": { "type": "string" } },
                "required": ["result"]
            }),
            ToolCategory::Safe,
        ));
        c.register(ToolSpec::new(
            "agent::delegate",
            "Spawn one sub-task on another agent kind and wait for its result.",
            json!({
                "type": "object",
                "properties": {
                    "agent": { "type": "string" },
                    "task": { "type": "string" }
                },
                "required": ["agent", "task"]
            }),
            ToolCategory::Safe,
        ));
        c.register(ToolSpec::new(
            "agent::delegate_parallel",
            "Spawn up to 5 sub-tasks concurrently and wait for all of them.",
            json!({
                "type": "object",
                "properties": {
                    "subtasks": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "agent": { "type": "string" },
                                "task": { "type": "string" }
                            },
                            "required": ["agent", "task"]
                        },
                        "maxItems": 5
                    }
                },
                "required": ["subtasks"]
            }),
            ToolCategory::Safe,
        ));
        c
    }

    /// Register (or replace) a spec and rebuild the sanitized-name index.
    pub fn register(&mut self, spec: ToolSpec) {
        self.sanitized.insert(sanitize_key(&spec.key), spec.key.clone());
        self.specs.insert(spec.key.clone(), spec);
    }

    pub fn get(&self, key: &str) -> Option<&ToolSpec> {
        self.specs.get(key)
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// All specs in key order (stable for prompt construction).
    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.specs.values()
    }

    /// Resolve a model-supplied name back to a canonical key.
    ///
    /// Order: exact sanitized match, suffix match (models sometimes prepend
    /// extra prefixes), alias table, then hallucination with suggestions.
    pub fn resolve(&self, api_name: &str) -> Resolution {
        // Exact match against sanitized names and raw keys.
        if let Some(key) = self.sanitized.get(api_name) {
            return Resolution::Known(key.clone());
        }
        if self.specs.contains_key(api_name) {
            return Resolution::Known(api_name.to_string());
        }

        // Suffix match: the supplied name ends with a known sanitized key.
        let mut suffix_hit: Option<&str> = None;
        for (san, key) in &self.sanitized {
            if api_name.len() > san.len() && api_name.ends_with(san.as_str()) {
                // Longest suffix wins to avoid e.g. `read` matching `file_read`
                // when `local__file_read` is also a suffix.
                if suffix_hit.map(|k| san.len() > sanitize_key(k).len()).unwrap_or(true) {
                    suffix_hit = Some(key);
                }
            }
        }
        if let Some(key) = suffix_hit {
            debug!(api_name, key, "tool name resolved by suffix match");
            return Resolution::Known(key.to_string());
        }

        // Alias table of common hallucinations.
        for (alias, key) in ALIASES {
            if api_name == *alias && self.specs.contains_key(*key) {
                debug!(api_name, key, "tool name resolved by alias");
                return Resolution::Known((*key).to_string());
            }
        }

        Resolution::Hallucinated {
            suggestions: self.closest_keys(api_name, 3),
        }
    }

    /// Lower a streamed XML tag to its canonical qualified key.
    ///
    /// The text protocol's tag alphabet admits both qualified tags
    /// (`local::file_read`) and bare base names (`file_read`); the parser
    /// matches qualified tags on their suffix, so the reverse mapping is
    /// needed here before inverse resolution runs.  Lowering keeps
    /// [`resolve`](Self::resolve) to its four steps: it only ever receives
    /// canonical keys or genuinely foreign names.  Returns `None` when the
    /// tag is unknown or its base name belongs to more than one key.
    pub fn canonical_for_tag(&self, tag: &str) -> Option<String> {
        if self.specs.contains_key(tag) {
            return Some(tag.to_string());
        }
        let base_hits: Vec<&String> = self
            .specs
            .keys()
            .filter(|k| k.rsplit("::").next() == Some(tag))
            .collect();
        match base_hits.as_slice() {
            [only] => Some((*only).clone()),
            _ => None,
        }
    }

    /// Rank registered keys by shared word-fragment count with `name`.
    fn closest_keys(&self, name: &str, limit: usize) -> Vec<String> {
        let wanted = fragments(name);
        let mut scored: Vec<(usize, &String)> = self
            .specs
            .keys()
            .map(|key| {
                let have = fragments(key);
                let shared = wanted.iter().filter(|f| have.contains(*f)).count();
                (shared, key)
            })
            .filter(|(score, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        scored.into_iter().take(limit).map(|(_, k)| k.clone()).collect()
    }
}

/// Split a tool name into lowercase word fragments on `_`, `-`, and `::`.
fn fragments(name: &str) -> Vec<String> {
    name.to_ascii_lowercase()
        .replace("::", "_")
        .split(['_', '-'])
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
