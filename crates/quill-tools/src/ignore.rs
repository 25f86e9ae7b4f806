// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;
use tracing::debug;

/// Name of the ignore file looked up at the project root.
pub const IGNORE_FILE_NAME: &str = ".ignorefile";

#[derive(Debug)]
struct Rule {
    negated: bool,
    /// Trailing-`/` pattern: matches directories and everything inside them.
    dir_only: bool,
    regex: Regex,
}

/// Gitignore-style matcher.
///
/// Semantics: later rules win; `!` un-ignores; patterns without `/` match at
/// any depth; trailing `/` is directory-only (contents included); `**`
/// crosses directory boundaries; `#` starts a comment; matching is
/// case-insensitive on all platforms.
#[derive(Debug, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
}

impl IgnoreMatcher {
    pub fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for raw in text.lines() {
            let line = raw.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (negated, body) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };
            let (dir_only, body) = match body.strip_suffix('/') {
                Some(rest) => (true, rest),
                None => (false, body),
            };
            // A pattern containing a slash (leading or interior) is anchored
            // at the root; one without matches at any depth.
            let anchored = body.contains('/');
            let body = body.trim_start_matches('/');
            if body.is_empty() {
                continue;
            }
            if let Some(regex) = compile(body, anchored) {
                rules.push(Rule {
                    negated,
                    dir_only,
                    regex,
                });
            } else {
                debug!(pattern = raw, "skipping unparseable ignore pattern");
            }
        }
        Self { rules }
    }

    /// True when `rel_path` (project-root-relative, `/`-separated) is
    /// ignored.  The last matching rule decides.
    pub fn is_ignored(&self, rel_path: &str) -> bool {
        let path = rel_path.trim_start_matches('/').replace('\\', "/");
        let mut ignored = false;
        for rule in &self.rules {
            if rule_matches(rule, &path) {
                ignored = !rule.negated;
            }
        }
        ignored
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn rule_matches(rule: &Rule, path: &str) -> bool {
    if rule.dir_only {
        // Only a strict ancestor directory can match a trailing-`/` rule:
        // `secrets/` ignores `secrets/x` but not a plain file `secrets`.
        return ancestors(path).any(|a| rule.regex.is_match(a));
    }
    if rule.regex.is_match(path) {
        return true;
    }
    // A directory match ignores everything inside it.
    ancestors(path).any(|a| rule.regex.is_match(a))
}

/// Strict ancestor directories of `path`: for `a/b/c`, yields `a` and `a/b`.
fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/').map(move |(i, _)| &path[..i])
}

/// Compile one gitignore pattern body into an anchored, case-insensitive
/// regex.  Glob grammar: `**` crosses slashes, `*` and `?` stop at them.
fn compile(body: &str, anchored: bool) -> Option<Regex> {
    let mut re = String::from("(?i)^");
    if !anchored {
        re.push_str("(?:.*/)?");
    }
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // Collapse `**/` so `a/**/b` also matches `a/b`.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).ok()
}

// ─── Process-wide cache ──────────────────────────────────────────────────────

static CACHE: OnceLock<RwLock<HashMap<PathBuf, Arc<IgnoreMatcher>>>> = OnceLock::new();

fn cache() -> &'static RwLock<HashMap<PathBuf, Arc<IgnoreMatcher>>> {
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Load (or fetch the cached) matcher for a project root.
///
/// The cache is process-wide and read-only after first load; concurrent
/// tasks with the same working directory share one matcher.  Call
/// [`clear_ignore_cache`] after a working-directory change.
pub fn matcher_for_root(root: &Path) -> Arc<IgnoreMatcher> {
    if let Some(m) = cache().read().unwrap().get(root) {
        return Arc::clone(m);
    }
    let text = std::fs::read_to_string(root.join(IGNORE_FILE_NAME)).unwrap_or_default();
    let matcher = Arc::new(IgnoreMatcher::parse(&text));
    cache()
        .write()
        .unwrap()
        .insert(root.to_path_buf(), Arc::clone(&matcher));
    matcher
}

/// Drop every cached matcher.  Exposed for working-directory changes.
pub fn clear_ignore_cache() {
    cache().write().unwrap().clear();
}

/// Project-root-relative form of a tool-call `path` argument, when the path
/// resolves beneath the root.  Returns `None` for paths outside the project.
pub fn relative_to_root(root: &Path, raw: &str) -> Option<String> {
    let p = Path::new(raw);
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    };
    // Textual normalisation only — the gate must not require the file to
    // exist yet (writes are checked before creation).
    let mut parts: Vec<String> = Vec::new();
    for comp in joined.components() {
        use std::path::Component;
        match comp {
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => parts.clear(),
        }
    }
    let root_parts: Vec<String> = root
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.len() < root_parts.len() || parts[..root_parts.len()] != root_parts[..] {
        return None;
    }
    Some(parts[root_parts.len()..].join("/"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
