// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use crate::budget::estimate;

/// Normalise a path for registry/tracker keys: forward slashes, lower-cased.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").to_lowercase()
}

/// One record in the per-task tool-call history, used for loop detection and
/// artifact accounting.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub tool_key: String,
    pub success: bool,
    pub content: String,
}

/// A cached file read.
#[derive(Debug, Clone)]
pub struct FileEntry {
    pub content: String,
    /// Loop step that produced this entry.
    pub step: u32,
    pub cached_tokens: usize,
}

/// Read-through cache of file contents, letting repeated reads within one
/// task skip the dispatcher.  Entries are written on successful reads and on
/// successful writes (the post-write content), and evicted by progressive
/// compaction.
#[derive(Debug, Default)]
pub struct FileRegistry {
    entries: HashMap<String, FileEntry>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(&normalize_path(path))
    }

    pub fn insert(&mut self, path: &str, content: String, step: u32) {
        let cached_tokens = estimate(&content);
        self.entries.insert(
            normalize_path(path),
            FileEntry {
                content,
                step,
                cached_tokens,
            },
        );
    }

    pub fn remove(&mut self, path: &str) {
        self.entries.remove(&normalize_path(path));
    }

    /// Total estimated tokens held by the cache.
    pub fn cached_tokens(&self) -> usize {
        self.entries.values().map(|e| e.cached_tokens).sum()
    }

    /// Evict oldest entries (by step) keeping the `keep` most recent.
    pub fn evict_oldest(&mut self, keep: usize) {
        if self.entries.len() <= keep {
            return;
        }
        let mut by_age: Vec<(String, u32)> = self
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.step))
            .collect();
        by_age.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (key, _) in by_age.into_iter().skip(keep) {
            self.entries.remove(&key);
        }
    }

    /// Head/tail-truncate every entry whose estimate exceeds `cap_tokens`.
    pub fn truncate_large(&mut self, cap_tokens: usize) {
        for entry in self.entries.values_mut() {
            if entry.cached_tokens <= cap_tokens {
                continue;
            }
            entry.content = head_tail(&entry.content, cap_tokens * 4);
            entry.cached_tokens = estimate(&entry.content);
        }
    }

    /// Short signature lines for condensation folding: path plus the first
    /// non-empty line of each cached file.
    pub fn signatures(&self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        let lines: Vec<String> = keys
            .into_iter()
            .map(|k| {
                let first = self.entries[k]
                    .content
                    .lines()
                    .find(|l| !l.trim().is_empty())
                    .unwrap_or("");
                format!("{k}: {}", first.trim())
            })
            .collect();
        Some(lines.join("\n"))
    }
}

/// Keep the leading and trailing halves of `content` within `cap_bytes`,
/// cutting at line boundaries, with an omission notice between them.
fn head_tail(content: &str, cap_bytes: usize) -> String {
    if content.len() <= cap_bytes {
        return content.to_string();
    }
    let half = cap_bytes / 2;
    let lines: Vec<&str> = content.lines().collect();

    let mut head: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in &lines {
        if used + line.len() + 1 > half {
            break;
        }
        used += line.len() + 1;
        head.push(line);
    }

    let mut tail: Vec<&str> = Vec::new();
    used = 0;
    for line in lines.iter().rev() {
        if used + line.len() + 1 > half {
            break;
        }
        used += line.len() + 1;
        tail.push(line);
    }
    tail.reverse();

    let omitted = lines.len().saturating_sub(head.len() + tail.len());
    format!(
        "{}\n[... {omitted} lines omitted; re-read the file to see them ...]\n{}",
        head.join("\n"),
        tail.join("\n")
    )
}

/// Per-file read/edit statistics, used to surface externally-modified files.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub first_read_step: u32,
    pub last_read_step: u32,
    pub last_edit_step: Option<u32>,
    /// Modification time (seconds since epoch) observed at the last read.
    pub mtime_at_last_read: i64,
    pub read_count: u32,
}

#[derive(Debug, Default)]
pub struct FileTracker {
    entries: HashMap<String, FileStat>,
}

impl FileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&FileStat> {
        self.entries.get(&normalize_path(path))
    }

    pub fn record_read(&mut self, path: &str, step: u32, mtime: i64) {
        let key = normalize_path(path);
        match self.entries.get_mut(&key) {
            Some(stat) => {
                stat.last_read_step = step;
                stat.mtime_at_last_read = mtime;
                stat.read_count += 1;
            }
            None => {
                self.entries.insert(
                    key,
                    FileStat {
                        first_read_step: step,
                        last_read_step: step,
                        last_edit_step: None,
                        mtime_at_last_read: mtime,
                        read_count: 1,
                    },
                );
            }
        }
    }

    pub fn record_edit(&mut self, path: &str, step: u32, mtime: i64) {
        let key = normalize_path(path);
        match self.entries.get_mut(&key) {
            Some(stat) => {
                stat.last_edit_step = Some(step);
                stat.mtime_at_last_read = mtime;
            }
            None => {
                self.entries.insert(
                    key,
                    FileStat {
                        first_read_step: step,
                        last_read_step: step,
                        last_edit_step: Some(step),
                        mtime_at_last_read: mtime,
                        read_count: 0,
                    },
                );
            }
        }
    }

    /// True when the file changed on disk since the last recorded read.
    pub fn externally_modified(&self, path: &str, current_mtime: i64) -> bool {
        self.get(path)
            .map(|s| current_mtime > s.mtime_at_last_read)
            .unwrap_or(false)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Path normalisation ────────────────────────────────────────────────────

    #[test]
    fn normalize_lowercases_and_forward_slashes() {
        assert_eq!(normalize_path("Src\\Main.RS"), "src/main.rs");
    }

    #[test]
    fn registry_lookup_ignores_case_and_separator() {
        let mut r = FileRegistry::new();
        r.insert("Src\\Lib.rs", "content".into(), 1);
        assert!(r.get("src/lib.rs").is_some());
    }

    // ── Registry ──────────────────────────────────────────────────────────────

    #[test]
    fn insert_records_step_and_tokens() {
        let mut r = FileRegistry::new();
        r.insert("a.rs", "x".repeat(400), 3);
        let e = r.get("a.rs").unwrap();
        assert_eq!(e.step, 3);
        assert_eq!(e.cached_tokens, 100);
    }

    #[test]
    fn reinsert_replaces_entry() {
        let mut r = FileRegistry::new();
        r.insert("a.rs", "old".into(), 1);
        r.insert("a.rs", "new content".into(), 2);
        assert_eq!(r.len(), 1);
        assert_eq!(r.get("a.rs").unwrap().content, "new content");
    }

    #[test]
    fn evict_oldest_keeps_most_recent() {
        let mut r = FileRegistry::new();
        for i in 0..6 {
            r.insert(&format!("f{i}.rs"), "data".into(), i);
        }
        r.evict_oldest(4);
        assert_eq!(r.len(), 4);
        assert!(r.get("f0.rs").is_none());
        assert!(r.get("f1.rs").is_none());
        assert!(r.get("f5.rs").is_some());
    }

    #[test]
    fn evict_oldest_noop_when_small() {
        let mut r = FileRegistry::new();
        r.insert("a.rs", "x".into(), 1);
        r.evict_oldest(4);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn truncate_large_shrinks_only_oversized() {
        let mut r = FileRegistry::new();
        let long = (0..500)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        r.insert("big.rs", long, 1);
        r.insert("small.rs", "tiny".into(), 1);
        r.truncate_large(100);
        assert!(r.get("big.rs").unwrap().content.contains("lines omitted"));
        assert!(r.get("big.rs").unwrap().cached_tokens <= 150);
        assert_eq!(r.get("small.rs").unwrap().content, "tiny");
    }

    #[test]
    fn signatures_list_first_nonempty_lines() {
        let mut r = FileRegistry::new();
        r.insert("b.rs", "\n\nfn second() {}".into(), 1);
        r.insert("a.rs", "fn first() {}\nmore".into(), 1);
        let sig = r.signatures().unwrap();
        let lines: Vec<&str> = sig.lines().collect();
        assert_eq!(lines[0], "a.rs: fn first() {}");
        assert_eq!(lines[1], "b.rs: fn second() {}");
    }

    #[test]
    fn signatures_empty_registry_is_none() {
        assert!(FileRegistry::new().signatures().is_none());
    }

    // ── Tracker ───────────────────────────────────────────────────────────────

    #[test]
    fn read_then_reread_bumps_counters() {
        let mut t = FileTracker::new();
        t.record_read("a.rs", 1, 100);
        t.record_read("a.rs", 5, 120);
        let s = t.get("a.rs").unwrap();
        assert_eq!(s.first_read_step, 1);
        assert_eq!(s.last_read_step, 5);
        assert_eq!(s.read_count, 2);
        assert_eq!(s.mtime_at_last_read, 120);
    }

    #[test]
    fn edit_records_step() {
        let mut t = FileTracker::new();
        t.record_read("a.rs", 1, 100);
        t.record_edit("a.rs", 2, 150);
        assert_eq!(t.get("a.rs").unwrap().last_edit_step, Some(2));
    }

    #[test]
    fn external_modification_detected_by_newer_mtime() {
        let mut t = FileTracker::new();
        t.record_read("a.rs", 1, 100);
        assert!(t.externally_modified("a.rs", 200));
        assert!(!t.externally_modified("a.rs", 100));
        assert!(!t.externally_modified("unknown.rs", 999));
    }
}
