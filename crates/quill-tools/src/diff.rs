// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

use similar::TextDiff;
use thiserror::Error;
use tracing::debug;

/// Minimum similarity ratio (0–1) for a fuzzy window to be accepted when the
/// caller does not override it.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Window half-size for the line-hint tier.
const HINT_WINDOW: usize = 40;

/// A second-best fuzzy candidate this close to the best one makes the match
/// ambiguous.
const AMBIGUITY_RATIO: f64 = 0.90;

/// One search-and-replace operation.  Search and replace are
/// newline-preserving; the hint is a 1-based line index.
#[derive(Debug, Clone)]
pub struct DiffBlock {
    pub search: String,
    pub replace: String,
    pub start_line_hint: Option<usize>,
}

impl DiffBlock {
    pub fn new(search: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            replace: replace.into(),
            start_line_hint: None,
        }
    }

    pub fn with_hint(mut self, line: usize) -> Self {
        self.start_line_hint = Some(line);
        self
    }
}

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(
        "block {index}: search content matches {count} locations; \
         include more surrounding context to disambiguate"
    )]
    Ambiguous { index: usize, count: usize },
    #[error(
        "block {index}: fuzzy match is ambiguous — best candidate {best:.2} \
         and runner-up {second:.2} are too close"
    )]
    AmbiguousFuzzy { index: usize, best: f64, second: f64 },
    #[error(
        "block {index}: no match found at similarity ≥ {threshold:.2} \
         (best observed {best:.2}).{nearest}"
    )]
    NoMatch {
        index: usize,
        threshold: f64,
        best: f64,
        nearest: String,
    },
    #[error("block {index}: search content is empty")]
    EmptySearch { index: usize },
}

impl DiffError {
    /// 0-based index of the block that failed.
    pub fn block_index(&self) -> usize {
        match self {
            DiffError::Ambiguous { index, .. }
            | DiffError::AmbiguousFuzzy { index, .. }
            | DiffError::NoMatch { index, .. }
            | DiffError::EmptySearch { index } => *index,
        }
    }
}

/// The result of applying an ordered block list.
///
/// A failing block aborts the patch, but blocks already applied stay
/// applied — `content` always reflects the `applied` count.
#[derive(Debug)]
pub struct DiffReport {
    pub content: String,
    pub applied: usize,
    pub error: Option<DiffError>,
}

impl DiffReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Apply `blocks` to `content` in order.  Each block is tried against the
/// five matchers in priority order; the first success wins.
pub fn apply_blocks(content: &str, blocks: &[DiffBlock], threshold: f64) -> DiffReport {
    let mut current = content.to_string();
    for (index, block) in blocks.iter().enumerate() {
        match apply_one(&current, block, index, threshold) {
            Ok(next) => current = next,
            Err(error) => {
                return DiffReport {
                    content: current,
                    applied: index,
                    error: Some(error),
                };
            }
        }
    }
    DiffReport {
        content: current,
        applied: blocks.len(),
        error: None,
    }
}

fn apply_one(
    content: &str,
    block: &DiffBlock,
    index: usize,
    threshold: f64,
) -> Result<String, DiffError> {
    if block.search.is_empty() {
        return Err(DiffError::EmptySearch { index });
    }

    // ── Tier 1: exact, unique ────────────────────────────────────────────────
    let occurrences: Vec<usize> = content.match_indices(&block.search).map(|(i, _)| i).collect();
    match occurrences.len() {
        1 => {
            let at = occurrences[0];
            let mut out = String::with_capacity(
                content.len() - block.search.len() + block.replace.len(),
            );
            out.push_str(&content[..at]);
            out.push_str(&block.replace);
            out.push_str(&content[at + block.search.len()..]);
            return Ok(out);
        }
        0 => {}
        count => return Err(DiffError::Ambiguous { index, count }),
    }

    let had_trailing_newline = content.ends_with('\n');
    let file_lines: Vec<&str> = content.lines().collect();
    let search_lines: Vec<&str> = block.search.lines().collect();
    let replace_lines: Vec<&str> = block.replace.lines().collect();
    let n = search_lines.len();

    if n == 0 || file_lines.len() < n {
        return Err(no_match_error(&file_lines, &search_lines, index, threshold, 0.0));
    }

    let last = file_lines.len() - n;
    let mut best_seen = 0.0_f64;

    // ── Tier 2: line-hint fuzzy ──────────────────────────────────────────────
    if let Some(hint) = block.start_line_hint {
        let center = hint.saturating_sub(1).min(last);
        let lo = center.saturating_sub(HINT_WINDOW);
        let hi = (center + HINT_WINDOW).min(last);
        match fuzzy_scan(&file_lines, &search_lines, lo, hi, center, threshold, index) {
            Ok(Some((pos, sim))) => {
                debug!(pos, sim, "diff block matched by line-hint fuzzy tier");
                return Ok(splice(
                    &file_lines,
                    pos,
                    n,
                    &replace_lines,
                    &search_lines,
                    had_trailing_newline,
                ));
            }
            Ok(None) => {}
            Err(e) => return Err(e),
        }
        if let Some(b) = fuzzy_best(&file_lines, &search_lines, lo, hi) {
            best_seen = best_seen.max(b);
        }
    }

    // ── Tier 3: whitespace-flexible ──────────────────────────────────────────
    let ws_search: Vec<String> = search_lines.iter().map(|l| collapse_ws(l)).collect();
    for i in 0..=last {
        if (0..n).all(|j| collapse_ws(file_lines[i + j]) == ws_search[j]) {
            debug!(pos = i, "diff block matched by whitespace-flexible tier");
            return Ok(splice(
                &file_lines,
                i,
                n,
                &replace_lines,
                &search_lines,
                had_trailing_newline,
            ));
        }
    }

    // ── Tier 4: line-trimmed ─────────────────────────────────────────────────
    for i in 0..=last {
        if (0..n).all(|j| file_lines[i + j].trim() == search_lines[j].trim()) {
            debug!(pos = i, "diff block matched by line-trimmed tier");
            return Ok(splice(
                &file_lines,
                i,
                n,
                &replace_lines,
                &search_lines,
                had_trailing_newline,
            ));
        }
    }

    // ── Tier 5: middle-out fuzzy ─────────────────────────────────────────────
    let mid = last / 2;
    match fuzzy_scan(&file_lines, &search_lines, 0, last, mid, threshold, index) {
        Ok(Some((pos, sim))) => {
            debug!(pos, sim, "diff block matched by middle-out fuzzy tier");
            return Ok(splice(
                &file_lines,
                pos,
                n,
                &replace_lines,
                &search_lines,
                had_trailing_newline,
            ));
        }
        Ok(None) => {}
        Err(e) => return Err(e),
    }
    if let Some(b) = fuzzy_best(&file_lines, &search_lines, 0, last) {
        best_seen = best_seen.max(b);
    }

    Err(no_match_error(
        &file_lines,
        &search_lines,
        index,
        threshold,
        best_seen,
    ))
}

// ─── Fuzzy matching ───────────────────────────────────────────────────────────

/// Scan windows `lo..=hi`, ordered by distance from `center`, for the best
/// normalized-similarity match.  Returns `Ok(Some((pos, sim)))` on a unique
/// accepted match, `Ok(None)` when nothing reaches the threshold, and an
/// ambiguity error when a non-overlapping runner-up comes within 90% of the
/// best candidate.
fn fuzzy_scan(
    file_lines: &[&str],
    search_lines: &[&str],
    lo: usize,
    hi: usize,
    center: usize,
    threshold: f64,
    index: usize,
) -> Result<Option<(usize, f64)>, DiffError> {
    let needle = normalize(&search_lines.join("\n"));
    let n = search_lines.len();

    let mut order: Vec<usize> = (lo..=hi).collect();
    order.sort_by_key(|&i| (i.abs_diff(center), i));

    let mut candidates: Vec<(usize, f64)> = Vec::new();
    for i in order {
        let hay = normalize(&file_lines[i..i + n].join("\n"));
        let sim = similarity(&needle, &hay);
        if sim >= threshold {
            candidates.push((i, sim));
        }
    }

    // Candidates are in scan order; strict comparison keeps the window
    // nearest the scan origin on equal similarity.
    let mut best: Option<(usize, f64)> = None;
    for &(pos, sim) in &candidates {
        if best.map(|(_, b)| sim > b).unwrap_or(true) {
            best = Some((pos, sim));
        }
    }
    let Some((best_pos, best_sim)) = best else {
        return Ok(None);
    };

    // Overlapping windows share most of their content and would trip the
    // runner-up check on every match; only distinct locations count.
    let runner_up = candidates
        .iter()
        .filter(|(pos, _)| pos.abs_diff(best_pos) >= n)
        .map(|&(_, sim)| sim)
        .fold(None::<f64>, |acc, s| Some(acc.map_or(s, |a| a.max(s))));

    if let Some(second) = runner_up {
        if second >= best_sim * AMBIGUITY_RATIO {
            return Err(DiffError::AmbiguousFuzzy {
                index,
                best: best_sim,
                second,
            });
        }
    }
    Ok(Some((best_pos, best_sim)))
}

/// Best similarity observed across `lo..=hi`, for failure reporting.
fn fuzzy_best(file_lines: &[&str], search_lines: &[&str], lo: usize, hi: usize) -> Option<f64> {
    let needle = normalize(&search_lines.join("\n"));
    let n = search_lines.len();
    (lo..=hi)
        .map(|i| similarity(&needle, &normalize(&file_lines[i..i + n].join("\n"))))
        .fold(None, |acc, s| Some(acc.map_or(s, |a: f64| a.max(s))))
}

/// Lowercase and collapse every whitespace run to a single space.
fn normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_ws = false;
    for c in s.to_lowercase().chars() {
        if c.is_whitespace() {
            if !in_ws && !out.is_empty() {
                out.push(' ');
            }
            in_ws = true;
        } else {
            out.push(c);
            in_ws = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Collapse runs of spaces/tabs to one space and strip trailing whitespace.
/// Leading indentation collapses too, which is exactly what the
/// whitespace-flexible tier wants.
fn collapse_ws(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_run = false;
    for c in line.chars() {
        if c == ' ' || c == '\t' {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out.trim_end().to_string()
}

/// `1 − edit_distance / max_len` over chars; 1.0 for two empty strings.
fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (edit_distance(a, b) as f64) / (max_len as f64)
}

/// Two-row Levenshtein over chars.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr: Vec<usize> = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

// ─── Replacement and indentation ─────────────────────────────────────────────

/// Replace `n` lines at `pos` with the replacement and reassemble the file.
///
/// Only the non-exact tiers reach this point, so indentation preservation
/// always applies: the replacement is shifted by the difference between the
/// first matched file line and the first search line.
fn splice(
    file_lines: &[&str],
    pos: usize,
    n: usize,
    replace_lines: &[&str],
    search_lines: &[&str],
    had_trailing_newline: bool,
) -> String {
    let file_indent = leading_ws(file_lines[pos]);
    let search_indent = leading_ws(search_lines[0]);
    let adjusted = adjust_indentation(replace_lines, file_indent, search_indent);

    let mut out: Vec<String> = file_lines[..pos].iter().map(|l| l.to_string()).collect();
    out.extend(adjusted);
    out.extend(file_lines[pos + n..].iter().map(|l| l.to_string()));

    let mut joined = out.join("\n");
    if had_trailing_newline {
        joined.push('\n');
    }
    joined
}

fn leading_ws(line: &str) -> &str {
    let end = line
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| i)
        .unwrap_or(line.len());
    &line[..end]
}

/// Align replacement lines with the indentation actually found in the file.
///
/// When the file is more indented than the search text, the missing prefix is
/// prepended to every non-empty line; when less, up to the difference in
/// leading whitespace characters is stripped.
fn adjust_indentation(
    replace_lines: &[&str],
    file_indent: &str,
    search_indent: &str,
) -> Vec<String> {
    let fi = file_indent.chars().count();
    let si = search_indent.chars().count();
    replace_lines
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                return line.to_string();
            }
            if fi > si {
                let extra: String = file_indent.chars().skip(si).collect();
                format!("{extra}{line}")
            } else if fi < si {
                let strip = si - fi;
                let ws_len = leading_ws(line).chars().count();
                let skip = strip.min(ws_len);
                line.chars().skip(skip).collect()
            } else {
                line.to_string()
            }
        })
        .collect()
}

// ─── Failure reporting ────────────────────────────────────────────────────────

fn no_match_error(
    file_lines: &[&str],
    search_lines: &[&str],
    index: usize,
    threshold: f64,
    best: f64,
) -> DiffError {
    DiffError::NoMatch {
        index,
        threshold,
        best,
        nearest: nearest_block_note(file_lines, search_lines),
    }
}

/// Render the single most similar window so the model can correct stale
/// context.  Uses a character-diff ratio, which is cheap and good enough for
/// a suggestion.
fn nearest_block_note(file_lines: &[&str], search_lines: &[&str]) -> String {
    let n = search_lines.len().max(1);
    if file_lines.len() < n {
        return String::new();
    }
    let needle = search_lines.join("\n");
    let mut best: Option<(f64, usize)> = None;
    for i in 0..=(file_lines.len() - n) {
        let hay = file_lines[i..i + n].join("\n");
        let ratio = TextDiff::from_chars(needle.as_str(), hay.as_str()).ratio() as f64;
        if best.map(|(r, _)| ratio > r).unwrap_or(true) {
            best = Some((ratio, i));
        }
    }
    match best {
        Some((ratio, at)) if ratio > 0.3 => {
            let mut note = format!(
                "\nNearest candidate at line {} ({:.0}%):\n",
                at + 1,
                ratio * 100.0
            );
            for l in &file_lines[at..at + n] {
                note.push_str(&format!("  |{l}|\n"));
            }
            note.push_str("Re-read the file, fix the search content, and retry.");
            note
        }
        _ => String::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
