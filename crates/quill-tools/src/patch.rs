// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

use crate::diff::DiffBlock;

const UPDATE_PREFIX: &str = "*** Update File: ";
const ADD_PREFIX: &str = "*** Add File: ";
const DELETE_PREFIX: &str = "*** Delete File: ";

/// One hunk of an update operation: the context+removed side must already be
/// in the file, the context+added side replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchHunk {
    pub search: Vec<String>,
    pub replace: Vec<String>,
}

impl PatchHunk {
    /// Lower to the diff engine's block form.
    pub fn to_diff_block(&self) -> DiffBlock {
        DiffBlock::new(self.search.join("\n"), self.replace.join("\n"))
    }
}

/// A parsed file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    Update { path: String, hunks: Vec<PatchHunk> },
    Add { path: String, content: String },
    Delete { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Update { path, .. } | PatchOp::Add { path, .. } | PatchOp::Delete { path } => {
                path
            }
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("patch contains no file operations")]
    Empty,
    #[error("line {line}: expected a file header, found: {text}")]
    UnexpectedLine { line: usize, text: String },
    #[error("file header on line {line} has an empty path")]
    EmptyPath { line: usize },
    #[error("update for '{path}' contains no hunks")]
    NoHunks { path: String },
}

/// Parse the multi-file patch format:
///
/// ```text
/// *** Update File: src/lib.rs
///  context line
/// -removed line
/// +added line
///
///  second hunk (hunks are separated by blank lines)
/// -old
/// +new
/// *** Add File: src/new.rs
/// +entire content
/// *** Delete File: src/old.rs
/// ```
///
/// `*** Begin Patch` / `*** End Patch` framing lines are tolerated and
/// skipped when present.
pub fn parse_patch(input: &str) -> Result<Vec<PatchOp>, PatchError> {
    let mut ops: Vec<PatchOp> = Vec::new();
    let lines: Vec<&str> = input.lines().collect();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_end();
        if trimmed.is_empty()
            || trimmed == "*** Begin Patch"
            || trimmed == "*** End Patch"
        {
            i += 1;
            continue;
        }
        if let Some(path) = trimmed.strip_prefix(UPDATE_PREFIX) {
            let path = non_empty_path(path, i)?;
            let (hunks, next) = collect_hunks(&lines, i + 1);
            if hunks.is_empty() {
                return Err(PatchError::NoHunks { path });
            }
            ops.push(PatchOp::Update { path, hunks });
            i = next;
        } else if let Some(path) = trimmed.strip_prefix(ADD_PREFIX) {
            let path = non_empty_path(path, i)?;
            let (content, next) = collect_add_content(&lines, i + 1);
            ops.push(PatchOp::Add { path, content });
            i = next;
        } else if let Some(path) = trimmed.strip_prefix(DELETE_PREFIX) {
            let path = non_empty_path(path, i)?;
            ops.push(PatchOp::Delete { path });
            i += 1;
        } else {
            return Err(PatchError::UnexpectedLine {
                line: i + 1,
                text: trimmed.to_string(),
            });
        }
    }

    if ops.is_empty() {
        return Err(PatchError::Empty);
    }
    Ok(ops)
}

fn non_empty_path(raw: &str, line_idx: usize) -> Result<String, PatchError> {
    let path = raw.trim().to_string();
    if path.is_empty() {
        return Err(PatchError::EmptyPath { line: line_idx + 1 });
    }
    Ok(path)
}

/// Collect hunk lines until the next `*** ` header.  Blank lines separate
/// hunks; lines start with ` ` (context, both sides), `-` (removed, search
/// side only), or `+` (added, replace side only).
fn collect_hunks(lines: &[&str], mut i: usize) -> (Vec<PatchHunk>, usize) {
    let mut hunks: Vec<PatchHunk> = Vec::new();
    let mut search: Vec<String> = Vec::new();
    let mut replace: Vec<String> = Vec::new();

    let mut flush = |search: &mut Vec<String>, replace: &mut Vec<String>| {
        if !search.is_empty() || !replace.is_empty() {
            hunks.push(PatchHunk {
                search: std::mem::take(search),
                replace: std::mem::take(replace),
            });
        }
    };

    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("*** ") {
            break;
        }
        if line.is_empty() {
            flush(&mut search, &mut replace);
            i += 1;
            continue;
        }
        if let Some(rest) = line.strip_prefix('+') {
            replace.push(rest.to_string());
        } else if let Some(rest) = line.strip_prefix('-') {
            search.push(rest.to_string());
        } else if let Some(rest) = line.strip_prefix(' ') {
            search.push(rest.to_string());
            replace.push(rest.to_string());
        }
        // Anything else inside a hunk body is noise; skip it.
        i += 1;
    }
    flush(&mut search, &mut replace);
    (hunks, i)
}

/// Collect the `+`-prefixed content of an Add operation.  Unprefixed lines
/// are accepted verbatim so slightly sloppy model output still applies.
fn collect_add_content(lines: &[&str], mut i: usize) -> (String, usize) {
    let mut content: Vec<String> = Vec::new();
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("*** ") {
            break;
        }
        if let Some(rest) = line.strip_prefix('+') {
            content.push(rest.to_string());
        } else {
            content.push(line.to_string());
        }
        i += 1;
    }
    // Drop trailing blank lines introduced by the header spacing.
    while content.last().map(|l| l.is_empty()).unwrap_or(false) {
        content.pop();
    }
    let mut text = content.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    (text, i)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_update_with_one_hunk() {
        let patch = "\
*** Update File: src/lib.rs
 fn main() {
-    old();
+    new();
 }
";
        let ops = parse_patch(patch).unwrap();
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            PatchOp::Update { path, hunks } => {
                assert_eq!(path, "src/lib.rs");
                assert_eq!(hunks.len(), 1);
                assert_eq!(
                    hunks[0].search,
                    vec!["fn main() {", "    old();", "}"]
                );
                assert_eq!(
                    hunks[0].replace,
                    vec!["fn main() {", "    new();", "}"]
                );
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn blank_lines_separate_hunks() {
        let patch = "\
*** Update File: a.txt
-one
+ONE

-two
+TWO
";
        let ops = parse_patch(patch).unwrap();
        match &ops[0] {
            PatchOp::Update { hunks, .. } => {
                assert_eq!(hunks.len(), 2);
                assert_eq!(hunks[0].search, vec!["one"]);
                assert_eq!(hunks[1].replace, vec!["TWO"]);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn parse_add_collects_plus_lines() {
        let patch = "\
*** Add File: docs/note.md
+# Note
+body line
";
        let ops = parse_patch(patch).unwrap();
        assert_eq!(
            ops[0],
            PatchOp::Add {
                path: "docs/note.md".into(),
                content: "# Note\nbody line\n".into()
            }
        );
    }

    #[test]
    fn parse_delete_is_header_only() {
        let patch = "*** Delete File: tmp/scratch.rs\n";
        let ops = parse_patch(patch).unwrap();
        assert_eq!(
            ops[0],
            PatchOp::Delete {
                path: "tmp/scratch.rs".into()
            }
        );
    }

    #[test]
    fn mixed_operations_keep_order() {
        let patch = "\
*** Update File: a.rs
-x
+y
*** Add File: b.rs
+fn b() {}
*** Delete File: c.rs
";
        let ops = parse_patch(patch).unwrap();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].path(), "a.rs");
        assert_eq!(ops[1].path(), "b.rs");
        assert_eq!(ops[2].path(), "c.rs");
    }

    #[test]
    fn begin_end_framing_is_tolerated() {
        let patch = "\
*** Begin Patch
*** Update File: a.rs
-x
+y
*** End Patch
";
        let ops = parse_patch(patch).unwrap();
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn context_lines_appear_on_both_sides() {
        let patch = "\
*** Update File: a.rs
 shared
-gone
+here
 also shared
";
        let ops = parse_patch(patch).unwrap();
        match &ops[0] {
            PatchOp::Update { hunks, .. } => {
                assert_eq!(hunks[0].search, vec!["shared", "gone", "also shared"]);
                assert_eq!(hunks[0].replace, vec!["shared", "here", "also shared"]);
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn hunk_lowers_to_diff_block() {
        let hunk = PatchHunk {
            search: vec!["a".into(), "b".into()],
            replace: vec!["a".into(), "c".into()],
        };
        let block = hunk.to_diff_block();
        assert_eq!(block.search, "a\nb");
        assert_eq!(block.replace, "a\nc");
        assert_eq!(block.start_line_hint, None);
    }

    #[test]
    fn empty_patch_is_an_error() {
        assert_eq!(parse_patch(""), Err(PatchError::Empty));
        assert_eq!(
            parse_patch("*** Begin Patch\n*** End Patch\n"),
            Err(PatchError::Empty)
        );
    }

    #[test]
    fn update_without_hunks_is_an_error() {
        let patch = "*** Update File: a.rs\n*** Delete File: b.rs\n";
        assert_eq!(
            parse_patch(patch),
            Err(PatchError::NoHunks { path: "a.rs".into() })
        );
    }

    #[test]
    fn garbage_outside_operations_is_an_error() {
        let err = parse_patch("here is a patch:\n*** Delete File: a.rs\n").unwrap_err();
        assert!(matches!(err, PatchError::UnexpectedLine { line: 1, .. }));
    }

    #[test]
    fn empty_path_is_an_error() {
        let err = parse_patch("*** Delete File:   \n").unwrap_err();
        assert!(matches!(err, PatchError::EmptyPath { .. }));
    }

    #[test]
    fn add_without_plus_prefix_is_accepted() {
        let patch = "*** Add File: a.txt\nraw line\n";
        let ops = parse_patch(patch).unwrap();
        assert_eq!(
            ops[0],
            PatchOp::Add {
                path: "a.txt".into(),
                content: "raw line\n".into()
            }
        );
    }
}
