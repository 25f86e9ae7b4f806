// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod catalog;
pub mod diff;
pub mod dispatch;
pub mod gate;
pub mod ignore;
pub mod patch;
pub mod tool;

pub use catalog::{sanitize_key, Resolution, ToolCatalog, COMPLETION_TOOL};
pub use diff::{apply_blocks, DiffBlock, DiffError, DiffReport, DEFAULT_SIMILARITY_THRESHOLD};
pub use dispatch::{DispatchResult, ToolDispatcher};
pub use gate::{
    agent_allows, ApprovalGate, ApprovalRequest, ApprovalResponse, APPROVAL_TIMEOUT,
};
pub use ignore::{
    clear_ignore_cache, matcher_for_root, relative_to_root, IgnoreMatcher, IGNORE_FILE_NAME,
};
pub use patch::{parse_patch, PatchError, PatchHunk, PatchOp};
pub use tool::{ToolCall, ToolCategory, ToolOutput, ToolSpec};
