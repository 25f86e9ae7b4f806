// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod budget;
mod compact;
mod context;
mod conversation;
mod delegate;
mod detector;
mod events;
mod files;
mod runner;
mod stream_parser;

pub use budget::{estimate, TokenBudget, AGGRESSIVE_RATIO, HEURISTIC_RATIO};
pub use compact::{condensation_request, progressive_compact, CONDENSATION_PROMPT};
pub use context::{AgentContext, Blackboard, Capabilities, Delegate};
pub use conversation::Conversation;
pub use delegate::{
    aggregate_reports, allowed_targets, parse_parallel_request, parse_serial_request,
    DelegationController, DelegationError, SubTaskReport, SubTaskRequest, TaskStatus,
    DELEGATE_PARALLEL_TOOL, DELEGATE_TOOL, MAX_PARALLEL_SUBTASKS,
};
pub use detector::{fingerprint, MisbehaviorCounter, RepetitionDetector, RepetitionVerdict};
pub use events::{EventSink, RunnerEvent, TaggedEvent};
pub use files::{FileEntry, FileRegistry, FileStat, FileTracker, ToolCallRecord};
pub use runner::{TaskOutcome, ToolRunner};
pub use stream_parser::{ChunkOutput, ParsedToolUse, StreamingXmlParser, COMPLETION_TAG};
