// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod schema;

pub use schema::{AgentKind, ApprovalMode, AutoApprove, RunnerConfig};
