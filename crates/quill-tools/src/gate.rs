// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use quill_config::{AgentKind, ApprovalMode, AutoApprove};

use crate::tool::{ToolCategory, ToolSpec};

/// How long the runner waits for the user before auto-rejecting.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Agent permission (hard-coded allow-lists) ───────────────────────────────

/// Keys the read-only kinds may call in addition to any `Safe` tool.
const PLANNER_EXTRA: &[&str] = &["agent::delegate", "agent::delegate_parallel"];

/// Decide whether `kind` is allowed to call the tool at all.
///
/// This check is hard-coded per agent kind and runs before any approval
/// dialog; a violation is a denial with reason, never a prompt.
pub fn agent_allows(kind: AgentKind, spec: &ToolSpec) -> Result<(), String> {
    let allowed = match kind {
        // The coder has the full surface.
        AgentKind::Coder => true,
        // The planner reads and delegates but never mutates directly.
        AgentKind::Planner => spec.is_read_only() || PLANNER_EXTRA.contains(&spec.key.as_str()),
        // Researcher and reviewer are strictly read-only.
        AgentKind::Researcher | AgentKind::Reviewer => {
            spec.is_read_only() && !spec.key.starts_with("agent::")
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(format!(
            "agent kind '{kind}' is not permitted to call '{}'",
            spec.key
        ))
    }
}

// ─── User approval ────────────────────────────────────────────────────────────

/// The user's answer to an approval request.
#[derive(Debug, Clone)]
pub struct ApprovalResponse {
    pub approved: bool,
    /// Optional guidance to forward to the model alongside the decision.
    pub feedback: Option<String>,
    /// Why the call was rejected, when it was.
    pub reason: Option<String>,
}

impl ApprovalResponse {
    pub fn approved() -> Self {
        Self {
            approved: true,
            feedback: None,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: None,
            reason: Some(reason.into()),
        }
    }
}

/// An approval request published on the event channel.  The consumer (UI)
/// answers through `respond`; dropping it counts as a denial.
#[derive(Debug)]
pub struct ApprovalRequest {
    /// Correlation id, unique per request.
    pub id: String,
    pub tool_key: String,
    /// Compact rendering of the arguments for display.
    pub summary: String,
    pub respond: oneshot::Sender<ApprovalResponse>,
}

/// Decides whether a call may run and whether the user must confirm first.
pub struct ApprovalGate {
    mode: ApprovalMode,
    auto: AutoApprove,
    /// Where approval requests are published.  `None` in embeddings without
    /// a UI; any prompt-requiring call is then denied outright.
    requests: Option<mpsc::Sender<ApprovalRequest>>,
}

impl ApprovalGate {
    pub fn new(
        mode: ApprovalMode,
        auto: AutoApprove,
        requests: Option<mpsc::Sender<ApprovalRequest>>,
    ) -> Self {
        Self {
            mode,
            auto,
            requests,
        }
    }

    /// Whether a call to `spec` needs user confirmation under this gate.
    pub fn needs_approval(&self, spec: &ToolSpec) -> bool {
        if self.mode == ApprovalMode::Autonomous {
            return false;
        }
        // Dangerous tools always prompt outside fully-autonomous mode.
        if spec.category == ToolCategory::Dangerous {
            return true;
        }
        if spec.is_mcp() && self.auto.mcp {
            return false;
        }
        match self.mode {
            ApprovalMode::Autonomous => false,
            ApprovalMode::AutoApproveReads => !matches!(spec.category, ToolCategory::Safe),
            ApprovalMode::ApproveAll => !match spec.category {
                ToolCategory::Safe => self.auto.reads,
                ToolCategory::Write => self.auto.writes,
                ToolCategory::Execute => self.auto.execute,
                ToolCategory::Dangerous => false,
            },
        }
    }

    /// Publish an approval request and wait for the answer.
    ///
    /// Auto-rejects after [`APPROVAL_TIMEOUT`] with no response, and when no
    /// request channel is wired up at all.
    pub async fn request(&self, tool_key: &str, summary: String) -> ApprovalResponse {
        let Some(tx) = &self.requests else {
            return ApprovalResponse::denied("no approval channel configured");
        };
        let (respond, rx) = oneshot::channel();
        let id = uuid::Uuid::new_v4().to_string();
        debug!(%id, tool_key, "requesting approval");
        let req = ApprovalRequest {
            id: id.clone(),
            tool_key: tool_key.to_string(),
            summary,
            respond,
        };
        if tx.send(req).await.is_err() {
            warn!(tool_key, "approval channel closed; denying");
            return ApprovalResponse::denied("approval channel closed");
        }
        match tokio::time::timeout(APPROVAL_TIMEOUT, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => ApprovalResponse::denied("approval request dismissed"),
            Err(_) => {
                warn!(%id, tool_key, "approval timed out; denying");
                ApprovalResponse::denied("approval timed out after 5 minutes")
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(key: &str, category: ToolCategory) -> ToolSpec {
        ToolSpec::new(key, "", json!({}), category)
    }

    // ── Agent permission ──────────────────────────────────────────────────────

    #[test]
    fn coder_may_call_anything() {
        for cat in [
            ToolCategory::Safe,
            ToolCategory::Write,
            ToolCategory::Execute,
            ToolCategory::Dangerous,
        ] {
            assert!(agent_allows(AgentKind::Coder, &spec("local::x", cat)).is_ok());
        }
    }

    #[test]
    fn researcher_denied_write_tools() {
        let err = agent_allows(
            AgentKind::Researcher,
            &spec("local::file_write", ToolCategory::Write),
        )
        .unwrap_err();
        assert!(err.contains("researcher"));
        assert!(err.contains("local::file_write"));
    }

    #[test]
    fn researcher_may_read() {
        assert!(agent_allows(
            AgentKind::Researcher,
            &spec("local::file_read", ToolCategory::Safe)
        )
        .is_ok());
    }

    #[test]
    fn researcher_denied_delegation() {
        assert!(agent_allows(
            AgentKind::Researcher,
            &spec("agent::delegate", ToolCategory::Safe)
        )
        .is_err());
    }

    #[test]
    fn planner_may_delegate_but_not_write() {
        assert!(agent_allows(
            AgentKind::Planner,
            &spec("agent::delegate", ToolCategory::Safe)
        )
        .is_ok());
        assert!(agent_allows(
            AgentKind::Planner,
            &spec("local::file_write", ToolCategory::Write)
        )
        .is_err());
    }

    // ── needs_approval matrix ─────────────────────────────────────────────────

    fn gate(mode: ApprovalMode, auto: AutoApprove) -> ApprovalGate {
        ApprovalGate::new(mode, auto, None)
    }

    #[test]
    fn autonomous_never_asks() {
        let g = gate(ApprovalMode::Autonomous, AutoApprove::default());
        assert!(!g.needs_approval(&spec("local::x", ToolCategory::Dangerous)));
        assert!(!g.needs_approval(&spec("local::x", ToolCategory::Execute)));
    }

    #[test]
    fn auto_approve_reads_asks_for_writes_only() {
        let g = gate(ApprovalMode::AutoApproveReads, AutoApprove::default());
        assert!(!g.needs_approval(&spec("local::file_read", ToolCategory::Safe)));
        assert!(g.needs_approval(&spec("local::file_write", ToolCategory::Write)));
        assert!(g.needs_approval(&spec("local::execute_command", ToolCategory::Execute)));
        assert!(g.needs_approval(&spec("local::rm", ToolCategory::Dangerous)));
    }

    #[test]
    fn approve_all_respects_auto_flags() {
        let auto = AutoApprove {
            reads: true,
            writes: true,
            execute: false,
            mcp: false,
        };
        let g = gate(ApprovalMode::ApproveAll, auto);
        assert!(!g.needs_approval(&spec("local::file_read", ToolCategory::Safe)));
        assert!(!g.needs_approval(&spec("local::file_write", ToolCategory::Write)));
        assert!(g.needs_approval(&spec("local::execute_command", ToolCategory::Execute)));
    }

    #[test]
    fn dangerous_prompts_even_with_auto_flags() {
        let auto = AutoApprove {
            reads: true,
            writes: true,
            execute: true,
            mcp: true,
        };
        let g = gate(ApprovalMode::ApproveAll, auto);
        assert!(g.needs_approval(&spec("local::rm", ToolCategory::Dangerous)));
    }

    #[test]
    fn mcp_auto_approve_skips_prompt() {
        let auto = AutoApprove {
            mcp: true,
            ..AutoApprove::default()
        };
        let g = gate(ApprovalMode::ApproveAll, auto);
        assert!(!g.needs_approval(&spec("github::create_issue", ToolCategory::Write)));
    }

    // ── request / response plumbing ───────────────────────────────────────────

    #[tokio::test]
    async fn no_channel_means_denied() {
        let g = gate(ApprovalMode::ApproveAll, AutoApprove::default());
        let resp = g.request("local::file_write", "write a.txt".into()).await;
        assert!(!resp.approved);
        assert!(resp.reason.unwrap().contains("no approval channel"));
    }

    #[tokio::test]
    async fn response_round_trip() {
        let (tx, mut rx) = mpsc::channel::<ApprovalRequest>(4);
        let g = ApprovalGate::new(ApprovalMode::ApproveAll, AutoApprove::default(), Some(tx));

        let answer = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.tool_key, "local::file_write");
            assert!(!req.id.is_empty());
            let _ = req.respond.send(ApprovalResponse::approved());
        });

        let resp = g.request("local::file_write", "write a.txt".into()).await;
        answer.await.unwrap();
        assert!(resp.approved);
    }

    #[tokio::test]
    async fn dropped_responder_is_denied() {
        let (tx, mut rx) = mpsc::channel::<ApprovalRequest>(4);
        let g = ApprovalGate::new(ApprovalMode::ApproveAll, AutoApprove::default(), Some(tx));

        let dismiss = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            drop(req.respond);
        });

        let resp = g.request("local::execute_command", "rm -rf".into()).await;
        dismiss.await.unwrap();
        assert!(!resp.approved);
        assert!(resp.reason.unwrap().contains("dismissed"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_auto_rejects() {
        let (tx, mut rx) = mpsc::channel::<ApprovalRequest>(4);
        let g = ApprovalGate::new(ApprovalMode::ApproveAll, AutoApprove::default(), Some(tx));

        // Hold the request without answering; paused time lets the 5-minute
        // timer fire instantly.
        let hold = tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            tokio::time::sleep(Duration::from_secs(600)).await;
            drop(req);
        });

        let resp = g.request("local::file_write", "w".into()).await;
        assert!(!resp.approved);
        assert!(resp.reason.unwrap().contains("timed out"));
        hold.abort();
    }
}
