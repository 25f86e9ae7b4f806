// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tracing::warn;

/// Ring size: this many identical fingerprints in a row flag a repetition.
const RING_SIZE: usize = 3;
/// Frequency cap per fingerprint and per tool name for mutating tools.
const MUTATING_CAP: u32 = 8;
/// Frequency cap per fingerprint and per tool name for read-only tools.
const READ_ONLY_CAP: u32 = 30;
/// Identical consecutive calls beyond this many are a breach on their own.
const CONSECUTIVE_CAP: u32 = 5;
/// Model misbehaviour (no tool use, bad arguments, unknown tools) trips here.
const MISBEHAVIOR_LIMIT: u32 = 8;

/// Canonical encoding of a tool call.  serde_json objects iterate in sorted
/// key order, so equal argument sets always encode identically.
pub fn fingerprint(tool_key: &str, args: &Value) -> String {
    format!("{tool_key}:{args}")
}

/// What the detector concluded about the latest call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepetitionVerdict {
    Ok,
    /// First threshold breach: inject a warning notice and continue.
    Warn { reason: String },
    /// Second breach: declare a loop and fail the task.
    Loop { reason: String },
}

/// Flags loops by fingerprint ring and frequency thresholds.
///
/// The ring catches tight A-A-A loops; the frequency caps catch slow loops
/// that interleave other calls; the consecutive cap catches a model hammering
/// one call past any plausible retry need.  The first breach warns, the
/// second fails the task.
#[derive(Debug, Default)]
pub struct RepetitionDetector {
    ring: VecDeque<String>,
    per_fingerprint: HashMap<String, u32>,
    per_tool: HashMap<String, u32>,
    last_fingerprint: Option<String>,
    consecutive: u32,
    strikes: u32,
}

impl RepetitionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call about to be dispatched and judge it.
    pub fn record(&mut self, tool_key: &str, args: &Value, read_only: bool) -> RepetitionVerdict {
        let fp = fingerprint(tool_key, args);
        let cap = if read_only { READ_ONLY_CAP } else { MUTATING_CAP };

        self.ring.push_back(fp.clone());
        if self.ring.len() > RING_SIZE {
            self.ring.pop_front();
        }

        let fp_count = {
            let e = self.per_fingerprint.entry(fp.clone()).or_insert(0);
            *e += 1;
            *e
        };
        let tool_count = {
            let e = self.per_tool.entry(tool_key.to_string()).or_insert(0);
            *e += 1;
            *e
        };

        if self.last_fingerprint.as_deref() == Some(fp.as_str()) {
            self.consecutive += 1;
        } else {
            self.consecutive = 1;
            self.last_fingerprint = Some(fp.clone());
        }

        let mut breach: Option<String> = None;
        if self.ring.len() == RING_SIZE && self.ring.iter().all(|f| *f == fp) {
            breach = Some(format!(
                "the call {tool_key} was repeated {RING_SIZE} times in a row with identical arguments"
            ));
        } else if fp_count > cap {
            breach = Some(format!(
                "identical {tool_key} call issued {fp_count} times (cap {cap})"
            ));
        } else if tool_count > cap {
            breach = Some(format!(
                "tool {tool_key} called {tool_count} times (cap {cap})"
            ));
        } else if self.consecutive > CONSECUTIVE_CAP {
            breach = Some(format!(
                "the same call was issued {} times consecutively",
                self.consecutive
            ));
        }

        match breach {
            None => RepetitionVerdict::Ok,
            Some(reason) => {
                self.strikes += 1;
                if self.strikes == 1 {
                    warn!(tool_key, %reason, "repetition warning");
                    RepetitionVerdict::Warn { reason }
                } else {
                    warn!(tool_key, %reason, "loop detected");
                    RepetitionVerdict::Loop { reason }
                }
            }
        }
    }
}

/// Counts general model misbehaviour: replies with no tool use, unknown tool
/// names, unparseable arguments.
#[derive(Debug, Default)]
pub struct MisbehaviorCounter {
    count: u32,
}

impl MisbehaviorCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump and report whether the limit tripped.
    pub fn bump(&mut self) -> bool {
        self.count += 1;
        self.count >= MISBEHAVIOR_LIMIT
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Fingerprints ──────────────────────────────────────────────────────────

    #[test]
    fn fingerprint_is_canonical_across_key_order() {
        let a: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        assert_eq!(fingerprint("t", &a), fingerprint("t", &b));
    }

    #[test]
    fn fingerprint_differs_by_args() {
        assert_ne!(
            fingerprint("t", &json!({"path": "a"})),
            fingerprint("t", &json!({"path": "b"}))
        );
    }

    // ── Ring detection ────────────────────────────────────────────────────────

    #[test]
    fn three_identical_calls_warn() {
        let mut d = RepetitionDetector::new();
        let args = json!({"path": "a.rs"});
        assert_eq!(d.record("local::file_read", &args, true), RepetitionVerdict::Ok);
        assert_eq!(d.record("local::file_read", &args, true), RepetitionVerdict::Ok);
        assert!(matches!(
            d.record("local::file_read", &args, true),
            RepetitionVerdict::Warn { .. }
        ));
    }

    #[test]
    fn two_identical_then_different_is_ok() {
        let mut d = RepetitionDetector::new();
        let a = json!({"path": "a.rs"});
        let b = json!({"path": "b.rs"});
        assert_eq!(d.record("local::file_read", &a, true), RepetitionVerdict::Ok);
        assert_eq!(d.record("local::file_read", &a, true), RepetitionVerdict::Ok);
        assert_eq!(d.record("local::file_read", &b, true), RepetitionVerdict::Ok);
    }

    #[test]
    fn second_breach_declares_loop() {
        let mut d = RepetitionDetector::new();
        let args = json!({"path": "a.rs"});
        for _ in 0..2 {
            let _ = d.record("local::file_read", &args, true);
        }
        assert!(matches!(
            d.record("local::file_read", &args, true),
            RepetitionVerdict::Warn { .. }
        ));
        assert!(matches!(
            d.record("local::file_read", &args, true),
            RepetitionVerdict::Loop { .. }
        ));
    }

    // ── Frequency caps ────────────────────────────────────────────────────────

    #[test]
    fn mutating_fingerprint_cap_is_eight() {
        let mut d = RepetitionDetector::new();
        // Interleave a second tool so the ring and consecutive counters
        // never trip; only the per-fingerprint cap can fire.
        let w = json!({"path": "out.rs", "content": "x"});
        let mut verdicts = Vec::new();
        for i in 0..9 {
            verdicts.push(d.record("local::file_write", &w, false));
            let _ = d.record("local::file_read", &json!({ "path": format!("f{i}") }), true);
        }
        assert!(verdicts[..8].iter().all(|v| *v == RepetitionVerdict::Ok));
        assert!(matches!(verdicts[8], RepetitionVerdict::Warn { .. }));
    }

    #[test]
    fn read_only_cap_is_higher() {
        let mut d = RepetitionDetector::new();
        let mut warned = false;
        for i in 0..40 {
            // Same tool, alternating args: per-tool cap applies, ring does not.
            let v = d.record("local::file_read", &json!({ "path": format!("f{}", i % 2) }), true);
            if !matches!(v, RepetitionVerdict::Ok) {
                // per-tool cap of 30 trips on call 31
                assert_eq!(i, 30);
                warned = true;
                break;
            }
        }
        assert!(warned);
    }

    // ── Consecutive cap ───────────────────────────────────────────────────────

    #[test]
    fn ring_warns_before_consecutive_cap() {
        let mut d = RepetitionDetector::new();
        let args = json!({"q": 1});
        let mut first_warn_at = None;
        for i in 0..6 {
            if !matches!(d.record("t", &args, true), RepetitionVerdict::Ok) {
                first_warn_at = Some(i);
                break;
            }
        }
        // The ring (3 identical) fires before the consecutive cap (5).
        assert_eq!(first_warn_at, Some(2));
    }

    // ── Misbehaviour counter ──────────────────────────────────────────────────

    #[test]
    fn misbehavior_trips_at_eight() {
        let mut m = MisbehaviorCounter::new();
        for _ in 0..7 {
            assert!(!m.bump());
        }
        assert!(m.bump());
        assert_eq!(m.count(), 8);
    }
}
