//! Event envelopes: the tagged payload sum type, per-session sequence
//! stamping, and the worker stdout line protocol.
//!
//! An envelope serializes flat: `{"type": "...", ..payload, "seq", "ts_server",
//! "ts_session"}`. `seq` and both timestamps are assigned once by the stamper
//! and never mutated afterwards.

use crate::clock::{default_clock, wall_secs, ClockFn};

/// Session lifecycle stage, carried in `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    Operational,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Initializing => "initializing",
            Stage::Operational => "operational",
            Stage::Stopping => "stopping",
            Stage::Stopped => "stopped",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One event payload. The serde tag drives the wire `type` field.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Hello {
        sid: String,
    },
    Status {
        #[serde(skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
        #[serde(skip_serializing_if = "Option::is_none")]
        log: Option<String>,
    },
    PartialEn {
        text: String,
    },
    PartialZh {
        text: String,
    },
    FinalEn {
        text: String,
    },
    FinalZh {
        text: String,
    },
    Vu {
        rms: f64,
        peak: f64,
    },
    DownloadProgress {
        job_id: String,
        repo_id: String,
        progress: u8,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
        error: String,
    },
}

impl EventPayload {
    pub fn status_stage(stage: Stage) -> Self {
        EventPayload::Status { stage: Some(stage), log: None }
    }
}

/// A stamped event as delivered to subscribers and kept in the replay buffer.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub payload: EventPayload,
    pub seq: u64,
    /// Wall clock at emission (unix seconds, fractional).
    pub ts_server: f64,
    /// Monotonic offset from session start (seconds).
    pub ts_session: f64,
}

/// Per-session stamper: monotonic `seq` from 1 plus dual timestamps.
/// Callers serialize access (the supervisor keeps one behind a mutex per session).
pub struct EventStamper {
    start: f64,
    next_seq: u64,
    clock: ClockFn,
}

impl EventStamper {
    pub fn new() -> Self {
        Self::with_clock(default_clock())
    }

    pub(crate) fn with_clock(clock: ClockFn) -> Self {
        let start = clock();
        Self { start, next_seq: 1, clock }
    }

    pub fn stamp(&mut self, payload: EventPayload) -> Envelope {
        let seq = self.next_seq;
        self.next_seq += 1;
        Envelope {
            payload,
            seq,
            ts_server: wall_secs(),
            ts_session: (self.clock)() - self.start,
        }
    }
}

impl Default for EventStamper {
    fn default() -> Self {
        Self::new()
    }
}

const READY_MARKER: &str = "Ready — start speaking now";

/// Map one worker stdout line to a payload. Empty lines map to None; anything
/// unrecognized becomes a plain `status{log}` so no output is lost.
pub fn parse_worker_line(line: &str) -> Option<EventPayload> {
    let text = line.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(rest) = text.strip_prefix("EN ≫ ") {
        return Some(EventPayload::PartialEn { text: rest.trim().to_string() });
    }
    if let Some(rest) = text.strip_prefix("ZH* ≫ ") {
        return Some(EventPayload::PartialZh { text: rest.trim().to_string() });
    }
    if let Some(rest) = text.strip_prefix("EN(final):") {
        return Some(EventPayload::FinalEn { text: rest.trim().to_string() });
    }
    if let Some(rest) = text.strip_prefix("ZH:") {
        return Some(EventPayload::FinalZh { text: rest.trim().to_string() });
    }
    if text.contains(READY_MARKER) {
        return Some(EventPayload::Status {
            stage: Some(Stage::Operational),
            log: Some(text.to_string()),
        });
    }
    Some(EventPayload::Status { stage: None, log: Some(text.to_string()) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn stamper_seq_is_contiguous_from_one() {
        let mut stamper = EventStamper::new();
        for expect in 1..=5u64 {
            let env = stamper.stamp(EventPayload::PartialEn { text: "x".into() });
            assert_eq!(env.seq, expect);
        }
    }

    #[test]
    fn stamper_session_offset_uses_injected_clock() {
        let t = Arc::new(Mutex::new(100.0));
        let clock: crate::clock::ClockFn = {
            let t = t.clone();
            Arc::new(move || *t.lock().unwrap())
        };
        let mut stamper = EventStamper::with_clock(clock);
        *t.lock().unwrap() = 102.5;
        let env = stamper.stamp(EventPayload::status_stage(Stage::Operational));
        assert!((env.ts_session - 2.5).abs() < 1e-9);
    }

    #[test]
    fn envelope_serializes_flat_with_type_tag() {
        let mut stamper = EventStamper::new();
        let env = stamper.stamp(EventPayload::FinalEn { text: "hello world".into() });
        let v: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(v["type"], "final_en");
        assert_eq!(v["text"], "hello world");
        assert_eq!(v["seq"], 1);
        assert!(v["ts_server"].is_f64() || v["ts_server"].is_u64());
    }

    #[test]
    fn status_omits_absent_fields() {
        let payload = EventPayload::Status { stage: None, log: Some("boot".into()) };
        let v = serde_json::to_value(&payload).unwrap();
        assert_eq!(v["type"], "status");
        assert!(v.get("stage").is_none());
    }

    #[test]
    fn parses_partial_and_final_lines() {
        match parse_worker_line("EN ≫ hello").unwrap() {
            EventPayload::PartialEn { text } => assert_eq!(text, "hello"),
            other => panic!("unexpected payload: {other:?}"),
        }
        match parse_worker_line("ZH* ≫ 你好").unwrap() {
            EventPayload::PartialZh { text } => assert_eq!(text, "你好"),
            other => panic!("unexpected payload: {other:?}"),
        }
        match parse_worker_line("EN(final): hello world").unwrap() {
            EventPayload::FinalEn { text } => assert_eq!(text, "hello world"),
            other => panic!("unexpected payload: {other:?}"),
        }
        match parse_worker_line("ZH: 你好，世界").unwrap() {
            EventPayload::FinalZh { text } => assert_eq!(text, "你好，世界"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn ready_marker_becomes_operational_status() {
        let line = "[asr] Ready — start speaking now";
        match parse_worker_line(line).unwrap() {
            EventPayload::Status { stage, log } => {
                assert_eq!(stage, Some(Stage::Operational));
                assert_eq!(log.as_deref(), Some(line));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_lines_become_plain_status() {
        match parse_worker_line("loading model shards...").unwrap() {
            EventPayload::Status { stage, log } => {
                assert!(stage.is_none());
                assert_eq!(log.as_deref(), Some("loading model shards..."));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert!(parse_worker_line("   ").is_none());
    }
}
