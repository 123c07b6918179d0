//! Server-side replay table for once-guarded calls.
//!
//! Each session keeps the serialized outcome of every executed
//! `(window, index)` for its newest windows. Older windows are forgotten and
//! answer as expired instead of running again. An evicted session leaves a
//! tombstone naming the newest window it had reached, so a late retry from
//! it is also refused.

use std::collections::BTreeMap;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::wire::WireResponse;

/// Bytes returned for one executed call, replayed verbatim on retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl Outcome {
    pub fn to_response(&self) -> WireResponse {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut resp = WireResponse::empty(status).with_body(self.body.clone().into_bytes());
        if let Some(ct) = &self.content_type {
            resp = resp.with_header(http::header::CONTENT_TYPE, ct);
        }
        resp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Windows kept per session.
    pub windows: usize,
    /// Sessions kept; the least recently used one is dropped first.
    pub max_sessions: usize,
    /// Evicted sessions remembered as tombstones; the oldest goes first.
    pub tombstones: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            windows: 4,
            max_sessions: 1024,
            tombstones: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct ServerSession {
    results: BTreeMap<u64, BTreeMap<u32, Outcome>>,
    /// Windows below this one have been forgotten.
    floor: u64,
    last_used: u64,
}

/// What is left of an evicted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Tombstone {
    /// Newest window the session had recorded.
    last_window: u64,
    evicted_at: u64,
}

#[derive(Debug, PartialEq)]
pub enum Lookup<'a> {
    Fresh,
    Replay(&'a Outcome),
    Forgotten,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sessions {
    sessions: BTreeMap<String, ServerSession>,
    #[serde(default)]
    tombstones: BTreeMap<String, Tombstone>,
    clock: u64,
}

impl Sessions {
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn tombstones(&self) -> usize {
        self.tombstones.len()
    }

    pub fn lookup(&self, key: &str, window: u64, index: u32) -> Lookup<'_> {
        let Some(session) = self.sessions.get(key) else {
            return match self.tombstones.get(key) {
                Some(t) if window <= t.last_window => Lookup::Forgotten,
                _ => Lookup::Fresh,
            };
        };
        if window < session.floor {
            return Lookup::Forgotten;
        }
        match session.results.get(&window).and_then(|w| w.get(&index)) {
            Some(outcome) => Lookup::Replay(outcome),
            None => Lookup::Fresh,
        }
    }

    pub fn record(
        &mut self,
        key: &str,
        window: u64,
        index: u32,
        outcome: Outcome,
        retention: Retention,
    ) {
        self.clock += 1;
        let clock = self.clock;
        let tombstone = self.tombstones.remove(key);
        let session = self.sessions.entry(key.to_string()).or_insert_with(|| ServerSession {
            floor: tombstone.map_or(0, |t| t.last_window + 1),
            ..ServerSession::default()
        });
        session.last_used = clock;
        session
            .results
            .entry(window)
            .or_default()
            .insert(index, outcome);
        while session.results.len() > retention.windows.max(1) {
            let Some((oldest, _)) = session.results.pop_first() else {
                break;
            };
            session.floor = session.floor.max(oldest + 1);
        }
        while self.sessions.len() > retention.max_sessions.max(1) {
            let victim = self
                .sessions
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(evicted) = self.sessions.remove(&victim) {
                let last_window = evicted
                    .results
                    .last_key_value()
                    .map_or(evicted.floor.saturating_sub(1), |(w, _)| *w);
                self.tombstones.insert(
                    victim,
                    Tombstone {
                        last_window,
                        evicted_at: clock,
                    },
                );
            }
        }
        while self.tombstones.len() > retention.tombstones {
            let oldest = self
                .tombstones
                .iter()
                .min_by_key(|(_, t)| t.evicted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.tombstones.remove(&k);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(body: &str) -> Outcome {
        Outcome {
            status: 200,
            content_type: Some("application/json".into()),
            body: body.into(),
        }
    }

    #[test]
    fn recorded_calls_replay() {
        let mut sessions = Sessions::default();
        assert_eq!(sessions.lookup("S", 0, 0), Lookup::Fresh);
        sessions.record("S", 0, 0, outcome("1"), Retention::default());
        assert_eq!(sessions.lookup("S", 0, 0), Lookup::Replay(&outcome("1")));
        assert_eq!(sessions.lookup("S", 0, 1), Lookup::Fresh);
        assert_eq!(sessions.lookup("T", 0, 0), Lookup::Fresh);
    }

    #[test]
    fn old_windows_are_forgotten() {
        let mut sessions = Sessions::default();
        let keep_two = Retention {
            windows: 2,
            max_sessions: 8,
            ..Retention::default()
        };
        for w in 0..4 {
            sessions.record("S", w, 0, outcome(&w.to_string()), keep_two);
        }
        assert_eq!(sessions.lookup("S", 0, 0), Lookup::Forgotten);
        assert_eq!(sessions.lookup("S", 1, 0), Lookup::Forgotten);
        assert_eq!(sessions.lookup("S", 2, 0), Lookup::Replay(&outcome("2")));
        assert_eq!(sessions.lookup("S", 3, 1), Lookup::Fresh);
    }

    #[test]
    fn least_recently_used_session_is_evicted() {
        let mut sessions = Sessions::default();
        let two = Retention {
            windows: 4,
            max_sessions: 2,
            ..Retention::default()
        };
        sessions.record("A", 0, 0, outcome("a"), two);
        sessions.record("B", 0, 0, outcome("b"), two);
        sessions.record("A", 0, 1, outcome("a1"), two);
        sessions.record("C", 0, 0, outcome("c"), two);
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.tombstones(), 1);
        assert_eq!(sessions.lookup("B", 0, 0), Lookup::Forgotten);
        assert_eq!(sessions.lookup("A", 0, 1), Lookup::Replay(&outcome("a1")));
    }

    #[test]
    fn evicted_session_refuses_old_windows_and_resumes_above_them() {
        let mut sessions = Sessions::default();
        let two = Retention {
            windows: 4,
            max_sessions: 2,
            ..Retention::default()
        };
        sessions.record("S1", 0, 0, outcome("1"), two);
        sessions.record("S1", 1, 0, outcome("2"), two);
        sessions.record("S2", 0, 0, outcome("3"), two);
        sessions.record("S3", 0, 0, outcome("4"), two);
        assert_eq!(sessions.lookup("S1", 0, 0), Lookup::Forgotten);
        assert_eq!(sessions.lookup("S1", 1, 3), Lookup::Forgotten);
        assert_eq!(sessions.lookup("S1", 2, 0), Lookup::Fresh);

        sessions.record("S1", 2, 0, outcome("5"), two);
        assert_eq!(sessions.lookup("S1", 1, 0), Lookup::Forgotten);
        assert_eq!(sessions.lookup("S1", 2, 0), Lookup::Replay(&outcome("5")));
    }

    #[test]
    fn tombstones_are_bounded() {
        let mut sessions = Sessions::default();
        let tight = Retention {
            windows: 1,
            max_sessions: 1,
            tombstones: 2,
        };
        for key in ["A", "B", "C", "D"] {
            sessions.record(key, 0, 0, outcome(key), tight);
        }
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions.tombstones(), 2);
        assert_eq!(sessions.lookup("A", 0, 0), Lookup::Fresh);
        assert_eq!(sessions.lookup("B", 0, 0), Lookup::Forgotten);
        assert_eq!(sessions.lookup("C", 0, 0), Lookup::Forgotten);
    }

    #[test]
    fn tombstones_survive_serialization() {
        let mut sessions = Sessions::default();
        let one = Retention {
            max_sessions: 1,
            ..Retention::default()
        };
        sessions.record("A", 0, 0, outcome("a"), one);
        sessions.record("B", 0, 0, outcome("b"), one);
        let raw = serde_json::to_string(&sessions).unwrap();
        let back: Sessions = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.lookup("A", 0, 0), Lookup::Forgotten);
    }

    #[test]
    fn outcome_replays_identical_bytes() {
        let o = outcome("{\"@\":\"http://a/#s=K\"}");
        assert_eq!(o.to_response().body, o.to_response().body);
        assert_eq!(o.to_response().status, StatusCode::OK);
    }
}
