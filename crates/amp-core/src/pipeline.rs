//! Per-peer queue of outbound messages.
//!
//! Queries may be pipelined freely. An update that follows a query halts
//! transmission until every earlier query has been acknowledged. A pipeline
//! never touches the wire itself: it answers with [`Flush`] effects that the
//! owner runs after the current transaction commits.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// Updates per session window before a fresh window is opened.
pub const WINDOW_CAPACITY: u32 = 64;

/// Ordering class of a message.
pub trait Operation {
    fn is_query(&self) -> bool;

    fn is_update(&self) -> bool {
        !self.is_query()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("response {got} for {peer} does not match pending front {expected:?}")]
    OutOfOrder {
        peer: String,
        expected: Option<u64>,
        got: u64,
    },
    #[error("no pipeline for peer {0}")]
    UnknownPeer(String),
}

/// Replay coordinates of an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub window: u64,
    pub index: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry<M> {
    pub id: u64,
    pub stamp: Option<Stamp>,
    pub message: M,
}

/// Deferred transmission decided by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Send exactly this entry.
    Entry(u64),
    /// Walk at most `max` entries from the front (or from `skip_to`), stopping
    /// before an update that follows a query sent in the same pass.
    Restart { skip_to: Option<u64>, max: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline<M> {
    peer: String,
    session: String,
    pending: VecDeque<Entry<M>>,
    next_id: u64,
    halts: u32,
    queries: u32,
    window: u64,
    index: u32,
}

impl<M: Operation> Pipeline<M> {
    pub fn new(peer: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            session: session.into(),
            pending: VecDeque::new(),
            next_id: 0,
            halts: 0,
            queries: 0,
            window: 0,
            index: 0,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn halts(&self) -> u32 {
        self.halts
    }

    pub fn queries(&self) -> u32 {
        self.queries
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn front(&self) -> Option<&Entry<M>> {
        self.pending.front()
    }

    pub fn entry(&self, mid: u64) -> Option<&Entry<M>> {
        self.pending.iter().find(|e| e.id == mid)
    }

    pub fn pending(&self) -> impl Iterator<Item = &Entry<M>> {
        self.pending.iter()
    }

    /// Appends `message` and returns its id, plus the transmission to
    /// schedule if the pipeline is not halted.
    pub fn enqueue(&mut self, message: M) -> (u64, Option<Flush>) {
        let mid = self.next_id;
        self.next_id += 1;
        let mut stamp = None;
        if message.is_update() {
            if self.queries != 0 {
                self.halts += 1;
                self.queries = 0;
                self.open_window();
                debug!(peer = %self.peer, mid, halts = self.halts, "update halted behind queries");
            } else if self.index >= WINDOW_CAPACITY {
                self.open_window();
            }
            stamp = Some(Stamp {
                window: self.window,
                index: self.index,
            });
            self.index += 1;
        }
        if message.is_query() {
            self.queries += 1;
        }
        self.pending.push_back(Entry {
            id: mid,
            stamp,
            message,
        });
        if self.halts != 0 {
            return (mid, None);
        }
        (mid, Some(Flush::Entry(mid)))
    }

    /// Pops the acknowledged front entry. A popped query may release the
    /// next halted update, returned as a restart.
    pub fn dequeue(&mut self, mid: u64) -> Result<(Entry<M>, Option<Flush>), PipelineError> {
        let expected = self.pending.front().map(|e| e.id);
        if expected != Some(mid) {
            return Err(PipelineError::OutOfOrder {
                peer: self.peer.clone(),
                expected,
                got: mid,
            });
        }
        let front = self
            .pending
            .pop_front()
            .ok_or_else(|| PipelineError::UnknownPeer(self.peer.clone()))?;
        let mut flush = None;
        if front.message.is_query() {
            if self.halts == 0 {
                self.queries = self.queries.saturating_sub(1);
            } else if let Some(next) = self.pending.front() {
                if next.message.is_update() {
                    self.halts -= 1;
                    flush = Some(Flush::Restart {
                        skip_to: Some(next.id),
                        max: self.pending.len(),
                    });
                }
            }
        }
        Ok((front, flush))
    }

    /// Retransmission of everything pending, used when a vat is revived.
    pub fn resend(&self) -> Option<Flush> {
        if self.pending.is_empty() {
            return None;
        }
        Some(Flush::Restart {
            skip_to: None,
            max: self.pending.len(),
        })
    }

    /// Ids of the entries a flush transmits, in wire order.
    pub fn plan(&self, flush: Flush) -> Vec<u64> {
        match flush {
            Flush::Entry(mid) => self.entry(mid).map(|e| vec![e.id]).unwrap_or_default(),
            Flush::Restart { skip_to, max } => {
                let mut out = Vec::new();
                let mut found = skip_to.is_none();
                let mut sent_query = false;
                for entry in self.pending.iter().take(max) {
                    if !found {
                        if Some(entry.id) == skip_to {
                            found = true;
                        } else {
                            continue;
                        }
                    }
                    if sent_query && entry.message.is_update() {
                        break;
                    }
                    if entry.message.is_query() {
                        sent_query = true;
                    }
                    out.push(entry.id);
                }
                out
            }
        }
    }

    fn open_window(&mut self) {
        if self.index != 0 {
            self.window += 1;
            self.index = 0;
        }
    }
}

/// Registry of pipelines by peer. `active` holds exactly the peers with
/// pending entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound<M> {
    pipelines: BTreeMap<String, Pipeline<M>>,
    active: BTreeSet<String>,
}

impl<M> Default for Outbound<M> {
    fn default() -> Self {
        Self {
            pipelines: BTreeMap::new(),
            active: BTreeSet::new(),
        }
    }
}

impl<M: Operation> Outbound<M> {
    pub fn find(&self, peer: &str) -> Option<&Pipeline<M>> {
        self.pipelines.get(peer)
    }

    pub fn active(&self) -> impl Iterator<Item = &str> {
        self.active.iter().map(String::as_str)
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_empty()
    }

    /// Enqueues on the peer's pipeline, creating it with a fresh session key.
    pub fn enqueue(&mut self, peer: &str, message: M) -> (u64, Option<Flush>) {
        let pipeline = self
            .pipelines
            .entry(peer.to_string())
            .or_insert_with(|| Pipeline::new(peer, Uuid::new_v4().simple().to_string()));
        self.active.insert(peer.to_string());
        pipeline.enqueue(message)
    }

    pub fn dequeue(
        &mut self,
        peer: &str,
        mid: u64,
    ) -> Result<(Entry<M>, Option<Flush>), PipelineError> {
        let pipeline = self
            .pipelines
            .get_mut(peer)
            .ok_or_else(|| PipelineError::UnknownPeer(peer.to_string()))?;
        let out = pipeline.dequeue(mid)?;
        if pipeline.is_empty() {
            self.active.remove(peer);
        }
        Ok(out)
    }

    /// Restart flushes for every pipeline with undelivered work.
    pub fn resend(&self) -> Vec<(String, Flush)> {
        self.active
            .iter()
            .filter_map(|peer| {
                let flush = self.pipelines.get(peer)?.resend()?;
                Some((peer.clone(), flush))
            })
            .collect()
    }
}
