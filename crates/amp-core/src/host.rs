//! Async hosting of a vat.
//!
//! The vat lives inside one tokio task and is only touched from there.
//! Inbound requests, transport completions and application closures reach it
//! through an mpsc mailbox. Outbound requests go through one link task per
//! peer, which keeps several requests in flight but hands the answers back
//! strictly in send order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::FuturesOrdered;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::callee;
use crate::turn::Executor;
use crate::value::{PromiseId, Settled};
use crate::vat::Vat;
use crate::wire::{Outgoing, TransportError, WireRequest, WireResponse};
use crate::Result;

/// Carries requests to peers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn exchange(&self, peer: &str, request: WireRequest) -> Result<WireResponse, TransportError>;

    /// Requests a link may have outstanding at once. A transport that cannot
    /// keep requests in order on the way to the peer answers 1.
    fn max_in_flight(&self) -> usize {
        usize::MAX
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("vat is no longer running")]
    Closed,
    #[error("vat transaction failed: {0}")]
    Vat(String),
}

type Job = Box<dyn FnOnce(&mut Vat) + Send>;

enum Command {
    Serve {
        request: WireRequest,
        reply: oneshot::Sender<WireResponse>,
    },
    Deliver {
        peer: String,
        mid: u64,
        result: Result<WireResponse, TransportError>,
    },
    Call(Job),
}

/// Cloneable mailbox address of a running vat.
#[derive(Clone)]
pub struct VatHandle {
    tx: UnboundedSender<Command>,
    here: Arc<str>,
}

impl VatHandle {
    pub fn here(&self) -> &str {
        &self.here
    }

    /// Answers one inbound request.
    pub async fn serve(&self, request: WireRequest) -> Result<WireResponse, HostError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Serve { request, reply })
            .map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)
    }

    /// Runs `f` as an update transaction of the vat.
    pub async fn call<R, F>(&self, f: F) -> Result<R, HostError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Vat) -> Result<R> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: Job = Box::new(move |vat| {
            let out = vat.enter(false, f).map_err(|e| HostError::Vat(e.to_string()));
            let _ = reply.send(out);
        });
        self.tx.send(Command::Call(job)).map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)?
    }

    /// Waits until `promise` settles.
    pub async fn settled(&self, promise: PromiseId) -> Result<Settled, HostError> {
        let (reply, rx) = oneshot::channel();
        let job: Job = Box::new(move |vat| {
            vat.when(promise, move |_, settled| {
                let _ = reply.send(settled);
                Ok(())
            });
        });
        self.tx.send(Command::Call(job)).map_err(|_| HostError::Closed)?;
        rx.await.map_err(|_| HostError::Closed)
    }
}

/// Starts the vat's task on the current runtime.
pub fn spawn(vat: Vat, transport: Arc<dyn Transport>) -> VatHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let here: Arc<str> = Arc::from(vat.here());
    tokio::spawn(run(vat, rx, tx.downgrade(), transport));
    VatHandle { tx, here }
}

async fn run(
    mut vat: Vat,
    mut rx: UnboundedReceiver<Command>,
    mailbox: WeakUnboundedSender<Command>,
    transport: Arc<dyn Transport>,
) {
    let mut links: HashMap<String, UnboundedSender<Outgoing>> = HashMap::new();
    info!(here = %vat.here(), "vat started");
    loop {
        vat.run_until_idle();
        for out in vat.take_outbox() {
            let sender = links.entry(out.peer.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(link(out.peer.clone(), rx, transport.clone(), mailbox.clone()));
                tx
            });
            if let Err(dropped) = sender.send(out) {
                warn!(peer = %dropped.0.peer, mid = dropped.0.mid, "link closed, request dropped");
            }
        }
        let Some(command) = rx.recv().await else {
            break;
        };
        match command {
            Command::Serve { request, reply } => {
                let response = callee::serve(&mut vat, request);
                if reply.send(response).is_err() {
                    debug!("requester went away before the response");
                }
            }
            Command::Deliver { peer, mid, result } => vat.deliver(peer, mid, result),
            Command::Call(job) => job(&mut vat),
        }
    }
    info!(here = %vat.here(), "vat stopped");
}

async fn link(
    peer: String,
    mut rx: UnboundedReceiver<Outgoing>,
    transport: Arc<dyn Transport>,
    mailbox: WeakUnboundedSender<Command>,
) {
    let window = transport.max_in_flight().max(1);
    let mut in_flight = FuturesOrdered::new();
    loop {
        tokio::select! {
            next = rx.recv(), if in_flight.len() < window => match next {
                Some(out) => {
                    let transport = transport.clone();
                    let peer = peer.clone();
                    in_flight.push_back(async move {
                        let result = transport.exchange(&peer, out.request).await;
                        (out.mid, result)
                    });
                }
                None => break,
            },
            Some((mid, result)) = in_flight.next(), if !in_flight.is_empty() => {
                let Some(vat) = mailbox.upgrade() else {
                    break;
                };
                let peer = peer.clone();
                if vat.send(Command::Deliver { peer, mid, result }).is_err() {
                    break;
                }
            }
        }
    }
    debug!(peer = %peer, "link closed");
}

/// Transport connecting vats hosted in the same process.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    vats: Arc<RwLock<HashMap<String, VatHandle>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: VatHandle) {
        self.vats.write().insert(handle.here().to_string(), handle);
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn exchange(&self, peer: &str, request: WireRequest) -> Result<WireResponse, TransportError> {
        let handle = self.vats.read().get(peer).cloned();
        let Some(handle) = handle else {
            return Err(TransportError::Connect(format!("unknown peer {peer}")));
        };
        handle.serve(request).await.map_err(|_| TransportError::Closed)
    }
}
