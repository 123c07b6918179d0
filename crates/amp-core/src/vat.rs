//! A vat: one persistent root, its promise arena, and the turn loop that
//! mutates both.
//!
//! Every turn runs inside a transaction. The first write to the root takes
//! a snapshot. On commit a written root is saved and the effects the turn
//! produced (flushes, wire requests) are released; on abort the snapshot is
//! restored, the effects are dropped and the turn's undo tasks are queued.

use std::collections::{BTreeMap, HashMap};

use amp_events::Bus;
use amp_protocol::{CallParams, WebKey};
use amp_topics::{TOPIC_MSG_SENT, TOPIC_TURN_ABORTED, TOPIC_VAT_REVIVED};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::caller::{self, Call};
use crate::codec::{Exporter, Importer};
use crate::config::VatSettings;
use crate::interface::Capability;
use crate::pipeline::{Flush, Outbound};
use crate::promise::{Promises, Resolver, State};
use crate::store::{Root, Store};
use crate::turn::{Executor, Task, TurnQueue};
use crate::value::{ObjectId, PromiseId, Ref, Rejection, Settled, Value};
use crate::wire::{Outgoing, TransportError, WireResponse};
use crate::{message::Message, Error, Result};

/// Work released only once the transaction that produced it commits.
pub(crate) enum Effect {
    Flush { peer: String, flush: Flush },
    Transmit(Outgoing),
    /// Look for the next buffered answer from `peer`.
    Drain { peer: String },
}

/// A transport answer waiting for its message to reach the pipeline front.
#[derive(Debug, Clone)]
pub(crate) struct Arrival {
    pub result: Result<WireResponse, TransportError>,
    /// Turns that already failed to commit this answer.
    pub attempts: u32,
}

pub struct Vat {
    pub(crate) settings: VatSettings,
    root: Root,
    /// Root as it was before the running transaction first wrote to it.
    snapshot: Option<Root>,
    /// Minted keys not yet saved.
    keys_dirty: bool,
    store: Box<dyn Store>,
    pub(crate) promises: Promises<Vat>,
    pub(crate) turns: TurnQueue<Vat>,
    pub(crate) objects: Vec<Box<dyn Capability>>,
    pub(crate) exports: HashMap<String, Ref>,
    exported: HashMap<Ref, String>,
    proxies: HashMap<PromiseId, WebKey>,
    imported: HashMap<WebKey, PromiseId>,
    pub(crate) effects: Vec<Effect>,
    undo: Vec<Task<Vat>>,
    arrivals: HashMap<String, BTreeMap<u64, Arrival>>,
    outbox: Vec<Outgoing>,
    bus: Option<Bus>,
    in_tx: bool,
}

fn mint_key() -> String {
    Uuid::new_v4().simple().to_string()
}

impl Vat {
    /// Loads the root from `store` (or starts empty) and schedules the
    /// retransmission of every message that was still pending.
    pub fn open(settings: VatSettings, store: Box<dyn Store>, bus: Option<Bus>) -> Result<Self> {
        let root = store.load()?.unwrap_or_default();
        let mut vat = Self {
            settings,
            root,
            snapshot: None,
            keys_dirty: false,
            store,
            promises: Promises::new(),
            turns: TurnQueue::new(),
            objects: Vec::new(),
            exports: HashMap::new(),
            exported: HashMap::new(),
            proxies: HashMap::new(),
            imported: HashMap::new(),
            effects: Vec::new(),
            undo: Vec::new(),
            arrivals: HashMap::new(),
            outbox: Vec::new(),
            bus,
            in_tx: false,
        };
        let resend = vat.root.outbound.resend();
        if !resend.is_empty() {
            let peers: Vec<&str> = resend.iter().map(|(peer, _)| peer.as_str()).collect();
            info!(here = %vat.settings.here, peers = ?peers, "vat revived with undelivered messages");
            vat.trace(TOPIC_VAT_REVIVED, json!({ "here": vat.settings.here, "peers": peers }));
            for (peer, flush) in resend {
                vat.effects.push(Effect::Flush { peer, flush });
            }
            vat.release();
        }
        Ok(vat)
    }

    pub fn here(&self) -> &str {
        &self.settings.here
    }

    pub fn settings(&self) -> &VatSettings {
        &self.settings
    }

    pub fn root(&self) -> &Root {
        &self.root
    }

    pub fn outbound(&self) -> &Outbound<Message> {
        &self.root.outbound
    }

    /// Root for writing. The first call in a transaction snapshots it.
    pub(crate) fn root_mut(&mut self) -> &mut Root {
        if self.snapshot.is_none() {
            self.snapshot = Some(self.root.clone());
        }
        &mut self.root
    }

    /// Runs `body` as one transaction.
    ///
    /// A query transaction must not write the root. An update transaction
    /// that wrote it is saved before its effects are released. Any error
    /// restores the root, discards the effects and queues the undo tasks.
    pub fn enter<R>(&mut self, is_query: bool, body: impl FnOnce(&mut Vat) -> Result<R>) -> Result<R> {
        if self.in_tx {
            return Err(Error::Reentrant);
        }
        self.in_tx = true;
        let out = body(self).and_then(|value| self.commit(is_query).map(|()| value));
        self.in_tx = false;
        let snapshot = self.snapshot.take();
        let undo = std::mem::take(&mut self.undo);
        match out {
            Ok(value) => {
                self.release();
                Ok(value)
            }
            Err(error) => {
                if let Some(mut snapshot) = snapshot {
                    // Minted keys stay: the export table is not rolled back.
                    snapshot.minted = std::mem::take(&mut self.root.minted);
                    self.root = snapshot;
                }
                self.effects.clear();
                for task in undo {
                    self.turns.push(task);
                }
                Err(error)
            }
        }
    }

    fn commit(&mut self, is_query: bool) -> Result<()> {
        let written = self.snapshot.is_some();
        if written && is_query {
            return Err(Error::ProhibitedModification);
        }
        if written || self.keys_dirty {
            self.store.save(&self.root)?;
            self.keys_dirty = false;
        }
        Ok(())
    }

    /// Queues `task` if the running transaction aborts.
    pub(crate) fn on_abort(&mut self, task: impl FnOnce(&mut Vat) -> Result<()> + Send + 'static) {
        self.undo.push(Box::new(task));
    }

    /// Joins the running transaction, or opens an update transaction.
    fn update<R>(&mut self, body: impl FnOnce(&mut Vat) -> Result<R>) -> Result<R> {
        if self.in_tx {
            body(self)
        } else {
            self.enter(false, body)
        }
    }

    fn release(&mut self) {
        for effect in std::mem::take(&mut self.effects) {
            match effect {
                Effect::Flush { peer, flush } => {
                    self.later(move |vat| caller::flush(vat, &peer, flush));
                }
                Effect::Transmit(out) => {
                    let member = out
                        .request
                        .target
                        .split_once('?')
                        .and_then(|(_, query)| CallParams::parse(query).ok())
                        .and_then(|params| params.member().map(str::to_string));
                    debug!(peer = %out.peer, mid = out.mid, method = %out.request.method, ?member, "transmit");
                    self.trace(
                        TOPIC_MSG_SENT,
                        json!({
                            "peer": out.peer,
                            "mid": out.mid,
                            "method": out.request.method.as_str(),
                            "member": member,
                        }),
                    );
                    self.outbox.push(out);
                }
                Effect::Drain { peer } => {
                    self.later(move |vat| caller::drain(vat, &peer));
                }
            }
        }
    }

    /// Requests ready for the transport, in release order.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Buffers the transport's answer to message `mid`. Answers are handled
    /// in send order, each in its own turn.
    pub fn deliver(&mut self, peer: String, mid: u64, result: Result<WireResponse, TransportError>) {
        self.stash(peer.clone(), mid, Arrival { result, attempts: 0 });
        self.later(move |vat| caller::drain(vat, &peer));
    }

    pub(crate) fn stash(&mut self, peer: String, mid: u64, arrival: Arrival) {
        self.arrivals.entry(peer).or_default().insert(mid, arrival);
    }

    /// Removes the buffered answer for the front of `peer`'s pipeline, if it
    /// has arrived. Answers for messages no longer pending are dropped.
    pub(crate) fn take_arrival(&mut self, peer: &str) -> Option<(u64, Arrival)> {
        let front = self.root.outbound.find(peer).and_then(|p| p.front()).map(|e| e.id);
        let buffered = self.arrivals.get_mut(peer)?;
        let taken = match front {
            Some(front) => {
                let stale: Vec<u64> = buffered.range(..front).map(|(mid, _)| *mid).collect();
                for mid in stale {
                    debug!(peer, mid, "dropping answer for a message no longer pending");
                    buffered.remove(&mid);
                }
                buffered.remove(&front).map(|arrival| (front, arrival))
            }
            None => {
                buffered.clear();
                None
            }
        };
        if buffered.is_empty() {
            self.arrivals.remove(peer);
        }
        taken
    }

    pub(crate) fn has_arrivals(&self, peer: &str) -> bool {
        self.arrivals.contains_key(peer)
    }

    pub(crate) fn later(&mut self, task: impl FnOnce(&mut Vat) -> Result<()> + Send + 'static) {
        self.turns.push(Box::new(task));
    }

    pub(crate) fn trace(&self, topic: &str, payload: serde_json::Value) {
        if let Some(bus) = &self.bus {
            bus.publish(topic, &payload);
        }
    }

    pub(crate) fn schedule(&mut self, peer: String, flush: Flush) {
        self.effects.push(Effect::Flush { peer, flush });
    }

    // Promises

    pub fn defer(&mut self) -> (PromiseId, Resolver) {
        self.promises.defer()
    }

    pub fn fulfilled(&mut self, value: Value) -> PromiseId {
        self.promises.fulfilled(value)
    }

    pub fn rejected(&mut self, reason: Rejection) -> PromiseId {
        self.promises.rejected(reason)
    }

    pub fn run(&mut self, resolver: Resolver, value: Value) -> bool {
        self.promises.run(resolver, value, &mut self.turns)
    }

    pub fn resolve(&mut self, resolver: Resolver, target: PromiseId) -> bool {
        self.promises.resolve(resolver, target, &mut self.turns)
    }

    pub fn reject(&mut self, resolver: Resolver, reason: Rejection) -> bool {
        self.promises.reject(resolver, reason, &mut self.turns)
    }

    pub fn settle(&mut self, resolver: Resolver, settled: Settled) -> bool {
        self.promises.settle(resolver, settled, &mut self.turns)
    }

    /// Observes `promise`; `reaction` runs in a later turn.
    pub fn when(
        &mut self,
        promise: PromiseId,
        reaction: impl FnOnce(&mut Vat, Settled) -> Result<()> + Send + 'static,
    ) {
        self.promises.when(promise, Box::new(reaction), &mut self.turns);
    }

    pub fn settled(&self, promise: PromiseId) -> Option<&Settled> {
        self.promises.settled(promise)
    }

    pub fn state(&self, promise: PromiseId) -> State<'_> {
        self.promises.state(promise)
    }

    pub fn same(&self, a: PromiseId, b: PromiseId) -> bool {
        self.promises.same(a, b)
    }

    /// Remote promise a local proxy stands for, while the proxy is deferred.
    pub(crate) fn proxy(&self, promise: PromiseId) -> Option<WebKey> {
        if !self.promises.is_deferred(promise) {
            return None;
        }
        self.proxies
            .get(&promise)
            .or_else(|| self.proxies.get(&self.promises.root(promise)))
            .cloned()
    }

    // Eventual operations

    /// Eventual property read.
    pub fn get(&mut self, target: Value, property: &str) -> Result<PromiseId> {
        let (promise, resolver) = self.defer();
        let call = Call::Get(property.to_string());
        self.update(move |vat| caller::dispatch(vat, target, call, Some(resolver)))?;
        Ok(promise)
    }

    /// Eventual method call.
    pub fn invoke(&mut self, target: Value, method: &str, args: Vec<Value>) -> Result<PromiseId> {
        let (promise, resolver) = self.defer();
        let call = Call::Invoke {
            method: method.to_string(),
            args,
        };
        self.update(move |vat| caller::dispatch(vat, target, call, Some(resolver)))?;
        Ok(promise)
    }

    /// Eventual method call whose outcome nobody observes.
    pub fn send(&mut self, target: Value, method: &str, args: Vec<Value>) -> Result<()> {
        let call = Call::Invoke {
            method: method.to_string(),
            args,
        };
        self.update(move |vat| caller::dispatch(vat, target, call, None))
    }

    /// Eventual property write.
    pub fn put(&mut self, target: Value, property: &str, value: Value) -> Result<()> {
        let call = Call::Put {
            property: property.to_string(),
            value,
        };
        self.update(move |vat| caller::dispatch(vat, target, call, None))
    }

    // Objects and keys

    /// Hosts `object` in this vat.
    pub fn adopt(&mut self, object: Box<dyn Capability>) -> Ref {
        self.objects.push(object);
        Ref::Object(ObjectId(self.objects.len() - 1))
    }

    pub fn object(&self, id: ObjectId) -> Option<&dyn Capability> {
        self.objects.get(id.0).map(|o| o.as_ref())
    }

    /// Hosts `object` under the web-key bound to `name` in the root,
    /// binding a fresh key on first use.
    pub fn publish(&mut self, name: &str, object: Box<dyn Capability>) -> Result<WebKey> {
        let object = self.adopt(object);
        self.update(move |vat| {
            let bound = vat.root.fetch(name).and_then(|v| v.as_str()).map(str::to_string);
            let key = match bound {
                Some(key) => key,
                None => {
                    let key = mint_key();
                    vat.root_mut().link(name, json!(key));
                    key
                }
            };
            vat.exports.insert(key.clone(), object.clone());
            vat.exported.insert(object, key.clone());
            info!(name, "published");
            Ok(WebKey::object(vat.settings.here.clone(), key))
        })
    }

    fn local_key(&mut self, r: &Ref, promise: bool) -> WebKey {
        let key = match self.exported.get(r) {
            Some(key) => key.clone(),
            None => {
                let key = mint_key();
                self.exported.insert(r.clone(), key.clone());
                self.exports.insert(key.clone(), r.clone());
                self.root.minted.insert(&key);
                self.keys_dirty = true;
                key
            }
        };
        WebKey {
            peer: self.settings.here.clone(),
            key,
            promise,
        }
    }

    /// True for a key this vat minted for a reference it no longer holds.
    pub fn is_lost(&self, key: &str) -> bool {
        !self.exports.contains_key(key) && self.root.minted.contains(key)
    }

    /// URL naming `r` for a remote reader.
    pub fn export(&mut self, r: &Ref) -> String {
        match r {
            Ref::Remote(key) => key.to_url(),
            Ref::Object(_) => self.local_key(r, false).to_url(),
            Ref::Promise(p) => {
                if let Some(Ok(Value::Ref(inner))) = self.promises.settled(*p) {
                    let inner = inner.clone();
                    return self.export(&inner);
                }
                if let Some(key) = self.proxy(*p) {
                    return key.to_url();
                }
                let root = self.promises.root(*p);
                self.local_key(&Ref::Promise(root), true).to_url()
            }
        }
    }

    /// Local stand-in for the web-key `url`.
    ///
    /// Keys of this vat resolve to the exported reference. A remote promise
    /// becomes a proxy promise resolved by a probe of the peer.
    pub fn import(&mut self, url: &str) -> Value {
        let key = match WebKey::parse(url) {
            Ok(key) => key,
            Err(e) => {
                let reason = Rejection::BadSyntax {
                    reason: e.to_string(),
                };
                return Value::Ref(Ref::Promise(self.rejected(reason)));
            }
        };
        if key.peer == self.settings.here {
            return match self.exports.get(&key.key) {
                Some(r) => Value::Ref(r.clone()),
                None => {
                    let reason = Rejection::failure(http::StatusCode::NOT_FOUND);
                    Value::Ref(Ref::Promise(self.rejected(reason)))
                }
            };
        }
        if !key.promise {
            return Value::Ref(Ref::Remote(key));
        }
        if let Some(p) = self.imported.get(&key) {
            return Value::Ref(Ref::Promise(*p));
        }
        let (proxy, resolver) = self.defer();
        self.proxies.insert(proxy, key.clone());
        self.imported.insert(key.clone(), proxy);
        caller::probe(self, key, resolver, 0);
        Value::Ref(Ref::Promise(proxy))
    }
}

impl Exporter for Vat {
    fn export(&mut self, r: &Ref) -> String {
        Vat::export(self, r)
    }
}

impl Importer for Vat {
    fn import(&mut self, url: &str) -> Value {
        Vat::import(self, url)
    }

    fn broken(&mut self, reason: Rejection) -> Value {
        Value::Ref(Ref::Promise(self.rejected(reason)))
    }
}

impl Executor for Vat {
    fn turn_queue(&mut self) -> &mut TurnQueue<Self> {
        &mut self.turns
    }

    fn execute(&mut self, task: Task<Self>) {
        if let Err(error) = self.enter(false, task) {
            let turn = self.turns.turns();
            warn!(%error, turn, here = %self.settings.here, "turn aborted");
            self.trace(
                TOPIC_TURN_ABORTED,
                json!({ "turn": turn, "error": error.to_string() }),
            );
        }
    }
}
