//! Calling side: dispatches eventual operations and turns peer responses
//! back into promise settlements.

use amp_protocol::WebKey;
use amp_topics::{TOPIC_MSG_GOT, TOPIC_PIPELINE_HALTED, TOPIC_PIPELINE_RESTARTED};
use http::StatusCode;
use serde_json::json;
use tracing::{debug, warn};

use crate::codec;
use crate::message::{Message, Query, Reply, Update, Verb};
use crate::pipeline::Flush;
use crate::promise::Resolver;
use crate::value::{ObjectId, Ref, Rejection, Settled, Value};
use crate::vat::{Arrival, Effect, Vat};
use crate::wire::{Outgoing, TransportError, WireResponse};
use crate::Result;

/// An eventual operation waiting for its target.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Get(String),
    Invoke { method: String, args: Vec<Value> },
    Put { property: String, value: Value },
}

impl Call {
    fn member(&self) -> &str {
        match self {
            Call::Get(property) => property,
            Call::Invoke { method, .. } => method,
            Call::Put { property, .. } => property,
        }
    }
}

fn answer(vat: &mut Vat, reply: Option<Resolver>, settled: Settled) {
    if let Some(resolver) = reply {
        vat.settle(resolver, settled);
    }
}

/// Routes `call` by the kind of `target`.
pub(crate) fn dispatch(vat: &mut Vat, target: Value, call: Call, reply: Option<Resolver>) -> Result<()> {
    match target {
        Value::Ref(Ref::Object(id)) => {
            vat.later(move |vat| {
                let settled = local_call(vat, id, call);
                answer(vat, reply, settled);
                Ok(())
            });
        }
        Value::Ref(Ref::Promise(p)) => {
            if let Some(settled) = vat.settled(p).cloned() {
                vat.later(move |vat| redispatch(vat, settled, call, reply));
            } else if let Some(key) = vat.proxy(p) {
                let origin = vat.promises.root(p);
                let reply = Reply {
                    resolver: reply,
                    origin: Some(origin),
                };
                call_remote(vat, key, call, reply)?;
            } else {
                vat.when(p, move |vat, settled| redispatch(vat, settled, call, reply));
            }
        }
        Value::Ref(Ref::Remote(key)) => {
            let reply = Reply {
                resolver: reply,
                origin: None,
            };
            call_remote(vat, key, call, reply)?;
        }
        Value::Record(mut fields) => {
            let settled = match &call {
                Call::Get(name) => fields
                    .remove(name)
                    .ok_or_else(|| Rejection::no_such_member(name)),
                other => Err(Rejection::no_such_member(other.member())),
            };
            vat.later(move |vat| {
                answer(vat, reply, settled);
                Ok(())
            });
        }
        _ => {
            let reason = Rejection::no_such_member(call.member());
            vat.later(move |vat| {
                answer(vat, reply, Err(reason));
                Ok(())
            });
        }
    }
    Ok(())
}

fn redispatch(vat: &mut Vat, settled: Settled, call: Call, reply: Option<Resolver>) -> Result<()> {
    match settled {
        Ok(target) => dispatch(vat, target, call, reply),
        Err(reason) => {
            answer(vat, reply, Err(reason));
            Ok(())
        }
    }
}

/// Runs `call` against an object hosted by `vat`.
pub(crate) fn local_call(vat: &mut Vat, id: ObjectId, call: Call) -> Settled {
    let this = Ref::Object(id);
    let Some(object) = vat.objects.get_mut(id.0) else {
        return Err(Rejection::failure(StatusCode::NOT_FOUND));
    };
    match call {
        Call::Get(property) => object.get(&property),
        Call::Invoke { method, args } => object.invoke(&this, &method, args),
        Call::Put { property, value } => object.set(&property, value).map(|()| Value::Null),
    }
}

fn call_remote(vat: &mut Vat, target: WebKey, call: Call, reply: Reply) -> Result<()> {
    let message = match call {
        Call::Get(property) => Message::Query(Query {
            target,
            property: Some(property),
            attempt: 0,
            reply,
        }),
        Call::Invoke { method, args } => Message::Update(Update {
            target,
            verb: Verb::Post,
            name: method,
            body: codec::serialize_args(vat, &args)?,
            reply,
        }),
        Call::Put { property, value } => Message::Update(Update {
            target,
            verb: Verb::Put,
            name: property,
            body: codec::serialize(vat, &Ok(value))?,
            reply,
        }),
    };
    enqueue(vat, message);
    Ok(())
}

/// Asks the peer for the resolution of the remote promise `target`.
pub(crate) fn probe(vat: &mut Vat, target: WebKey, resolver: Resolver, attempt: u32) {
    enqueue(
        vat,
        Message::Query(Query {
            target,
            property: None,
            attempt,
            reply: Reply {
                resolver: Some(resolver),
                origin: None,
            },
        }),
    );
}

fn enqueue(vat: &mut Vat, message: Message) {
    let peer = message.target().peer.clone();
    let (mid, flush) = vat.root_mut().outbound.enqueue(&peer, message);
    match flush {
        Some(flush) => vat.schedule(peer, flush),
        None => {
            debug!(peer = %peer, mid, "message held behind pending queries");
            vat.trace(TOPIC_PIPELINE_HALTED, json!({ "peer": peer, "mid": mid }));
        }
    }
}

/// Puts the entries selected by `flush` on the outbox, once the running
/// transaction commits.
pub(crate) fn flush(vat: &mut Vat, peer: &str, flush: Flush) -> Result<()> {
    let Some(pipeline) = vat.root().outbound.find(peer) else {
        return Ok(());
    };
    let session = pipeline.session();
    let outgoing: Vec<Outgoing> = pipeline
        .plan(flush)
        .into_iter()
        .filter_map(|mid| pipeline.entry(mid))
        .map(|entry| Outgoing {
            peer: peer.to_string(),
            mid: entry.id,
            request: entry.message.render(session, entry.stamp),
        })
        .collect();
    if let Flush::Restart { skip_to, .. } = flush {
        let mids: Vec<u64> = outgoing.iter().map(|o| o.mid).collect();
        debug!(peer, ?skip_to, ?mids, "pipeline restarted");
        vat.trace(
            TOPIC_PIPELINE_RESTARTED,
            json!({ "peer": peer, "skip_to": skip_to, "mids": mids }),
        );
    }
    vat.effects
        .extend(outgoing.into_iter().map(Effect::Transmit));
    Ok(())
}

/// Turns allowed to fail on one answer before its message is sent again.
const DELIVERY_ATTEMPTS: u32 = 3;

/// Handles the buffered answer to the front of `peer`'s pipeline, if it has
/// arrived. If the turn aborts the answer goes back in the buffer; after
/// [`DELIVERY_ATTEMPTS`] failures it is dropped and the message resent, so
/// the peer replays the same answer later.
pub(crate) fn drain(vat: &mut Vat, peer: &str) -> Result<()> {
    let Some((mid, arrival)) = vat.take_arrival(peer) else {
        return Ok(());
    };
    let retry = arrival.clone();
    let owner = peer.to_string();
    vat.on_abort(move |vat| redeliver(vat, owner, mid, retry));
    receive(vat, peer, mid, arrival.result)?;
    if vat.has_arrivals(peer) {
        vat.effects.push(Effect::Drain {
            peer: peer.to_string(),
        });
    }
    Ok(())
}

fn redeliver(vat: &mut Vat, peer: String, mid: u64, mut arrival: Arrival) -> Result<()> {
    arrival.attempts += 1;
    if arrival.attempts < DELIVERY_ATTEMPTS {
        vat.stash(peer.clone(), mid, arrival);
        return drain(vat, &peer);
    }
    warn!(peer = %peer, mid, attempts = arrival.attempts, "answer could not be committed, resending");
    flush(vat, &peer, Flush::Entry(mid))
}

/// Settles the reply of message `mid` from the transport's answer. Only the
/// pending front may be answered.
fn receive(
    vat: &mut Vat,
    peer: &str,
    mid: u64,
    result: Result<WireResponse, TransportError>,
) -> Result<()> {
    let (entry, next) = vat.root_mut().outbound.dequeue(peer, mid)?;
    if let Some(flush) = next {
        vat.schedule(peer.to_string(), flush);
    }
    let status = result.as_ref().map(|r| r.status.as_u16()).ok();
    vat.trace(
        TOPIC_MSG_GOT,
        json!({ "peer": peer, "mid": mid, "status": status }),
    );
    match result {
        Ok(response) => {
            let reply = entry.message.reply();
            if let Err(error) = fulfill(vat, entry.message, response) {
                debug!(peer, mid, %error, "answer could not be applied");
                let reason = Rejection::BadSyntax {
                    reason: error.to_string(),
                };
                answer(vat, reply.resolver, Err(reason));
            }
            Ok(())
        }
        Err(error) => {
            debug!(peer, mid, %error, "transport failed");
            let reason = Rejection::Transport {
                reason: error.to_string(),
            };
            answer(vat, entry.message.reply().resolver, Err(reason));
            Ok(())
        }
    }
}

fn fulfill(vat: &mut Vat, message: Message, response: WireResponse) -> Result<()> {
    let reply = message.reply();
    let settled = match response.status.as_u16() {
        200..=203 => codec::deserialize(&response.body, vat).unwrap_or_else(|e| {
            Err(Rejection::BadSyntax {
                reason: e.to_string(),
            })
        }),
        204 | 205 => Ok(Value::Null),
        303 => match response.location() {
            Some(location) if !message.is_probe() => {
                let location = location.to_string();
                return follow(vat, message, &location);
            }
            Some(location) => {
                let location = location.to_string();
                Ok(vat.import(&location))
            }
            None => Err(Rejection::failure(response.status)),
        },
        404 => return retarget(vat, message),
        _ => Err(Rejection::failure(response.status)),
    };
    answer(vat, reply.resolver, settled);
    Ok(())
}

/// A 404 means the target did not exist yet. Probes are repeated; a call
/// sent against a still-deferred local promise is reissued once that
/// promise settles.
fn retarget(vat: &mut Vat, message: Message) -> Result<()> {
    let reply = message.reply();
    let not_found = Rejection::failure(StatusCode::NOT_FOUND);
    match message {
        Message::Query(Query {
            target,
            property: None,
            attempt,
            reply:
                Reply {
                    resolver: Some(resolver),
                    ..
                },
        }) if attempt + 1 < vat.settings.max_when_probes => {
            debug!(peer = %target.peer, attempt, "promise not yet resolved, probing again");
            probe(vat, target, resolver, attempt + 1);
        }
        message if message.is_probe() => answer(vat, reply.resolver, Err(not_found)),
        message => match reply.origin {
            Some(origin) => {
                let call = recall(vat, message)?;
                debug!(%origin, member = call.member(), "retargeting call");
                vat.when(origin, move |vat, settled| {
                    redispatch(vat, settled, call, reply.resolver)
                });
            }
            None => answer(vat, reply.resolver, Err(not_found)),
        },
    }
    Ok(())
}

/// A member call answered with a redirect went to a promise that resolved
/// elsewhere; the call is sent on to the resolution.
fn follow(vat: &mut Vat, message: Message, location: &str) -> Result<()> {
    let reply = message.reply();
    let call = recall(vat, message)?;
    debug!(member = call.member(), "following resolved target");
    let target = vat.import(location);
    dispatch(vat, target, call, reply.resolver)
}

/// The call a message was rendered from.
fn recall(vat: &mut Vat, message: Message) -> Result<Call> {
    Ok(match message {
        Message::Query(q) => Call::Get(q.property.unwrap_or_default()),
        Message::Update(Update {
            verb: Verb::Post,
            name,
            body,
            ..
        }) => Call::Invoke {
            method: name,
            args: codec::deserialize_args(body.as_bytes(), vat)?,
        },
        Message::Update(Update {
            verb: Verb::Put,
            name,
            body,
            ..
        }) => Call::Put {
            property: name,
            value: codec::deserialize_value(body.as_bytes(), vat)?,
        },
    })
}
