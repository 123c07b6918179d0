mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use amp_core::samples::Drum;
use amp_core::{callee, Executor, MemoryStore, Ref, State, Value};

#[test]
fn replayed_post_gives_identical_bytes_and_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut a = common::open("http://a/", MemoryStore::new());
    let mut b = common::open("http://b/", MemoryStore::new());
    let drum = b.publish("drum", Box::new(Drum::counted(calls.clone()))).unwrap();
    let target = Value::Ref(Ref::Remote(drum));

    let banged = a.invoke(target, "bang", vec![Value::Int(5)]).unwrap();
    a.run_until_idle();
    let out = a.take_outbox();
    assert_eq!(out.len(), 1);
    let first = callee::serve(&mut b, out[0].request.clone());
    let again = callee::serve(&mut b, out[0].request.clone());
    assert_eq!(first, again);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    a.deliver(out[0].peer.clone(), out[0].mid, Ok(again));
    a.run_until_idle();
    assert!(matches!(a.state(banged), State::Fulfilled(Value::Ref(Ref::Remote(_)))));
    assert!(a.outbound().is_idle());
}

#[test]
fn revived_caller_resends_the_same_slot_without_double_count() {
    let calls = Arc::new(AtomicUsize::new(0));
    let store = MemoryStore::new();
    let mut a = common::open("http://a/", store.clone());
    let mut b = common::open("http://b/", MemoryStore::new());
    let drum = b.publish("drum", Box::new(Drum::counted(calls.clone()))).unwrap();
    let target = Value::Ref(Ref::Remote(drum.clone()));

    a.invoke(target, "bang", vec![Value::Int(5)]).unwrap();
    a.run_until_idle();
    let lost = a.take_outbox();
    assert_eq!(lost.len(), 1);
    // Executed by the callee, but the caller crashes before the answer lands.
    callee::serve(&mut b, lost[0].request.clone());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    drop(a);

    let mut a = common::open("http://a/", store);
    a.run_until_idle();
    let resent = a.take_outbox();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].mid, lost[0].mid);
    assert_eq!(resent[0].request, lost[0].request);
    let response = callee::serve(&mut b, resent[0].request.clone());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    a.deliver(resent[0].peer.clone(), resent[0].mid, Ok(response));
    a.run_until_idle();
    assert!(a.outbound().is_idle());

    let hits = a.get(Value::Ref(Ref::Remote(drum)), "hits").unwrap();
    common::pump(&mut a, &mut b);
    assert_eq!(a.state(hits), State::Fulfilled(&Value::Int(5)));
}
