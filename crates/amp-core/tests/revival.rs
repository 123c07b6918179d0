mod common;

use amp_core::samples::Drum;
use amp_core::{callee, Executor, MemoryStore, Ref, Value, WireRequest};
use amp_protocol::WebKey;
use http::{Method, StatusCode};

fn keys_in(body: &[u8]) -> Vec<WebKey> {
    let args: serde_json::Value = serde_json::from_slice(body).unwrap();
    args.as_array()
        .unwrap()
        .iter()
        .map(|arg| WebKey::parse(arg["@"].as_str().unwrap()).unwrap())
        .collect()
}

fn read(vat: &mut amp_core::Vat, key: &WebKey) -> StatusCode {
    let target = key.request_url(&key.params());
    callee::serve(vat, WireRequest::new(Method::GET, target)).status
}

#[test]
fn references_in_a_resent_message_still_answer_after_revival() {
    let store = MemoryStore::new();
    let mut a = common::open("http://a/", store.clone());
    let kept = a.publish("kept", Box::new(Drum::new())).unwrap();
    let (pending, _resolver) = a.defer();
    let b = Value::Ref(Ref::Remote(WebKey::object("http://b/", "K")));
    a.send(
        b,
        "bang",
        vec![Value::Ref(Ref::Object(amp_core::ObjectId(0))), Value::Ref(Ref::Promise(pending))],
    )
    .unwrap();
    a.run_until_idle();
    let lost = a.take_outbox();
    assert_eq!(lost.len(), 1);
    let keys = keys_in(&lost[0].request.body);
    assert_eq!(keys[0], kept);
    assert!(keys[1].promise);
    drop(a);

    let mut a = common::open("http://a/", store);
    a.publish("kept", Box::new(Drum::new())).unwrap();
    a.run_until_idle();
    let resent = a.take_outbox();
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].request.body, lost[0].request.body);

    assert_eq!(read(&mut a, &keys[0]), StatusCode::OK);
    assert_eq!(read(&mut a, &keys[1]), StatusCode::GONE);
    let unknown = WebKey::promise("http://a/", "never-minted");
    assert_eq!(read(&mut a, &unknown), StatusCode::NOT_FOUND);
}
