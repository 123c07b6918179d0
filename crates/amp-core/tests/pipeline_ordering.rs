use std::sync::Arc;

use amp_core::{
    spawn, MemoryStore, Ref, Transport, TransportError, Value, Vat, VatSettings, WireRequest,
    WireResponse,
};
use amp_protocol::WebKey;
use async_trait::async_trait;
use http::{Method, StatusCode};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration};

type Exchange = (WireRequest, oneshot::Sender<WireResponse>);

/// Hands every request to the test, which answers whenever it likes.
struct Switchboard {
    tx: mpsc::UnboundedSender<Exchange>,
}

#[async_trait]
impl Transport for Switchboard {
    async fn exchange(&self, _peer: &str, request: WireRequest) -> Result<WireResponse, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send((request, reply)).map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)
    }
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Exchange>) -> Exchange {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("request in time")
        .expect("switchboard open")
}

#[tokio::test]
async fn update_waits_for_earlier_queries_even_when_later_answers_arrive_first() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let vat = Vat::open(VatSettings::default(), Box::new(MemoryStore::new()), None).unwrap();
    let handle = spawn(vat, Arc::new(Switchboard { tx }));
    let drum = Value::Ref(Ref::Remote(WebKey::object("http://b/", "K")));

    let (a, b, c) = handle
        .call(move |vat| {
            let a = vat.get(drum.clone(), "hits")?;
            let b = vat.get(drum.clone(), "kind")?;
            let c = vat.invoke(drum, "bang", vec![Value::Int(1)])?;
            Ok((a, b, c))
        })
        .await
        .unwrap();

    let (req_a, reply_a) = next(&mut rx).await;
    let (req_b, reply_b) = next(&mut rx).await;
    assert_eq!(req_a.method, Method::GET);
    assert!(req_a.target.contains("p=hits"), "{}", req_a.target);
    assert!(req_b.target.contains("p=kind"), "{}", req_b.target);

    reply_b
        .send(WireResponse::json(StatusCode::OK, r#""Drum""#))
        .unwrap();
    assert!(
        timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
        "update sent before the first query was answered"
    );
    let b_settled = handle.call(move |vat| Ok(vat.settled(b).is_some())).await.unwrap();
    assert!(!b_settled, "answers are surfaced in send order");

    reply_a.send(WireResponse::json(StatusCode::OK, "0")).unwrap();
    let (req_c, reply_c) = next(&mut rx).await;
    assert_eq!(req_c.method, Method::POST);
    assert!(req_c.target.contains("p=bang"), "{}", req_c.target);
    reply_c.send(WireResponse::empty(StatusCode::NO_CONTENT)).unwrap();

    assert_eq!(handle.settled(a).await.unwrap(), Ok(Value::Int(0)));
    assert_eq!(
        handle.settled(b).await.unwrap(),
        Ok(Value::Text("Drum".into()))
    );
    assert_eq!(handle.settled(c).await.unwrap(), Ok(Value::Null));
}

#[tokio::test]
async fn query_only_traffic_is_never_held() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let vat = Vat::open(VatSettings::default(), Box::new(MemoryStore::new()), None).unwrap();
    let handle = spawn(vat, Arc::new(Switchboard { tx }));
    let drum = Value::Ref(Ref::Remote(WebKey::object("http://b/", "K")));

    handle
        .call(move |vat| {
            for _ in 0..5 {
                vat.get(drum.clone(), "hits")?;
            }
            Ok(())
        })
        .await
        .unwrap();
    let mut pending = Vec::new();
    for _ in 0..5 {
        pending.push(next(&mut rx).await);
    }
    assert!(pending.iter().all(|(req, _)| req.method == Method::GET));
}
