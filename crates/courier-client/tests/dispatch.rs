//! Dispatcher behaviour against an in-process broker, with the worker
//! side played by a plain queue listener.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_broker::{
    handler_fn, Broker, EnqueueOptions, MemoryBroker, QueueOptions, Verdict,
};
use courier_client::{AdapterManager, ConnectionConfig, DispatchError, RequestConfig};
use courier_proto::{
    codec, BodyKind, Outcome, QueueTopology, RequestId, ResponseRecord, ResponseType,
};
use tokio_util::sync::CancellationToken;

const QUEUE: &str = "dispatch-tests";

/// Listens on the shared queue and answers every envelope with `outcome`.
/// Returns a slot that captures the correlation id of the first request.
async fn respond_with(broker: &Arc<MemoryBroker>, outcome: Outcome) -> Arc<Mutex<Option<String>>> {
    let seen = Arc::new(Mutex::new(None));
    let captured = seen.clone();
    let respond_broker = broker.clone();
    let queue = broker
        .get_queue(QUEUE, QueueOptions::confirm())
        .await
        .unwrap();
    queue
        .listen(handler_fn(move |delivery| {
            let broker = respond_broker.clone();
            let captured = captured.clone();
            let outcome = outcome.clone();
            Box::pin(async move {
                let envelope = codec::decode_envelope(&delivery.payload).unwrap();
                let correlation = delivery.correlation_id.expect("correlated publish");
                *captured.lock().unwrap() = Some(correlation.clone());

                let request_id = RequestId::parse(&correlation).unwrap();
                assert_eq!(envelope.request_id, request_id);
                let topology = QueueTopology::resolve(QUEUE, request_id);
                let response_q = broker
                    .get_queue(&topology.response, QueueOptions::default())
                    .await
                    .unwrap();
                response_q
                    .enqueue(codec::encode_outcome(&outcome).unwrap(), EnqueueOptions::default())
                    .await
                    .unwrap();
                Verdict::Ack
            })
        }))
        .await
        .unwrap();
    seen
}

fn json_response(status: u16, body: serde_json::Value) -> ResponseRecord {
    let mut record = ResponseRecord::with_status(status, "OK");
    record.body = serde_json::to_vec(&body).unwrap();
    record.body_kind = BodyKind::Json;
    record
        .headers
        .push(("content-type".into(), "application/json".into()));
    record
}

#[tokio::test]
async fn round_trip_settles_with_worker_response() {
    let broker = Arc::new(MemoryBroker::new());
    let seen = respond_with(
        &broker,
        Outcome::Response(json_response(200, serde_json::json!({"id": 12345}))),
    )
    .await;

    let adapter = AdapterManager::make(QUEUE, ConnectionConfig::External(broker.clone())).unwrap();
    let response = adapter
        .dispatch(RequestConfig::get("/user/12345"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.get_header("Content-Type"), Some("application/json"));
    let body: serde_json::Value = response.json().unwrap();
    assert_eq!(body["id"], 12345);

    // The shared queue survives; the per-request queues do not.
    let correlation = seen.lock().unwrap().clone().unwrap();
    let topology = QueueTopology::resolve(QUEUE, RequestId::parse(&correlation).unwrap());
    assert!(broker.has_queue(QUEUE));
    assert!(!broker.has_queue(&topology.response));
    assert!(!broker.has_queue(&topology.upload_progress));
    assert!(!broker.has_queue(&topology.download_progress));
    assert!(!broker.has_queue(&topology.cancel));
}

#[tokio::test]
async fn failing_status_predicate_surfaces_response() {
    let broker = Arc::new(MemoryBroker::new());
    respond_with(
        &broker,
        Outcome::Response(json_response(404, serde_json::json!({"error": "missing"}))),
    )
    .await;

    let adapter = AdapterManager::make(QUEUE, ConnectionConfig::External(broker)).unwrap();
    let err = adapter
        .dispatch(RequestConfig::get("/user/0"))
        .await
        .unwrap_err();

    match err {
        DispatchError::Status { status, message, response, .. } => {
            assert_eq!(status, 404);
            assert_eq!(message, "Request failed with status code 404");
            let body: serde_json::Value = response.json().unwrap();
            assert_eq!(body["error"], "missing");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn stream_response_type_settles_locally_without_publishing() {
    let broker = Arc::new(MemoryBroker::new());

    let mut config = RequestConfig::get("/download").with_validate_status(None);
    config.response_type = ResponseType::Stream;

    let adapter = AdapterManager::make(QUEUE, ConnectionConfig::External(broker.clone())).unwrap();
    let response = adapter.dispatch(config).await.unwrap();

    assert_eq!(response.status, 406);
    assert_eq!(response.status_text, "Response Type \"stream\" Not Supported");
    assert_eq!(broker.enqueued_total(QUEUE), 0);
}

#[tokio::test]
async fn cancellation_wins_when_no_worker_answers() {
    let broker = Arc::new(MemoryBroker::new());
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let adapter = AdapterManager::make(QUEUE, ConnectionConfig::External(broker.clone())).unwrap();
    let err = adapter
        .dispatch(RequestConfig::get("/slow").with_cancel(token))
        .await
        .unwrap_err();

    assert!(err.is_canceled());
    // The envelope reached the shared queue before the cancellation fired.
    assert_eq!(broker.enqueued_total(QUEUE), 1);
}

#[tokio::test]
async fn cancel_marker_lands_even_when_response_wins_the_race() {
    let broker = Arc::new(MemoryBroker::new());
    let token = CancellationToken::new();
    let seen: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

    // The responder fires the token and answers in the same breath, so
    // both race branches become ready together.
    let respond_broker = broker.clone();
    let racer = token.clone();
    let captured = seen.clone();
    let queue = broker
        .get_queue(QUEUE, QueueOptions::confirm())
        .await
        .unwrap();
    queue
        .listen(handler_fn(move |delivery| {
            let broker = respond_broker.clone();
            let racer = racer.clone();
            let captured = captured.clone();
            Box::pin(async move {
                let correlation = delivery.correlation_id.expect("correlated publish");
                *captured.lock().unwrap() = Some(correlation.clone());
                let topology =
                    QueueTopology::resolve(QUEUE, RequestId::parse(&correlation).unwrap());
                let response_q = broker
                    .get_queue(&topology.response, QueueOptions::default())
                    .await
                    .unwrap();
                racer.cancel();
                let outcome = Outcome::Response(json_response(200, serde_json::json!({})));
                response_q
                    .enqueue(codec::encode_outcome(&outcome).unwrap(), EnqueueOptions::default())
                    .await
                    .unwrap();
                Verdict::Ack
            })
        }))
        .await
        .unwrap();

    let adapter = AdapterManager::make(QUEUE, ConnectionConfig::External(broker.clone())).unwrap();
    let result = adapter
        .dispatch(RequestConfig::get("/race").with_cancel(token))
        .await;

    // Either branch may win, but the marker publish always completes
    // before dispatch returns.
    match &result {
        Ok(response) => assert_eq!(response.status, 200),
        Err(err) => assert!(err.is_canceled()),
    }
    let correlation = seen.lock().unwrap().clone().unwrap();
    let topology = QueueTopology::resolve(QUEUE, RequestId::parse(&correlation).unwrap());
    assert_eq!(broker.enqueued_total(&topology.cancel), 1);
}

#[tokio::test]
async fn owned_connection_is_single_use() {
    let broker = Arc::new(MemoryBroker::new());
    let manager = AdapterManager::new(QUEUE, ConnectionConfig::Owned(broker.clone()));
    let adapter = manager.adapter().unwrap();

    let mut config = RequestConfig::get("/download").with_validate_status(None);
    config.response_type = ResponseType::Stream;
    let response = adapter.dispatch(config).await.unwrap();
    assert_eq!(response.status, 406);

    assert!(broker.is_closed());
    assert!(matches!(
        manager.adapter(),
        Err(DispatchError::ConnectionClosed)
    ));
}

#[tokio::test]
async fn external_connection_survives_dispatch_and_manager_close() {
    let broker = Arc::new(MemoryBroker::new());
    respond_with(&broker, Outcome::Response(json_response(200, serde_json::json!({})))).await;

    let manager = AdapterManager::new(QUEUE, ConnectionConfig::External(broker.clone()));
    let adapter = manager.adapter().unwrap();
    adapter.dispatch(RequestConfig::get("/a")).await.unwrap();
    assert!(!broker.is_closed());

    manager.close().await.unwrap();
    assert!(!broker.is_closed());

    // Still usable for a second request.
    adapter.dispatch(RequestConfig::get("/b")).await.unwrap();
}
