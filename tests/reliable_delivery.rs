use std::time::Duration;

use broker_link::core::{
    AckStatus, ConnectionState, DeliveryFailureReason, LinkCapabilities, LinkError, LinkEvent,
    OutboundMessage, WireFrame,
};
use broker_link::testing::{
    MockConnection, MockTransport, Recorded, RecordingHandler, test_config, wait_for_state,
};
use broker_link::ws::{BrokerLinkActor, BrokerLinkArgs, Connect, GetStatus, Stop, Submit};
use kameo::actor::{Actor, ActorRef};
use kameo::error::SendError;
use sonic_rs::{JsonValueTrait, json};

type TestLink = BrokerLinkActor<RecordingHandler, MockTransport>;

const WAIT: Duration = Duration::from_secs(2);

async fn connected(
    config: broker_link::core::LinkConfig,
) -> (
    ActorRef<TestLink>,
    MockConnection,
    broker_link::testing::Recordings,
) {
    let (transport, mut broker) = MockTransport::pair();
    let (handler, records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(config, transport, handler));
    link.tell(Connect).send().await.unwrap();
    let conn = broker.accept(WAIT).await.expect("connection");
    wait_for_state(&link, ConnectionState::Connected, WAIT)
        .await
        .expect("connected");
    (link, conn, records)
}

fn seq(frame: &WireFrame) -> u64 {
    frame.payload.get("seq").and_then(|v| v.as_u64()).unwrap_or(u64::MAX)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ok_ack_clears_the_pending_entry() {
    let (link, mut conn, mut records) = connected(test_config()).await;

    let id = link
        .ask(Submit(
            OutboundMessage::new("order", json!({"seq": 1})).reliable(),
        ))
        .await
        .unwrap();
    let sent = conn.recv_unpacked(WAIT).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message_id.as_ref(), Some(&id));
    assert!(sent[0].requires_ack);
    assert_eq!(link.ask(GetStatus).await.unwrap().pending, 1);

    conn.send_wire(&WireFrame::ack(id.clone(), AckStatus::Ok)).unwrap();
    let delivered = records
        .wait_for(WAIT, |record| match record {
            Recorded::Event(LinkEvent::Delivered { message_id, attempts }) => {
                Some((message_id, attempts))
            }
            _ => None,
        })
        .await
        .expect("delivered event");
    assert_eq!(delivered, (id, 1));
    assert_eq!(link.ask(GetStatus).await.unwrap().pending, 0);

    // No resend once acknowledged.
    assert!(conn.recv_wire(Duration::from_millis(150)).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unacknowledged_message_is_resent_then_reported_once() {
    let mut config = test_config();
    config.retry.base_delay_ms = 20;
    config.retry.max_delay_ms = 40;
    config.retry.max_attempts = 3;
    let (link, mut conn, mut records) = connected(config).await;

    let id = link
        .ask(Submit(
            OutboundMessage::new("order", json!({"seq": 1}))
                .reliable()
                .critical(),
        ))
        .await
        .unwrap();
    for _ in 0..3 {
        let frame = conn.recv_wire(WAIT).await.expect("send attempt");
        assert_eq!(frame.message_id.as_ref(), Some(&id));
    }

    let failure = records
        .wait_for(WAIT, |record| match record {
            Recorded::Failure(failure) => Some(failure),
            _ => None,
        })
        .await
        .expect("delivery failure");
    assert_eq!(failure.message_id, id);
    assert_eq!(failure.reason, DeliveryFailureReason::RetriesExhausted);
    assert_eq!(failure.attempts, 3);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(records.failures().is_empty());
    assert!(conn.recv_wire(Duration::from_millis(50)).await.is_none());
    assert_eq!(link.ask(GetStatus).await.unwrap().pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn error_ack_reports_a_rejection() {
    let (link, mut conn, mut records) = connected(test_config()).await;
    let id = link
        .ask(Submit(
            OutboundMessage::new("order", json!({})).reliable().critical(),
        ))
        .await
        .unwrap();
    assert!(conn.recv_wire(WAIT).await.is_some());

    conn.send_wire(&WireFrame::ack(id.clone(), AckStatus::Error)).unwrap();
    let failure = records
        .wait_for(WAIT, |record| match record {
            Recorded::Failure(failure) => Some(failure),
            _ => None,
        })
        .await
        .expect("rejection");
    assert_eq!(failure.message_id, id);
    assert_eq!(failure.reason, DeliveryFailureReason::Rejected);
    assert_eq!(link.ask(GetStatus).await.unwrap().pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn offline_queue_flushes_in_order_and_drops_stale_entries() {
    let mut config = test_config();
    config.offline.stale_after_ms = 40;
    let (transport, mut broker) = MockTransport::pair();
    let (handler, mut records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(config, transport, handler));

    let stale = link
        .ask(Submit(OutboundMessage::new("telemetry", json!({"seq": 0}))))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;
    for seq in 1..=3u64 {
        link.ask(Submit(OutboundMessage::new("telemetry", json!({"seq": seq}))))
            .await
            .unwrap();
    }
    assert_eq!(link.ask(GetStatus).await.unwrap().offline_queued, 4);

    link.tell(Connect).send().await.unwrap();
    let mut conn = broker.accept(WAIT).await.expect("connection");
    let sent = conn.recv_unpacked(WAIT).await;
    assert_eq!(sent.iter().map(seq).collect::<Vec<_>>(), [1, 2, 3]);

    let dropped = records
        .wait_for(WAIT, |record| match record {
            Recorded::Event(LinkEvent::StaleDropped { message_id }) => Some(message_id),
            _ => None,
        })
        .await
        .expect("stale drop event");
    assert_eq!(dropped, stale);
    assert_eq!(link.ask(GetStatus).await.unwrap().offline_queued, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_offline_queue_evicts_the_oldest_entry() {
    let mut config = test_config();
    config.offline.capacity = 2;
    let (transport, _broker) = MockTransport::pair();
    let (handler, mut records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(config, transport, handler));

    let first = link
        .ask(Submit(OutboundMessage::new("telemetry", json!({"seq": 1}))))
        .await
        .unwrap();
    for seq in 2..=3u64 {
        link.ask(Submit(OutboundMessage::new("telemetry", json!({"seq": seq}))))
            .await
            .unwrap();
    }

    let failures = records.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].message_id, first);
    assert_eq!(failures[0].reason, DeliveryFailureReason::QueueOverflow);
    assert_eq!(link.ask(GetStatus).await.unwrap().offline_queued, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn twelve_quick_submissions_go_out_as_ten_then_two() {
    let mut config = test_config();
    config.batching.max_batch_delay_ms = 50;
    let (link, mut conn, _records) = connected(config).await;

    for seq in 0..12u64 {
        link.ask(Submit(OutboundMessage::new("telemetry", json!({"seq": seq}))))
            .await
            .unwrap();
    }

    let first = conn.recv_wire(WAIT).await.expect("first batch");
    assert_eq!(first.kind, "batch");
    let first = first.messages.unwrap_or_default();
    assert_eq!(first.iter().map(seq).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());

    let second = conn.recv_unpacked(WAIT).await;
    assert_eq!(second.iter().map(seq).collect::<Vec<_>>(), [10, 11]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn critical_message_flushes_buffered_traffic_first() {
    let mut config = test_config();
    config.batching.max_batch_delay_ms = 500;
    let (link, mut conn, _records) = connected(config).await;

    link.ask(Submit(OutboundMessage::new("telemetry", json!({"seq": 1}))))
        .await
        .unwrap();
    link.ask(Submit(
        OutboundMessage::new("alert", json!({"seq": 2})).critical(),
    ))
    .await
    .unwrap();

    let first = conn.recv_wire(WAIT).await.expect("buffered message");
    assert_eq!((first.kind.as_str(), seq(&first)), ("telemetry", 1));
    let second = conn.recv_wire(WAIT).await.expect("critical message");
    assert_eq!((second.kind.as_str(), seq(&second)), ("alert", 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn large_payloads_are_gzip_compressed() {
    let mut config = test_config();
    config.batching.compression_threshold_bytes = 256;
    let (link, mut conn, _records) = connected(config).await;

    let blob = "x".repeat(4096);
    link.ask(Submit(
        OutboundMessage::new("snapshot", json!({"blob": blob})).critical(),
    ))
    .await
    .unwrap();

    let raw = conn.recv_frame(WAIT).await.expect("frame");
    assert!(matches!(raw, broker_link::core::WsFrame::Binary(_)));
    let decoded = broker_link::ws::ProtocolRouter::decode(&raw).unwrap().unwrap();
    assert_eq!(decoded.kind, "snapshot");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_rejects_per_kind_and_sender() {
    let mut config = test_config();
    config.rate_limit.max_requests = 2;
    config.rate_limit.window_ms = 60_000;
    let (transport, _broker) = MockTransport::pair();
    let (handler, _records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(config, transport, handler));

    for _ in 0..2 {
        link.ask(Submit(OutboundMessage::new("quote", json!({}))))
            .await
            .unwrap();
    }
    match link.ask(Submit(OutboundMessage::new("quote", json!({})))).await {
        Err(SendError::HandlerError(LinkError::RateLimitExceeded { key, retry_after })) => {
            assert_eq!(key, "quote:test-client");
            assert!(retry_after > Duration::from_secs(59));
        }
        other => panic!("expected rate limit rejection, got {other:?}"),
    }

    // Other keys have their own window.
    link.ask(Submit(
        OutboundMessage::new("quote", json!({})).with_sender("desk-2"),
    ))
    .await
    .unwrap();
    link.ask(Submit(OutboundMessage::new("trade", json!({}))))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_drops_pending_work_without_failure_callbacks() {
    let (link, mut conn, mut records) = connected(test_config()).await;
    for seq in 0..3u64 {
        link.ask(Submit(
            OutboundMessage::new("order", json!({"seq": seq})).reliable(),
        ))
        .await
        .unwrap();
    }
    assert!(!conn.recv_unpacked(WAIT).await.is_empty());

    link.tell(Stop).send().await.unwrap();
    let status = wait_for_state(&link, ConnectionState::Disconnected, WAIT)
        .await
        .expect("stopped");
    assert_eq!(status.pending, 0);
    assert_eq!(status.offline_queued, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(records.failures().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pending_messages_are_resent_after_reconnect() {
    let mut config = test_config();
    config.retry.base_delay_ms = 60;
    config.retry.max_attempts = 5;
    let (transport, mut broker) = MockTransport::pair();
    let (handler, mut records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(config, transport, handler));
    link.tell(Connect).send().await.unwrap();
    let mut first = broker.accept(WAIT).await.expect("connection");

    let id = link
        .ask(Submit(
            OutboundMessage::new("order", json!({})).reliable().critical(),
        ))
        .await
        .unwrap();
    assert!(first.recv_wire(WAIT).await.is_some());
    first.drop_socket();

    let mut second = broker.accept(WAIT).await.expect("reconnected");
    let resent = second.recv_wire(WAIT).await.expect("resend on new socket");
    assert_eq!(resent.message_id.as_ref(), Some(&id));

    second
        .send_wire(&WireFrame::ack(id.clone(), AckStatus::Ok))
        .unwrap();
    let attempts = records
        .wait_for(WAIT, |record| match record {
            Recorded::Event(LinkEvent::Delivered { message_id, attempts }) if message_id == id => {
                Some(attempts)
            }
            _ => None,
        })
        .await
        .expect("delivered");
    assert_eq!(attempts, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stability_monitor_sends_without_tracking() {
    let config = test_config().with_capabilities(LinkCapabilities::stability_monitor());
    let (link, mut conn, _records) = connected(config).await;

    let id = link
        .ask(Submit(
            OutboundMessage::new("order", json!({})).reliable(),
        ))
        .await
        .unwrap();
    let frame = conn.recv_wire(WAIT).await.expect("sent immediately");
    assert_eq!(frame.message_id, Some(id));
    assert_eq!(link.ask(GetStatus).await.unwrap().pending, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batched_reliable_message_is_requeued_untracked_on_disconnect() {
    let mut config = test_config();
    config.batching.max_batch_delay_ms = 500;
    config.retry.base_delay_ms = 2_000;
    config.retry.max_delay_ms = 2_000;
    config.reconnect.base_delay_ms = 200;
    config.reconnect.max_delay_ms = 400;
    let (transport, mut broker) = MockTransport::pair();
    let (handler, mut records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(config, transport, handler));
    link.tell(Connect).send().await.unwrap();
    let mut first = broker.accept(WAIT).await.expect("connection");
    wait_for_state(&link, ConnectionState::Connected, WAIT)
        .await
        .expect("connected");

    let id = link
        .ask(Submit(OutboundMessage::new("order", json!({})).reliable()))
        .await
        .unwrap();
    assert_eq!(link.ask(GetStatus).await.unwrap().pending, 1);
    first.drop_socket();

    let status = wait_for_state(&link, ConnectionState::Reconnecting, WAIT)
        .await
        .expect("reconnecting");
    assert_eq!(status.pending, 0);
    assert_eq!(status.offline_queued, 1);

    let mut second = broker.accept(WAIT).await.expect("reconnected");
    let sent = second.recv_unpacked(WAIT).await;
    assert!(sent.iter().any(|frame| frame.message_id.as_ref() == Some(&id)));
    assert_eq!(link.ask(GetStatus).await.unwrap().pending, 1);

    second
        .send_wire(&WireFrame::ack(id.clone(), AckStatus::Ok))
        .unwrap();
    let attempts = records
        .wait_for(WAIT, |record| match record {
            Recorded::Event(LinkEvent::Delivered { message_id, attempts }) if message_id == id => {
                Some(attempts)
            }
            _ => None,
        })
        .await
        .expect("delivered");
    assert_eq!(attempts, 1);
    assert!(records.failures().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submissions_after_stop_are_rejected_until_connect() {
    let (transport, mut broker) = MockTransport::pair();
    let (handler, _records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(test_config(), transport, handler));
    link.tell(Connect).send().await.unwrap();
    assert!(broker.accept(WAIT).await.is_some());
    wait_for_state(&link, ConnectionState::Connected, WAIT)
        .await
        .expect("connected");

    link.tell(Stop).send().await.unwrap();
    match link.ask(Submit(OutboundMessage::new("order", json!({})))).await {
        Err(SendError::HandlerError(LinkError::Stopped)) => {}
        other => panic!("expected stopped rejection, got {other:?}"),
    }
    assert_eq!(link.ask(GetStatus).await.unwrap().offline_queued, 0);

    link.tell(Connect).send().await.unwrap();
    let mut conn = broker.accept(WAIT).await.expect("connected again");
    wait_for_state(&link, ConnectionState::Connected, WAIT)
        .await
        .expect("connected");
    let id = link
        .ask(Submit(OutboundMessage::new("order", json!({})).critical()))
        .await
        .unwrap();
    let frame = conn.recv_wire(WAIT).await.expect("sent after reconnect");
    assert_eq!(frame.message_id, Some(id));
}
