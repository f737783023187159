use std::sync::{Arc, Mutex};
use std::time::Duration;

use broker_link::core::{
    AckStatus, ConnectionState, LinkCapabilities, LinkEvent, MessageId, OutboundMessage, WireFrame,
};
use broker_link::testing::{
    MockTransport, Recorded, RecordingHandler, test_config, wait_for_state,
};
use broker_link::ws::{BrokerLinkActor, BrokerLinkArgs, Connect, GetConnectionStats, GetStatus, Submit};
use kameo::actor::Actor;
use sonic_rs::{JsonValueTrait, json};

type TestLink = BrokerLinkActor<RecordingHandler, MockTransport>;

const WAIT: Duration = Duration::from_secs(2);

fn app_frame(kind: &str, id: &str, requires_ack: bool) -> WireFrame {
    let mut frame: WireFrame =
        sonic_rs::from_str(&format!(r#"{{"type":"{kind}","payload":{{"n":1}}}}"#)).unwrap();
    frame.message_id = Some(MessageId::from(id));
    frame.requires_ack = requires_ack;
    frame
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_deliveries_are_acked_but_handled_once() {
    let (transport, mut broker) = MockTransport::pair();
    let (handler, mut records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(test_config(), transport, handler));
    link.tell(Connect).send().await.unwrap();
    let mut conn = broker.accept(WAIT).await.expect("connection");

    let frame = app_frame("notice", "srv-1", true);
    conn.send_wire(&frame).unwrap();
    conn.send_wire(&frame).unwrap();

    for _ in 0..2 {
        let ack = conn.recv_kind("message_ack", WAIT).await.expect("ack");
        assert_eq!(ack.message_id, Some(MessageId::from("srv-1")));
        assert_eq!(ack.status, Some(AckStatus::Ok));
    }

    let delivered = records
        .wait_for(WAIT, |record| match record {
            Recorded::Message(frame) => Some(frame),
            _ => None,
        })
        .await
        .expect("message delivered");
    assert_eq!(delivered.kind, "notice");
    assert!(
        records
            .wait_for(Duration::from_millis(100), |record| match record {
                Recorded::Message(frame) => Some(frame),
                _ => None,
            })
            .await
            .is_none()
    );
    wait_for_state(&link, ConnectionState::Connected, WAIT)
        .await
        .expect("still connected");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn routed_types_bypass_the_handler() {
    let (transport, mut broker) = MockTransport::pair();
    let (handler, mut records) = RecordingHandler::new();
    let commands = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&commands);
    let args = BrokerLinkArgs::with_transport(test_config(), transport, handler)
        .route("command", move |frame: WireFrame| {
            sink.lock().unwrap().push(frame.message_id);
        });
    let link = TestLink::spawn(args);
    link.tell(Connect).send().await.unwrap();
    let conn = broker.accept(WAIT).await.expect("connection");

    // A batch carrying a routed frame and an unrouted one, in order.
    let batch = WireFrame::batch(vec![
        app_frame("command", "c-1", false),
        app_frame("status", "s-1", false),
    ]);
    conn.send_wire(&batch).unwrap();

    let unrouted = records
        .wait_for(WAIT, |record| match record {
            Recorded::Message(frame) => Some(frame),
            _ => None,
        })
        .await
        .expect("unrouted frame reaches handler");
    assert_eq!(unrouted.kind, "status");
    assert_eq!(*commands.lock().unwrap(), [Some(MessageId::from("c-1"))]);
    let _ = link.ask(GetStatus).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn broker_heartbeats_are_answered_with_the_same_timestamp() {
    let (transport, mut broker) = MockTransport::pair();
    let (handler, _records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(test_config(), transport, handler));
    link.tell(Connect).send().await.unwrap();
    let mut conn = broker.accept(WAIT).await.expect("connection");

    conn.send_wire(&WireFrame::heartbeat(1_234)).unwrap();
    let response = conn
        .recv_kind("heartbeat_response", WAIT)
        .await
        .expect("heartbeat response");
    assert_eq!(response.timestamp, 1_234);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_frames_are_dropped_without_disconnecting() {
    let (transport, mut broker) = MockTransport::pair();
    let (handler, mut records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(test_config(), transport, handler));
    link.tell(Connect).send().await.unwrap();
    let conn = broker.accept(WAIT).await.expect("connection");

    conn.send_text("{definitely not json").unwrap();
    conn.send_text(r#"{"type":"message_ack"}"#).unwrap();
    conn.send_wire(&app_frame("notice", "after", false)).unwrap();

    let frame = records
        .wait_for(WAIT, |record| match record {
            Recorded::Message(frame) => Some(frame),
            _ => None,
        })
        .await
        .expect("valid frame still delivered");
    assert_eq!(frame.message_id, Some(MessageId::from("after")));

    let stats = link.ask(GetConnectionStats).await.unwrap();
    assert_eq!(stats.errors, 2);
    assert_eq!(stats.messages, 3);
    assert_eq!(
        link.ask(GetStatus).await.unwrap().state,
        ConnectionState::Connected
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sends_wait_for_registration_when_required() {
    let mut config = test_config().with_capabilities(LinkCapabilities::protocol_agent());
    config.registration.role = "pricer".to_string();
    config.registration.capabilities = vec!["quotes".to_string()];
    let (transport, mut broker) = MockTransport::pair();
    let (handler, mut records) = RecordingHandler::new();
    let link = TestLink::spawn(BrokerLinkArgs::with_transport(config, transport, handler));
    link.tell(Connect).send().await.unwrap();
    let mut conn = broker.accept(WAIT).await.expect("connection");

    let register = conn.recv_kind("register", WAIT).await.expect("register frame");
    assert_eq!(
        register.payload.get("role").and_then(|v| v.as_str()),
        Some("pricer")
    );
    assert_eq!(
        register.payload.get("clientId").and_then(|v| v.as_str()),
        Some("test-client")
    );

    wait_for_state(&link, ConnectionState::Connected, WAIT)
        .await
        .expect("connected");
    link.ask(Submit(
        OutboundMessage::new("quote", json!({"px": 1})).critical(),
    ))
    .await
    .unwrap();
    let status = link.ask(GetStatus).await.unwrap();
    assert!(!status.registered);
    assert_eq!(status.offline_queued, 1);
    assert!(conn.recv_wire(Duration::from_millis(100)).await.is_none());

    conn.send_text(r#"{"type":"registered"}"#).unwrap();
    let quote = conn.recv_kind("quote", WAIT).await.expect("queued quote flushed");
    assert_eq!(quote.payload.get("px").and_then(|v| v.as_u64()), Some(1));
    assert!(
        records
            .wait_for(WAIT, |record| match record {
                Recorded::Event(LinkEvent::Registered) => Some(()),
                _ => None,
            })
            .await
            .is_some()
    );
    assert!(link.ask(GetStatus).await.unwrap().registered);
}
