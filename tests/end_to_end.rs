//! Broker and clients over loopback

use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};
use switchyard::protocol::{self, HeartbeatRequest, MessageType, Reply, RegisterRequest};
use switchyard::{
    Broker, BrokerConfig, BrokerHandle, ChannelPattern, ChannelRole, Client, ClientConfig,
    CloseReason, ClosingNotice, FrameInfo, KeyPair, ProducerInfo, SchemaHash, SwitchyardError,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start_broker(heartbeat_timeout_ms: u64) -> BrokerHandle {
    Broker::spawn(BrokerConfig {
        endpoint: "tcp://127.0.0.1:*".into(),
        heartbeat_timeout_ms,
        tick_ms: 20,
        ..Default::default()
    })
    .unwrap()
}

fn client_config() -> ClientConfig {
    ClientConfig {
        heartbeat_interval_ms: 50,
        tick_ms: 10,
        discovery_retry_ms: 50,
        shm_capacity: 4096,
        ..Default::default()
    }
}

fn connected_client(broker: &BrokerHandle) -> Client {
    let client = Client::new(client_config()).unwrap();
    client.connect(broker.endpoint(), broker.public_key()).unwrap();
    client
}

/// Unique per process so parallel test runs do not share segments
fn channel_name(base: &str) -> String {
    format!("{}_{}", base, std::process::id())
}

fn closing_notices(client: &Client) -> flume::Receiver<ClosingNotice> {
    let (tx, rx) = flume::unbounded();
    client.on_channel_closing(move |notice| {
        let _ = tx.send(notice.clone());
    });
    rx
}

#[test]
fn test_pipeline_channel_end_to_end() {
    let broker = start_broker(2_000);
    let producer = connected_client(&broker);
    let consumer = connected_client(&broker);
    let name = channel_name("pipeline");
    let schema = SchemaHash::new([7; 32]);

    let tx = producer
        .create_channel(&name, ChannelPattern::Pipeline, false, Some(&schema), 3, TIMEOUT)
        .unwrap();
    assert_eq!(tx.role(), ChannelRole::Producer);

    let rx = consumer.connect_channel(&name, TIMEOUT, Some(&schema)).unwrap();
    assert_eq!(rx.role(), ChannelRole::Consumer);
    assert_eq!(rx.pattern(), ChannelPattern::Pipeline);
    assert_eq!(rx.schema_hash(), Some(schema));
    assert_eq!(rx.schema_version(), 3);
    assert_eq!(rx.info().producer_pid, std::process::id() as u64);

    tx.send(b"hello").unwrap();
    assert_eq!(rx.recv(Some(TIMEOUT)).unwrap(), Some(b"hello".to_vec()));

    tx.send_multipart(&[b"a".as_slice(), b"bc".as_slice()]).unwrap();
    assert_eq!(
        rx.recv_multipart(Some(TIMEOUT)).unwrap(),
        Some(vec![b"a".to_vec(), b"bc".to_vec()])
    );
}

#[test]
fn test_bidir_channel_both_ways() {
    let broker = start_broker(2_000);
    let producer = connected_client(&broker);
    let consumer = connected_client(&broker);
    let name = channel_name("bidir");

    let a = producer
        .create_channel(&name, ChannelPattern::Bidir, false, None, 0, TIMEOUT)
        .unwrap();
    let b = consumer.connect_channel(&name, TIMEOUT, None).unwrap();

    b.send(b"ping").unwrap();
    assert_eq!(a.recv(Some(TIMEOUT)).unwrap(), Some(b"ping".to_vec()));
    a.send(b"pong").unwrap();
    assert_eq!(b.recv(Some(TIMEOUT)).unwrap(), Some(b"pong".to_vec()));
}

#[test]
fn test_schema_checks_on_connect() {
    let broker = start_broker(2_000);
    let producer = connected_client(&broker);
    let consumer = connected_client(&broker);
    let name = channel_name("schema");

    let _tx = producer
        .create_channel(
            &name,
            ChannelPattern::PubSub,
            false,
            Some(&SchemaHash::new([1; 32])),
            1,
            TIMEOUT,
        )
        .unwrap();

    let err = consumer
        .connect_channel(&name, TIMEOUT, Some(&SchemaHash::new([2; 32])))
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::SchemaMismatch { channel } if channel == name));

    // No expectation accepts anything
    assert!(consumer.connect_channel(&name, TIMEOUT, None).is_ok());
}

#[test]
fn test_expected_schema_rejects_unhashed_producer() {
    let broker = start_broker(2_000);
    let producer = connected_client(&broker);
    let consumer = connected_client(&broker);
    let name = channel_name("unhashed");

    let _tx = producer
        .create_channel(&name, ChannelPattern::PubSub, false, None, 0, TIMEOUT)
        .unwrap();

    let err = consumer
        .connect_channel(&name, TIMEOUT, Some(&SchemaHash::new([1; 32])))
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::SchemaMismatch { .. }));
}

#[test]
fn test_conflicting_registration_is_rejected() {
    let broker = start_broker(2_000);
    let first = connected_client(&broker);
    let second = connected_client(&broker);
    let name = channel_name("conflict");

    let _tx = first
        .create_channel(&name, ChannelPattern::PubSub, false, Some(&SchemaHash::new([1; 32])), 1, TIMEOUT)
        .unwrap();
    let err = second
        .create_channel(&name, ChannelPattern::PubSub, false, Some(&SchemaHash::new([9; 32])), 1, TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::SchemaMismatch { .. }));
}

#[test]
fn test_conflicting_shm_producer_keeps_live_segment() {
    let broker = start_broker(2_000);
    let first = connected_client(&broker);
    let second = connected_client(&broker);
    let consumer = connected_client(&broker);
    let name = channel_name("shm_conflict");

    let mut tx = first
        .create_channel(&name, ChannelPattern::PubSub, true, Some(&SchemaHash::new([1; 32])), 1, TIMEOUT)
        .unwrap();
    let mut rx = consumer.connect_channel(&name, TIMEOUT, None).unwrap();
    tx.shm_producer().unwrap().publish(b"one", FrameInfo::new(3)).unwrap();
    tx.shm_producer().unwrap().publish(b"two", FrameInfo::new(3)).unwrap();

    let err = second
        .create_channel(&name, ChannelPattern::PubSub, true, Some(&SchemaHash::new([9; 32])), 1, TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::SegmentInUse { .. }));

    let frame = rx.shm_consumer().unwrap().consume(Some(TIMEOUT)).unwrap().unwrap();
    assert_eq!(frame.frame_id(), 2);
    assert_eq!(frame.data(), b"two");
    drop(frame);

    // New consumers can still attach
    let late_client = connected_client(&broker);
    let mut late = late_client.connect_channel(&name, TIMEOUT, None).unwrap();
    assert_eq!(late.shm_consumer().unwrap().frame_id(), 2);
}

#[test]
fn test_unknown_channel_is_not_found() {
    let broker = start_broker(2_000);
    let consumer = connected_client(&broker);

    let err = consumer
        .discover_producer(&channel_name("missing"), TIMEOUT)
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::ChannelNotFound(_)));
}

#[test]
fn test_shared_memory_channel() {
    let broker = start_broker(2_000);
    let producer = connected_client(&broker);
    let consumer = connected_client(&broker);
    let name = channel_name("shm");

    let mut tx = producer
        .create_channel(&name, ChannelPattern::PubSub, true, None, 0, TIMEOUT)
        .unwrap();
    assert!(tx.info().has_shared_memory);
    assert!(!tx.info().shm_name.is_empty());

    let mut rx = consumer.connect_channel(&name, TIMEOUT, None).unwrap();
    let shm_rx = rx.shm_consumer().unwrap();
    assert_eq!(shm_rx.capacity(), 4096);

    let frame_id = tx
        .shm_producer()
        .unwrap()
        .publish(b"pixels", FrameInfo::new(6).with_dimensions(&[2, 3]))
        .unwrap();

    let frame = shm_rx.consume(Some(TIMEOUT)).unwrap().unwrap();
    assert_eq!(frame.frame_id(), frame_id);
    assert_eq!(frame.data(), b"pixels");
    assert_eq!(frame.info().dimensions[..2], [2, 3]);
}

#[test]
fn test_deregistration_notifies_consumers() {
    let broker = start_broker(2_000);
    let producer = connected_client(&broker);
    let consumer = connected_client(&broker);
    let notices = closing_notices(&consumer);
    let name = channel_name("dereg");

    let _tx = producer
        .create_channel(&name, ChannelPattern::PubSub, false, None, 0, TIMEOUT)
        .unwrap();
    let _rx = consumer.connect_channel(&name, TIMEOUT, None).unwrap();

    producer.deregister_channel(&name, TIMEOUT).unwrap();

    let notice = notices.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(notice.channel_name, name);
    assert_eq!(notice.reason, CloseReason::Deregistered);

    let err = consumer.discover_producer(&name, TIMEOUT).unwrap_err();
    assert!(matches!(err, SwitchyardError::ChannelNotFound(_)));
}

#[test]
fn test_silent_producer_expires() {
    let broker = start_broker(300);
    let consumer = connected_client(&broker);
    let notices = closing_notices(&consumer);
    let name = channel_name("expiry");

    let producer = connected_client(&broker);
    let _tx = producer
        .create_channel(&name, ChannelPattern::PubSub, false, None, 0, TIMEOUT)
        .unwrap();
    let _rx = consumer.connect_channel(&name, TIMEOUT, None).unwrap();

    // Stopping the producer's client stops its heartbeats
    drop(producer);

    let notice = notices.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(notice.channel_name, name);
    assert_eq!(notice.reason, CloseReason::HeartbeatTimeout);
}

#[test]
fn test_heartbeats_keep_channel_alive() {
    let broker = start_broker(300);
    let producer = connected_client(&broker);
    let consumer = connected_client(&broker);
    let name = channel_name("alive");

    let _tx = producer
        .create_channel(&name, ChannelPattern::PubSub, false, None, 0, TIMEOUT)
        .unwrap();

    std::thread::sleep(Duration::from_millis(900));
    assert!(consumer.discover_producer(&name, TIMEOUT).is_ok());
}

/// Broker connection without a client worker, so nothing heartbeats
/// unless the test says so
fn raw_producer(broker: &BrokerHandle) -> zmq::Socket {
    let socket = zmq::Context::new().socket(zmq::DEALER).unwrap();
    KeyPair::generate()
        .unwrap()
        .apply_client(&socket, broker.public_key())
        .unwrap();
    socket.set_linger(0).unwrap();
    socket.set_rcvtimeo(2_000).unwrap();
    socket.connect(broker.endpoint()).unwrap();
    socket
}

#[test]
fn test_discovery_waits_for_first_heartbeat() {
    let broker = start_broker(2_000);
    let consumer = connected_client(&broker);
    let name = channel_name("late_heartbeat");
    let producer_pid = 4_242;

    let raw = raw_producer(&broker);
    let register = RegisterRequest {
        channel_name: name.clone(),
        info: ProducerInfo {
            producer_pid,
            zmq_data_endpoint: "tcp://127.0.0.1:1".into(),
            ..Default::default()
        },
    };
    raw.send_multipart(protocol::encode(MessageType::RegReq, &register).unwrap(), 0)
        .unwrap();
    let ack = protocol::decode(raw.recv_multipart(0).unwrap()).unwrap();
    assert_eq!(ack.msg_type, MessageType::RegAck);
    ack.parse_body::<Reply>().unwrap().into_result().unwrap();

    // Still pending: discovery retries until its deadline, then gives up
    let timeout = Duration::from_millis(400);
    let start = Instant::now();
    let err = consumer.discover_producer(&name, timeout).unwrap_err();
    let elapsed = start.elapsed();
    assert!(matches!(err, SwitchyardError::ChannelNotReady(ref c) if *c == name));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500));

    // The same bound holds for a full connect
    let start = Instant::now();
    assert!(consumer.connect_channel(&name, timeout, None).is_err());
    assert!(start.elapsed() < timeout + Duration::from_millis(500));

    let heartbeat = {
        let channel_name = name.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            let req = HeartbeatRequest {
                channel_name,
                producer_pid,
            };
            raw.send_multipart(protocol::encode(MessageType::HeartbeatReq, &req).unwrap(), 0)
                .unwrap();
            raw
        })
    };

    let info = consumer.discover_producer(&name, TIMEOUT).unwrap();
    assert_eq!(info.producer_pid, producer_pid);
    drop(heartbeat.join().unwrap());
}

#[test]
fn test_fire_and_forget_registration() {
    let broker = start_broker(2_000);
    let producer = connected_client(&broker);
    let consumer = connected_client(&broker);
    let name = channel_name("fire_forget");

    producer
        .register_producer(
            &name,
            ProducerInfo {
                producer_pid: 77,
                zmq_data_endpoint: "tcp://127.0.0.1:1".into(),
                ..Default::default()
            },
        )
        .unwrap();

    // The registration races our discovery, so not-found is retried here
    let deadline = Instant::now() + TIMEOUT;
    let info = loop {
        match consumer.discover_producer(&name, TIMEOUT) {
            Ok(info) => break info,
            Err(SwitchyardError::ChannelNotFound(_)) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => panic!("discovery failed: {}", e),
        }
    };
    assert_eq!(info.producer_pid, 77);
}

#[test]
fn test_connect_validates_arguments() {
    let client = Client::new(client_config()).unwrap();
    let key = KeyPair::generate().unwrap();

    assert!(matches!(
        client.connect("tcp://127.0.0.1:5550", "short"),
        Err(SwitchyardError::InvalidKey(_))
    ));
    assert!(matches!(
        client.connect("not an endpoint", &key.public_key),
        Err(SwitchyardError::InvalidEndpoint(_))
    ));
}

#[test]
fn test_requests_need_a_connection() {
    let client = Client::new(client_config()).unwrap();
    assert!(matches!(
        client.discover_producer("anything", TIMEOUT),
        Err(SwitchyardError::NotConnected)
    ));

    // Disconnecting twice is fine
    client.disconnect().unwrap();
    client.disconnect().unwrap();
}

#[test]
fn test_wrong_broker_key_times_out() {
    let broker = start_broker(2_000);
    let client = Client::new(client_config()).unwrap();
    let impostor = KeyPair::generate().unwrap();
    client.connect(broker.endpoint(), &impostor.public_key).unwrap();

    let err = client
        .discover_producer("anything", Duration::from_millis(300))
        .unwrap_err();
    assert!(matches!(err, SwitchyardError::Timeout(_)));
}

#[test]
fn test_invalid_channel_names() {
    let broker = start_broker(2_000);
    let client = connected_client(&broker);

    for name in ["", "a/b"] {
        let err = client
            .create_channel(name, ChannelPattern::PubSub, false, None, 0, TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, SwitchyardError::InvalidChannelName { .. }));
    }
}
