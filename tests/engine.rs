use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use wsportal::{
    frame::{self, Frame, OpCode},
    CloseCode, ConnectionId, ConnectionState, Disposition, Engine, Handlers, MemoryTransport,
    Options, WebSocketError,
};

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

fn upgrade_request(path: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: portal\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 13\r\n\r\n",
        path, KEY
    )
}

fn connect(engine: &mut Engine, transport: &mut MemoryTransport, id: u64, path: &str) -> ConnectionId {
    let id = ConnectionId(id);
    engine.accept(id, None);
    engine
        .upgrade(transport, id, &upgrade_request(path))
        .expect("handshake");
    id
}

/// A client frame: always masked.
fn client(frame: Frame) -> Vec<u8> {
    frame.encode(true).to_vec()
}

#[test]
fn broadcast_reaches_only_the_route() {
    let mut engine = Engine::new(Options::default(), Handlers::new());
    let mut transport = MemoryTransport::new();

    let a = connect(&mut engine, &mut transport, 1, "/chat");
    let b = connect(&mut engine, &mut transport, 2, "/chat");
    let c = connect(&mut engine, &mut transport, 3, "/other");

    let report = engine.broadcast(&mut transport, "/chat", &Frame::text("hello"));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 0);

    assert_eq!(transport.frames_to(a), vec![Frame::text("hello")]);
    assert_eq!(transport.frames_to(b), vec![Frame::text("hello")]);
    assert!(transport.frames_to(c).is_empty());
}

#[test]
fn close_unregisters_and_stops_dispatch() {
    let texts = Arc::new(AtomicUsize::new(0));
    let closes = Arc::new(AtomicUsize::new(0));
    let handlers = {
        let texts = texts.clone();
        let closes = closes.clone();
        Handlers::new()
            .on_text(move |_, _| {
                texts.fetch_add(1, Ordering::SeqCst);
            })
            .on_close(move |_, _| {
                closes.fetch_add(1, Ordering::SeqCst);
            })
    };
    let mut engine = Engine::new(Options::default(), handlers);
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/chat");

    // a close followed by a text frame in the same delivery
    let mut bytes = client(Frame::close(CloseCode::Normal, "bye"));
    bytes.extend(client(Frame::text("too late")));

    let disposition = engine.on_data(&mut transport, id, &bytes).unwrap();
    assert_eq!(disposition, Disposition::Close);
    assert_eq!(engine.route_of(id), None);
    assert_eq!(engine.state(id), ConnectionState::Closing);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(texts.load(Ordering::SeqCst), 0);

    // the reply echoes the status code only
    assert_eq!(
        transport.frames_to(id),
        vec![Frame::close(CloseCode::Normal, "")]
    );
    assert!(transport.is_closed(id));

    // nothing more is dispatched
    engine
        .on_data(&mut transport, id, &client(Frame::text("still here?")))
        .unwrap();
    assert_eq!(texts.load(Ordering::SeqCst), 0);

    engine.on_end(&mut transport, id);
    assert_eq!(engine.state(id), ConnectionState::Closed);
    assert_eq!(transport.close_count(id), 1);
}

#[test]
fn ping_gets_exactly_one_pong() {
    let pings = Arc::new(AtomicUsize::new(0));
    let handlers = {
        let pings = pings.clone();
        Handlers::new().on_ping(move |_, payload| {
            assert_eq!(payload, b"abc");
            pings.fetch_add(1, Ordering::SeqCst);
        })
    };
    let mut engine = Engine::new(Options::default(), handlers);
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/");

    engine
        .on_data(&mut transport, id, &client(Frame::ping("abc")))
        .unwrap();

    assert_eq!(transport.frames_to(id), vec![Frame::pong("abc")]);
    assert_eq!(pings.load(Ordering::SeqCst), 1);
}

#[test]
fn frames_split_across_deliveries() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let handlers = {
        let seen = seen.clone();
        Handlers::new().on_text(move |_, text| seen.lock().unwrap().push(text.to_vec()))
    };
    let mut engine = Engine::new(Options::default(), handlers);
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/");

    let mut bytes = client(Frame::text("first"));
    bytes.extend(client(Frame::text(vec![b'x'; 300])));
    bytes.extend(client(Frame::text("third")));

    for chunk in bytes.chunks(7) {
        engine.on_data(&mut transport, id, chunk).unwrap();
    }

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], b"first");
    assert_eq!(seen[1], vec![b'x'; 300]);
    assert_eq!(seen[2], b"third");
}

#[test]
fn oversized_frame_drops_connection() {
    let mut engine = Engine::new(Options::default().with_max_frame_size(128), Handlers::new());
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/chat");

    let err = engine
        .on_data(&mut transport, id, &client(Frame::text(vec![b'a'; 200])))
        .unwrap_err();
    assert!(matches!(err, WebSocketError::ResourceLimitExceeded { limit: 128 }));

    // no close frame, straight teardown
    assert!(transport.frames_to(id).is_empty());
    assert!(transport.is_closed(id));
    assert_eq!(engine.state(id), ConnectionState::Closed);
    assert_eq!(engine.route_of(id), None);
}

#[test]
fn huge_declared_length_drops_connection() {
    let mut engine = Engine::new(Options::default(), Handlers::new());
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/chat");

    // 64-bit length field of all ones, masked
    let bytes = [0x81, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 1, 2, 3, 4, 5];
    let err = engine.on_data(&mut transport, id, &bytes).unwrap_err();
    assert!(matches!(err, WebSocketError::ResourceLimitExceeded { .. }));

    assert!(transport.frames_to(id).is_empty());
    assert!(transport.is_closed(id));
    assert_eq!(engine.state(id), ConnectionState::Closed);
}

#[test]
fn failed_handshake_writes_nothing() {
    let mut engine = Engine::new(Options::default(), Handlers::new());
    let mut transport = MemoryTransport::new();
    let id = ConnectionId(9);
    engine.accept(id, None);

    let err = engine
        .upgrade(
            &mut transport,
            id,
            "GET /chat HTTP/1.1\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap_err();
    assert!(matches!(err, WebSocketError::InvalidRequest(_)));
    assert!(transport.writes_to(id).is_empty());
    assert_eq!(engine.state(id), ConnectionState::AwaitingUpgrade);
    assert_eq!(engine.route_of(id), None);
}

#[test]
fn broadcast_survives_a_failing_client() {
    let mut engine = Engine::new(Options::default(), Handlers::new());
    let mut transport = MemoryTransport::new();
    let a = connect(&mut engine, &mut transport, 1, "/status");
    let b = connect(&mut engine, &mut transport, 2, "/status");
    let c = connect(&mut engine, &mut transport, 3, "/status");
    transport.fail_writes_to(b);

    let report = engine.broadcast(&mut transport, "/status", &Frame::text("status:00:00:01"));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(transport.frames_to(a).len(), 1);
    assert_eq!(transport.frames_to(c).len(), 1);
}

#[test]
fn callbacks_queue_replies_and_broadcasts() {
    let handlers = Handlers::new().on_text(|out, text| {
        let route = out.route().unwrap_or("/").to_string();
        out.broadcast(route, Frame::text(text.to_vec()));
    });
    let mut engine = Engine::new(Options::default(), handlers);
    let mut transport = MemoryTransport::new();
    let a = connect(&mut engine, &mut transport, 1, "/room");
    let b = connect(&mut engine, &mut transport, 2, "/room");

    engine
        .on_data(&mut transport, a, &client(Frame::text("hi all")))
        .unwrap();

    assert_eq!(transport.frames_to(a), vec![Frame::text("hi all")]);
    assert_eq!(transport.frames_to(b), vec![Frame::text("hi all")]);
}

#[test]
fn end_of_stream_forgets_client() {
    let mut engine = Engine::new(Options::default(), Handlers::new());
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/chat");

    engine.on_end(&mut transport, id);
    assert_eq!(engine.route_of(id), None);
    assert_eq!(engine.connection_count(), 0);
    assert!(transport.is_closed(id));

    let report = engine.broadcast(&mut transport, "/chat", &Frame::text("anyone?"));
    assert_eq!(report.delivered, 0);
}

#[test]
fn churn_keeps_registry_bounded() {
    let mut engine = Engine::new(Options::default(), Handlers::new());
    let mut transport = MemoryTransport::new();
    let resident = connect(&mut engine, &mut transport, 1, "/status");

    for n in 2..2_000 {
        let id = connect(&mut engine, &mut transport, n, "/chat");
        engine.on_end(&mut transport, id);
        engine.compact();
    }

    assert_eq!(engine.registry().len(), 1);
    assert_eq!(engine.registry().slot_count(), 1);
    assert!(engine.registry().slot_capacity() <= 4);
    assert_eq!(engine.route_of(resident), Some("/status"));
}

#[test]
fn unknown_opcodes_are_ignored() {
    let mut engine = Engine::new(Options::default(), Handlers::new());
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/");

    let mut bytes = client(Frame::binary("raw"));
    bytes.extend(client(Frame::new(OpCode::Continuation, "cont")));
    let disposition = engine.on_data(&mut transport, id, &bytes).unwrap();

    assert_eq!(disposition, Disposition::Continue);
    assert_eq!(engine.state(id), ConnectionState::Open);
    assert!(transport.frames_to(id).is_empty());
}

#[test]
fn masked_outgoing_frames_decode() {
    let mut engine = Engine::new(Options::default().with_masking(), Handlers::new());
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/");

    engine
        .send(&mut transport, id, &Frame::text("masked"))
        .unwrap();

    let writes = transport.writes_to(id);
    let raw = writes.last().unwrap();
    let mut buf = raw.to_vec();
    let header = frame::parse(&mut buf).unwrap();
    assert!(header.masked);
    assert_eq!(header.payload(&buf), b"masked");
}

#[cfg(feature = "json")]
#[test]
fn broadcast_json_as_text() {
    #[derive(serde::Serialize)]
    struct Status {
        uptime: u64,
    }

    let mut engine = Engine::new(Options::default(), Handlers::new());
    let mut transport = MemoryTransport::new();
    let id = connect(&mut engine, &mut transport, 1, "/status");

    let report = engine
        .broadcast_json(&mut transport, "/status", &Status { uptime: 3 })
        .unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(transport.frames_to(id), vec![Frame::text(r#"{"uptime":3}"#)]);
}
