use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use http::{HeaderName, HeaderValue};
use ws_core::core::{HandshakeError, encode_frame};
use ws_core::testing::{
    AcceptOptions, ConsumerEvent, MockServer, RecordingConsumer, RecordingReporter, ReportEvent,
    open_with, recv_within,
};
use ws_core::ws::accept_key;
use ws_core::{
    Destination, Frame, WebSocketError, WebSocketResult, WsCall, WsClient, WsConnectionState,
    WsExtension,
};

const WAIT: Duration = Duration::from_secs(2);

fn client(reporter: Arc<RecordingReporter>) -> WsClient {
    WsClient::builder()
        .reporter(reporter)
        .header(
            HeaderName::from_static("x-client"),
            HeaderValue::from_static("ws-core-tests"),
        )
        .build()
        .expect("client")
}

fn handshake_error(result: WebSocketResult<impl std::fmt::Debug>) -> HandshakeError {
    match result {
        Err(WebSocketError::Handshake(err)) => err,
        other => panic!("expected handshake error, got {other:?}"),
    }
}

/// Extension that refuses every server answer.
struct RejectingExtension;

impl WsExtension for RejectingExtension {
    fn name(&self) -> &str {
        "rejecting"
    }

    fn decode_frame(&self, _frame: &mut Frame) -> WebSocketResult<()> {
        Ok(())
    }

    fn encode_frame(&self, _frame: &mut Frame) -> WebSocketResult<()> {
        Ok(())
    }

    fn is_frame_valid(&self, _frame: &Frame) -> bool {
        true
    }

    fn accept_provided_extension_as_client(&self, _header: &str) -> bool {
        false
    }

    fn provided_extension_as_client(&self) -> String {
        "x-rejecting".to_string()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upgrade_request_carries_protocol_and_caller_headers() {
    let (reporter, _reports) = RecordingReporter::new();
    let client = client(reporter);
    let (consumer, _events) = RecordingConsumer::new();
    let (stream, mut server) = MockServer::pair();
    let destination: Destination = "ws://feed.example.test:8080/v1/stream?x=1".parse().unwrap();
    let call = WsCall::new()
        .header(
            HeaderName::from_static("x-call"),
            HeaderValue::from_static("one"),
        )
        .protocol("chat");

    let (connection, request) = tokio::join!(
        client.connect(stream, &destination, consumer, call),
        server.accept_with(AcceptOptions {
            protocol: Some("chat".to_string()),
            ..AcceptOptions::default()
        }),
    );
    let connection = connection.expect("connected");
    let request = request.expect("request");

    assert_eq!(request.request_line, "GET /v1/stream?x=1 HTTP/1.1");
    assert_eq!(request.headers["host"], "feed.example.test:8080");
    assert_eq!(request.headers["upgrade"], "websocket");
    assert_eq!(request.headers["connection"], "Upgrade");
    assert_eq!(request.headers["sec-websocket-version"], "13");
    assert_eq!(request.headers["sec-websocket-protocol"], "chat");
    assert_eq!(request.headers["x-client"], "ws-core-tests");
    assert_eq!(request.headers["x-call"], "one");
    assert!(request.headers.get("sec-websocket-extensions").is_none());
    assert_eq!(request.key().len(), 24);

    assert_eq!(connection.state(), WsConnectionState::Running);
    assert_eq!(connection.subprotocol(), "chat");
    assert_eq!(connection.diagnostics().status, Some(101));
    connection.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn accept_mismatch_fails_and_is_reported() {
    let (reporter, mut reports) = RecordingReporter::new();
    let client = client(reporter);
    let (consumer, _events) = RecordingConsumer::new();

    let result = open_with(
        &client,
        consumer,
        WsCall::new(),
        AcceptOptions {
            accept_override: Some(accept_key("some other key")),
            ..AcceptOptions::default()
        },
    )
    .await;

    assert!(matches!(
        handshake_error(result),
        HandshakeError::AcceptMismatch { .. }
    ));
    match recv_within(&mut reports, WAIT).await {
        Some(ReportEvent::Exception { details, error }) => {
            assert_eq!(details, "websocket handshake failed");
            assert!(error.contains("Sec-WebSocket-Accept mismatch"), "{error}");
        }
        other => panic!("expected exception, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_101_status_fails() {
    let (reporter, _reports) = RecordingReporter::new();
    let client = client(reporter);
    let (consumer, _events) = RecordingConsumer::new();

    let result = open_with(
        &client,
        consumer,
        WsCall::new(),
        AcceptOptions {
            status_line: Some("HTTP/1.1 403 Forbidden".to_string()),
            ..AcceptOptions::default()
        },
    )
    .await;

    assert_eq!(
        handshake_error(result),
        HandshakeError::UnexpectedStatus {
            code: 403,
            line: "HTTP/1.1 403 Forbidden".to_string(),
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_response_header_fails() {
    let (reporter, _reports) = RecordingReporter::new();
    let client = client(reporter);
    let (consumer, _events) = RecordingConsumer::new();

    let result = open_with(
        &client,
        consumer,
        WsCall::new(),
        AcceptOptions {
            extra_lines: vec!["this line has no separator".to_string()],
            ..AcceptOptions::default()
        },
    )
    .await;

    assert!(matches!(
        handshake_error(result),
        HandshakeError::MalformedHeader(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn extension_rejection_leaves_no_connection() {
    let (reporter, mut reports) = RecordingReporter::new();
    let client = client(reporter);
    let (consumer, mut events) = RecordingConsumer::new();

    let result = open_with(
        &client,
        consumer,
        WsCall::new().extension(RejectingExtension),
        AcceptOptions {
            extension: Some("permessage-deflate".to_string()),
            ..AcceptOptions::default()
        },
    )
    .await;

    assert_eq!(
        handshake_error(result),
        HandshakeError::NoAcceptableExtension("permessage-deflate".to_string())
    );
    assert!(matches!(
        recv_within(&mut reports, WAIT).await,
        Some(ReportEvent::Exception { .. })
    ));
    assert!(recv_within(&mut events, Duration::from_millis(100)).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subprotocol_rejection_fails() {
    let (reporter, _reports) = RecordingReporter::new();
    let client = client(reporter);
    let (consumer, _events) = RecordingConsumer::new();

    let result = open_with(
        &client,
        consumer,
        WsCall::new().protocol("chat"),
        AcceptOptions {
            protocol: Some("mqtt".to_string()),
            ..AcceptOptions::default()
        },
    )
    .await;

    assert_eq!(
        handshake_error(result),
        HandshakeError::NoAcceptableSubprotocol("mqtt".to_string())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_server_times_out() {
    let (reporter, mut reports) = RecordingReporter::new();
    let client = client(reporter);
    let (consumer, _events) = RecordingConsumer::new();
    let (stream, _server) = MockServer::pair();
    let destination: Destination = "ws://mock.test/".parse().unwrap();

    let result = client
        .connect(
            stream,
            &destination,
            consumer,
            WsCall::new().connect_timeout(Duration::from_millis(50)),
        )
        .await;

    assert_eq!(
        handshake_error(result),
        HandshakeError::Timeout(Duration::from_millis(50))
    );
    assert!(matches!(
        recv_within(&mut reports, WAIT).await,
        Some(ReportEvent::Exception { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn frames_pipelined_behind_the_upgrade_are_delivered() {
    let (reporter, _reports) = RecordingReporter::new();
    let client = client(reporter);
    let (consumer, mut events) = RecordingConsumer::new();
    let (stream, mut server) = MockServer::pair();
    let destination: Destination = "ws://mock.test/".parse().unwrap();

    let server_side = async {
        let request = server.read_request().await.expect("request");
        let mut bytes = BytesMut::from(
            format!(
                "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept_key(request.key())
            )
            .as_bytes(),
        );
        encode_frame(&Frame::text("early"), None, &mut bytes);
        server.send_raw(&bytes).await.expect("response");
    };
    let (connection, ()) = tokio::join!(
        client.connect(stream, &destination, consumer, WsCall::new()),
        server_side,
    );
    let connection = connection.expect("connected");

    match recv_within(&mut events, WAIT).await {
        Some(ConsumerEvent::Message(message)) => {
            assert_eq!(message.text.as_deref(), Some("early"))
        }
        other => panic!("expected message, got {other:?}"),
    }
    connection.close();
}
