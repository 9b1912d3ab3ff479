use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use ws_core::core::{NotificationLevel, Opcode};
use ws_core::testing::{
    AcceptOptions, ConsumerEvent, MockServer, RecordingConsumer, RecordingReporter, ReportEvent,
    open, open_with, recv_within, wait_for,
};
use ws_core::{
    CompressionExtension, Connection, DeliveredMessage, Frame, FrameCompressor, WebSocketResult,
    WsCall, WsClient, WsConsumer, WsErrorReporter, close_code,
};

const WAIT: Duration = Duration::from_secs(2);

fn client(reporter: Arc<dyn WsErrorReporter>) -> WsClient {
    WsClient::builder()
        .reporter(reporter)
        .build()
        .expect("client")
}

async fn connect(
    consumer: Arc<dyn WsConsumer>,
    reporter: Arc<RecordingReporter>,
) -> (Connection, MockServer) {
    open(&client(reporter), consumer, WsCall::new())
        .await
        .expect("connected")
}

fn is_warning(event: &ReportEvent) -> bool {
    matches!(
        event,
        ReportEvent::Notification {
            level: NotificationLevel::Warn,
            ..
        }
    )
}

fn is_exception(event: &ReportEvent) -> bool {
    matches!(event, ReportEvent::Exception { .. })
}

async fn expect_close(events: &mut mpsc::UnboundedReceiver<ConsumerEvent>, expected: u16) {
    let close = wait_for(events, WAIT, |event| {
        matches!(event, ConsumerEvent::Close { .. })
    })
    .await;
    match close {
        Some(ConsumerEvent::Close { code, remote, .. }) => {
            assert_eq!(code, expected);
            assert!(!remote);
        }
        other => panic!("expected close, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_frames_are_discarded_and_the_connection_continues() {
    let (consumer, mut events) = RecordingConsumer::new();
    let (reporter, mut reports) = RecordingReporter::new();
    let (connection, mut server) = connect(consumer, reporter).await;

    // RSV bit without a negotiated extension.
    server
        .send_frame(&Frame::text("reserved").with_rsv(true, false, false))
        .await
        .unwrap();
    // Text that is not UTF-8.
    server
        .send_frame(&Frame::new(Opcode::Text, true, vec![0xffu8, 0xfe]))
        .await
        .unwrap();
    // Control payload above 125 bytes.
    server
        .send_frame(&Frame::ping(vec![1u8; 126]))
        .await
        .unwrap();
    server.send_text("still alive").await.unwrap();

    match recv_within(&mut events, WAIT).await {
        Some(ConsumerEvent::Message(message)) => {
            assert_eq!(message.text.as_deref(), Some("still alive"))
        }
        other => panic!("expected message, got {other:?}"),
    }
    for _ in 0..3 {
        assert!(wait_for(&mut reports, WAIT, is_warning).await.is_some());
    }
    assert_eq!(connection.stats().frames_discarded, 3);
    assert!(connection.is_running());
    connection.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn continuation_without_open_message_is_fatal() {
    let (consumer, mut events) = RecordingConsumer::new();
    let (reporter, mut reports) = RecordingReporter::new();
    let (connection, mut server) = connect(consumer, reporter).await;

    server
        .send_frame(&Frame::continuation(true, "orphan"))
        .await
        .unwrap();

    expect_close(&mut events, close_code::PROTOCOL_ERROR).await;
    match wait_for(&mut reports, WAIT, is_exception).await {
        Some(ReportEvent::Exception { error, .. }) => {
            assert!(error.starts_with("Fragment sequence violation"), "{error}")
        }
        other => panic!("expected exception, got {other:?}"),
    }
    let close = server.recv_frame_timeout(WAIT).await.expect("close frame");
    assert_eq!(
        close.close_info().map(|(code, _)| code),
        Some(close_code::PROTOCOL_ERROR)
    );
    tokio::time::timeout(WAIT, connection.closed())
        .await
        .expect("released");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_message_inside_open_fragment_is_fatal() {
    let (consumer, mut events) = RecordingConsumer::new();
    let (reporter, _reports) = RecordingReporter::new();
    let (_connection, mut server) = connect(consumer, reporter).await;

    server
        .send_frame(&Frame::binary(vec![1u8]).fragment())
        .await
        .unwrap();
    server.send_text("interloper").await.unwrap();

    expect_close(&mut events, close_code::PROTOCOL_ERROR).await;
    assert!(recv_within(&mut events, Duration::from_millis(100)).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_opcode_is_fatal() {
    let (consumer, mut events) = RecordingConsumer::new();
    let (reporter, mut reports) = RecordingReporter::new();
    let (_connection, mut server) = connect(consumer, reporter).await;

    server.send_raw(&[0x83, 0x00]).await.unwrap();

    expect_close(&mut events, close_code::PROTOCOL_ERROR).await;
    assert!(wait_for(&mut reports, WAIT, is_exception).await.is_some());
}

/// Reverses payload bytes in place of a real compression codec.
struct ReverseCodec;

impl FrameCompressor for ReverseCodec {
    fn token(&self) -> &str {
        "x-reverse"
    }

    fn compress(&self, payload: &[u8]) -> WebSocketResult<Bytes> {
        Ok(payload.iter().rev().copied().collect::<Vec<u8>>().into())
    }

    fn decompress(&self, payload: &[u8]) -> WebSocketResult<Bytes> {
        self.compress(payload)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negotiated_extension_transforms_both_directions() {
    let (consumer, mut events) = RecordingConsumer::new();
    let (reporter, _reports) = RecordingReporter::new();
    let (connection, mut server) = open_with(
        &client(reporter),
        consumer,
        WsCall::new().extension(CompressionExtension::new(ReverseCodec)),
        AcceptOptions {
            extension: Some("x-reverse".to_string()),
            ..AcceptOptions::default()
        },
    )
    .await
    .expect("connected");
    assert_eq!(connection.extension().name(), "x-reverse");

    server
        .send_frame(&Frame::text("olleh").with_rsv(true, false, false))
        .await
        .unwrap();
    server.send_text("plain").await.unwrap();

    match recv_within(&mut events, WAIT).await {
        Some(ConsumerEvent::Message(message)) => assert_eq!(message.text.as_deref(), Some("hello")),
        other => panic!("expected message, got {other:?}"),
    }
    match recv_within(&mut events, WAIT).await {
        Some(ConsumerEvent::Message(message)) => assert_eq!(message.text.as_deref(), Some("plain")),
        other => panic!("expected message, got {other:?}"),
    }

    connection.send_text("abc").unwrap();
    let frame = server.recv_frame_timeout(WAIT).await.expect("frame");
    assert!(frame.rsv1);
    assert_eq!(frame.payload(), &Bytes::from_static(b"cba"));
    connection.close();
}

/// Panics on the first message, records the rest.
struct FlakyConsumer {
    panicked: AtomicBool,
    tx: mpsc::UnboundedSender<String>,
}

impl WsConsumer for FlakyConsumer {
    fn on_message(&self, message: DeliveredMessage) {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("consumer bug");
        }
        let _ = self.tx.send(message.text.unwrap_or_default());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_consumer_is_reported_and_reading_continues() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = Arc::new(FlakyConsumer {
        panicked: AtomicBool::new(false),
        tx,
    });
    let (reporter, mut reports) = RecordingReporter::new();
    let (connection, mut server) = connect(consumer, reporter).await;

    server.send_text("first").await.unwrap();
    server.send_text("second").await.unwrap();

    assert_eq!(recv_within(&mut rx, WAIT).await.as_deref(), Some("second"));
    match wait_for(&mut reports, WAIT, is_exception).await {
        Some(ReportEvent::Exception { details, error }) => {
            assert_eq!(details, "consumer on_message panicked");
            assert!(error.contains("consumer bug"), "{error}");
        }
        other => panic!("expected exception, got {other:?}"),
    }
    assert!(connection.is_running());
    connection.close();
}
