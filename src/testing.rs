//! Reusable test utilities for exercising connections without a real socket.
//!
//! [`MockServer`] plays the server side of an in-memory duplex stream: it answers the upgrade
//! request, writes unmasked frames and reads back what the client sent. [`RecordingConsumer`]
//! and [`RecordingReporter`] turn callbacks into channel events a test can await.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use http::header::SEC_WEBSOCKET_KEY;
use http::HeaderMap;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
};
use tokio::sync::mpsc;

use crate::client::{WsCall, WsClient};
use crate::core::{
    DeliveredMessage, DiagnosticContext, Frame, NotificationLevel, WebSocketError,
    WebSocketResult, encode_frame, read_frame_with_mask,
};
use crate::ws::{Connection, Destination, WsConsumer, WsErrorReporter, accept_key, parse_header_line};

const DUPLEX_BYTES: usize = 64 * 1024;

/// Error surface for operations on [`MockServer`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The server side of the socket was intentionally dropped.
    SocketDropped,
    /// The client hung up or sent something that is not an upgrade request.
    BadRequest,
}

impl std::fmt::Display for MockServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MockServerError::SocketDropped => f.write_str("mock socket already dropped"),
            MockServerError::BadRequest => f.write_str("mock server received a bad request"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Upgrade request as received by the mock server.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub request_line: String,
    pub headers: HeaderMap,
}

impl MockRequest {
    pub fn key(&self) -> &str {
        self.headers
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }
}

/// How the mock server answers the upgrade.
#[derive(Debug, Clone, Default)]
pub struct AcceptOptions {
    /// Replace the whole status line, e.g. `HTTP/1.1 403 Forbidden`.
    pub status_line: Option<String>,
    /// Send this `Sec-WebSocket-Accept` value instead of the correct one.
    pub accept_override: Option<String>,
    pub extension: Option<String>,
    pub protocol: Option<String>,
    /// Raw header lines appended as-is (without CRLF).
    pub extra_lines: Vec<String>,
}

/// Server side of an in-memory websocket.
#[derive(Debug)]
pub struct MockServer {
    stream: Option<BufReader<DuplexStream>>,
}

impl MockServer {
    /// Client stream plus the server handle driving its other end.
    pub fn pair() -> (DuplexStream, MockServer) {
        let (client, server) = tokio::io::duplex(DUPLEX_BYTES);
        (
            client,
            MockServer {
                stream: Some(BufReader::new(server)),
            },
        )
    }

    fn stream(&mut self) -> Result<&mut BufReader<DuplexStream>, MockServerError> {
        self.stream.as_mut().ok_or(MockServerError::SocketDropped)
    }

    /// Like [`MockServer::pair`], with a client stream that fails on demand.
    pub fn faulty_pair() -> (FaultyStream, FaultSwitch, MockServer) {
        let (client, server) = Self::pair();
        let switch = FaultSwitch::default();
        let stream = FaultyStream {
            inner: client,
            switch: switch.clone(),
        };
        (stream, switch, server)
    }

    /// Read the upgrade request header block.
    pub async fn read_request(&mut self) -> Result<MockRequest, MockServerError> {
        let stream = self.stream()?;
        let mut request_line = String::new();
        let mut headers = HeaderMap::new();
        loop {
            let mut line = String::new();
            let read = stream
                .read_line(&mut line)
                .await
                .map_err(|_| MockServerError::BadRequest)?;
            if read == 0 {
                return Err(MockServerError::BadRequest);
            }
            let line = line.trim_end_matches(['\r', '\n']);
            if request_line.is_empty() {
                request_line = line.to_string();
                continue;
            }
            if line.is_empty() {
                break;
            }
            let (name, value) = parse_header_line(line).map_err(|_| MockServerError::BadRequest)?;
            headers.append(name, value);
        }
        Ok(MockRequest {
            request_line,
            headers,
        })
    }

    /// Read the request and answer `101` with the correct accept key.
    pub async fn accept(&mut self) -> Result<MockRequest, MockServerError> {
        self.accept_with(AcceptOptions::default()).await
    }

    pub async fn accept_with(
        &mut self,
        options: AcceptOptions,
    ) -> Result<MockRequest, MockServerError> {
        let request = self.read_request().await?;
        let status = options
            .status_line
            .unwrap_or_else(|| "HTTP/1.1 101 Switching Protocols".to_string());
        let accept = options
            .accept_override
            .unwrap_or_else(|| accept_key(request.key()));

        let mut response = format!(
            "{status}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {accept}\r\n"
        );
        if let Some(extension) = options.extension {
            response.push_str(&format!("Sec-WebSocket-Extensions: {extension}\r\n"));
        }
        if let Some(protocol) = options.protocol {
            response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
        }
        for line in options.extra_lines {
            response.push_str(&line);
            response.push_str("\r\n");
        }
        response.push_str("\r\n");
        self.send_raw(response.as_bytes()).await?;
        Ok(request)
    }

    /// Write raw bytes to the client.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), MockServerError> {
        let stream = self.stream()?;
        stream
            .write_all(bytes)
            .await
            .map_err(|_| MockServerError::SocketDropped)?;
        stream
            .flush()
            .await
            .map_err(|_| MockServerError::SocketDropped)
    }

    /// Write `frame` unmasked, as a server does.
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), MockServerError> {
        let mut buf = BytesMut::new();
        encode_frame(frame, None, &mut buf);
        self.send_raw(&buf).await
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), MockServerError> {
        self.send_frame(&Frame::text(text)).await
    }

    /// Next frame from the client with the mask key it used. `Ok(None)` when the client hung up.
    pub async fn recv_frame_with_mask(
        &mut self,
    ) -> WebSocketResult<Option<(Frame, Option<[u8; 4]>)>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| WebSocketError::InvalidState("mock socket dropped".to_string()))?;
        read_frame_with_mask(stream, usize::MAX).await
    }

    pub async fn recv_frame(&mut self) -> WebSocketResult<Option<Frame>> {
        Ok(self.recv_frame_with_mask().await?.map(|(frame, _)| frame))
    }

    /// [`MockServer::recv_frame`] bounded by `timeout`; `None` on timeout or hang-up.
    pub async fn recv_frame_timeout(&mut self, timeout: Duration) -> Option<Frame> {
        tokio::time::timeout(timeout, self.recv_frame())
            .await
            .ok()
            .and_then(Result::ok)
            .flatten()
    }

    /// Simulate a server-side socket drop.
    pub fn drop_socket(&mut self) {
        self.stream = None;
    }
}

/// Handshake a fresh in-memory connection with a default `101` answer.
pub async fn open(
    client: &WsClient,
    consumer: Arc<dyn WsConsumer>,
    call: WsCall,
) -> WebSocketResult<(Connection, MockServer)> {
    open_with(client, consumer, call, AcceptOptions::default()).await
}

pub async fn open_with(
    client: &WsClient,
    consumer: Arc<dyn WsConsumer>,
    call: WsCall,
    options: AcceptOptions,
) -> WebSocketResult<(Connection, MockServer)> {
    let (stream, server) = MockServer::pair();
    handshake(client, stream, server, consumer, call, options).await
}

/// Handshake over a [`FaultyStream`]; faults armed on the returned switch hit the live connection.
pub async fn open_faulty(
    client: &WsClient,
    consumer: Arc<dyn WsConsumer>,
    call: WsCall,
) -> WebSocketResult<(Connection, MockServer, FaultSwitch)> {
    let (stream, switch, server) = MockServer::faulty_pair();
    let (connection, server) =
        handshake(client, stream, server, consumer, call, AcceptOptions::default()).await?;
    Ok((connection, server, switch))
}

async fn handshake<S>(
    client: &WsClient,
    stream: S,
    mut server: MockServer,
    consumer: Arc<dyn WsConsumer>,
    call: WsCall,
    options: AcceptOptions,
) -> WebSocketResult<(Connection, MockServer)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let destination: Destination = "ws://mock.test/socket".parse()?;
    let (connection, accepted) = tokio::join!(
        client.connect(stream, &destination, consumer, call),
        server.accept_with(options),
    );
    accepted.map_err(|err| WebSocketError::InvalidState(err.to_string()))?;
    Ok((connection?, server))
}

/// Arms one-shot I/O failures on a [`FaultyStream`].
///
/// An armed fault fires on the next poll of that direction, so a read fault armed while the
/// connection is parked waiting for data hits the poll that the next server write wakes up.
#[derive(Clone, Debug, Default)]
pub struct FaultSwitch {
    read: Arc<Mutex<Option<io::ErrorKind>>>,
    write: Arc<Mutex<Option<io::ErrorKind>>>,
}

impl FaultSwitch {
    pub fn fail_next_read(&self, kind: io::ErrorKind) {
        *self.read.lock().unwrap_or_else(PoisonError::into_inner) = Some(kind);
    }

    pub fn fail_next_write(&self, kind: io::ErrorKind) {
        *self.write.lock().unwrap_or_else(PoisonError::into_inner) = Some(kind);
    }

    fn take(slot: &Mutex<Option<io::ErrorKind>>) -> Option<io::Error> {
        slot.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(|kind| io::Error::new(kind, "injected fault"))
    }
}

/// Client side of the in-memory duplex with failures injected through a [`FaultSwitch`].
#[derive(Debug)]
pub struct FaultyStream {
    inner: DuplexStream,
    switch: FaultSwitch,
}

impl AsyncRead for FaultyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(err) = FaultSwitch::take(&this.switch.read) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FaultyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(err) = FaultSwitch::take(&this.switch.write) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Callback recorded by [`RecordingConsumer`].
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    Message(DeliveredMessage),
    Close {
        code: u16,
        reason: String,
        remote: bool,
    },
}

/// Consumer forwarding every callback to a channel.
pub struct RecordingConsumer {
    tx: mpsc::UnboundedSender<ConsumerEvent>,
    auto_json: bool,
    auto_xml: bool,
}

impl RecordingConsumer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ConsumerEvent>) {
        Self::with_parsing(false, false)
    }

    pub fn with_parsing(
        auto_json: bool,
        auto_xml: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ConsumerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                auto_json,
                auto_xml,
            }),
            rx,
        )
    }
}

impl WsConsumer for RecordingConsumer {
    fn on_message(&self, message: DeliveredMessage) {
        let _ = self.tx.send(ConsumerEvent::Message(message));
    }

    fn on_close(&self, code: u16, reason: &str, remote: bool) {
        let _ = self.tx.send(ConsumerEvent::Close {
            code,
            reason: reason.to_string(),
            remote,
        });
    }

    fn auto_json_parse(&self) -> bool {
        self.auto_json
    }

    fn auto_xml_parse(&self) -> bool {
        self.auto_xml
    }
}

/// Event recorded by [`RecordingReporter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    Notification {
        level: NotificationLevel,
        text: String,
    },
    Exception {
        details: String,
        error: String,
    },
}

/// Reporter forwarding every event to a channel.
pub struct RecordingReporter {
    tx: mpsc::UnboundedSender<ReportEvent>,
}

impl RecordingReporter {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ReportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl WsErrorReporter for RecordingReporter {
    fn notification(&self, level: NotificationLevel, text: &str, _ctx: &DiagnosticContext) {
        let _ = self.tx.send(ReportEvent::Notification {
            level,
            text: text.to_string(),
        });
    }

    fn exception(&self, details: &str, error: &WebSocketError, _ctx: &DiagnosticContext) {
        let _ = self.tx.send(ReportEvent::Exception {
            details: details.to_string(),
            error: error.to_string(),
        });
    }
}

/// Receive with a timeout; `None` if nothing arrived in time.
pub async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>, timeout: Duration) -> Option<T> {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .ok()
        .flatten()
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_for<T>(
    rx: &mut mpsc::UnboundedReceiver<T>,
    timeout: Duration,
    mut pred: impl FnMut(&T) -> bool,
) -> Option<T> {
    tokio::time::timeout(timeout, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
