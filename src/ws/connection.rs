//! A live websocket after a successful handshake.
//!
//! The stream is split into independent halves. A dedicated reader task owns the inbound half
//! for the lifetime of the connection. The outbound half sits behind an async mutex and is
//! driven by a writer task that is spawned on demand, drains the outbound queue and exits; the
//! `sending` flag keeps that to one writer at a time.

use std::collections::VecDeque;
use std::fmt;
use std::ops::ControlFlow;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info};

use super::consumer::{WsConsumer, WsErrorReporter};
use super::extension::{DefaultExtension, WsExtension};
use super::protocol::WsSubprotocol;
use crate::core::{
    DeliveredMessage, DiagnosticContext, Frame, FrameKind, MAX_CONTROL_PAYLOAD, NotificationLevel,
    Opcode, WebSocketError, WebSocketResult, WsConfig, WsConnectionState, WsConnectionStats,
    close_code, encode_frame, read_frame,
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Upper bound for reclaiming the outbound half, writing the final Close frame and shutting it.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

static DEFAULT_EXTENSION: DefaultExtension = DefaultExtension;

/// Handle to a negotiated websocket. Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Everything a connection needs besides the stream itself.
pub(crate) struct ConnectionParts {
    pub extension: Arc<dyn WsExtension>,
    pub subprotocol: Arc<dyn WsSubprotocol>,
    pub consumer: Arc<dyn WsConsumer>,
    pub reporter: Arc<dyn WsErrorReporter>,
    pub diagnostics: Arc<DiagnosticContext>,
    pub config: WsConfig,
    pub runtime: Handle,
}

struct Inner {
    parts: ConnectionParts,
    outbound: Mutex<VecDeque<Frame>>,
    writer: AsyncMutex<Option<BoxedWriter>>,
    reader: Mutex<Option<BoxedReader>>,
    running: AtomicBool,
    closing: AtomicBool,
    sending: AtomicBool,
    /// A write was abandoned part way, so no further frame may follow it on the wire.
    write_torn: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    released_tx: watch::Sender<bool>,
    stats: Counters,
}

#[derive(Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    messages_delivered: AtomicU64,
    frames_discarded: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> WsConnectionStats {
        WsConnectionStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
        }
    }
}

/// Partially received fragmented message.
struct FragmentAssembly {
    opcode: Opcode,
    buffer: BytesMut,
}

impl Connection {
    pub(crate) fn new<S>(stream: S, parts: ConnectionParts) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (shutdown_tx, _) = watch::channel(false);
        let (released_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                outbound: Mutex::new(VecDeque::with_capacity(parts.config.outbound_capacity)),
                writer: AsyncMutex::new(Some(Box::new(writer))),
                reader: Mutex::new(Some(Box::new(reader))),
                running: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                sending: AtomicBool::new(false),
                write_torn: AtomicBool::new(false),
                shutdown_tx,
                released_tx,
                stats: Counters::default(),
                parts,
            }),
        }
    }

    /// Start the read loop. Succeeds once per connection.
    pub(crate) fn start(&self) -> WebSocketResult<()> {
        let inner = &self.inner;
        if inner.closing.load(Ordering::Acquire) {
            return Err(WebSocketError::InvalidState("connection is closed".to_string()));
        }
        if inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(WebSocketError::InvalidState(
                "read loop already started".to_string(),
            ));
        }
        let reader = lock(&inner.reader)
            .take()
            .ok_or_else(|| WebSocketError::InvalidState("reader already released".to_string()))?;
        let shutdown_rx = inner.shutdown_tx.subscribe();
        let task = Arc::clone(inner);
        inner
            .parts
            .runtime
            .spawn(async move { task.read_loop(reader, shutdown_rx).await });
        Ok(())
    }

    /// Validate `frame` and queue it for the writer.
    pub fn send(&self, frame: Frame) -> WebSocketResult<()> {
        frame.validate()?;
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(WebSocketError::InvalidState("connection is closed".to_string()));
        }
        self.inner.enqueue(frame)
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> WebSocketResult<()> {
        self.send(Frame::text(text))
    }

    pub fn send_binary(&self, data: impl Into<Bytes>) -> WebSocketResult<()> {
        self.send(Frame::binary(data))
    }

    /// Serialize `value` as JSON and send it as a text message.
    pub fn send_json<T>(&self, value: &T) -> WebSocketResult<()>
    where
        T: Serialize + ?Sized,
    {
        let text = sonic_rs::to_string(value)
            .map_err(|err| WebSocketError::SerializeFailed(err.to_string()))?;
        self.send(Frame::text(text))
    }

    /// Serialize `element` and send it as a single-line text message.
    pub fn send_xml(&self, element: &xmltree::Element) -> WebSocketResult<()> {
        let mut out = Vec::new();
        element
            .write(&mut out)
            .map_err(|err| WebSocketError::SerializeFailed(err.to_string()))?;
        let text = String::from_utf8(out)
            .map_err(|err| WebSocketError::SerializeFailed(err.to_string()))?;
        self.send(Frame::text(text.replace(['\r', '\n'], "")))
    }

    pub fn send_ping(&self, payload: impl Into<Bytes>) -> WebSocketResult<()> {
        self.send(Frame::ping(payload))
    }

    pub fn send_pong(&self, payload: impl Into<Bytes>) -> WebSocketResult<()> {
        self.send(Frame::pong(payload))
    }

    /// Close with `1000`. Returns whether this call performed the close.
    pub fn close(&self) -> bool {
        self.inner.close(close_code::NORMAL, "", false)
    }

    /// Close with an explicit code and reason. Returns whether this call performed the close.
    pub fn close_with(&self, code: u16, reason: &str) -> bool {
        self.inner.close(code, reason, false)
    }

    /// Resolves once the stream has been released.
    pub async fn closed(&self) {
        let mut released = self.inner.released_tx.subscribe();
        let _ = released.wait_for(|done| *done).await;
    }

    pub fn state(&self) -> WsConnectionState {
        let inner = &self.inner;
        if *inner.released_tx.borrow() {
            WsConnectionState::Closed
        } else if inner.closing.load(Ordering::Acquire) {
            WsConnectionState::Closing
        } else if inner.running.load(Ordering::Acquire) {
            WsConnectionState::Running
        } else {
            WsConnectionState::Idle
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == WsConnectionState::Running
    }

    /// Negotiated subprotocol name, empty when none was requested.
    pub fn subprotocol(&self) -> String {
        self.inner.parts.subprotocol.provided_protocol()
    }

    pub fn extension(&self) -> &Arc<dyn WsExtension> {
        &self.inner.parts.extension
    }

    pub fn diagnostics(&self) -> &Arc<DiagnosticContext> {
        &self.inner.parts.diagnostics
    }

    pub fn stats(&self) -> WsConnectionStats {
        self.inner.stats.snapshot()
    }

    /// Frames waiting for the writer.
    pub fn queued(&self) -> usize {
        lock(&self.inner.outbound).len()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("call", &self.inner.parts.diagnostics.id)
            .field("url", &self.inner.parts.diagnostics.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn id(&self) -> u64 {
        self.parts.diagnostics.id
    }

    fn notify(&self, level: NotificationLevel, text: &str) {
        self.parts
            .reporter
            .notification(level, text, &self.parts.diagnostics);
    }

    fn report(&self, details: &str, err: &WebSocketError) {
        self.parts
            .reporter
            .exception(details, err, &self.parts.diagnostics);
    }

    // ---------------------------------------------------------------- read path

    async fn read_loop(
        self: Arc<Self>,
        mut reader: BoxedReader,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        debug!(target: "ws-reader", connection = self.id(), "read loop started");
        let mut assembly: Option<FragmentAssembly> = None;

        loop {
            if self.closing.load(Ordering::Acquire) {
                break;
            }
            let result = tokio::select! {
                biased;
                res = shutdown_rx.changed() => {
                    if res.is_err() || *shutdown_rx.borrow_and_update() { break; }
                    continue;
                }
                result = read_frame(&mut reader, self.parts.config.max_frame_bytes) => result,
            };

            match result {
                Ok(Some(frame)) => {
                    if self.handle_frame(frame, &mut assembly).is_break() {
                        break;
                    }
                }
                Ok(None) => {
                    if !self.closing.load(Ordering::Acquire) {
                        self.notify(
                            NotificationLevel::Warn,
                            "websocket stream ended without a close frame",
                        );
                        self.close(close_code::ABNORMAL, "", true);
                    }
                    break;
                }
                Err(err) if err.is_transient() => continue,
                Err(err) => {
                    if !self.closing.load(Ordering::Acquire) {
                        self.report("websocket read failed", &err);
                        let code = match err {
                            WebSocketError::MessageTooLarge { .. } => close_code::TOO_BIG,
                            WebSocketError::Protocol(_) => close_code::PROTOCOL_ERROR,
                            _ => close_code::ABNORMAL,
                        };
                        self.close(code, &err.to_string(), false);
                    }
                    break;
                }
            }
        }
        debug!(target: "ws-reader", connection = self.id(), "read loop exited");
    }

    fn handle_frame(
        self: &Arc<Self>,
        mut frame: Frame,
        assembly: &mut Option<FragmentAssembly>,
    ) -> ControlFlow<()> {
        self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_in
            .fetch_add(frame.payload().len() as u64, Ordering::Relaxed);
        debug!(
            target: "ws-reader",
            connection = self.id(),
            opcode = ?frame.opcode(),
            fin = frame.fin,
            payload_len = frame.payload().len(),
            "frame received"
        );

        let extension: &dyn WsExtension = if frame.has_rsv() {
            self.parts.extension.as_ref()
        } else {
            &DEFAULT_EXTENSION
        };
        if !extension.is_frame_valid(&frame) {
            self.discard(&frame, "reserved bits not allowed by the negotiated extension");
            return ControlFlow::Continue(());
        }
        if let Err(err) = extension.decode_frame(&mut frame) {
            self.discard(&frame, &err.to_string());
            return ControlFlow::Continue(());
        }
        if let Err(err) = frame.validate() {
            self.discard(&frame, &err.to_string());
            return ControlFlow::Continue(());
        }

        match frame.kind() {
            FrameKind::Close { code, reason } => {
                info!(connection = self.id(), code, reason = %reason, "received websocket close frame");
                self.close(*code, reason, true);
                ControlFlow::Break(())
            }
            FrameKind::Ping => {
                if let Err(err) = self.enqueue(Frame::pong(frame.payload().clone())) {
                    self.report("failed to queue pong", &err);
                }
                self.notify(NotificationLevel::Info, "ping received");
                ControlFlow::Continue(())
            }
            FrameKind::Pong => {
                self.notify(NotificationLevel::Info, "pong received");
                ControlFlow::Continue(())
            }
            FrameKind::Text | FrameKind::Binary => {
                if assembly.is_some() {
                    *assembly = None;
                    return self.fail(
                        WebSocketError::ProtocolSequence(
                            "new data frame while a fragmented message is open".to_string(),
                        ),
                        close_code::PROTOCOL_ERROR,
                    );
                }
                let opcode = frame.opcode();
                if frame.fin {
                    self.deliver(opcode, frame.into_payload());
                } else {
                    let payload = frame.into_payload();
                    if let Err(err) = self.check_message_size(payload.len()) {
                        return self.fail(err, close_code::TOO_BIG);
                    }
                    *assembly = Some(FragmentAssembly {
                        opcode,
                        buffer: BytesMut::from(payload.as_ref()),
                    });
                }
                ControlFlow::Continue(())
            }
            FrameKind::Continuation => {
                let Some(open) = assembly.as_mut() else {
                    return self.fail(
                        WebSocketError::ProtocolSequence(
                            "continuation frame without a fragmented message".to_string(),
                        ),
                        close_code::PROTOCOL_ERROR,
                    );
                };
                if let Err(err) = self.check_message_size(open.buffer.len() + frame.payload().len())
                {
                    *assembly = None;
                    return self.fail(err, close_code::TOO_BIG);
                }
                open.buffer.extend_from_slice(frame.payload());
                if frame.fin {
                    if let Some(done) = assembly.take() {
                        self.deliver(done.opcode, done.buffer.freeze());
                    }
                }
                ControlFlow::Continue(())
            }
        }
    }

    fn check_message_size(&self, size: usize) -> WebSocketResult<()> {
        let limit = self.parts.config.max_message_bytes;
        if size > limit {
            return Err(WebSocketError::MessageTooLarge {
                size: size as u64,
                limit,
            });
        }
        Ok(())
    }

    fn discard(&self, frame: &Frame, why: &str) {
        self.stats.frames_discarded.fetch_add(1, Ordering::Relaxed);
        self.notify(
            NotificationLevel::Warn,
            &format!("discarding invalid {:?} frame: {why}", frame.opcode()),
        );
    }

    fn fail(self: &Arc<Self>, err: WebSocketError, code: u16) -> ControlFlow<()> {
        self.report("websocket protocol failure", &err);
        self.close(code, &err.to_string(), false);
        ControlFlow::Break(())
    }

    fn deliver(&self, opcode: Opcode, payload: Bytes) {
        let consumer = &self.parts.consumer;
        let message = if opcode == Opcode::Text {
            let text = match std::str::from_utf8(&payload) {
                Ok(text) => text.to_string(),
                Err(_) => {
                    self.stats.frames_discarded.fetch_add(1, Ordering::Relaxed);
                    self.notify(
                        NotificationLevel::Warn,
                        "discarding text message that is not valid UTF-8",
                    );
                    return;
                }
            };
            let (message, parse_err) = DeliveredMessage::text(
                payload,
                text,
                consumer.auto_json_parse(),
                consumer.auto_xml_parse(),
            );
            if let Some(err) = parse_err {
                self.report("failed to parse text message", &err);
            }
            message
        } else {
            DeliveredMessage::binary(payload)
        };

        self.stats.messages_delivered.fetch_add(1, Ordering::Relaxed);
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| consumer.on_message(message))) {
            self.report(
                "consumer on_message panicked",
                &WebSocketError::ConsumerPanicked(panic_text(panic.as_ref())),
            );
        }
    }

    // --------------------------------------------------------------- write path

    fn enqueue(self: &Arc<Self>, frame: Frame) -> WebSocketResult<()> {
        {
            let mut queue = lock(&self.outbound);
            if queue.len() >= self.parts.config.outbound_capacity {
                drop(queue);
                self.notify(
                    NotificationLevel::Error,
                    &format!(
                        "outbound queue full ({} frames), dropping {:?} frame",
                        self.parts.config.outbound_capacity,
                        frame.opcode()
                    ),
                );
                return Err(WebSocketError::OutboundQueueFull);
            }
            queue.push_back(frame);
        }
        self.kick_writer();
        Ok(())
    }

    fn kick_writer(self: &Arc<Self>) {
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let task = Arc::clone(self);
            self.parts.runtime.spawn(async move { task.drain().await });
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            self.write_queued().await;
            self.sending.store(false, Ordering::Release);

            // A sender may have pushed after the last pop but before the flag was released.
            if self.closing.load(Ordering::Acquire) || lock(&self.outbound).is_empty() {
                return;
            }
            if self
                .sending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
        }
    }

    async fn write_queued(self: &Arc<Self>) {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return;
        };
        let mut buf = BytesMut::new();

        while !self.closing.load(Ordering::Acquire) {
            let Some(mut frame) = lock(&self.outbound).pop_front() else {
                break;
            };
            if let Err(err) = self.parts.extension.encode_frame(&mut frame) {
                self.report("failed to encode outbound frame", &err);
                continue;
            }

            buf.clear();
            encode_frame(&frame, Some(rand::random::<u32>().to_be_bytes()), &mut buf);
            // A peer that stopped reading must not pin the writer past close.
            let written = tokio::select! {
                biased;
                res = write_flush(writer, &buf) => res,
                () = shutdown_signalled(self.shutdown_tx.subscribe()) => {
                    self.write_torn.store(true, Ordering::Release);
                    debug!(
                        target: "ws-writer",
                        connection = self.id(),
                        "write abandoned on close"
                    );
                    return;
                }
            };

            match written {
                Ok(()) => {
                    self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_out
                        .fetch_add(buf.len() as u64, Ordering::Relaxed);
                    debug!(
                        target: "ws-writer",
                        connection = self.id(),
                        opcode = ?frame.opcode(),
                        payload_len = frame.payload().len(),
                        "frame written"
                    );
                }
                Err(err) => {
                    drop(guard);
                    if !self.closing.load(Ordering::Acquire) {
                        let err = WebSocketError::from(err);
                        self.report("websocket write failed", &err);
                        self.close(close_code::ABNORMAL, "", false);
                    }
                    return;
                }
            }
        }
    }

    // -------------------------------------------------------------------- close

    fn close(self: &Arc<Self>, code: u16, reason: &str, remote: bool) -> bool {
        if self
            .closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.shutdown_tx.send_replace(true);
        info!(connection = self.id(), code, remote, "closing websocket connection");

        let consumer = &self.parts.consumer;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| consumer.on_close(code, reason, remote)))
        {
            self.report(
                "consumer on_close panicked",
                &WebSocketError::ConsumerPanicked(panic_text(panic.as_ref())),
            );
        }

        let task = Arc::clone(self);
        let reason = truncate_reason(reason).to_string();
        self.parts
            .runtime
            .spawn(async move { task.release(code, reason).await });
        true
    }

    /// Write a best-effort Close frame, then shut the stream. Errors are expected here and dropped.
    async fn release(&self, code: u16, reason: String) {
        lock(&self.reader).take();
        let finish = async {
            let Some(mut writer) = self.writer.lock().await.take() else {
                return;
            };
            if close_code::is_sendable(code) && !self.write_torn.load(Ordering::Acquire) {
                let mut buf = BytesMut::new();
                encode_frame(
                    &Frame::close(code, &reason),
                    Some(rand::random::<u32>().to_be_bytes()),
                    &mut buf,
                );
                let _ = writer.write_all(&buf).await;
                let _ = writer.flush().await;
            }
            let _ = writer.shutdown().await;
        };
        if tokio::time::timeout(RELEASE_TIMEOUT, finish).await.is_err() {
            debug!(connection = self.id(), "timed out releasing websocket stream");
            if let Ok(mut guard) = self.writer.try_lock() {
                guard.take();
            }
        }
        self.released_tx.send_replace(true);
        debug!(connection = self.id(), "websocket stream released");
    }
}

async fn write_flush(writer: &mut BoxedWriter, buf: &[u8]) -> std::io::Result<()> {
    writer.write_all(buf).await?;
    writer.flush().await
}

async fn shutdown_signalled(mut shutdown_rx: watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Longest prefix of `reason` that fits a Close payload next to the status code.
fn truncate_reason(reason: &str) -> &str {
    let max = MAX_CONTROL_PAYLOAD - 2;
    if reason.len() <= max {
        return reason;
    }
    let mut end = max;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_is_cut_on_a_char_boundary() {
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_CONTROL_PAYLOAD - 2);
        assert!(Frame::close(close_code::NORMAL, cut).is_valid());
        assert_eq!(truncate_reason("short"), "short");
    }

    #[test]
    fn panic_payloads_render_as_text() {
        assert_eq!(panic_text(&"boom"), "boom");
        assert_eq!(panic_text(&String::from("bang")), "bang");
        assert_eq!(panic_text(&42u8), "non-string panic payload");
    }
}
