use std::time::Duration;

use thiserror::Error;

/// Convenience result alias for websocket operations.
pub type WebSocketResult<T> = Result<T, WebSocketError>;

/// Failures of the opening handshake. Any of these means no connection was produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed status line: {0:?}")]
    MalformedStatusLine(String),

    #[error("unsupported protocol version in status line: {0:?}")]
    UnsupportedVersion(String),

    #[error("unexpected status code {code}: {line:?}")]
    UnexpectedStatus { code: u16, line: String },

    #[error("malformed response header: {0:?}")]
    MalformedHeader(String),

    #[error("response ended before the header block was complete")]
    IncompleteResponse,

    #[error("response header block exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },

    #[error("missing Sec-WebSocket-Accept header")]
    MissingAccept,

    #[error("Sec-WebSocket-Accept mismatch: expected {expected}, received {received}")]
    AcceptMismatch { expected: String, received: String },

    #[error("no acceptable extension for {0:?}")]
    NoAcceptableExtension(String),

    #[error("no acceptable subprotocol for {0:?}")]
    NoAcceptableSubprotocol(String),

    #[error("invalid request header: {0}")]
    InvalidRequestHeader(String),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
}

/// Canonical websocket error surface.
#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("Invalid frame: {0}")]
    FrameValidation(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Fragment sequence violation: {0}")]
    ProtocolSequence(String),

    #[error("Transport error ({context}): {error}")]
    TransportError {
        context: &'static str,
        error: String,
    },

    #[error("Backpressure: outbound queue full")]
    OutboundQueueFull,

    #[error("Message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: u64, limit: usize },

    #[error("Invalid destination: {0}")]
    InvalidDestination(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Parse failed: {0}")]
    ParseFailed(String),

    #[error("Serialize failed: {0}")]
    SerializeFailed(String),

    #[error("Consumer callback panicked: {0}")]
    ConsumerPanicked(String),

    #[error("Runtime unavailable: {0}")]
    Runtime(String),
}

impl WebSocketError {
    /// Read timeouts with no bytes consumed; the read loop simply retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WebSocketError::TransportError { context: "io_timeout", .. }
        )
    }
}

impl From<std::io::Error> for WebSocketError {
    fn from(err: std::io::Error) -> Self {
        let context = match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => "io_timeout",
            std::io::ErrorKind::UnexpectedEof => "io_eof",
            _ => "io",
        };
        WebSocketError::TransportError {
            context,
            error: err.to_string(),
        }
    }
}

/// Severity of a notification passed to an error reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationLevel {
    Info,
    Warn,
    Error,
}

/// Sizing and timing parameters of a websocket connection.
#[derive(Clone, Copy, Debug)]
pub struct WsConfig {
    /// Outbound frames that may wait for the writer before sends are refused.
    pub outbound_capacity: usize,
    /// Largest single inbound frame payload accepted.
    pub max_frame_bytes: usize,
    /// Largest reassembled inbound message accepted.
    pub max_message_bytes: usize,
    /// Largest handshake response header block accepted.
    pub max_handshake_bytes: usize,
    /// Upper bound for the whole opening handshake.
    pub connect_timeout: Duration,
    /// Capacity of the buffered reader wrapping the inbound half.
    pub read_buffer_bytes: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 128,
            max_frame_bytes: 16 * 1024 * 1024,
            max_message_bytes: 16 * 1024 * 1024,
            max_handshake_bytes: 16 * 1024,
            connect_timeout: Duration::from_secs(30),
            read_buffer_bytes: 8 * 1024,
        }
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsConnectionState {
    /// Negotiated, read loop not yet started.
    Idle,
    Running,
    /// Close sequence entered; the stream is being released.
    Closing,
    Closed,
}

/// Traffic counters snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WsConnectionStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub messages_delivered: u64,
    pub frames_discarded: u64,
}
