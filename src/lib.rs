//! Client-side websocket core over any async byte stream.
//!
//! The surrounding HTTP layer opens the stream (and terminates TLS); this crate performs the
//! RFC 6455 upgrade on it and runs the resulting [`Connection`].

pub mod client;
pub mod core;
pub mod testing;
pub mod ws;

pub use client::{WsCall, WsClient, WsClientBuilder, default_runtime};
pub use ws::{
    CompressionExtension, Connection, DefaultExtension, DeliveredMessage, Destination,
    DiagnosticContext, Frame, FrameCompressor, FrameKind, NotificationLevel, Opcode, Scheme,
    Subprotocol, TracingReporter, WebSocketError, WebSocketResult, WsConfig, WsConnectionState,
    WsConnectionStats, WsConsumer, WsErrorReporter, WsExtension, WsSubprotocol, close_code,
};
