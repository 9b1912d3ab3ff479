use tracing::{error, info, warn};

use crate::core::{DeliveredMessage, DiagnosticContext, NotificationLevel, WebSocketError};

/// Application side of a connection.
///
/// Callbacks run on the connection's reader task; a slow callback delays the next frame.
pub trait WsConsumer: Send + Sync + 'static {
    fn on_message(&self, message: DeliveredMessage);

    /// Called exactly once per connection, whichever side closed it.
    fn on_close(&self, code: u16, reason: &str, remote: bool) {
        let _ = (code, reason, remote);
    }

    /// Parse text messages that look like JSON.
    fn auto_json_parse(&self) -> bool {
        false
    }

    /// Parse text messages that look like XML.
    fn auto_xml_parse(&self) -> bool {
        false
    }
}

/// Sink for notifications and failures raised by the handshake and the connection.
pub trait WsErrorReporter: Send + Sync + 'static {
    fn notification(&self, level: NotificationLevel, text: &str, ctx: &DiagnosticContext);

    fn exception(&self, details: &str, error: &WebSocketError, ctx: &DiagnosticContext);
}

/// Reporter that forwards everything to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl WsErrorReporter for TracingReporter {
    fn notification(&self, level: NotificationLevel, text: &str, ctx: &DiagnosticContext) {
        match level {
            NotificationLevel::Info => info!(call = ctx.id, url = %ctx.url, "{text}"),
            NotificationLevel::Warn => warn!(call = ctx.id, url = %ctx.url, "{text}"),
            NotificationLevel::Error => error!(call = ctx.id, url = %ctx.url, "{text}"),
        }
    }

    fn exception(&self, details: &str, err: &WebSocketError, ctx: &DiagnosticContext) {
        error!(call = ctx.id, url = %ctx.url, error = %err, "{details}");
    }
}
