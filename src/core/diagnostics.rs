//! Diagnostic context attached to every reported event.
//!
//! The surrounding HTTP layer owns call tracing; the websocket core only records what the
//! handshake observed so reporters can correlate events with the call that produced them.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use http::HeaderMap;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable snapshot of one websocket call.
#[derive(Clone, Debug)]
pub struct DiagnosticContext {
    pub id: u64,
    pub method: &'static str,
    pub url: String,
    pub request_headers: HeaderMap,
    pub request_started: SystemTime,
    pub request_written: Option<SystemTime>,
    pub response_started: Option<SystemTime>,
    pub response_done: Option<SystemTime>,
    pub status: Option<u16>,
    pub status_message: Option<String>,
    pub response_headers: HeaderMap,
    pub broken_by: Option<String>,
}

impl DiagnosticContext {
    pub fn has_invoke_error(&self) -> bool {
        self.broken_by.is_some()
    }

    /// Whether the HTTP exchange completed with a status line.
    pub fn is_http_transaction_done(&self) -> bool {
        !self.has_invoke_error() && self.status.is_some()
    }

    /// Human-readable multi-line summary.
    pub fn trace(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "*** TRACE {} ***", self.id);
        let _ = writeln!(out, "===> REQUEST {} {}", self.method, self.url);
        for (name, value) in &self.request_headers {
            let _ = writeln!(
                out,
                "{}: {}",
                name,
                String::from_utf8_lossy(value.as_bytes())
            );
        }
        match self.status {
            Some(status) => {
                let _ = writeln!(
                    out,
                    "===> RESPONSE {} {}",
                    status,
                    self.status_message.as_deref().unwrap_or("")
                );
                for (name, value) in &self.response_headers {
                    let _ = writeln!(
                        out,
                        "{}: {}",
                        name,
                        String::from_utf8_lossy(value.as_bytes())
                    );
                }
            }
            None => {
                let _ = writeln!(out, "===> RESPONSE not received");
            }
        }
        if let Some(err) = &self.broken_by {
            let _ = writeln!(out, "===> BROKEN BY {err}");
        }
        out
    }
}

/// Incremental recorder used while the handshake runs.
#[derive(Debug)]
pub struct DiagnosticBuilder {
    ctx: DiagnosticContext,
}

impl DiagnosticBuilder {
    pub fn start(url: impl Into<String>) -> Self {
        Self {
            ctx: DiagnosticContext {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                method: "GET",
                url: url.into(),
                request_headers: HeaderMap::new(),
                request_started: SystemTime::now(),
                request_written: None,
                response_started: None,
                response_done: None,
                status: None,
                status_message: None,
                response_headers: HeaderMap::new(),
                broken_by: None,
            },
        }
    }

    pub fn headers(&mut self, headers: &HeaderMap) -> &mut Self {
        self.ctx.request_headers = headers.clone();
        self
    }

    pub fn written(&mut self) -> &mut Self {
        self.ctx.request_written = Some(SystemTime::now());
        self
    }

    pub fn response_started(&mut self, status: u16, message: impl Into<String>) -> &mut Self {
        self.ctx.response_started = Some(SystemTime::now());
        self.ctx.status = Some(status);
        self.ctx.status_message = Some(message.into());
        self
    }

    pub fn response_done(&mut self, headers: &HeaderMap) -> &mut Self {
        self.ctx.response_done = Some(SystemTime::now());
        self.ctx.response_headers = headers.clone();
        self
    }

    pub fn broken(&mut self, error: &impl std::fmt::Display) -> &mut Self {
        self.ctx.broken_by = Some(error.to_string());
        self
    }

    pub fn build(&self) -> DiagnosticContext {
        self.ctx.clone()
    }
}
