//! Client context and the connect entry point.
//!
//! A [`WsClient`] carries what used to be process-wide state: default headers, the default error
//! reporter and the execution context that runs connection tasks. Each call can override any of
//! these through [`WsCall`].

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::{Handle, Runtime};
use tracing::info;

use crate::core::{DiagnosticBuilder, HandshakeError, WebSocketError, WebSocketResult, WsConfig};
use crate::ws::{
    Connection, ConnectionParts, DefaultExtension, Destination, HandshakeRequest, Subprotocol,
    TracingReporter, WsConsumer, WsErrorReporter, WsExtension, WsSubprotocol, client_handshake,
};

static SHARED_RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Handle of the current runtime, or of a lazily built shared pool when called outside one.
pub fn default_runtime() -> WebSocketResult<Handle> {
    if let Ok(handle) = Handle::try_current() {
        return Ok(handle);
    }
    if let Some(runtime) = SHARED_RUNTIME.get() {
        return Ok(runtime.handle().clone());
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("ws-core-shared")
        .enable_all()
        .build()
        .map_err(|err| WebSocketError::Runtime(err.to_string()))?;
    Ok(SHARED_RUNTIME.get_or_init(|| runtime).handle().clone())
}

/// Shared client context. Cheap to clone.
#[derive(Clone)]
pub struct WsClient {
    headers: HeaderMap,
    reporter: Arc<dyn WsErrorReporter>,
    runtime: Handle,
    config: WsConfig,
}

impl WsClient {
    pub fn builder() -> WsClientBuilder {
        WsClientBuilder::default()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn config(&self) -> &WsConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    /// Run the opening handshake on `stream` and start the connection.
    ///
    /// `stream` must already be connected (and TLS-terminated for `wss`). On failure the error is
    /// reported through the call's reporter and no connection exists.
    pub async fn connect<S>(
        &self,
        stream: S,
        destination: &Destination,
        consumer: Arc<dyn WsConsumer>,
        call: WsCall,
    ) -> WebSocketResult<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let reporter = call
            .reporter
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.reporter));
        let runtime = call.runtime.clone().unwrap_or_else(|| self.runtime.clone());
        let headers = self.merged_headers(&call.headers);

        let extensions = if call.extensions.is_empty() {
            vec![Arc::new(DefaultExtension) as Arc<dyn WsExtension>]
        } else {
            call.extensions
        };
        let subprotocols = if call.subprotocols.is_empty() {
            vec![Arc::new(Subprotocol::new("")) as Arc<dyn WsSubprotocol>]
        } else {
            call.subprotocols
        };

        let timeout = call.connect_timeout.unwrap_or(self.config.connect_timeout);
        let mut diag = DiagnosticBuilder::start(destination.to_string());
        let request = HandshakeRequest {
            destination,
            headers: &headers,
            extensions: &extensions,
            subprotocols: &subprotocols,
            max_response_bytes: self.config.max_handshake_bytes,
            read_buffer_bytes: self.config.read_buffer_bytes,
        };
        let outcome =
            match tokio::time::timeout(timeout, client_handshake(stream, request, &mut diag)).await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(HandshakeError::Timeout(timeout).into()),
            };
        let negotiated = match outcome {
            Ok(negotiated) => negotiated,
            Err(err) => {
                diag.broken(&err);
                reporter.exception("websocket handshake failed", &err, &diag.build());
                return Err(err);
            }
        };

        let diagnostics = Arc::new(diag.build());
        let connection = Connection::new(
            negotiated.stream,
            ConnectionParts {
                extension: negotiated.extension,
                subprotocol: negotiated.subprotocol,
                consumer,
                reporter,
                diagnostics: Arc::clone(&diagnostics),
                config: self.config,
                runtime,
            },
        );
        connection.start()?;
        info!(
            call = diagnostics.id,
            url = %diagnostics.url,
            subprotocol = %connection.subprotocol(),
            extension = connection.extension().name(),
            "websocket connection established"
        );
        Ok(connection)
    }

    /// Client headers with every name present in `overrides` replaced.
    fn merged_headers(&self, overrides: &HeaderMap) -> HeaderMap {
        let mut headers = self.headers.clone();
        for name in overrides.keys() {
            headers.remove(name);
        }
        for (name, value) in overrides {
            headers.append(name.clone(), value.clone());
        }
        headers
    }
}

#[derive(Default)]
pub struct WsClientBuilder {
    headers: HeaderMap,
    reporter: Option<Arc<dyn WsErrorReporter>>,
    runtime: Option<Handle>,
    config: WsConfig,
}

impl WsClientBuilder {
    /// Header sent with every call unless the call overrides it.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn reporter(mut self, reporter: Arc<dyn WsErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn config(mut self, config: WsConfig) -> Self {
        self.config = config;
        self
    }

    /// Fails only when no runtime was given and the shared pool cannot be started.
    pub fn build(self) -> WebSocketResult<WsClient> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => default_runtime()?,
        };
        Ok(WsClient {
            headers: self.headers,
            reporter: self.reporter.unwrap_or_else(|| Arc::new(TracingReporter)),
            runtime,
            config: self.config,
        })
    }
}

/// Per-call overrides.
#[derive(Clone, Default)]
pub struct WsCall {
    headers: HeaderMap,
    extensions: Vec<Arc<dyn WsExtension>>,
    subprotocols: Vec<Arc<dyn WsSubprotocol>>,
    reporter: Option<Arc<dyn WsErrorReporter>>,
    runtime: Option<Handle>,
    connect_timeout: Option<Duration>,
}

impl WsCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Candidate extension; the first one accepting the response wins.
    pub fn extension(mut self, extension: impl WsExtension) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    pub fn subprotocol(mut self, subprotocol: impl WsSubprotocol) -> Self {
        self.subprotocols.push(Arc::new(subprotocol));
        self
    }

    /// Shorthand for a [`Subprotocol`] matched by name.
    pub fn protocol(self, name: impl Into<String>) -> Self {
        self.subprotocol(Subprotocol::new(name))
    }

    pub fn reporter(mut self, reporter: Arc<dyn WsErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_headers_replace_client_headers() {
        let client = WsClient::builder()
            .header(
                HeaderName::from_static("x-tenant"),
                HeaderValue::from_static("shared"),
            )
            .header(
                HeaderName::from_static("x-agent"),
                HeaderValue::from_static("ws-core"),
            )
            .build()
            .unwrap();
        let mut overrides = HeaderMap::new();
        overrides.insert("x-tenant", HeaderValue::from_static("call"));

        let merged = client.merged_headers(&overrides);
        assert_eq!(merged["x-tenant"], "call");
        assert_eq!(merged["x-agent"], "ws-core");
        assert_eq!(merged.get_all("x-tenant").iter().count(), 1);
    }

    #[test]
    fn builder_outside_a_runtime_uses_the_shared_pool() {
        let client = WsClient::builder().build().unwrap();
        let again = WsClient::builder().build().unwrap();
        assert_eq!(client.runtime().block_on(async { 7 }), 7);
        assert_eq!(again.runtime().block_on(async { 8 }), 8);
        assert_eq!(client.config().outbound_capacity, 128);
    }
}
