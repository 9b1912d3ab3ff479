use std::fmt;
use std::str::FromStr;

use http::Uri;

use crate::core::WebSocketError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Ws,
    Wss,
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ws | Scheme::Http => 80,
            Scheme::Wss | Scheme::Https => 443,
        }
    }

    /// Whether the surrounding layer is expected to have terminated TLS on the stream.
    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Wss | Scheme::Https)
    }
}

impl FromStr for Scheme {
    type Err = WebSocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(WebSocketError::InvalidDestination(format!(
                "unsupported scheme {other:?}"
            ))),
        }
    }
}

/// Target of a websocket call.
///
/// A port of 0 stands for the scheme's default port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

impl Destination {
    pub fn new(scheme: Scheme, host: impl Into<String>) -> Self {
        Self {
            scheme,
            host: host.into(),
            port: 0,
            path: "/".to_string(),
            query: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.query = (!query.is_empty()).then_some(query);
        self
    }

    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            self.scheme.default_port()
        } else {
            self.port
        }
    }

    /// Request target: path (default `/`) plus `?query`.
    pub fn descriptor(&self) -> String {
        let path = if self.path.is_empty() { "/" } else { &self.path };
        match &self.query {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }

    /// `Host` header value; the port is omitted when it is the scheme default.
    pub fn host_header(&self) -> String {
        let port = self.effective_port();
        if port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme.as_str(),
            self.host_header(),
            self.descriptor()
        )
    }
}

impl FromStr for Destination {
    type Err = WebSocketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri: Uri = s
            .parse()
            .map_err(|err| WebSocketError::InvalidDestination(format!("{s:?}: {err}")))?;
        let scheme: Scheme = uri
            .scheme_str()
            .ok_or_else(|| WebSocketError::InvalidDestination(format!("{s:?}: missing scheme")))?
            .parse()?;
        let authority = uri
            .authority()
            .ok_or_else(|| WebSocketError::InvalidDestination(format!("{s:?}: missing host")))?;
        if authority.as_str().contains('@') {
            return Err(WebSocketError::InvalidDestination(format!(
                "{s:?}: userinfo is not supported"
            )));
        }

        let mut destination = Destination::new(scheme, authority.host())
            .with_port(authority.port_u16().unwrap_or(0))
            .with_path(uri.path());
        if let Some(query) = uri.query() {
            destination = destination.with_query(query);
        }
        Ok(destination)
    }
}
