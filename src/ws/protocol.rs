/// An application subprotocol negotiated through `Sec-WebSocket-Protocol`.
pub trait WsSubprotocol: Send + Sync + 'static {
    /// Whether the server's response header value is acceptable.
    fn accept_protocol(&self, header: &str) -> bool;

    /// Value offered in the request header. Empty means none.
    fn provided_protocol(&self) -> String;
}

/// Name-matching subprotocol.
///
/// An empty name offers nothing and accepts any response. Otherwise the response value is
/// split on commas, spaces removed, and one entry must equal the name exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subprotocol {
    name: String,
}

impl Subprotocol {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl WsSubprotocol for Subprotocol {
    fn accept_protocol(&self, header: &str) -> bool {
        if self.name.is_empty() {
            return true;
        }
        let compact: String = header.chars().filter(|c| *c != ' ').collect();
        compact.split(',').any(|candidate| candidate == self.name)
    }

    fn provided_protocol(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_accepts_anything() {
        let proto = Subprotocol::new("");
        assert!(proto.accept_protocol(""));
        assert!(proto.accept_protocol("chat"));
    }

    #[test]
    fn named_protocol_matches_list_entries_exactly() {
        let proto = Subprotocol::new("chat.v2");
        assert!(proto.accept_protocol("chat.v2"));
        assert!(proto.accept_protocol("mqtt, chat.v2"));
        assert!(!proto.accept_protocol("chat"));
        assert!(!proto.accept_protocol(""));
    }
}
