use std::time::SystemTime;

use bytes::Bytes;

use super::types::WebSocketError;

/// One completed inbound message as handed to the consumer.
///
/// `data` always holds the raw payload. For a text message at most one of `text`, `json` and
/// `xml` is populated; binary messages carry only `data`.
#[derive(Clone, Debug)]
pub struct DeliveredMessage {
    pub data: Bytes,
    pub text: Option<String>,
    pub json: Option<sonic_rs::Value>,
    pub xml: Option<xmltree::Element>,
    pub received_at: SystemTime,
}

impl DeliveredMessage {
    pub fn binary(data: Bytes) -> Self {
        Self {
            data,
            text: None,
            json: None,
            xml: None,
            received_at: SystemTime::now(),
        }
    }

    /// Build a text message, sniffing JSON then XML when the consumer asked for it.
    ///
    /// A body that looks structured but fails to parse is still delivered as plain text; the
    /// parse error is returned alongside so the caller can report it.
    pub fn text(
        data: Bytes,
        text: String,
        auto_json: bool,
        auto_xml: bool,
    ) -> (Self, Option<WebSocketError>) {
        let mut message = Self::binary(data);
        let trimmed = text.trim();

        if auto_json && looks_like_json(trimmed) {
            match sonic_rs::from_str::<sonic_rs::Value>(trimmed) {
                Ok(value) => {
                    message.json = Some(value);
                    return (message, None);
                }
                Err(err) => {
                    message.text = Some(text);
                    return (
                        message,
                        Some(WebSocketError::ParseFailed(format!("json: {err}"))),
                    );
                }
            }
        }

        if auto_xml && looks_like_xml(trimmed) {
            match xmltree::Element::parse(trimmed.as_bytes()) {
                Ok(element) => {
                    message.xml = Some(element);
                    return (message, None);
                }
                Err(err) => {
                    message.text = Some(text);
                    return (
                        message,
                        Some(WebSocketError::ParseFailed(format!("xml: {err}"))),
                    );
                }
            }
        }

        message.text = Some(text);
        (message, None)
    }

    #[inline]
    pub fn has_text(&self) -> bool {
        self.text.is_some()
    }

    #[inline]
    pub fn has_json(&self) -> bool {
        self.json.is_some()
    }

    #[inline]
    pub fn has_xml(&self) -> bool {
        self.xml.is_some()
    }

    /// Payload as UTF-8, whichever representation was populated.
    pub fn as_str(&self) -> Option<&str> {
        match &self.text {
            Some(text) => Some(text),
            None => std::str::from_utf8(&self.data).ok(),
        }
    }
}

fn looks_like_json(s: &str) -> bool {
    (s.starts_with('{') && s.ends_with('}')) || (s.starts_with('[') && s.ends_with(']'))
}

fn looks_like_xml(s: &str) -> bool {
    s.starts_with('<') && s.ends_with('>')
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonic_rs::JsonValueTrait;

    fn text(body: &str, json: bool, xml: bool) -> (DeliveredMessage, Option<WebSocketError>) {
        DeliveredMessage::text(
            Bytes::copy_from_slice(body.as_bytes()),
            body.to_string(),
            json,
            xml,
        )
    }

    #[test]
    fn plain_text_without_sniffing() {
        let (msg, err) = text(r#"{"a":1}"#, false, false);
        assert!(err.is_none());
        assert_eq!(msg.text.as_deref(), Some(r#"{"a":1}"#));
        assert!(!msg.has_json());
    }

    #[test]
    fn json_takes_priority() {
        let (msg, err) = text(r#" {"a":1} "#, true, true);
        assert!(err.is_none());
        assert!(!msg.has_text());
        assert!(!msg.has_xml());
        let json = msg.json.expect("json");
        assert_eq!(json.get("a").and_then(|v| v.as_i64()), Some(1));
    }

    #[test]
    fn xml_is_parsed_when_enabled() {
        let (msg, err) = text("<note><to>bob</to></note>", true, true);
        assert!(err.is_none());
        let xml = msg.xml.as_ref().expect("xml");
        assert_eq!(xml.name, "note");
        assert!(xml.get_child("to").is_some());
        assert!(!msg.has_text());
    }

    #[test]
    fn broken_json_falls_back_to_text() {
        let (msg, err) = text("{not json}", true, false);
        assert!(matches!(err, Some(WebSocketError::ParseFailed(_))));
        assert_eq!(msg.text.as_deref(), Some("{not json}"));
        assert!(!msg.has_json());
    }

    #[test]
    fn binary_carries_only_bytes() {
        let msg = DeliveredMessage::binary(Bytes::from_static(&[0, 159]));
        assert!(!msg.has_text() && !msg.has_json() && !msg.has_xml());
        assert_eq!(msg.as_str(), None);
    }
}
