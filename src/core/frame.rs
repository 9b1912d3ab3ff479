use bytes::{BufMut, Bytes, BytesMut};

use super::types::{WebSocketError, WebSocketResult};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Registered close codes.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    /// Sentinel for a Close frame that carried no status code. Never sent on the wire.
    pub const NO_STATUS: u16 = 1005;
    /// Sentinel for a connection dropped without a Close frame. Never sent on the wire.
    pub const ABNORMAL: u16 = 1006;
    pub const INVALID_PAYLOAD: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const TOO_BIG: u16 = 1009;
    pub const MANDATORY_EXTENSION: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    /// Sentinel for a TLS handshake failure. Never sent on the wire.
    pub const TLS_FAILURE: u16 = 1015;

    /// Whether `code` may appear in a Close frame written to the wire.
    #[inline]
    pub fn is_sendable(code: u16) -> bool {
        !matches!(code, NO_STATUS | ABNORMAL | TLS_FAILURE) && (1000..5000).contains(&code)
    }
}

/// 4-bit frame opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0,
            Opcode::Text => 1,
            Opcode::Binary => 2,
            Opcode::Close => 8,
            Opcode::Ping => 9,
            Opcode::Pong => 10,
        }
    }

    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Opcode::Continuation),
            1 => Some(Opcode::Text),
            2 => Some(Opcode::Binary),
            8 => Some(Opcode::Close),
            9 => Some(Opcode::Ping),
            10 => Some(Opcode::Pong),
            _ => None,
        }
    }

    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// Variant-specific part of a frame. Close carries its decoded code and reason.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Continuation,
    Text,
    Binary,
    Close { code: u16, reason: String },
    Ping,
    Pong,
}

impl FrameKind {
    #[inline]
    pub fn opcode(&self) -> Opcode {
        match self {
            FrameKind::Continuation => Opcode::Continuation,
            FrameKind::Text => Opcode::Text,
            FrameKind::Binary => Opcode::Binary,
            FrameKind::Close { .. } => Opcode::Close,
            FrameKind::Ping => Opcode::Ping,
            FrameKind::Pong => Opcode::Pong,
        }
    }
}

/// One websocket frame, control or data.
///
/// A frame is owned by whichever side currently holds it: the reader builds it from the wire
/// and hands it to the dispatcher, the writer takes it off the outbound queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    payload: Bytes,
}

impl Frame {
    /// Build a frame from a raw opcode and payload, decoding Close payloads leniently.
    ///
    /// Use [`Frame::validate`] to find out whether the result is well-formed.
    pub fn new(opcode: Opcode, fin: bool, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let kind = kind_for(opcode, &payload);
        Self {
            kind,
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            payload,
        }
    }

    #[inline]
    pub fn text(text: impl AsRef<str>) -> Self {
        Self::new(
            Opcode::Text,
            true,
            Bytes::copy_from_slice(text.as_ref().as_bytes()),
        )
    }

    #[inline]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, true, payload)
    }

    #[inline]
    pub fn continuation(fin: bool, payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Continuation, fin, payload)
    }

    #[inline]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, true, payload)
    }

    #[inline]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, true, payload)
    }

    pub fn close(code: u16, reason: impl AsRef<str>) -> Self {
        let reason = reason.as_ref();
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self {
            kind: FrameKind::Close {
                code,
                reason: reason.to_string(),
            },
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            payload: payload.freeze(),
        }
    }

    /// Mark this frame as a non-final fragment.
    #[inline]
    pub fn fragment(mut self) -> Self {
        self.fin = false;
        self
    }

    #[inline]
    pub fn with_rsv(mut self, rsv1: bool, rsv2: bool, rsv3: bool) -> Self {
        self.rsv1 = rsv1;
        self.rsv2 = rsv2;
        self.rsv3 = rsv3;
        self
    }

    #[inline]
    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }

    #[inline]
    pub fn opcode(&self) -> Opcode {
        self.kind.opcode()
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Replace the payload. Close frames re-derive their code and reason.
    pub fn set_payload(&mut self, payload: impl Into<Bytes>) {
        self.payload = payload.into();
        if let FrameKind::Close { .. } = self.kind {
            self.kind = kind_for(Opcode::Close, &self.payload);
        }
    }

    #[inline]
    pub fn has_rsv(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode().is_control()
    }

    /// Close code and reason, `None` for any other variant.
    pub fn close_info(&self) -> Option<(u16, &str)> {
        match &self.kind {
            FrameKind::Close { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        }
    }

    /// Check the shape rules of this frame's variant.
    pub fn validate(&self) -> WebSocketResult<()> {
        if self.is_control() {
            if !self.fin {
                return Err(invalid(self, "fragmented control frame"));
            }
            if self.has_rsv() {
                return Err(invalid(self, "control frame with reserved bits set"));
            }
            if self.payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(invalid(
                    self,
                    &format!(
                        "control payload of {} bytes exceeds {MAX_CONTROL_PAYLOAD}",
                        self.payload.len()
                    ),
                ));
            }
        }

        match self.kind {
            FrameKind::Text => {
                let utf8_ok = if self.fin {
                    std::str::from_utf8(&self.payload).is_ok()
                } else {
                    utf8_prefix_ok(&self.payload)
                };
                if !utf8_ok {
                    return Err(invalid(self, "text payload is not valid UTF-8"));
                }
            }
            FrameKind::Close { .. } => {
                if self.payload.len() == 1 {
                    return Err(invalid(self, "close payload of a single byte"));
                }
                if self.payload.len() > 2 && std::str::from_utf8(&self.payload[2..]).is_err() {
                    return Err(invalid(self, "close reason is not valid UTF-8"));
                }
            }
            _ => {}
        }
        Ok(())
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

fn invalid(frame: &Frame, why: &str) -> WebSocketError {
    WebSocketError::FrameValidation(format!("{:?} frame: {why}", frame.opcode()))
}

fn kind_for(opcode: Opcode, payload: &[u8]) -> FrameKind {
    match opcode {
        Opcode::Continuation => FrameKind::Continuation,
        Opcode::Text => FrameKind::Text,
        Opcode::Binary => FrameKind::Binary,
        Opcode::Ping => FrameKind::Ping,
        Opcode::Pong => FrameKind::Pong,
        Opcode::Close => {
            if payload.len() < 2 {
                FrameKind::Close {
                    code: close_code::NO_STATUS,
                    reason: String::new(),
                }
            } else {
                FrameKind::Close {
                    code: u16::from_be_bytes([payload[0], payload[1]]),
                    reason: String::from_utf8_lossy(&payload[2..]).into_owned(),
                }
            }
        }
    }
}

/// Valid UTF-8, allowing a trailing sequence cut off by fragmentation.
fn utf8_prefix_ok(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(_) => true,
        Err(err) => err.error_len().is_none(),
    }
}
