use bytes::Bytes;

use crate::core::{Frame, Opcode, WebSocketResult};

/// A per-connection frame transform negotiated during the handshake.
///
/// The extension is chosen once and held for the lifetime of the connection. Decoding runs on
/// the reader task and encoding on the writer task, so implementations must be `Send + Sync`.
pub trait WsExtension: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Reverse the transform applied by the peer.
    fn decode_frame(&self, frame: &mut Frame) -> WebSocketResult<()>;

    /// Apply the transform before the frame is masked and written.
    fn encode_frame(&self, frame: &mut Frame) -> WebSocketResult<()>;

    /// Whether an incoming frame satisfies this extension's RSV rules.
    fn is_frame_valid(&self, frame: &Frame) -> bool;

    /// Whether the server's `Sec-WebSocket-Extensions` response value is acceptable.
    fn accept_provided_extension_as_client(&self, header: &str) -> bool;

    /// Value offered in the request's `Sec-WebSocket-Extensions` header. Empty means none.
    fn provided_extension_as_client(&self) -> String;
}

/// No-op extension. Frames must not carry RSV bits.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultExtension;

impl WsExtension for DefaultExtension {
    fn name(&self) -> &str {
        "default"
    }

    fn decode_frame(&self, _frame: &mut Frame) -> WebSocketResult<()> {
        Ok(())
    }

    fn encode_frame(&self, _frame: &mut Frame) -> WebSocketResult<()> {
        Ok(())
    }

    fn is_frame_valid(&self, frame: &Frame) -> bool {
        !frame.has_rsv()
    }

    fn accept_provided_extension_as_client(&self, _header: &str) -> bool {
        true
    }

    fn provided_extension_as_client(&self) -> String {
        String::new()
    }
}

/// Payload transform plugged into a [`CompressionExtension`].
pub trait FrameCompressor: Send + Sync + 'static {
    /// Extension token offered in the request and expected back, e.g. `permessage-deflate`.
    fn token(&self) -> &str;

    fn compress(&self, payload: &[u8]) -> WebSocketResult<Bytes>;

    fn decompress(&self, payload: &[u8]) -> WebSocketResult<Bytes>;
}

/// Compression-style extension: outbound Text and Binary frames are compressed and flagged with
/// RSV1, inbound data frames carrying RSV1 are decompressed.
///
/// Data frames may set RSV1 but never RSV2 or RSV3. Control frames may set none of them.
#[derive(Clone, Debug, Default)]
pub struct CompressionExtension<C> {
    compressor: C,
}

impl<C: FrameCompressor> CompressionExtension<C> {
    pub fn new(compressor: C) -> Self {
        Self { compressor }
    }

    pub fn compressor(&self) -> &C {
        &self.compressor
    }
}

impl<C: FrameCompressor> WsExtension for CompressionExtension<C> {
    fn name(&self) -> &str {
        self.compressor.token()
    }

    fn decode_frame(&self, frame: &mut Frame) -> WebSocketResult<()> {
        if frame.rsv1 && !frame.is_control() {
            let payload = self.compressor.decompress(frame.payload())?;
            frame.set_payload(payload);
            frame.rsv1 = false;
        }
        Ok(())
    }

    fn encode_frame(&self, frame: &mut Frame) -> WebSocketResult<()> {
        if matches!(frame.opcode(), Opcode::Text | Opcode::Binary) {
            let payload = self.compressor.compress(frame.payload())?;
            frame.set_payload(payload);
            frame.rsv1 = true;
        }
        Ok(())
    }

    fn is_frame_valid(&self, frame: &Frame) -> bool {
        if frame.is_control() {
            !frame.has_rsv()
        } else {
            !frame.rsv2 && !frame.rsv3
        }
    }

    /// Accepts a response listing our token, with or without parameters.
    fn accept_provided_extension_as_client(&self, header: &str) -> bool {
        let token = self.compressor.token();
        header
            .split(',')
            .filter_map(|offer| offer.split(';').next())
            .any(|name| name.trim().eq_ignore_ascii_case(token))
    }

    fn provided_extension_as_client(&self) -> String {
        self.compressor.token().to_string()
    }
}
