//! RFC 6455 frame wire format.
//!
//! Layout: `FIN|RSV1|RSV2|RSV3|opcode`, then `MASK|len7`, an optional 16- or 64-bit big-endian
//! extended length, an optional 4-byte mask key, then the payload.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::frame::{Frame, Opcode};
use super::types::{WebSocketError, WebSocketResult};

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV2_BIT: u8 = 0x20;
const RSV3_BIT: u8 = 0x10;
const OPCODE_MASK: u8 = 0x0F;
const MASK_BIT: u8 = 0x80;
const LEN_MASK: u8 = 0x7F;

/// Width of the payload length field chosen for a given payload size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthClass {
    /// Length fits the 7-bit field (0..=125).
    Short,
    /// `126` marker plus a 16-bit length (126..=65535).
    Extended16,
    /// `127` marker plus a 64-bit length.
    Extended64,
}

impl LengthClass {
    #[inline]
    pub fn for_len(len: usize) -> Self {
        if len <= 125 {
            LengthClass::Short
        } else if len <= u16::MAX as usize {
            LengthClass::Extended16
        } else {
            LengthClass::Extended64
        }
    }

    /// Bytes used by the extended length field.
    #[inline]
    pub fn extended_bytes(self) -> usize {
        match self {
            LengthClass::Short => 0,
            LengthClass::Extended16 => 2,
            LengthClass::Extended64 => 8,
        }
    }
}

/// XOR `payload` with `key`. Masking and unmasking are the same operation.
#[inline]
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Number of bytes `encode_frame` will produce for `frame`.
pub fn encoded_len(frame: &Frame, masked: bool) -> usize {
    let len = frame.payload().len();
    2 + LengthClass::for_len(len).extended_bytes() + if masked { 4 } else { 0 } + len
}

/// Append the wire form of `frame` to `dst`, masking the payload when a key is given.
pub fn encode_frame(frame: &Frame, mask: Option<[u8; 4]>, dst: &mut BytesMut) {
    let payload = frame.payload();
    dst.reserve(encoded_len(frame, mask.is_some()));

    let mut first = frame.opcode().as_u8();
    if frame.fin {
        first |= FIN_BIT;
    }
    if frame.rsv1 {
        first |= RSV1_BIT;
    }
    if frame.rsv2 {
        first |= RSV2_BIT;
    }
    if frame.rsv3 {
        first |= RSV3_BIT;
    }
    dst.put_u8(first);

    let mask_flag = if mask.is_some() { MASK_BIT } else { 0 };
    match LengthClass::for_len(payload.len()) {
        LengthClass::Short => dst.put_u8(mask_flag | payload.len() as u8),
        LengthClass::Extended16 => {
            dst.put_u8(mask_flag | 126);
            dst.put_u16(payload.len() as u16);
        }
        LengthClass::Extended64 => {
            dst.put_u8(mask_flag | 127);
            dst.put_u64(payload.len() as u64);
        }
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(payload),
    }
}

/// Read one frame, unmasking it if the sender masked it.
///
/// Returns `Ok(None)` on a clean end of stream before the first header byte.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> WebSocketResult<Option<Frame>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(read_frame_with_mask(reader, max_frame_bytes)
        .await?
        .map(|(frame, _)| frame))
}

/// Like [`read_frame`], also returning the mask key the sender used.
pub async fn read_frame_with_mask<R>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> WebSocketResult<Option<(Frame, Option<[u8; 4]>)>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 2];
    if reader.read(&mut head[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut head[1..]).await.map_err(mid_frame)?;

    let [first, second] = head;
    let opcode = Opcode::from_u8(first & OPCODE_MASK).ok_or_else(|| {
        WebSocketError::Protocol(format!("unknown opcode {:#x}", first & OPCODE_MASK))
    })?;
    let masked = second & MASK_BIT != 0;

    let len = match second & LEN_MASK {
        126 => u64::from(reader.read_u16().await.map_err(mid_frame)?),
        127 => {
            let len = reader.read_u64().await.map_err(mid_frame)?;
            if len & (1 << 63) != 0 {
                return Err(WebSocketError::Protocol(
                    "64-bit payload length with the high bit set".to_string(),
                ));
            }
            len
        }
        short => u64::from(short),
    };
    if len > max_frame_bytes as u64 {
        return Err(WebSocketError::MessageTooLarge {
            size: len,
            limit: max_frame_bytes,
        });
    }

    let key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await.map_err(mid_frame)?;
        Some(key)
    } else {
        None
    };

    let mut payload = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut payload).await.map_err(mid_frame)?;
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }

    let mut frame = Frame::new(opcode, first & FIN_BIT != 0, payload.freeze());
    frame.rsv1 = first & RSV1_BIT != 0;
    frame.rsv2 = first & RSV2_BIT != 0;
    frame.rsv3 = first & RSV3_BIT != 0;
    Ok(Some((frame, key)))
}

/// Once part of a frame has been consumed the stream position is lost, so no error here is
/// retryable.
fn mid_frame(err: std::io::Error) -> WebSocketError {
    WebSocketError::TransportError {
        context: "io_mid_frame",
        error: err.to_string(),
    }
}
