/// Legacy binary provider protocol framing
///
/// Notification frame (big-endian):
///
/// ```text
/// 0x02 | u32 item block length | items...
/// item: tag(1) | len(u16) | value
/// ```
///
/// Error response: `0x08 | status(1) | identifier(u32)`.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use push_core::{PushError, PushMessage};

pub const COMMAND_NOTIFICATION: u8 = 0x02;
pub const COMMAND_ERROR_RESPONSE: u8 = 0x08;

pub const ITEM_DEVICE_TOKEN: u8 = 0x01;
pub const ITEM_PAYLOAD: u8 = 0x02;
pub const ITEM_IDENTIFIER: u8 = 0x03;
pub const ITEM_EXPIRATION: u8 = 0x04;
pub const ITEM_PRIORITY: u8 = 0x05;

pub const DEVICE_TOKEN_SIZE: usize = 32;
pub const MAX_PAYLOAD_SIZE: usize = 2048;
pub const ERROR_RESPONSE_SIZE: usize = 6;

const FRAME_HEADER_SIZE: usize = 5;
const PRIORITY_IMMEDIATE: u8 = 0x05;

/// Status byte meaning "invalid token"
pub const STATUS_INVALID_TOKEN: u8 = 8;

/// Parse a 64-character hex device token (either case) into its 32 raw bytes
pub fn decode_device_token(token: &str) -> Result<[u8; DEVICE_TOKEN_SIZE], PushError> {
    let mut raw = [0u8; DEVICE_TOKEN_SIZE];
    hex::decode_to_slice(token, &mut raw)
        .map_err(|e| PushError::Format(format!("invalid device token: {e}")))?;
    Ok(raw)
}

/// Render raw token bytes as lowercase hex
pub fn encode_device_token(raw: &[u8]) -> String {
    hex::encode(raw)
}

/// Encode one notification frame
///
/// `None` produces the close sentinel: a frame carrying only the identifier item. Every
/// validation happens before any byte is produced, so a rejected message never reaches
/// the wire.
pub fn encode_frame(
    message: Option<&PushMessage>,
    identifier: u32,
    now: DateTime<Utc>,
) -> Result<Bytes, PushError> {
    let mut items = BytesMut::with_capacity(64);

    put_item(&mut items, ITEM_IDENTIFIER, &identifier.to_be_bytes());

    if let Some(message) = message {
        let token = decode_device_token(message.device_token())?;

        let payload = serde_json::to_vec(message.payload())
            .map_err(|e| PushError::Format(format!("payload serialization failed: {e}")))?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PushError::Format(format!(
                "payload too big ({} bytes, max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        if message.expire_time() < now + chrono::Duration::seconds(60) {
            return Err(PushError::Expired);
        }
        let expiry = u32::try_from(message.expire_time().timestamp())
            .map_err(|_| PushError::Format("expire time out of range".to_string()))?;

        items.reserve(payload.len() + 64);
        put_item(&mut items, ITEM_DEVICE_TOKEN, &token);
        put_item(&mut items, ITEM_PAYLOAD, &payload);
        put_item(&mut items, ITEM_EXPIRATION, &expiry.to_be_bytes());
        if message.high_priority() {
            put_item(&mut items, ITEM_PRIORITY, &[PRIORITY_IMMEDIATE]);
        }
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_SIZE + items.len());
    frame.put_u8(COMMAND_NOTIFICATION);
    frame.put_u32(items.len() as u32);
    frame.extend_from_slice(&items);
    Ok(frame.freeze())
}

fn put_item(buf: &mut BytesMut, tag: u8, value: &[u8]) {
    buf.put_u8(tag);
    buf.put_u16(value.len() as u16);
    buf.extend_from_slice(value);
}

/// A notification frame as seen by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecodedFrame {
    pub identifier: Option<u32>,
    pub device_token: Option<[u8; DEVICE_TOKEN_SIZE]>,
    pub payload: Option<Vec<u8>>,
    pub expiry: Option<u32>,
    pub high_priority: bool,
}

impl DecodedFrame {
    /// The close sentinel carries nothing but its identifier
    pub fn is_sentinel(&self) -> bool {
        self.identifier.is_some() && self.device_token.is_none() && self.payload.is_none()
    }
}

/// Decode one notification frame from the front of `buf`
///
/// Returns `Ok(None)` when `buf` does not yet hold a complete frame, otherwise the frame
/// and the number of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(DecodedFrame, usize)>, PushError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &buf[..FRAME_HEADER_SIZE];
    let command = header.get_u8();
    if command != COMMAND_NOTIFICATION {
        return Err(PushError::Format(format!("unexpected command {command:#04x}")));
    }
    let block_len = header.get_u32() as usize;
    let total = FRAME_HEADER_SIZE + block_len;
    if buf.len() < total {
        return Ok(None);
    }

    let mut items = &buf[FRAME_HEADER_SIZE..total];
    let mut frame = DecodedFrame::default();

    while items.has_remaining() {
        if items.remaining() < 3 {
            return Err(PushError::Format("truncated item header".to_string()));
        }
        let tag = items.get_u8();
        let len = items.get_u16() as usize;
        if items.remaining() < len {
            return Err(PushError::Format(format!("truncated item {tag:#04x}")));
        }
        let value = &items[..len];

        match (tag, len) {
            (ITEM_DEVICE_TOKEN, DEVICE_TOKEN_SIZE) => {
                let mut token = [0u8; DEVICE_TOKEN_SIZE];
                token.copy_from_slice(value);
                frame.device_token = Some(token);
            }
            (ITEM_PAYLOAD, _) => frame.payload = Some(value.to_vec()),
            (ITEM_IDENTIFIER, 4) => frame.identifier = Some((&value[..]).get_u32()),
            (ITEM_EXPIRATION, 4) => frame.expiry = Some((&value[..]).get_u32()),
            (ITEM_PRIORITY, 1) => frame.high_priority = value[0] == PRIORITY_IMMEDIATE,
            _ => {
                return Err(PushError::Format(format!(
                    "invalid item {tag:#04x} of length {len}"
                )))
            }
        }

        items.advance(len);
    }

    Ok(Some((frame, total)))
}

/// Asynchronous error report sent by the gateway right before it closes the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: u8,
    pub identifier: u32,
}

impl ErrorResponse {
    /// `None` when the frame is not an error response
    pub fn parse(frame: &[u8; ERROR_RESPONSE_SIZE]) -> Option<Self> {
        let mut buf = &frame[..];
        if buf.get_u8() != COMMAND_ERROR_RESPONSE {
            return None;
        }
        let status = buf.get_u8();
        let identifier = buf.get_u32();
        Some(Self { status, identifier })
    }

    pub fn to_bytes(&self) -> [u8; ERROR_RESPONSE_SIZE] {
        let mut out = [0u8; ERROR_RESPONSE_SIZE];
        let mut buf = &mut out[..];
        buf.put_u8(COMMAND_ERROR_RESPONSE);
        buf.put_u8(self.status);
        buf.put_u32(self.identifier);
        out
    }

    pub fn description(&self) -> &'static str {
        status_description(self.status)
    }
}

/// Human-readable text for an error response status
pub fn status_description(status: u8) -> &'static str {
    match status {
        0 => "No errors encountered",
        1 => "Processing error",
        2 => "Missing device token",
        3 => "Missing topic",
        4 => "Missing payload",
        5 => "Invalid token size",
        6 => "Invalid topic size",
        7 => "Invalid payload size",
        8 => "Invalid token",
        10 => "Shutdown",
        255 => "None (unknown)",
        _ => "Unrecognized status",
    }
}
