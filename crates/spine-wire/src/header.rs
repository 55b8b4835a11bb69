//! Fixed 5-byte frame header.
//!
//! Every message on the wire is `[1-byte status][4-byte big-endian length]`
//! followed by exactly `length` payload bytes.

use spine_types::{SpineError, SpineResult};

/// Encoded size of a header in bytes.
pub const HEADER_LENGTH: usize = 5;

const STATUS_INDEX: usize = 0;
const LENGTH_INDEX: usize = 1;

/// Status byte carried in every header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Regular request or successful response.
    Ok,
    /// Layout handshake between a caller and a service.
    LayoutProbe,
    /// The handler failed while producing a response.
    HandlerInternalError,
    /// The payload could not be decoded.
    CorruptPayload,
    /// The authentication tag did not match.
    IncorrectHash,
    /// Any status byte this version does not know about.
    Unknown(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            0 => Status::Ok,
            1 => Status::LayoutProbe,
            253 => Status::HandlerInternalError,
            254 => Status::CorruptPayload,
            255 => Status::IncorrectHash,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => 0,
            Status::LayoutProbe => 1,
            Status::HandlerInternalError => 253,
            Status::CorruptPayload => 254,
            Status::IncorrectHash => 255,
            Status::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Ok => write!(f, "ok"),
            Status::LayoutProbe => write!(f, "layout_probe"),
            Status::HandlerInternalError => write!(f, "handler_internal_error"),
            Status::CorruptPayload => write!(f, "corrupt_payload"),
            Status::IncorrectHash => write!(f, "incorrect_hash"),
            Status::Unknown(code) => write!(f, "unknown({code})"),
        }
    }
}

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub status: Status,
    pub payload_length: u32,
}

impl Header {
    /// Build the header describing `payload`.
    pub fn for_payload(status: Status, payload: &[u8]) -> SpineResult<Self> {
        let payload_length = length_field(payload.len())?;
        Ok(Self {
            status,
            payload_length,
        })
    }

    /// Encode to the fixed wire layout.
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[STATUS_INDEX] = self.status.into();
        buf[LENGTH_INDEX..].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }
}

fn length_field(len: usize) -> SpineResult<u32> {
    u32::try_from(len).map_err(|_| SpineError::MessageTooLarge {
        size: u64::try_from(len).unwrap_or(u64::MAX),
        max: u32::MAX,
    })
}

/// Encode the header for `payload`.
pub fn encode_header(status: Status, payload: &[u8]) -> SpineResult<[u8; HEADER_LENGTH]> {
    Ok(Header::for_payload(status, payload)?.encode())
}

/// Decode a header. Fails unless `buffer` is exactly [`HEADER_LENGTH`] bytes.
pub fn decode_header(buffer: &[u8]) -> SpineResult<Header> {
    if buffer.len() != HEADER_LENGTH {
        return Err(SpineError::MalformedHeader {
            expected: HEADER_LENGTH,
            actual: buffer.len(),
        });
    }
    let mut length = [0u8; 4];
    length.copy_from_slice(&buffer[LENGTH_INDEX..HEADER_LENGTH]);
    Ok(Header {
        status: Status::from(buffer[STATUS_INDEX]),
        payload_length: u32::from_be_bytes(length),
    })
}
