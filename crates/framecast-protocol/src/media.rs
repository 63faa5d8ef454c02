use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Sub-header size: 1 (type) + 8 (capture_timestamp) + 8 (duration) = 17 bytes.
pub const MEDIA_HEADER_SIZE: usize = 17;

/// Echo sub-header: 1 (type) + 8 (send_timestamp) + 8 (capture_timestamp)
/// + 8 (duration) = 25 bytes.
pub const ECHO_MEDIA_HEADER_SIZE: usize = 25;

/// Whether an encoded frame can be decoded on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Key = 1,
    Delta = 2,
}

impl FrameKind {
    pub fn from_byte(b: u8) -> Result<Self, ProtocolError> {
        match b {
            1 => Ok(Self::Key),
            2 => Ok(Self::Delta),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }

    pub fn is_key(self) -> bool {
        self == Self::Key
    }
}

/// Which sub-header a stream carries in front of the encoded data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderLayout {
    #[default]
    Standard,
    /// Adds the sender's wall-clock send time so the far end can measure
    /// round-trip latency when the stream is reflected back.
    Echo,
}

impl HeaderLayout {
    pub fn header_size(self) -> usize {
        match self {
            Self::Standard => MEDIA_HEADER_SIZE,
            Self::Echo => ECHO_MEDIA_HEADER_SIZE,
        }
    }
}

/// One encoded media unit as produced by an encoder.
///
/// Wire format (the reassembled frame payload):
/// ```text
/// standard: [type: u8] [capture_timestamp: i64 BE] [duration: u64 BE] [data]
/// echo:     [type: u8] [send_timestamp: i64 BE] [capture_timestamp: i64 BE] [duration: u64 BE] [data]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    pub kind: FrameKind,
    /// Presentation timestamp in microseconds.
    pub capture_timestamp: i64,
    /// Duration in microseconds.
    pub duration: u64,
    /// Milliseconds since the Unix epoch when the frame was sent. Only
    /// present with [`HeaderLayout::Echo`].
    pub send_timestamp: Option<i64>,
    pub data: Bytes,
}

impl MediaFrame {
    pub fn new(kind: FrameKind, capture_timestamp: i64, duration: u64, data: Bytes) -> Self {
        Self { kind, capture_timestamp, duration, send_timestamp: None, data }
    }

    /// Stamp the frame for the echo layout.
    pub fn with_send_timestamp(mut self, send_timestamp_ms: i64) -> Self {
        self.send_timestamp = Some(send_timestamp_ms);
        self
    }

    pub fn layout(&self) -> HeaderLayout {
        if self.send_timestamp.is_some() {
            HeaderLayout::Echo
        } else {
            HeaderLayout::Standard
        }
    }

    /// Serialize sub-header and data into a single frame payload.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.layout().header_size() + self.data.len());
        buf.put_u8(self.kind as u8);
        if let Some(sent) = self.send_timestamp {
            buf.put_i64(sent);
        }
        buf.put_i64(self.capture_timestamp);
        buf.put_u64(self.duration);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse a reassembled frame payload. `data` is a slice of `payload`.
    pub fn from_bytes(payload: Bytes, layout: HeaderLayout) -> Result<Self, ProtocolError> {
        let header_size = layout.header_size();
        if payload.len() < header_size {
            return Err(ProtocolError::PacketTooShort {
                expected: header_size,
                got: payload.len(),
            });
        }

        let kind = FrameKind::from_byte(payload[0])?;
        let (send_timestamp, rest) = match layout {
            HeaderLayout::Standard => (None, 1),
            HeaderLayout::Echo => (Some(read_i64(&payload, 1)), 9),
        };
        let capture_timestamp = read_i64(&payload, rest);
        let duration = read_i64(&payload, rest + 8) as u64;

        Ok(Self {
            kind,
            capture_timestamp,
            duration,
            send_timestamp,
            data: payload.slice(header_size..),
        })
    }

    /// Round-trip latency against `now_ms` (Unix epoch milliseconds), for
    /// frames carrying a send timestamp.
    pub fn latency_ms(&self, now_ms: i64) -> Option<i64> {
        self.send_timestamp.map(|sent| now_ms - sent)
    }
}

fn read_i64(buf: &[u8], at: usize) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    i64::from_be_bytes(raw)
}
