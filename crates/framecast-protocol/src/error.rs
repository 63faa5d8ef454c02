use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("packet too short: expected at least {expected} bytes, got {got}")]
    PacketTooShort { expected: usize, got: usize },

    #[error("segment too large: {len} bytes (max {max})")]
    SegmentTooLarge { len: usize, max: usize },

    #[error("packet index {index} out of range for frame {frame_id} (limit {limit})")]
    SegmentIndexOutOfRange { frame_id: u32, index: u32, limit: u32 },

    #[error("frame too large: {0} bytes")]
    FrameTooLarge(u64),

    #[error("stale frame {0}: already emitted or evicted")]
    StaleFrame(u32),

    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownFrameKind(u8),
}

impl ProtocolError {
    /// Whether the datagram itself was structurally invalid, as opposed to
    /// well-formed but not usable by the receiver.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::PacketTooShort { .. }
                | Self::SegmentTooLarge { .. }
                | Self::SegmentIndexOutOfRange { .. }
                | Self::FrameTooLarge(_)
        )
    }
}
