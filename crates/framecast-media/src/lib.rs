pub mod decoder;
pub mod gate;
pub mod session;

use std::fmt;
use std::time::Duration;

use framecast_protocol::ReassemblerConfig;

use crate::gate::GateConfig;

/// The independent media streams of a session. Each has its own frame id
/// space, reassembler and decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }

    /// Frames allowed in the decoder before the gate starts skipping to the
    /// next keyframe.
    pub fn backlog_threshold(self) -> u32 {
        match self {
            StreamKind::Video => 30,
            StreamKind::Audio => 30,
        }
    }

    /// How long a partial frame may sit idle before it is abandoned.
    /// Audio frames are small and frequent, so a stalled one is stale sooner.
    pub fn frame_ttl(self) -> Duration {
        match self {
            StreamKind::Video => Duration::from_secs(2),
            StreamKind::Audio => Duration::from_millis(500),
        }
    }

    /// Capacity of the per-stream datagram channel. Video frames span many
    /// packets; 1024 slots hold a couple of seconds of bursts.
    pub fn datagram_queue_capacity(self) -> usize {
        match self {
            StreamKind::Video => 1024,
            StreamKind::Audio => 256,
        }
    }

    pub fn reassembler_config(self) -> ReassemblerConfig {
        ReassemblerConfig {
            frame_ttl: self.frame_ttl(),
            ..ReassemblerConfig::default()
        }
    }

    pub fn gate_config(self) -> GateConfig {
        GateConfig {
            backlog_threshold: Some(self.backlog_threshold()),
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_names() {
        assert_eq!(StreamKind::Video.to_string(), "video");
        assert_eq!(StreamKind::Audio.as_str(), "audio");
    }

    #[test]
    fn presets_feed_configs() {
        assert_eq!(StreamKind::Video.gate_config().backlog_threshold, Some(30));
        assert_eq!(
            StreamKind::Audio.reassembler_config().frame_ttl,
            Duration::from_millis(500)
        );
        assert_eq!(
            StreamKind::Video.reassembler_config().max_segment,
            framecast_protocol::packet::MAX_SEGMENT_SIZE
        );
    }

    #[test]
    fn video_queue_is_larger() {
        assert!(StreamKind::Video.datagram_queue_capacity() > StreamKind::Audio.datagram_queue_capacity());
    }
}
