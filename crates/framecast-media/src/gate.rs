use framecast_protocol::FrameKind;
use tracing::{debug, info};

/// Whether reassembled frames may reach the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Delta frames are useless until a keyframe re-establishes the
    /// reference chain.
    WaitingForKeyframe,
    Decoding,
}

/// What to do with the frame just offered to the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Decode,
    /// Delta frame while no keyframe has been seen since the last reset.
    DropAwaitingKeyframe,
    /// The decoder is too far behind; the frame is sacrificed and the gate
    /// waits for the next keyframe.
    DropBacklog,
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Maximum frames handed to the decoder but not yet decoded. `None`
    /// disables the backlog check.
    pub backlog_threshold: Option<u32>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { backlog_threshold: Some(30) }
    }
}

/// Keyframe/backlog state machine in front of a decoder.
#[derive(Debug)]
pub struct DecodeGate {
    config: GateConfig,
    state: GateState,
    frames_in_flight: u32,
}

impl DecodeGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::WaitingForKeyframe,
            frames_in_flight: 0,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Decide whether a completed frame of `kind` is decoded. A `Decode`
    /// decision counts the frame as in flight until
    /// [`DecodeGate::on_decoded`] is called for it.
    pub fn offer(&mut self, kind: FrameKind) -> GateDecision {
        if self.state == GateState::WaitingForKeyframe {
            if !kind.is_key() {
                return GateDecision::DropAwaitingKeyframe;
            }
            info!("keyframe received, decoding resumed");
            self.state = GateState::Decoding;
        }

        if let Some(threshold) = self.config.backlog_threshold {
            if self.frames_in_flight >= threshold {
                debug!(
                    in_flight = self.frames_in_flight,
                    threshold, "decode backlog too deep, skipping to next keyframe"
                );
                self.state = GateState::WaitingForKeyframe;
                return GateDecision::DropBacklog;
            }
        }

        self.frames_in_flight += 1;
        GateDecision::Decode
    }

    /// The decoder produced output for one in-flight frame.
    pub fn on_decoded(&mut self) {
        self.frames_in_flight = self.frames_in_flight.saturating_sub(1);
    }

    /// The decoder failed. Frames queued in the old decoder instance are
    /// gone with it, so nothing is in flight any more.
    pub fn on_decode_error(&mut self) {
        self.state = GateState::WaitingForKeyframe;
        self.frames_in_flight = 0;
    }
}

impl Default for DecodeGate {
    fn default() -> Self {
        Self::new(GateConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_waiting_for_keyframe() {
        let gate = DecodeGate::default();
        assert_eq!(gate.state(), GateState::WaitingForKeyframe);
        assert_eq!(gate.frames_in_flight(), 0);
    }

    #[test]
    fn delta_before_keyframe_dropped() {
        let mut gate = DecodeGate::default();
        for _ in 0..5 {
            assert_eq!(gate.offer(FrameKind::Delta), GateDecision::DropAwaitingKeyframe);
        }
        assert_eq!(gate.state(), GateState::WaitingForKeyframe);
        assert_eq!(gate.frames_in_flight(), 0);
    }

    #[test]
    fn keyframe_then_deltas_all_decoded() {
        let mut gate = DecodeGate::default();
        assert_eq!(gate.offer(FrameKind::Key), GateDecision::Decode);
        for _ in 0..10 {
            assert_eq!(gate.offer(FrameKind::Delta), GateDecision::Decode);
        }
        assert_eq!(gate.state(), GateState::Decoding);
        assert_eq!(gate.frames_in_flight(), 11);
    }

    #[test]
    fn keyframe_while_decoding_passes_through() {
        let mut gate = DecodeGate::default();
        gate.offer(FrameKind::Key);
        gate.offer(FrameKind::Delta);
        assert_eq!(gate.offer(FrameKind::Key), GateDecision::Decode);
        assert_eq!(gate.state(), GateState::Decoding);
    }

    #[test]
    fn backlog_drops_and_waits_for_keyframe() {
        let mut gate = DecodeGate::new(GateConfig { backlog_threshold: Some(3) });
        assert_eq!(gate.offer(FrameKind::Key), GateDecision::Decode);
        assert_eq!(gate.offer(FrameKind::Delta), GateDecision::Decode);
        assert_eq!(gate.offer(FrameKind::Delta), GateDecision::Decode);
        assert_eq!(gate.offer(FrameKind::Delta), GateDecision::DropBacklog);
        assert_eq!(gate.state(), GateState::WaitingForKeyframe);

        // Decoder catches up, but deltas still wait for a keyframe.
        gate.on_decoded();
        gate.on_decoded();
        gate.on_decoded();
        assert_eq!(gate.offer(FrameKind::Delta), GateDecision::DropAwaitingKeyframe);
        assert_eq!(gate.offer(FrameKind::Key), GateDecision::Decode);
    }

    #[test]
    fn keyframe_into_full_backlog_is_dropped() {
        let mut gate = DecodeGate::new(GateConfig { backlog_threshold: Some(1) });
        assert_eq!(gate.offer(FrameKind::Key), GateDecision::Decode);
        assert_eq!(gate.offer(FrameKind::Key), GateDecision::DropBacklog);
        assert_eq!(gate.state(), GateState::WaitingForKeyframe);
    }

    #[test]
    fn decoded_output_drains_backlog() {
        let mut gate = DecodeGate::new(GateConfig { backlog_threshold: Some(2) });
        gate.offer(FrameKind::Key);
        gate.offer(FrameKind::Delta);
        gate.on_decoded();
        assert_eq!(gate.offer(FrameKind::Delta), GateDecision::Decode);
        assert_eq!(gate.frames_in_flight(), 2);
    }

    #[test]
    fn unbounded_backlog() {
        let mut gate = DecodeGate::new(GateConfig { backlog_threshold: None });
        gate.offer(FrameKind::Key);
        for _ in 0..1000 {
            assert_eq!(gate.offer(FrameKind::Delta), GateDecision::Decode);
        }
    }

    #[test]
    fn decode_error_resets() {
        let mut gate = DecodeGate::default();
        gate.offer(FrameKind::Key);
        gate.offer(FrameKind::Delta);
        gate.on_decode_error();
        assert_eq!(gate.state(), GateState::WaitingForKeyframe);
        assert_eq!(gate.frames_in_flight(), 0);
        assert_eq!(gate.offer(FrameKind::Delta), GateDecision::DropAwaitingKeyframe);
    }

    #[test]
    fn on_decoded_never_underflows() {
        let mut gate = DecodeGate::default();
        gate.on_decoded();
        assert_eq!(gate.frames_in_flight(), 0);
    }
}
