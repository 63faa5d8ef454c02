use anyhow::Result;
use framecast_protocol::{CompletedFrame, HeaderLayout, MediaFrame};
use tracing::{debug, info, warn};

use crate::gate::{DecodeGate, GateConfig, GateDecision};

/// A codec decoder instance. Decoders may buffer, so one call can return
/// zero or several outputs.
pub trait MediaDecoder {
    type Output;

    fn decode(&mut self, frame: &MediaFrame) -> Result<Vec<Self::Output>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub frames_offered: u64,
    pub frames_decoded: u64,
    pub dropped_awaiting_keyframe: u64,
    pub dropped_backlog: u64,
    pub dropped_unparseable: u64,
    pub decoder_resets: u64,
}

/// Parses reassembled payloads, gates them, and feeds a decoder that is
/// rebuilt through `factory` whenever it reports an error.
pub struct DecodePipeline<D, F> {
    layout: HeaderLayout,
    gate: DecodeGate,
    decoder: D,
    factory: F,
    stats: PipelineStats,
}

impl<D, F> DecodePipeline<D, F>
where
    D: MediaDecoder,
    F: FnMut() -> Result<D>,
{
    pub fn new(layout: HeaderLayout, gate: GateConfig, mut factory: F) -> Result<Self> {
        let decoder = factory()?;
        Ok(Self {
            layout,
            gate: DecodeGate::new(gate),
            decoder,
            factory,
            stats: PipelineStats::default(),
        })
    }

    pub fn gate(&self) -> &DecodeGate {
        &self.gate
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Hand one reassembled frame to the decoder if the gate allows it.
    ///
    /// Decoder failures are absorbed: the decoder is replaced and the gate
    /// goes back to waiting for a keyframe. Only a failure to build the
    /// replacement decoder is returned.
    pub fn push(&mut self, completed: CompletedFrame) -> Result<Vec<D::Output>> {
        self.stats.frames_offered += 1;
        let frame_id = completed.frame_id;

        let frame = match MediaFrame::from_bytes(completed.payload, self.layout) {
            Ok(frame) => frame,
            Err(e) => {
                self.stats.dropped_unparseable += 1;
                debug!(frame_id, "dropping frame with unreadable sub-header: {}", e);
                return Ok(Vec::new());
            }
        };

        match self.gate.offer(frame.kind) {
            GateDecision::Decode => {}
            GateDecision::DropAwaitingKeyframe => {
                self.stats.dropped_awaiting_keyframe += 1;
                return Ok(Vec::new());
            }
            GateDecision::DropBacklog => {
                self.stats.dropped_backlog += 1;
                return Ok(Vec::new());
            }
        }

        match self.decoder.decode(&frame) {
            Ok(outputs) => {
                for _ in &outputs {
                    self.gate.on_decoded();
                }
                self.stats.frames_decoded += 1;
                Ok(outputs)
            }
            Err(e) => {
                warn!(frame_id, "decode error: {:#}", e);
                self.gate.on_decode_error();
                self.decoder = (self.factory)()?;
                self.stats.decoder_resets += 1;
                info!(frame_id, "decoder rebuilt, waiting for keyframe");
                Ok(Vec::new())
            }
        }
    }
}
