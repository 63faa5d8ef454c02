use bytes::Bytes;

use crate::error::ProtocolError;
use crate::packet::{encode_data_packet, encode_length_packet, MAX_SEGMENT_SIZE};

/// Split one frame payload into datagrams: a length announcement followed by
/// data packets of at most `max_segment` bytes, indexed from 1.
///
/// Packets are produced lazily; nothing is retained once a packet has been
/// handed to the caller.
pub fn fragment_frame(
    frame_id: u32,
    payload: &[u8],
    max_segment: usize,
) -> Result<Fragments<'_>, ProtocolError> {
    let total_length = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::FrameTooLarge(payload.len() as u64))?;
    Ok(Fragments {
        frame_id,
        total_length,
        payload,
        max_segment: max_segment.max(1),
        next_index: 0,
        offset: 0,
    })
}

/// Iterator over the datagrams of a single frame.
#[derive(Debug)]
pub struct Fragments<'a> {
    frame_id: u32,
    total_length: u32,
    payload: &'a [u8],
    max_segment: usize,
    next_index: u32,
    offset: usize,
}

impl Fragments<'_> {
    pub fn frame_id(&self) -> u32 {
        self.frame_id
    }

    /// Number of datagrams the whole frame occupies, including the length
    /// announcement.
    pub fn packet_count(&self) -> usize {
        1 + self.payload.len().div_ceil(self.max_segment)
    }
}

impl Iterator for Fragments<'_> {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.next_index == 0 {
            self.next_index = 1;
            return Some(encode_length_packet(self.frame_id, self.total_length));
        }
        if self.offset >= self.payload.len() {
            return None;
        }

        let end = (self.offset + self.max_segment).min(self.payload.len());
        let packet = encode_data_packet(self.frame_id, self.next_index, &self.payload[self.offset..end]);
        self.offset = end;
        self.next_index += 1;
        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let emitted = if self.next_index == 0 { 0 } else { 1 + self.offset.div_ceil(self.max_segment) };
        let remaining = self.packet_count() - emitted;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Fragments<'_> {}

/// Sender half of one media stream: owns the frame id counter so that every
/// frame on the stream gets the next id. Video and audio each use their own.
#[derive(Debug)]
pub struct Fragmenter {
    next_frame_id: u32,
    max_segment: usize,
}

impl Fragmenter {
    pub fn new() -> Self {
        Self::with_max_segment(MAX_SEGMENT_SIZE)
    }

    pub fn with_max_segment(max_segment: usize) -> Self {
        Self { next_frame_id: 0, max_segment: max_segment.max(1) }
    }

    /// Id the next call to [`Fragmenter::fragment`] will use.
    pub fn next_frame_id(&self) -> u32 {
        self.next_frame_id
    }

    pub fn max_segment(&self) -> usize {
        self.max_segment
    }

    /// Assign the next frame id to `payload` and return its datagrams.
    ///
    /// The counter only advances when the payload is accepted.
    pub fn fragment<'a>(&mut self, payload: &'a [u8]) -> Result<Fragments<'a>, ProtocolError> {
        let fragments = fragment_frame(self.next_frame_id, payload, self.max_segment)?;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        Ok(fragments)
    }
}

impl Default for Fragmenter {
    fn default() -> Self {
        Self::new()
    }
}
