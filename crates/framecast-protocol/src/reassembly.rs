use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::loss::LossTracker;
use crate::media::FrameKind;
use crate::packet::{Packet, MAX_SEGMENT_SIZE, PACKET_HEADER_SIZE};

/// Frame ids within this distance behind the last emitted id count as
/// already seen.
const HALF_ID_SPACE: u32 = 1 << 31;

#[derive(Debug, Clone)]
pub struct ReassemblerConfig {
    /// Largest accepted data segment; also the size of one padding chunk
    /// when a segment is missing.
    pub max_segment: usize,
    /// Largest frame the receiver will announce or buffer.
    pub max_frame_len: u32,
    /// Open entries beyond this evict the least recently updated one.
    pub max_open_frames: usize,
    /// Entries idle longer than this are abandoned by [`Reassembler::sweep`].
    pub frame_ttl: Duration,
    /// When the length announcement never arrived, the frame length is
    /// guessed as `slots * max_segment * unknown_length_inflation`.
    pub unknown_length_inflation: f64,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            max_segment: MAX_SEGMENT_SIZE,
            max_frame_len: 16 * 1024 * 1024,
            max_open_frames: 64,
            frame_ttl: Duration::from_secs(2),
            unknown_length_inflation: 1.05,
        }
    }
}

/// Why a frame was emitted before all of its data arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonReason {
    /// The next frame completed while this one was still open ("skipped").
    NewerFrameCompleted,
    /// No packet arrived for longer than the configured TTL.
    Expired,
    /// Pushed out by the open-entry limit.
    Evicted,
    /// The inbound channel closed.
    Flushed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Complete,
    Abandoned(AbandonReason),
}

/// A frame handed out by the reassembler, padded with zeros where data was
/// missing.
#[derive(Debug, Clone)]
pub struct CompletedFrame {
    pub frame_id: u32,
    pub payload: Bytes,
    /// Number of zero-filled slots in `payload`.
    pub lost_packets: u32,
    pub disposition: Disposition,
}

impl CompletedFrame {
    pub fn is_complete(&self) -> bool {
        self.disposition == Disposition::Complete
    }

    pub fn is_skipped(&self) -> bool {
        self.disposition == Disposition::Abandoned(AbandonReason::NewerFrameCompleted)
    }

    /// Frame kind from the payload's own sub-header, if it carries a valid one.
    pub fn kind(&self) -> Option<FrameKind> {
        self.payload.first().and_then(|&b| FrameKind::from_byte(b).ok())
    }
}

/// Partial state of one frame under reassembly.
#[derive(Debug)]
pub struct ReassemblyEntry {
    expected_length: Option<u32>,
    received_bytes: u32,
    /// packet_index - 1 → segment. Keys may have gaps.
    segments: BTreeMap<u32, Bytes>,
    last_update: Instant,
}

impl ReassemblyEntry {
    fn new(now: Instant) -> Self {
        Self {
            expected_length: None,
            received_bytes: 0,
            segments: BTreeMap::new(),
            last_update: now,
        }
    }

    pub fn expected_length(&self) -> Option<u32> {
        self.expected_length
    }

    pub fn received_bytes(&self) -> u32 {
        self.received_bytes
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn is_complete(&self) -> bool {
        self.expected_length == Some(self.received_bytes)
    }

    /// Store a segment unless its slot is already filled. Returns false for
    /// duplicates, which are not re-counted.
    fn insert(&mut self, slot: u32, segment: Bytes) -> bool {
        if self.segments.contains_key(&slot) {
            return false;
        }
        self.received_bytes += segment.len() as u32;
        self.segments.insert(slot, segment);
        true
    }

    /// Concatenate the segments in slot order, zero-filling every missing
    /// slot with up to `chunk` bytes. Returns the payload and how many slots
    /// were filled.
    fn assemble(self, config: &ReassemblerConfig) -> (Bytes, u32) {
        let chunk = config.max_segment.max(1);
        let length = match self.expected_length {
            Some(len) => len as usize,
            None => {
                let slots = self.segments.keys().next_back().map_or(0, |&last| last as usize + 1);
                let estimate = (slots * chunk) as f64 * config.unknown_length_inflation;
                (estimate as usize).min(config.max_frame_len as usize)
            }
        };

        let mut payload = BytesMut::with_capacity(length);
        let mut lost = 0u32;
        let mut slot = 0u32;
        while payload.len() < length {
            let remaining = length - payload.len();
            match self.segments.get(&slot) {
                Some(segment) => {
                    let n = segment.len().min(remaining);
                    payload.extend_from_slice(&segment[..n]);
                }
                None => {
                    let n = chunk.min(remaining);
                    payload.resize(payload.len() + n, 0);
                    lost += 1;
                }
            }
            slot += 1;
        }

        (payload.freeze(), lost)
    }
}

/// Open frames keyed by frame id.
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    entries: HashMap<u32, ReassemblyEntry>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, frame_id: u32) -> bool {
        self.entries.contains_key(&frame_id)
    }

    pub fn get(&self, frame_id: u32) -> Option<&ReassemblyEntry> {
        self.entries.get(&frame_id)
    }

    pub fn frame_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    fn entry(&mut self, frame_id: u32, now: Instant) -> &mut ReassemblyEntry {
        let entry = self
            .entries
            .entry(frame_id)
            .or_insert_with(|| ReassemblyEntry::new(now));
        entry.last_update = now;
        entry
    }

    fn remove(&mut self, frame_id: u32) -> Option<ReassemblyEntry> {
        self.entries.remove(&frame_id)
    }

    fn least_recently_updated(&self) -> Option<u32> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_update)
            .map(|(&id, _)| id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub packets_accepted: u64,
    pub malformed: u64,
    pub stale: u64,
    pub duplicates: u64,
    pub frames_completed: u64,
    pub frames_abandoned: u64,
    pub frames_skipped: u64,
}

/// Receiver half of one media stream.
///
/// Feed every inbound datagram to [`Reassembler::on_packet`]; it returns the
/// frames that became ready, oldest first. Malformed or stale datagrams are
/// counted and dropped, never surfaced as errors.
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblerConfig,
    table: ReassemblyTable,
    loss: LossTracker,
    stats: ReassemblyStats,
    /// Highest frame id emitted so far (wrapping order).
    last_emitted: Option<u32>,
}

impl Reassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            table: ReassemblyTable::new(),
            loss: LossTracker::new(),
            stats: ReassemblyStats::default(),
            last_emitted: None,
        }
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    pub fn table(&self) -> &ReassemblyTable {
        &self.table
    }

    pub fn loss(&self) -> &LossTracker {
        &self.loss
    }

    pub fn stats(&self) -> &ReassemblyStats {
        &self.stats
    }

    pub fn on_packet(&mut self, datagram: Bytes) -> Vec<CompletedFrame> {
        self.on_packet_at(datagram, Instant::now())
    }

    /// Same as [`Reassembler::on_packet`] with an explicit arrival time.
    pub fn on_packet_at(&mut self, datagram: Bytes, now: Instant) -> Vec<CompletedFrame> {
        let mut ready = Vec::new();
        if let Err(e) = self.ingest(datagram, now, &mut ready) {
            if e.is_malformed() {
                self.stats.malformed += 1;
                debug!("dropping malformed packet: {}", e);
            } else {
                self.stats.stale += 1;
                trace!("dropping packet: {}", e);
            }
        }
        ready
    }

    /// Abandon every entry that has not been touched for `frame_ttl`.
    pub fn sweep(&mut self, now: Instant) -> Vec<CompletedFrame> {
        let ttl = self.config.frame_ttl;
        let expired: Vec<u32> = self
            .table
            .entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_update) >= ttl)
            .map(|(&id, _)| id)
            .collect();
        self.abandon_all(expired, AbandonReason::Expired)
    }

    /// Abandon every open entry, e.g. when the inbound channel closed.
    pub fn flush(&mut self) -> Vec<CompletedFrame> {
        let open: Vec<u32> = self.table.frame_ids().collect();
        self.abandon_all(open, AbandonReason::Flushed)
    }

    fn ingest(
        &mut self,
        datagram: Bytes,
        now: Instant,
        ready: &mut Vec<CompletedFrame>,
    ) -> Result<(), ProtocolError> {
        let packet = Packet::parse(datagram)?;
        let frame_id = packet.frame_id();

        // Reject before touching the table so a bad packet can never evict a
        // good frame.
        match &packet {
            Packet::Length { total_length, .. } => {
                if *total_length > self.config.max_frame_len {
                    return Err(ProtocolError::FrameTooLarge(*total_length as u64));
                }
            }
            Packet::Data { packet_index, segment, .. } => {
                self.validate_segment(frame_id, *packet_index, segment)?;
            }
        }

        if !self.table.contains(frame_id) {
            if self.is_behind_emitted(frame_id) {
                return Err(ProtocolError::StaleFrame(frame_id));
            }
            self.make_room(ready);
        }

        match packet {
            Packet::Length { total_length, .. } => {
                let entry = self.table.entry(frame_id, now);
                match entry.expected_length {
                    None => entry.expected_length = Some(total_length),
                    Some(known) if known != total_length => {
                        debug!(frame_id, known, total_length, "conflicting length announcement ignored");
                    }
                    Some(_) => {}
                }
                trace!(frame_id, total_length, "length announced");
            }
            Packet::Data { packet_index, segment, .. } => {
                let entry = self.table.entry(frame_id, now);
                if !entry.insert(packet_index - 1, segment) {
                    self.stats.duplicates += 1;
                    trace!(frame_id, packet_index, "duplicate packet ignored");
                    return Ok(());
                }
                trace!(frame_id, packet_index, received = entry.received_bytes, "segment stored");
            }
        }

        self.stats.packets_accepted += 1;
        self.loss.record_received();

        if self.table.get(frame_id).is_some_and(ReassemblyEntry::is_complete) {
            let previous = frame_id.wrapping_sub(1);
            if self.table.contains(previous) {
                debug!(frame_id = previous, "frame skipped: next frame completed first");
                self.finalize(previous, Disposition::Abandoned(AbandonReason::NewerFrameCompleted), ready);
            }
            self.finalize(frame_id, Disposition::Complete, ready);
        }
        Ok(())
    }

    fn validate_segment(&self, frame_id: u32, packet_index: u32, segment: &Bytes) -> Result<(), ProtocolError> {
        if segment.is_empty() {
            return Err(ProtocolError::PacketTooShort {
                expected: PACKET_HEADER_SIZE + 1,
                got: PACKET_HEADER_SIZE,
            });
        }
        if segment.len() > self.config.max_segment {
            return Err(ProtocolError::SegmentTooLarge {
                len: segment.len(),
                max: self.config.max_segment,
            });
        }

        // Every segment carries at least one byte, so a frame can never have
        // more segments than bytes.
        let entry = self.table.get(frame_id);
        let limit = entry
            .and_then(ReassemblyEntry::expected_length)
            .unwrap_or(self.config.max_frame_len);
        if packet_index > limit {
            return Err(ProtocolError::SegmentIndexOutOfRange { frame_id, index: packet_index, limit });
        }

        let buffered = entry.map_or(0, ReassemblyEntry::received_bytes) as u64;
        if buffered + segment.len() as u64 > self.config.max_frame_len as u64 {
            return Err(ProtocolError::FrameTooLarge(buffered + segment.len() as u64));
        }
        Ok(())
    }

    fn make_room(&mut self, ready: &mut Vec<CompletedFrame>) {
        while self.table.len() >= self.config.max_open_frames.max(1) {
            let Some(oldest) = self.table.least_recently_updated() else {
                break;
            };
            debug!(frame_id = oldest, "evicting frame: too many open frames");
            self.finalize(oldest, Disposition::Abandoned(AbandonReason::Evicted), ready);
        }
    }

    fn abandon_all(&mut self, mut frame_ids: Vec<u32>, reason: AbandonReason) -> Vec<CompletedFrame> {
        let Some(base) = oldest_id(&frame_ids) else {
            return Vec::new();
        };
        frame_ids.sort_by_key(|id| id.wrapping_sub(base));

        let mut ready = Vec::with_capacity(frame_ids.len());
        for frame_id in frame_ids {
            self.finalize(frame_id, Disposition::Abandoned(reason), &mut ready);
        }
        ready
    }

    fn finalize(&mut self, frame_id: u32, disposition: Disposition, ready: &mut Vec<CompletedFrame>) {
        let Some(entry) = self.table.remove(frame_id) else {
            return;
        };
        let (payload, lost_packets) = entry.assemble(&self.config);
        self.loss.record_lost_n(lost_packets as u64);

        match disposition {
            Disposition::Complete => self.stats.frames_completed += 1,
            Disposition::Abandoned(reason) => {
                self.stats.frames_abandoned += 1;
                if reason == AbandonReason::NewerFrameCompleted {
                    self.stats.frames_skipped += 1;
                }
                debug!(
                    frame_id,
                    ?reason,
                    lost_packets,
                    len = payload.len(),
                    loss_ratio = self.loss.loss_ratio(),
                    "frame abandoned"
                );
            }
        }

        self.last_emitted = match self.last_emitted {
            Some(last) if frame_id.wrapping_sub(last) >= HALF_ID_SPACE => Some(last),
            _ => Some(frame_id),
        };

        ready.push(CompletedFrame { frame_id, payload, lost_packets, disposition });
    }

    fn is_behind_emitted(&self, frame_id: u32) -> bool {
        self.last_emitted
            .is_some_and(|last| last.wrapping_sub(frame_id) < HALF_ID_SPACE)
    }
}

/// The id every other id in `ids` is at or ahead of, in wrapping order.
/// Falls back to the numeric minimum when the ids span more than half the
/// id space and no such id exists.
fn oldest_id(ids: &[u32]) -> Option<u32> {
    ids.iter()
        .copied()
        .find(|&candidate| ids.iter().all(|&id| id.wrapping_sub(candidate) < HALF_ID_SPACE))
        .or_else(|| ids.iter().copied().min())
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ReassemblerConfig::default())
    }
}
