//! Datagram transport for encoded media frames.
//!
//! A frame is announced by a length packet and carried by data packets of at
//! most [`packet::MAX_SEGMENT_SIZE`] bytes. The receiver rebuilds frames from
//! whatever arrives, zero-filling what was lost.

pub mod error;
pub mod fragment;
pub mod loss;
pub mod media;
pub mod packet;
pub mod reassembly;

pub use error::ProtocolError;
pub use fragment::{fragment_frame, Fragmenter, Fragments};
pub use loss::LossTracker;
pub use media::{FrameKind, HeaderLayout, MediaFrame};
pub use packet::{decode_header, encode_data_packet, encode_length_packet, Packet, PacketHeader};
pub use reassembly::{
    AbandonReason, CompletedFrame, Disposition, ReassemblerConfig, Reassembler, ReassemblyEntry,
    ReassemblyStats, ReassemblyTable,
};
