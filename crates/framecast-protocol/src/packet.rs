use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Transport header: 4 (frame_id) + 4 (packet_index) = 8 bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Length announcement: transport header + 4 (total_length) = 12 bytes.
pub const LENGTH_PACKET_SIZE: usize = 12;

/// Maximum data bytes carried by one data packet. Together with the header
/// this keeps every datagram well under a 1280-byte path MTU.
pub const MAX_SEGMENT_SIZE: usize = 1000;

/// Packet index reserved for the length announcement.
pub const LENGTH_PACKET_INDEX: u32 = 0;

/// The fixed header prefixed to every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub frame_id: u32,
    pub packet_index: u32,
}

impl PacketHeader {
    pub fn is_length_announcement(&self) -> bool {
        self.packet_index == LENGTH_PACKET_INDEX
    }
}

/// A decoded datagram.
///
/// Wire format (all integers big-endian):
/// ```text
/// length: [frame_id: u32] [packet_index = 0: u32] [total_length: u32]
/// data:   [frame_id: u32] [packet_index >= 1: u32] [segment: variable]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Length { frame_id: u32, total_length: u32 },
    Data { frame_id: u32, packet_index: u32, segment: Bytes },
}

impl Packet {
    pub fn frame_id(&self) -> u32 {
        match self {
            Self::Length { frame_id, .. } | Self::Data { frame_id, .. } => *frame_id,
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Length { frame_id, total_length } => {
                encode_length_packet(*frame_id, *total_length)
            }
            Self::Data { frame_id, packet_index, segment } => {
                encode_data_packet(*frame_id, *packet_index, segment)
            }
        }
    }

    /// Parse a received datagram. The segment of a data packet is a slice of
    /// `datagram`, not a copy.
    pub fn parse(datagram: Bytes) -> Result<Self, ProtocolError> {
        let header = decode_header(&datagram)?;
        if header.is_length_announcement() {
            if datagram.len() < LENGTH_PACKET_SIZE {
                return Err(ProtocolError::PacketTooShort {
                    expected: LENGTH_PACKET_SIZE,
                    got: datagram.len(),
                });
            }
            let total_length =
                u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
            Ok(Self::Length { frame_id: header.frame_id, total_length })
        } else {
            Ok(Self::Data {
                frame_id: header.frame_id,
                packet_index: header.packet_index,
                segment: datagram.slice(PACKET_HEADER_SIZE..),
            })
        }
    }
}

/// Encode the 12-byte length announcement for `frame_id`.
pub fn encode_length_packet(frame_id: u32, total_length: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PACKET_SIZE);
    buf.put_u32(frame_id);
    buf.put_u32(LENGTH_PACKET_INDEX);
    buf.put_u32(total_length);
    buf.freeze()
}

/// Encode a data packet. `packet_index` must be at least 1; index 0 is the
/// length announcement.
pub fn encode_data_packet(frame_id: u32, packet_index: u32, segment: &[u8]) -> Bytes {
    debug_assert!(packet_index != LENGTH_PACKET_INDEX);
    let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + segment.len());
    buf.put_u32(frame_id);
    buf.put_u32(packet_index);
    buf.put_slice(segment);
    buf.freeze()
}

/// Read the transport header without interpreting the rest of the datagram.
pub fn decode_header(data: &[u8]) -> Result<PacketHeader, ProtocolError> {
    if data.len() < PACKET_HEADER_SIZE {
        return Err(ProtocolError::PacketTooShort {
            expected: PACKET_HEADER_SIZE,
            got: data.len(),
        });
    }

    let frame_id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let packet_index = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
    Ok(PacketHeader { frame_id, packet_index })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_packet_layout() {
        let bytes = encode_length_packet(5, 3200);
        assert_eq!(bytes.len(), LENGTH_PACKET_SIZE);
        assert_eq!(&bytes[..], &[0, 0, 0, 5, 0, 0, 0, 0, 0, 0, 0x0C, 0x80]);
    }

    #[test]
    fn data_packet_layout() {
        let bytes = encode_data_packet(0x01020304, 2, &[9, 8, 7]);
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE + 3);
        assert_eq!(&bytes[..8], &[1, 2, 3, 4, 0, 0, 0, 2]);
        assert_eq!(&bytes[8..], &[9, 8, 7]);
    }

    #[test]
    fn decode_header_fields() {
        let bytes = encode_data_packet(u32::MAX, 17, b"abc");
        let header = decode_header(&bytes).unwrap();
        assert_eq!(header.frame_id, u32::MAX);
        assert_eq!(header.packet_index, 17);
        assert!(!header.is_length_announcement());
    }

    #[test]
    fn header_too_short() {
        let result = decode_header(&[0, 0, 0, 1, 0, 0, 0]);
        assert!(matches!(
            result,
            Err(ProtocolError::PacketTooShort { expected: 8, got: 7 })
        ));
    }

    #[test]
    fn parse_length_packet() {
        let packet = Packet::parse(encode_length_packet(9, 500)).unwrap();
        assert_eq!(packet, Packet::Length { frame_id: 9, total_length: 500 });
        assert_eq!(packet.frame_id(), 9);
    }

    #[test]
    fn truncated_length_packet_rejected() {
        // Header claims index 0 but the total_length field is cut off.
        let result = Packet::parse(Bytes::from_static(&[0, 0, 0, 1, 0, 0, 0, 0, 0, 1]));
        assert!(matches!(
            result,
            Err(ProtocolError::PacketTooShort { expected: 12, got: 10 })
        ));
    }

    #[test]
    fn parse_data_packet_slices_segment() {
        let packet = Packet::parse(encode_data_packet(3, 1, &[1, 2, 3, 4])).unwrap();
        match packet {
            Packet::Data { frame_id, packet_index, segment } => {
                assert_eq!(frame_id, 3);
                assert_eq!(packet_index, 1);
                assert_eq!(&segment[..], &[1, 2, 3, 4]);
            }
            other => panic!("expected data packet, got {:?}", other),
        }
    }

    #[test]
    fn data_packet_may_be_empty() {
        let packet = Packet::parse(encode_data_packet(3, 4, &[])).unwrap();
        assert!(matches!(packet, Packet::Data { ref segment, .. } if segment.is_empty()));
    }

    #[test]
    fn to_bytes_matches_encoders() {
        let length = Packet::Length { frame_id: 1, total_length: 2 };
        assert_eq!(length.to_bytes(), encode_length_packet(1, 2));

        let data = Packet::Data {
            frame_id: 1,
            packet_index: 3,
            segment: Bytes::from_static(b"xyz"),
        };
        assert_eq!(data.to_bytes(), encode_data_packet(1, 3, b"xyz"));
    }
}
