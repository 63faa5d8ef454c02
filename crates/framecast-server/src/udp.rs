use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, error, trace, warn};

use framecast_protocol::packet::{MAX_SEGMENT_SIZE, PACKET_HEADER_SIZE};
use framecast_protocol::{Packet, ProtocolError};

use crate::state::RelayState;

/// Maximum buffer size for incoming UDP packets.
/// Frame datagrams are at most 1008 bytes; anything longer is malformed.
const MAX_UDP_PACKET_SIZE: usize = 1500;

/// Outcome for one inbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Echo,
    Malformed,
    /// Unknown sender while the peer table is full.
    Rejected,
    /// Discarded on purpose to emulate a lossy path.
    SimulatedLoss,
}

/// Parse a datagram and apply the segment size limits a receiver would.
fn parse_checked(data: Bytes) -> Result<Packet, ProtocolError> {
    let packet = Packet::parse(data)?;
    if let Packet::Data { segment, .. } = &packet {
        if segment.is_empty() {
            return Err(ProtocolError::PacketTooShort {
                expected: PACKET_HEADER_SIZE + 1,
                got: PACKET_HEADER_SIZE,
            });
        }
        if segment.len() > MAX_SEGMENT_SIZE {
            return Err(ProtocolError::SegmentTooLarge {
                len: segment.len(),
                max: MAX_SEGMENT_SIZE,
            });
        }
    }
    Ok(packet)
}

/// Decide what to do with `data` received from `src`, updating the peer's
/// statistics along the way.
pub fn judge<R: Rng>(
    data: Bytes,
    src: SocketAddr,
    state: &RelayState,
    drop_probability: f64,
    rng: &mut R,
    now: Instant,
) -> Verdict {
    let len = data.len();
    let packet = match parse_checked(data) {
        Ok(p) => p,
        Err(e) => {
            warn!(src = %src, len, "malformed datagram: {}", e);
            state.record_malformed(src, now);
            return Verdict::Malformed;
        }
    };

    if !state.record_datagram(src, len, packet.frame_id(), now) {
        debug!(src = %src, "peer table full, datagram refused");
        return Verdict::Rejected;
    }

    if drop_probability > 0.0 && rng.gen_bool(drop_probability) {
        state.record_dropped(src);
        trace!(src = %src, frame_id = packet.frame_id(), "simulated loss");
        return Verdict::SimulatedLoss;
    }

    Verdict::Echo
}

/// Run the echo loop: every accepted datagram goes back to its sender
/// unchanged.
pub async fn run_udp_loop(socket: Arc<UdpSocket>, state: Arc<RelayState>, drop_probability: f64) {
    let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
    loop {
        let (len, src_addr) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                error!("UDP recv error: {}", e);
                continue;
            }
        };

        let data = Bytes::copy_from_slice(&buf[..len]);
        let verdict = judge(
            data.clone(),
            src_addr,
            &state,
            drop_probability,
            &mut rand::thread_rng(),
            Instant::now(),
        );

        if verdict == Verdict::Echo {
            if let Err(e) = socket.send_to(&data, src_addr).await {
                trace!(%src_addr, "failed to echo datagram: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use framecast_protocol::{encode_data_packet, encode_length_packet, fragment_frame};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::time::Duration;

    fn src() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn relay_state() -> RelayState {
        RelayState::new(&ServerConfig::default())
    }

    #[test]
    fn well_formed_datagrams_echoed() {
        let state = relay_state();
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();
        assert_eq!(judge(encode_length_packet(0, 10), src(), &state, 0.0, &mut rng, now), Verdict::Echo);
        assert_eq!(
            judge(encode_data_packet(0, 1, &[1; 10]), src(), &state, 0.0, &mut rng, now),
            Verdict::Echo
        );
        assert_eq!(state.peers.get(&src()).unwrap().packets, 2);
    }

    #[test]
    fn malformed_datagrams_dropped() {
        let state = relay_state();
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();
        let short = Bytes::from_static(&[0, 0, 0]);
        assert_eq!(judge(short, src(), &state, 0.0, &mut rng, now), Verdict::Malformed);
        let oversized = encode_data_packet(0, 1, &[0u8; 1001]);
        assert_eq!(judge(oversized, src(), &state, 0.0, &mut rng, now), Verdict::Malformed);
        let empty = encode_data_packet(0, 1, &[]);
        assert_eq!(judge(empty, src(), &state, 0.0, &mut rng, now), Verdict::Malformed);
        assert_eq!(state.peer_count(), 0);
    }

    #[test]
    fn full_drop_probability_drops_everything() {
        let state = relay_state();
        let mut rng = StdRng::seed_from_u64(7);
        let now = Instant::now();
        for packet in fragment_frame(0, &[5u8; 3000], 1000).unwrap() {
            assert_eq!(judge(packet, src(), &state, 1.0, &mut rng, now), Verdict::SimulatedLoss);
        }
        let stats = state.peers.get(&src()).unwrap();
        assert_eq!(stats.packets, 4);
        assert_eq!(stats.dropped, 4);
    }

    #[test]
    fn partial_drop_probability_drops_some() {
        let state = relay_state();
        let mut rng = StdRng::seed_from_u64(42);
        let now = Instant::now();
        let dropped = (0..1000)
            .filter(|&i| {
                judge(encode_length_packet(i, 0), src(), &state, 0.2, &mut rng, now) == Verdict::SimulatedLoss
            })
            .count();
        assert!((100..300).contains(&dropped), "dropped {}", dropped);
    }

    #[tokio::test]
    async fn echo_loop_reflects_to_sender() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let server_addr = server.local_addr().unwrap();
        let state = Arc::new(relay_state());
        tokio::spawn(run_udp_loop(server, state.clone(), 0.0));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 1500];

        client.send_to(&[1, 2, 3], server_addr).await.unwrap();
        let packet = encode_data_packet(9, 1, b"hello");
        client.send_to(&packet, server_addr).await.unwrap();

        // The malformed datagram is swallowed, so the first reply is the data packet.
        let (n, from) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, server_addr);
        assert_eq!(&buf[..n], &packet[..]);
        assert_eq!(state.peer_count(), 1);
    }
}
