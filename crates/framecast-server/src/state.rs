use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::ServerConfig;

/// What the relay knows about one sender.
#[derive(Debug, Clone)]
pub struct PeerStats {
    pub packets: u64,
    pub bytes: u64,
    /// Datagrams discarded by simulated loss.
    pub dropped: u64,
    pub malformed: u64,
    /// Newest frame id seen, compared with wrap-around.
    pub highest_frame_id: Option<u32>,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

impl PeerStats {
    fn new(now: Instant) -> Self {
        Self {
            packets: 0,
            bytes: 0,
            dropped: 0,
            malformed: 0,
            highest_frame_id: None,
            first_seen: now,
            last_seen: now,
        }
    }

    fn observe_frame(&mut self, frame_id: u32) {
        match self.highest_frame_id {
            Some(prev) if (frame_id.wrapping_sub(prev) as i32) <= 0 => {}
            _ => self.highest_frame_id = Some(frame_id),
        }
    }
}

/// Shared state of the echo relay.
pub struct RelayState {
    pub peers: DashMap<SocketAddr, PeerStats>,
    max_peers: usize,
    idle_timeout: Duration,
    /// Datagrams refused because the peer table was full.
    rejected: AtomicU64,
}

impl RelayState {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            peers: DashMap::new(),
            max_peers: config.max_peers,
            idle_timeout: Duration::from_secs(config.peer_idle_timeout_secs),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Run `f` on the stats of `addr`, admitting the peer if there is room.
    /// Returns `None` when the peer is unknown and the table is full.
    fn with_peer<T>(&self, addr: SocketAddr, now: Instant, f: impl FnOnce(&mut PeerStats) -> T) -> Option<T> {
        if let Some(mut stats) = self.peers.get_mut(&addr) {
            stats.last_seen = now;
            return Some(f(&mut stats));
        }
        if self.peers.len() >= self.max_peers {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let mut stats = self.peers.entry(addr).or_insert_with(|| PeerStats::new(now));
        stats.last_seen = now;
        Some(f(&mut stats))
    }

    /// Account for a well-formed datagram. Returns `false` if the peer
    /// could not be admitted.
    pub fn record_datagram(&self, addr: SocketAddr, len: usize, frame_id: u32, now: Instant) -> bool {
        self.with_peer(addr, now, |stats| {
            stats.packets += 1;
            stats.bytes += len as u64;
            stats.observe_frame(frame_id);
        })
        .is_some()
    }

    /// Only known peers are charged; garbage from strangers never earns a
    /// table slot.
    pub fn record_malformed(&self, addr: SocketAddr, now: Instant) {
        if let Some(mut stats) = self.peers.get_mut(&addr) {
            stats.malformed += 1;
            stats.last_seen = now;
        }
    }

    pub fn record_dropped(&self, addr: SocketAddr) {
        if let Some(mut stats) = self.peers.get_mut(&addr) {
            stats.dropped += 1;
        }
    }

    /// Remove and return every peer silent for longer than the idle timeout.
    pub fn reap_idle(&self, now: Instant) -> Vec<(SocketAddr, PeerStats)> {
        let idle: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_seen) > self.idle_timeout)
            .map(|entry| *entry.key())
            .collect();

        idle.into_iter().filter_map(|addr| self.peers.remove(&addr)).collect()
    }
}
