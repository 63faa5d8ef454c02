use std::fs;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tracing::info;

mod config;
mod state;
mod udp;

use config::ServerConfig;
use state::RelayState;

#[derive(Parser)]
#[command(name = "framecast-server", about = "UDP echo relay for fragmented media frames")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// UDP port, overrides config
    #[arg(short, long)]
    port: Option<u16>,

    /// Probability of discarding a datagram instead of echoing it, overrides config
    #[arg(long)]
    drop_probability: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "framecast_server=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content).with_context(|| format!("invalid config file: {}", config_path))?
    } else {
        ServerConfig::default()
    };

    // CLI overrides
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(p) = args.drop_probability {
        config.drop_probability = p;
    }
    config.validate()?;

    info!("framecast relay starting");
    info!(
        host = %config.host,
        port = config.port,
        max_peers = config.max_peers,
        peer_idle_timeout = config.peer_idle_timeout_secs,
        drop_probability = config.drop_probability,
    );

    let socket = bind_udp(&config)?;
    info!("UDP socket bound on {}:{}", config.host, config.port);

    let state = Arc::new(RelayState::new(&config));

    let udp_state = state.clone();
    let udp_sock = socket.clone();
    let drop_probability = config.drop_probability;
    let relay = tokio::spawn(async move {
        udp::run_udp_loop(udp_sock, udp_state, drop_probability).await;
    });

    let reaper_state = state.clone();
    let idle_timeout = Duration::from_secs(config.peer_idle_timeout_secs);
    let reaper = tokio::spawn(async move {
        run_reaper(reaper_state, idle_timeout).await;
    });

    info!("relay ready");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    relay.abort();
    reaper.abort();
    for entry in state.peers.iter() {
        log_peer_totals(*entry.key(), entry.value(), "peer at shutdown");
    }
    info!(peers = state.peer_count(), rejected = state.rejected(), "relay stopped");
    Ok(())
}

/// Bind the relay socket with large kernel buffers to absorb keyframe bursts.
fn bind_udp(config: &ServerConfig) -> Result<Arc<UdpSocket>> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid UDP address {}:{}", config.host, config.port))?;

    let sock = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )
    .context("failed to create UDP socket")?;
    let _ = sock.set_recv_buffer_size(config.recv_buffer_bytes);
    let _ = sock.set_send_buffer_size(config.send_buffer_bytes);
    sock.bind(&addr.into())
        .with_context(|| format!("failed to bind UDP on {}", addr))?;
    sock.set_nonblocking(true)
        .context("failed to set non-blocking")?;

    let std_sock: std::net::UdpSocket = sock.into();
    Ok(Arc::new(
        UdpSocket::from_std(std_sock).context("failed to wrap UDP socket in tokio")?,
    ))
}

/// Periodically forget peers that have gone quiet.
async fn run_reaper(state: Arc<RelayState>, idle_timeout: Duration) {
    let mut tick = tokio::time::interval((idle_timeout / 2).max(Duration::from_secs(1)));
    loop {
        tick.tick().await;
        for (addr, stats) in state.reap_idle(Instant::now()) {
            log_peer_totals(addr, &stats, "peer idle, removed");
        }
    }
}

fn log_peer_totals(addr: SocketAddr, stats: &state::PeerStats, msg: &str) {
    info!(
        peer = %addr,
        packets = stats.packets,
        bytes = stats.bytes,
        dropped = stats.dropped,
        malformed = stats.malformed,
        highest_frame_id = ?stats.highest_frame_id,
        active_secs = stats.last_seen.duration_since(stats.first_seen).as_secs(),
        "{}",
        msg
    );
}
