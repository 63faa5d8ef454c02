// Stream synthetic frames through a running relay and report loss and latency.
// Run with: cargo run -p framecast-server --example test_client -- --server 127.0.0.1:4433

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use framecast_media::decoder::{DecodePipeline, MediaDecoder};
use framecast_media::session::{decode_task, fragment_task, reassembly_task, udp_receiver_task, udp_sender_task};
use framecast_media::StreamKind;
use framecast_protocol::{FrameKind, Fragmenter, HeaderLayout, MediaFrame, Reassembler};

#[derive(Parser)]
#[command(name = "test_client", about = "Echo test client for framecast-server")]
struct Args {
    /// Relay address
    #[arg(long, default_value = "127.0.0.1:4433")]
    server: SocketAddr,

    /// Number of frames to send
    #[arg(long, default_value_t = 300)]
    frames: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Average frame size in bytes; keyframes are four times larger
    #[arg(long, default_value_t = 6000)]
    frame_size: usize,

    /// A keyframe every this many frames
    #[arg(long, default_value_t = 30)]
    keyframe_interval: u32,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Stands in for a real decoder: yields the round-trip latency of each frame.
struct LatencyProbe;

impl MediaDecoder for LatencyProbe {
    type Output = i64;

    fn decode(&mut self, frame: &MediaFrame) -> Result<Vec<i64>> {
        Ok(frame.latency_ms(now_ms()).into_iter().collect())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "framecast_media=info".into()),
        )
        .init();

    let args = Args::parse();
    let kind = StreamKind::Video;

    let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await.context("failed to bind UDP")?);
    println!("[OK] bound {}, relay {}", socket.local_addr()?, args.server);

    let (frame_tx, frame_rx) = mpsc::channel(8);
    let (out_tx, out_rx) = mpsc::channel(kind.datagram_queue_capacity());
    let (in_tx, in_rx) = mpsc::channel(kind.datagram_queue_capacity());
    let (done_tx, done_rx) = mpsc::channel(64);
    let (latency_tx, mut latency_rx) = mpsc::channel(64);

    tokio::spawn(fragment_task(kind, frame_rx, Fragmenter::new(), out_tx));
    tokio::spawn(udp_sender_task(socket.clone(), out_rx, args.server));
    let receiver = tokio::spawn(udp_receiver_task(socket.clone(), in_tx));
    let reassembly = tokio::spawn(reassembly_task(
        kind,
        in_rx,
        Reassembler::new(kind.reassembler_config()),
        done_tx,
        Duration::from_millis(250),
    ));
    let pipeline = DecodePipeline::new(HeaderLayout::Echo, kind.gate_config(), || Ok(LatencyProbe))?;
    let decoder = tokio::task::spawn_blocking(move || decode_task(kind, done_rx, pipeline, latency_tx));

    let collector = tokio::spawn(async move {
        let mut samples = Vec::new();
        while let Some(ms) = latency_rx.recv().await {
            samples.push(ms);
        }
        samples
    });

    let mut tick = tokio::time::interval(Duration::from_secs(1) / args.fps.max(1));
    for i in 0..args.frames {
        tick.tick().await;
        let key = i % args.keyframe_interval.max(1) == 0;
        let size = if key { args.frame_size * 4 } else { args.frame_size };
        let mut data = vec![0u8; size];
        rand::thread_rng().fill(&mut data[..]);

        let frame = MediaFrame::new(
            if key { FrameKind::Key } else { FrameKind::Delta },
            i as i64 * 1_000_000 / args.fps.max(1) as i64,
            1_000_000 / args.fps.max(1) as u64,
            Bytes::from(data),
        )
        .with_send_timestamp(now_ms());
        frame_tx.send(frame).await.context("fragment task stopped")?;
    }
    drop(frame_tx);
    println!("[OK] sent {} frames", args.frames);

    // Give the last echoes time to arrive, then end the stream.
    tokio::time::sleep(Duration::from_secs(1)).await;
    receiver.abort();

    let reassembler = reassembly.await?;
    let pipeline = decoder.await??;
    let mut samples = collector.await?;
    samples.sort_unstable();

    let loss = reassembler.loss();
    let stats = reassembler.stats();
    println!(
        "[OK] datagrams received={} lost={} loss_ratio={:.4}",
        loss.received(),
        loss.lost(),
        loss.loss_ratio()
    );
    println!(
        "[OK] frames complete={} abandoned={} skipped={}",
        stats.frames_completed, stats.frames_abandoned, stats.frames_skipped
    );
    println!(
        "[OK] decoded={} dropped_awaiting_keyframe={} dropped_backlog={}",
        pipeline.stats().frames_decoded,
        pipeline.stats().dropped_awaiting_keyframe,
        pipeline.stats().dropped_backlog
    );
    if let (Some(min), Some(max)) = (samples.first(), samples.last()) {
        let median = samples[samples.len() / 2];
        println!("[OK] latency ms min={} median={} max={}", min, median, max);
    } else {
        println!("[ERR] no frames came back from the relay");
    }

    Ok(())
}
