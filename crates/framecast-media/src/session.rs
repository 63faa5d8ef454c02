use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use framecast_protocol::{CompletedFrame, Fragmenter, MediaFrame, Reassembler};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::decoder::{DecodePipeline, MediaDecoder};
use crate::StreamKind;

/// Receive buffer size. Datagrams are at most 1008 bytes; anything larger
/// is truncated and later rejected by the reassembler.
pub const MAX_DATAGRAM_SIZE: usize = 1500;

/// Encoder side: give each frame the stream's next frame id and push its
/// datagrams out. Ends when the encoder side hangs up or the datagram channel
/// closes, returning the fragmenter so the frame counter can be reused.
pub async fn fragment_task(
    kind: StreamKind,
    mut frames: mpsc::Receiver<MediaFrame>,
    mut fragmenter: Fragmenter,
    datagrams: mpsc::Sender<Bytes>,
) -> Fragmenter {
    let mut frames_sent: u64 = 0;

    while let Some(frame) = frames.recv().await {
        let payload = frame.to_bytes();
        let fragments = match fragmenter.fragment(&payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(stream = %kind, "frame not sent: {}", e);
                continue;
            }
        };
        let frame_id = fragments.frame_id();
        let packet_count = fragments.packet_count();

        for datagram in fragments {
            if datagrams.send(datagram).await.is_err() {
                debug!(stream = %kind, "datagram channel closed, sender stopping");
                return fragmenter;
            }
        }

        frames_sent += 1;
        trace!(stream = %kind, frame_id, packet_count, kind = ?frame.kind, "frame sent");
        if frames_sent % 30 == 0 {
            debug!(stream = %kind, frames_sent, last_len = payload.len(), "sent 30 frames");
        }
    }

    info!(stream = %kind, frames_sent, "frame source ended");
    fragmenter
}

/// Send every datagram from the channel to `peer`. Fire-and-forget: send
/// failures are logged and the datagram is gone.
pub async fn udp_sender_task(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Bytes>, peer: SocketAddr) {
    while let Some(data) = rx.recv().await {
        if let Err(e) = socket.send_to(&data, peer).await {
            error!(%peer, "UDP send error: {}", e);
        }
    }
}

/// Consecutive receive errors after which the receiver gives up.
pub const MAX_CONSECUTIVE_RECV_ERRORS: u32 = 50;

/// Pause before retrying after the `consecutive`-th receive error in a row,
/// or `None` once the socket should be considered dead.
pub fn recv_error_backoff(consecutive: u32) -> Option<Duration> {
    if consecutive >= MAX_CONSECUTIVE_RECV_ERRORS {
        return None;
    }
    let exp = consecutive.saturating_sub(1).min(6);
    Some(Duration::from_millis(5 << exp))
}

/// Read datagrams from the socket into the channel until the consumer is
/// gone. A full channel drops the datagram, which the reassembler then sees
/// as ordinary loss.
pub async fn udp_receiver_task(socket: Arc<UdpSocket>, tx: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut overflow: u64 = 0;
    let mut recv_errors: u32 = 0;

    loop {
        let (n, src_addr) = tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok(result) => {
                    recv_errors = 0;
                    result
                }
                Err(e) => {
                    recv_errors += 1;
                    let Some(pause) = recv_error_backoff(recv_errors) else {
                        error!(recv_errors, "UDP recv keeps failing, receiver stopping: {}", e);
                        break;
                    };
                    if recv_errors == 1 {
                        warn!("UDP recv error: {}", e);
                    } else {
                        debug!(recv_errors, "UDP recv error: {}", e);
                    }
                    tokio::time::sleep(pause).await;
                    continue;
                }
            },
            _ = tx.closed() => break,
        };

        match tx.try_send(Bytes::copy_from_slice(&buf[..n])) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                overflow += 1;
                trace!(src = %src_addr, overflow, "receive queue full, datagram dropped");
            }
            Err(TrySendError::Closed(_)) => break,
        }
    }

    debug!(overflow, "UDP receiver stopped");
}

/// Receiver side: run every inbound datagram through the reassembler in
/// arrival order and forward finished frames. Partial frames are swept every
/// `sweep_interval`. When the datagram channel closes, whatever is still open
/// is flushed and forwarded; that is the normal end of a stream.
pub async fn reassembly_task(
    kind: StreamKind,
    mut datagrams: mpsc::Receiver<Bytes>,
    mut reassembler: Reassembler,
    frames: mpsc::Sender<CompletedFrame>,
    sweep_interval: Duration,
) -> Reassembler {
    let mut sweep = tokio::time::interval(sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let ready = tokio::select! {
            datagram = datagrams.recv() => match datagram {
                Some(datagram) => reassembler.on_packet(datagram),
                None => break,
            },
            _ = sweep.tick() => reassembler.sweep(Instant::now()),
        };

        for frame in ready {
            if frames.send(frame).await.is_err() {
                debug!(stream = %kind, "frame consumer gone, reassembly stopping");
                return reassembler;
            }
        }
    }

    for frame in reassembler.flush() {
        if frames.send(frame).await.is_err() {
            break;
        }
    }

    let stats = reassembler.stats();
    info!(
        stream = %kind,
        completed = stats.frames_completed,
        abandoned = stats.frames_abandoned,
        skipped = stats.frames_skipped,
        malformed = stats.malformed,
        loss_ratio = reassembler.loss().loss_ratio(),
        "datagram stream ended"
    );
    reassembler
}

/// Decoder side. Blocking: run it under `tokio::task::spawn_blocking` the
/// way a CPU-bound codec would be.
pub fn decode_task<D, F>(
    kind: StreamKind,
    mut frames: mpsc::Receiver<CompletedFrame>,
    mut pipeline: DecodePipeline<D, F>,
    outputs: mpsc::Sender<D::Output>,
) -> Result<DecodePipeline<D, F>>
where
    D: MediaDecoder,
    F: FnMut() -> Result<D>,
{
    while let Some(frame) = frames.blocking_recv() {
        for output in pipeline.push(frame)? {
            if outputs.blocking_send(output).is_err() {
                debug!(stream = %kind, "output consumer gone, decoder stopping");
                return Ok(pipeline);
            }
        }
    }

    let stats = pipeline.stats();
    info!(
        stream = %kind,
        decoded = stats.frames_decoded,
        awaiting_keyframe = stats.dropped_awaiting_keyframe,
        backlog = stats.dropped_backlog,
        resets = stats.decoder_resets,
        "decode task ended"
    );
    Ok(pipeline)
}
