use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zelana_pubkey::Pubkey;
use zephyr::{Frame, FrameCodec, SubmitAck, TaskMsg};

use super::ServerConfig;
use super::handshake::{ReplayGuard, read_register};
use crate::coordinator::Manager;

type FrameSink = SplitSink<Framed<TcpStream, FrameCodec>, Frame>;
type FrameStream = SplitStream<Framed<TcpStream, FrameCodec>>;

/// Replies produced by the read loop, sent ahead of queued tasks.
const CONTROL_CAPACITY: usize = 16;

/// Runs one worker connection from handshake to close.
///
/// The registry entry outlives the connection; a dropped task channel is
/// what marks the worker as disconnected.
pub async fn serve(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    manager: Arc<Manager>,
    replay_guard: Arc<ReplayGuard>,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, FrameCodec::new(config.max_frame_bytes));

    let envelope = tokio::select! {
        _ = cancel.cancelled() => return,
        result = read_register(&mut framed, config.handshake_timeout, &replay_guard) => match result {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%peer, error = %e, "handshake failed");
                reject(&mut framed, e.to_string()).await;
                return;
            }
        },
    };

    let pubkey = envelope.pubkey();
    let name = envelope.identity.name.clone();
    let task_rx = match manager.register_worker(envelope.identity) {
        Ok(rx) => rx,
        Err(e) => {
            warn!(%peer, worker = %name, error = %e, "registration refused");
            reject(&mut framed, e.to_string()).await;
            return;
        }
    };
    info!(%peer, worker = %name, pubkey = %pubkey.short(), "worker connected");

    let (sink, stream) = framed.split();
    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);

    let writer = tokio::spawn(write_loop(
        sink,
        task_rx,
        control_rx,
        config.ping_interval,
        cancel.clone(),
    ));
    read_loop(stream, &manager, pubkey, &control_tx, config.pong_wait, &cancel).await;

    cancel.cancel();
    drop(control_tx);
    if let Err(e) = writer.await {
        warn!(worker = %name, error = %e, "connection writer ended abnormally");
    }
    info!(%peer, worker = %name, "worker disconnected");
}

async fn reject(framed: &mut Framed<TcpStream, FrameCodec>, reason: String) {
    if let Err(e) = framed.send(Frame::Error(reason)).await {
        debug!(error = %e, "failed to send rejection");
    }
    let _ = framed.close().await;
}

/// Forwards pushed tasks and read-loop replies to the socket, and probes
/// the worker every `ping_interval`.
async fn write_loop(
    mut sink: FrameSink,
    mut task_rx: mpsc::Receiver<TaskMsg>,
    mut control_rx: mpsc::Receiver<Frame>,
    ping_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut probe = 0u64;

    loop {
        let frame = tokio::select! {
            biased;
            Some(frame) = control_rx.recv() => frame,
            _ = cancel.cancelled() => break,
            task = task_rx.recv() => match task {
                Some(task) => {
                    debug!(task_id = task.id, "pushing task");
                    Frame::BlockTrace(task)
                }
                // Sender replaced by a newer registration.
                None => break,
            },
            _ = ping.tick() => {
                probe += 1;
                Frame::Ping(probe)
            }
        };
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "write failed");
            break;
        }
    }

    cancel.cancel();
    let _ = sink.close().await;
}

/// Routes inbound frames until the worker closes, errs, or goes silent
/// past `pong_wait`.
async fn read_loop(
    mut stream: FrameStream,
    manager: &Manager,
    pubkey: Pubkey,
    control_tx: &mpsc::Sender<Frame>,
    pong_wait: Duration,
    cancel: &CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            next = tokio::time::timeout(pong_wait, stream.next()) => next,
        };
        let frame = match next {
            Err(_) => {
                warn!(pubkey = %pubkey.short(), "liveness deadline missed, closing");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                warn!(pubkey = %pubkey.short(), error = %e, "bad frame from worker");
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let reply = match frame {
            Frame::Proof(proof) => {
                let id = proof.id;
                // Identity comes from the handshake, never from the frame.
                let ack = match manager.submit_proof(&pubkey, proof).await {
                    Ok(accepted) => SubmitAck {
                        id,
                        accepted,
                        error: None,
                    },
                    Err(e) => {
                        warn!(task_id = id, pubkey = %pubkey.short(), error = %e, "proof submission refused");
                        SubmitAck {
                            id,
                            accepted: false,
                            error: Some(e.to_string()),
                        }
                    }
                };
                Frame::SubmitAck(ack)
            }
            Frame::Ping(n) => Frame::Pong(n),
            Frame::Pong(_) => continue,
            other => {
                warn!(pubkey = %pubkey.short(), kind = other.kind(), "unexpected frame from registered worker");
                let _ = control_tx
                    .send(Frame::Error(format!("unexpected {} frame", other.kind())))
                    .await;
                return;
            }
        };
        if control_tx.send(reply).await.is_err() {
            return;
        }
    }
}
