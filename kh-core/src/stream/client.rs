//! Receiver-side stream consumer.
//!
//! One cooperative loop per receiver: drain the socket, route packets of
//! the announced session into the [`FrameReassembler`], decode every
//! delivered frame in order, publish the newest one, and acknowledge it.
//! Decoded frames and statistics are published through
//! `tokio::sync::watch` channels so a renderer always sees the latest
//! state without ever blocking the receive loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::codec::color::ColorDecoder;
use crate::codec::trvl::TrvlDecoder;
use crate::error::KhError;
use crate::message::FrameMessage;
use crate::packet::{InitPacket, SenderPacket};
use crate::stream::audio::AudioPacketCollector;
use crate::stream::collector::{FrameReassembler, StallPolicy};
use crate::stream::transport::ReceiverSocket;
use crate::stream::types::{Calibration, DecodedFrame};

/// Audio frames buffered for a slow consumer before new ones are dropped.
pub const AUDIO_QUEUE_DEPTH: usize = 64;

/// Delivery instants kept for the fps estimate.
const FPS_WINDOW: usize = 60;

// ── StreamClientConfig ───────────────────────────────────────────

/// Configuration for [`StreamClient`].
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    /// Upper bound on one idle wait for the socket.
    pub poll_interval: Duration,
    /// Ping repeat interval until the first init packet arrives.
    pub ping_interval: Duration,
    /// What to do when a frame can never complete.
    pub stall_policy: StallPolicy,
}

impl Default for StreamClientConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            ping_interval: Duration::from_secs(1),
            stall_policy: StallPolicy::default(),
        }
    }
}

// ── FrameStats ───────────────────────────────────────────────────

/// Receive statistics exposed to the display layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameStats {
    /// Current session, once announced.
    pub session_id: Option<u32>,
    /// Smoothed delivered frames per second.
    pub fps: f64,
    /// Frames delivered in order and decoded.
    pub delivered_frames: u64,
    /// Frames published to the frame channel.
    pub rendered_frames: u64,
    /// Delivered keyframes.
    pub keyframes: u64,
    /// Frames given up on by the stall policy.
    pub skipped_frames: u64,
    /// Bytes of well-formed sender packets received.
    pub total_bytes: u64,
    /// Id of the last delivered frame.
    pub last_frame_id: Option<u32>,
}

// ── Session ──────────────────────────────────────────────────────

/// Decoder state for the session announced by the latest init packet.
struct Session {
    session_id: u32,
    calibration: Calibration,
    depth: TrvlDecoder,
    reassembler: FrameReassembler,
    audio: AudioPacketCollector,
    skipped_before: u64,
    /// Cleared by a failed depth decode; only a keyframe sets it again.
    depth_in_sync: bool,
}

impl Session {
    fn new(init: &InitPacket, policy: StallPolicy, skipped_before: u64) -> Self {
        Self {
            session_id: init.session_id,
            calibration: init.calibration,
            depth: TrvlDecoder::new(init.calibration.depth_pixels()),
            reassembler: FrameReassembler::new(
                init.session_id,
                init.fec_group_size as usize,
                policy,
            ),
            audio: AudioPacketCollector::new(init.session_id),
            skipped_before,
            depth_in_sync: false,
        }
    }

    fn skipped_frames(&self) -> u64 {
        self.skipped_before + self.reassembler.skipped_frames()
    }
}

/// Result of running delivered frames through the decoders.
#[derive(Default)]
struct Decoded {
    /// Newest frame, if it decoded.
    newest: Option<DecodedFrame>,
    /// Newest frame id whose depth decoded against an in-sync decoder.
    ack: Option<u32>,
}

// ── StreamClient ─────────────────────────────────────────────────

/// Receiver that reassembles, decodes and publishes frames.
pub struct StreamClient {
    socket: ReceiverSocket,
    color: Box<dyn ColorDecoder>,
    config: StreamClientConfig,
    running: Arc<AtomicBool>,
    /// Latest decoded frame; `None` until the first one.
    frame_tx: watch::Sender<Option<Arc<DecodedFrame>>>,
    frame_rx: watch::Receiver<Option<Arc<DecodedFrame>>>,
    stats_tx: watch::Sender<FrameStats>,
    stats_rx: watch::Receiver<FrameStats>,
    audio_tx: mpsc::Sender<Bytes>,
    audio_rx: Option<mpsc::Receiver<Bytes>>,
}

impl StreamClient {
    pub fn new(
        socket: ReceiverSocket,
        color: Box<dyn ColorDecoder>,
        config: StreamClientConfig,
    ) -> Self {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (stats_tx, stats_rx) = watch::channel(FrameStats::default());
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_DEPTH);
        Self {
            socket,
            color,
            config,
            running: Arc::new(AtomicBool::new(false)),
            frame_tx,
            frame_rx,
            stats_tx,
            stats_rx,
            audio_tx,
            audio_rx: Some(audio_rx),
        }
    }

    /// Obtain a `watch::Receiver` that yields the latest decoded frame.
    pub fn frame_receiver(&self) -> watch::Receiver<Option<Arc<DecodedFrame>>> {
        self.frame_rx.clone()
    }

    /// Obtain a `watch::Receiver` for receive statistics.
    pub fn stats_receiver(&self) -> watch::Receiver<FrameStats> {
        self.stats_rx.clone()
    }

    /// Take the audio channel. Only the first call returns it.
    pub fn audio_receiver(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.audio_rx.take()
    }

    /// A cloneable stop handle.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run the receive loop until [`stop`](Self::stop) is invoked or the
    /// socket fails.
    pub async fn run(&mut self) -> Result<(), KhError> {
        self.running.store(true, Ordering::SeqCst);

        let mut session: Option<Session> = None;
        let mut stats = FrameStats::default();
        let mut deliveries: VecDeque<Instant> = VecDeque::with_capacity(FPS_WINDOW + 1);

        self.socket.ping().await?;
        let mut last_ping = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            // 1. Drain the socket.
            let packets = self.socket.drain()?;
            let idle = packets.is_empty();

            // 2. Route.
            for packet in packets {
                stats.total_bytes += packet.wire_size() as u64;
                self.route(&mut session, packet);
            }

            let Some(current) = session.as_mut() else {
                if last_ping.elapsed() >= self.config.ping_interval {
                    debug!("no init yet, pinging {}", self.socket.sender_addr());
                    self.socket.ping().await?;
                    last_ping = Instant::now();
                }
                self.socket.wait_readable(self.config.poll_interval).await?;
                continue;
            };

            for payload in current.audio.drain() {
                // A full or abandoned queue drops the frame.
                let _ = self.audio_tx.try_send(payload);
            }

            // 3. Assemble and deliver in order.
            current.reassembler.assemble();
            let delivered = current.reassembler.deliver();

            // 4. Decode and acknowledge. Frames the depth decoder could
            //    not follow stay unacknowledged so the sender's lag grows
            //    until it sends a keyframe.
            let mut newest = None;
            if !delivered.is_empty() {
                let now = Instant::now();
                for _ in 0..delivered.len() {
                    deliveries.push_back(now);
                }
                while deliveries.len() > FPS_WINDOW {
                    deliveries.pop_front();
                }
                let decoded = self.decode(current, delivered, &mut stats);
                if let Some(frame_id) = decoded.ack {
                    self.socket.ack(frame_id).await?;
                }
                newest = decoded.newest;
                stats.fps = fps(&deliveries);
            }

            // 5. Publish: stats first, so a renderer woken by a frame
            //    never reads older counters.
            stats.session_id = Some(current.session_id);
            stats.skipped_frames = current.skipped_frames();
            if newest.is_some() {
                stats.rendered_frames += 1;
            }
            self.stats_tx.send_if_modified(|published| {
                if *published == stats {
                    return false;
                }
                *published = stats.clone();
                true
            });
            if let Some(frame) = newest {
                self.frame_tx.send_replace(Some(Arc::new(frame)));
            }

            // 6. Idle wait.
            if idle {
                self.socket.wait_readable(self.config.poll_interval).await?;
            }
        }

        Ok(())
    }

    /// Signal the client to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the receive loop is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    fn route(&mut self, session: &mut Option<Session>, packet: SenderPacket) {
        match packet {
            SenderPacket::Init(init) => {
                if session
                    .as_ref()
                    .is_some_and(|s| s.session_id == init.session_id)
                {
                    return;
                }
                let skipped = session.as_ref().map_or(0, Session::skipped_frames);
                info!(
                    "session {:#010x}: depth {}x{}, color {}x{}, fec group {}",
                    init.session_id,
                    init.calibration.depth_width,
                    init.calibration.depth_height,
                    init.calibration.color_width,
                    init.calibration.color_height,
                    init.fec_group_size,
                );
                self.color
                    .configure(init.calibration.color_width, init.calibration.color_height);
                *session = Some(Session::new(&init, self.config.stall_policy, skipped));
            }
            SenderPacket::Video(video) => match session.as_mut() {
                Some(s) => {
                    s.reassembler.push_video(video);
                }
                None => trace!(frame_id = video.frame_id, "video before init"),
            },
            SenderPacket::Parity(parity) => match session.as_mut() {
                Some(s) => {
                    s.reassembler.push_parity(parity);
                }
                None => trace!(frame_id = parity.frame_id, "parity before init"),
            },
            SenderPacket::Audio(audio) => {
                if let Some(s) = session.as_mut() {
                    s.audio.push(audio);
                }
            }
        }
    }

    /// Run every delivered frame through the decoders so their state
    /// stays in step with the sender. After a failed depth decode, delta
    /// frames are skipped until the next keyframe.
    fn decode(
        &mut self,
        session: &mut Session,
        delivered: Vec<FrameMessage>,
        stats: &mut FrameStats,
    ) -> Decoded {
        let count = delivered.len();
        let mut decoded = Decoded::default();
        for (i, message) in delivered.into_iter().enumerate() {
            stats.delivered_frames += 1;
            stats.keyframes += u64::from(message.keyframe);
            stats.last_frame_id = Some(message.frame_id);

            if !message.keyframe && !session.depth_in_sync {
                trace!(frame_id = message.frame_id, "delta frame while out of sync");
                continue;
            }
            let depth = match session.depth.decode(&message.depth, message.keyframe) {
                Ok(depth) => depth,
                Err(e) => {
                    warn!(frame_id = message.frame_id, "depth decode failed: {e}");
                    session.depth_in_sync = false;
                    continue;
                }
            };
            session.depth_in_sync = true;
            decoded.ack = Some(message.frame_id);
            let color = match self.color.decode(&message.color) {
                Ok(color) => color,
                Err(e) => {
                    warn!(frame_id = message.frame_id, "color decode failed: {e}");
                    continue;
                }
            };

            if i + 1 == count {
                decoded.newest = Some(DecodedFrame {
                    frame_id: message.frame_id,
                    timestamp_ms: message.timestamp_ms,
                    keyframe: message.keyframe,
                    color,
                    depth: depth.to_vec(),
                    depth_width: session.calibration.depth_width,
                    depth_height: session.calibration.depth_height,
                });
            }
        }
        decoded
    }
}

/// Frames per second over the delivery window.
fn fps(deliveries: &VecDeque<Instant>) -> f64 {
    let (Some(first), Some(last)) = (deliveries.front(), deliveries.back()) else {
        return 0.0;
    };
    let span = last.duration_since(*first).as_secs_f64();
    if span > 0.0 {
        (deliveries.len() - 1) as f64 / span
    } else {
        0.0
    }
}

// ── Tests ────────────────────────────────────────────────────────
