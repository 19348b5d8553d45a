//! Sender-side streaming service.
//!
//! Runs two tasks joined by an mpsc channel:
//!
//! 1. The capture task (a blocking thread) pulls frames from the
//!    [`DepthCamera`], asks the [`PacingController`] whether to send,
//!    encodes depth with [`TrvlEncoder`] and color with the supplied
//!    [`ColorEncoder`], and queues the framed [`FrameMessage`].
//! 2. The send task fragments queued frames with [`Fragmenter`], sends
//!    them over the [`SenderSocket`], reads acks into the shared
//!    [`ReceiverState`], repeats the init packet until the receiver
//!    answers, forwards audio, and logs periodic summaries.
//!
//! Both tasks watch the same `running` flag. A fatal error in either one
//! stops the other and is returned from [`StreamService::run`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::codec::color::ColorEncoder;
use crate::codec::trvl::{DEFAULT_CHANGE_THRESHOLD, DEFAULT_INVALID_THRESHOLD, TrvlEncoder};
use crate::error::KhError;
use crate::message::FrameMessage;
use crate::packet::{AudioPacket, InitPacket, ReceiverPacket, SenderPacket};
use crate::stream::audio::AudioSource;
use crate::stream::bandwidth::{BandwidthEstimator, SummaryWindow};
use crate::stream::capture::DepthCamera;
use crate::stream::fragment::{DEFAULT_GROUP_SIZE, Fragmenter};
use crate::stream::pacing::{
    DEFAULT_KEYFRAME_LAG, NOMINAL_FRAME_RATE, PacingController, PacingDecision, ReceiverState,
};
use crate::stream::transport::SenderSocket;
use crate::stream::types::Calibration;

/// Frames remembered for round-trip measurement.
const MAX_IN_FLIGHT: usize = 256;

/// Pick a fresh session id.
pub fn new_session_id(rng: &mut impl Rng) -> u32 {
    rng.random()
}

// ── StreamServiceConfig ──────────────────────────────────────────

/// Configuration for [`StreamService`].
#[derive(Debug, Clone)]
pub struct StreamServiceConfig {
    /// Nominal frame rate used by the pacing rule.
    pub frame_rate: f64,
    /// Lag beyond which every frame is a keyframe.
    pub keyframe_lag: i64,
    /// TRVL change threshold in millimetres.
    pub change_threshold: i16,
    /// Consecutive zero readings before a pixel is invalidated.
    pub invalid_threshold: u32,
    /// Data packets per parity packet.
    pub fec_group_size: usize,
    /// Init packet repeat interval until the first ack.
    pub init_interval: Duration,
    /// Interval between logged summaries.
    pub summary_interval: Duration,
    /// Send-loop wakeup interval when no frame is queued.
    pub tick: Duration,
}

impl StreamServiceConfig {
    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), KhError> {
        if !(self.frame_rate.is_finite() && self.frame_rate > 0.0) {
            return Err(KhError::Config(format!("frame rate {} is not positive", self.frame_rate)));
        }
        if self.fec_group_size == 0 {
            return Err(KhError::Config("fec group size must be at least 1".into()));
        }
        if self.tick.is_zero() {
            return Err(KhError::Config("send tick must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for StreamServiceConfig {
    fn default() -> Self {
        Self {
            frame_rate: NOMINAL_FRAME_RATE,
            keyframe_lag: DEFAULT_KEYFRAME_LAG,
            change_threshold: DEFAULT_CHANGE_THRESHOLD,
            invalid_threshold: DEFAULT_INVALID_THRESHOLD,
            fec_group_size: DEFAULT_GROUP_SIZE,
            init_interval: Duration::from_millis(100),
            summary_interval: Duration::from_secs(10),
            tick: Duration::from_millis(5),
        }
    }
}

// ── OutgoingFrame ────────────────────────────────────────────────

/// A framed message on its way from the capture task to the send task.
#[derive(Debug)]
struct OutgoingFrame {
    frame_id: u32,
    keyframe: bool,
    message: Bytes,
}

// ── CaptureLoop ──────────────────────────────────────────────────

struct CaptureLoop {
    camera: Box<dyn DepthCamera>,
    color: Box<dyn ColorEncoder>,
    depth: TrvlEncoder,
    pacing: PacingController,
    receiver_state: Arc<ReceiverState>,
    running: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<OutgoingFrame>,
}

impl CaptureLoop {
    fn run(mut self) -> Result<(), KhError> {
        let session_start = Instant::now();
        let mut frame_id: u32 = 0;

        while self.running.load(Ordering::SeqCst) {
            // 1. Capture.
            let Some(frame) = self.camera.capture()? else {
                continue;
            };

            // 2. Pacing. Frame ids are only consumed by admitted frames.
            let acknowledged = self.receiver_state.acknowledged();
            let keyframe = match self.pacing.decide(Instant::now(), frame_id, acknowledged) {
                PacingDecision::Skip => continue,
                // The receiver's decoder starts from nothing.
                PacingDecision::Send { keyframe } => keyframe || frame_id == 0,
            };

            // 3. Encode.
            let color = self.color.encode(&frame.color, keyframe)?;
            let depth = self.depth.encode(&frame.depth, keyframe)?;
            let timestamp_ms = frame
                .captured_at
                .saturating_duration_since(session_start)
                .as_secs_f32()
                * 1000.0;
            let message = FrameMessage::new(frame_id, timestamp_ms, keyframe, color, depth);

            // 4. Hand off.
            let outgoing = OutgoingFrame {
                frame_id,
                keyframe,
                message: Bytes::from(message.encode()),
            };
            if self.tx.send(outgoing).is_err() {
                break;
            }
            frame_id = frame_id.wrapping_add(1);
        }

        Ok(())
    }
}

// ── SendLoop ─────────────────────────────────────────────────────

/// Per-run state of the send task.
struct SendLoop {
    fragmenter: Fragmenter,
    init: SenderPacket,
    last_init: Option<Instant>,
    audio_frame_id: u32,
    in_flight: VecDeque<(u32, Instant)>,
    bandwidth: BandwidthEstimator,
    summary: SummaryWindow,
}

// ── StreamService ────────────────────────────────────────────────

/// Sender side of one streaming session.
///
/// # Lifetime
///
/// Call [`run`](Self::run) with a camera and a color encoder. It runs
/// until [`stop`](Self::stop) is called, the camera fails, or the socket
/// hits an unrecoverable error.
pub struct StreamService {
    socket: SenderSocket,
    session_id: u32,
    config: StreamServiceConfig,
    running: Arc<AtomicBool>,
    receiver_state: Arc<ReceiverState>,
}

impl StreamService {
    pub fn new(socket: SenderSocket, session_id: u32, config: StreamServiceConfig) -> Self {
        Self {
            socket,
            session_id,
            config,
            running: Arc::new(AtomicBool::new(false)),
            receiver_state: Arc::new(ReceiverState::new()),
        }
    }

    /// A cloneable handle that can be used to stop the service from
    /// another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// The receiver's progress as seen through its acks.
    pub fn receiver_state(&self) -> Arc<ReceiverState> {
        Arc::clone(&self.receiver_state)
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Stream until stopped.
    ///
    /// ```no_run
    /// # use kh_core::stream::{StreamService, SyntheticCamera};
    /// # use kh_core::codec::ZstdColorCodec;
    /// # async fn example(svc: StreamService) {
    /// let handle = svc.stop_handle();
    /// let camera = SyntheticCamera::new(Default::default(), 30.0, 1);
    /// tokio::spawn(async move {
    ///     svc.run(Box::new(camera), Box::new(ZstdColorCodec::default()), None).await
    /// });
    /// // … later …
    /// handle.store(false, std::sync::atomic::Ordering::SeqCst);
    /// # }
    /// ```
    pub async fn run(
        &self,
        camera: Box<dyn DepthCamera>,
        color: Box<dyn ColorEncoder>,
        audio: Option<Box<dyn AudioSource>>,
    ) -> Result<(), KhError> {
        self.config.validate()?;
        self.running.store(true, Ordering::SeqCst);
        let calibration = camera.calibration();
        info!(
            "session {:#010x}: depth {}x{}, color {}x{}, fec group {}",
            self.session_id,
            calibration.depth_width,
            calibration.depth_height,
            calibration.color_width,
            calibration.color_height,
            self.config.fec_group_size,
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let capture = CaptureLoop {
            camera,
            color,
            depth: TrvlEncoder::new(
                calibration.depth_pixels(),
                self.config.change_threshold,
                self.config.invalid_threshold,
            ),
            pacing: PacingController::new(self.config.frame_rate, self.config.keyframe_lag),
            receiver_state: Arc::clone(&self.receiver_state),
            running: Arc::clone(&self.running),
            tx,
        };
        let capture_task = tokio::task::spawn_blocking(move || capture.run());

        let send_result = self.send_loop(rx, calibration, audio).await;
        self.running.store(false, Ordering::SeqCst);

        let capture_result = capture_task
            .await
            .map_err(|e| KhError::Other(format!("capture task failed: {e}")))?;
        if let Err(e) = &capture_result {
            warn!("capture stopped: {e}");
        }
        send_result.and(capture_result)
    }

    /// Signal the service to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the service is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Send task ────────────────────────────────────────────────

    async fn send_loop(
        &self,
        mut rx: mpsc::UnboundedReceiver<OutgoingFrame>,
        calibration: Calibration,
        mut audio: Option<Box<dyn AudioSource>>,
    ) -> Result<(), KhError> {
        let mut state = SendLoop {
            fragmenter: Fragmenter::new(self.config.fec_group_size),
            init: SenderPacket::Init(InitPacket {
                session_id: self.session_id,
                calibration,
                fec_group_size: self.config.fec_group_size as u32,
            }),
            last_init: None,
            audio_frame_id: 0,
            in_flight: VecDeque::with_capacity(MAX_IN_FLIGHT),
            bandwidth: BandwidthEstimator::new(),
            summary: SummaryWindow::new(Instant::now()),
        };
        // The receiver must learn the session before frame 0 arrives.
        self.send_init(&mut state).await?;

        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => self.send_frame(&mut state, frame).await?,
                    // Capture task ended.
                    None => break,
                },
                _ = ticker.tick() => {}
            }

            self.read_acks(&mut state)?;

            if self.receiver_state.acknowledged().is_none()
                && state
                    .last_init
                    .is_none_or(|sent| sent.elapsed() >= self.config.init_interval)
            {
                self.send_init(&mut state).await?;
            }

            if let Some(source) = audio.as_mut() {
                while let Some(payload) = source.poll_frame() {
                    self.send_audio(&mut state, payload).await?;
                }
            }

            let now = Instant::now();
            if state.summary.elapsed(now) >= self.config.summary_interval {
                self.log_summary(&mut state, now);
            }
        }

        Ok(())
    }

    async fn send_frame(&self, state: &mut SendLoop, frame: OutgoingFrame) -> Result<(), KhError> {
        let packets = state
            .fragmenter
            .packetize(self.session_id, frame.frame_id, &frame.message);
        for packet in &packets {
            if self.socket.send(packet).await? {
                let size = packet.wire_size();
                state.bandwidth.record(size as u64);
                state.summary.record_packet(size);
            } else {
                state.summary.record_drop();
            }
        }
        state.summary.record_frame(frame.keyframe);

        if state.in_flight.len() == MAX_IN_FLIGHT {
            state.in_flight.pop_front();
        }
        state.in_flight.push_back((frame.frame_id, Instant::now()));

        trace!(
            frame_id = frame.frame_id,
            keyframe = frame.keyframe,
            bytes = frame.message.len(),
            packets = packets.len(),
            "frame sent"
        );
        Ok(())
    }

    async fn send_init(&self, state: &mut SendLoop) -> Result<(), KhError> {
        if !self.socket.send(&state.init).await? {
            debug!("init packet dropped by full socket buffer");
        }
        state.last_init = Some(Instant::now());
        Ok(())
    }

    async fn send_audio(&self, state: &mut SendLoop, payload: Bytes) -> Result<(), KhError> {
        let packet = SenderPacket::Audio(AudioPacket {
            session_id: self.session_id,
            frame_id: state.audio_frame_id,
            payload,
        });
        if self.socket.send(&packet).await? {
            state.bandwidth.record(packet.wire_size() as u64);
        }
        state.audio_frame_id = state.audio_frame_id.wrapping_add(1);
        Ok(())
    }

    fn read_acks(&self, state: &mut SendLoop) -> Result<(), KhError> {
        while let Some(packet) = self.socket.try_receive()? {
            let ReceiverPacket::Ack { frame_id } = packet else {
                // Repeated pings from a receiver still waiting for init.
                continue;
            };
            if self.receiver_state.acknowledged().is_none() {
                info!("receiver acknowledged frame {frame_id}");
            }
            self.receiver_state.acknowledge(frame_id);

            while let Some(&(sent_id, sent_at)) = state.in_flight.front() {
                if sent_id > frame_id {
                    break;
                }
                state.in_flight.pop_front();
                if sent_id == frame_id {
                    state.bandwidth.record_rtt(sent_at.elapsed());
                }
            }
        }
        Ok(())
    }

    fn log_summary(&self, state: &mut SendLoop, now: Instant) {
        let summary = state.summary.take(now);
        let rtt = state
            .bandwidth
            .rtt()
            .map_or_else(|| "n/a".to_string(), |rtt| format!("{:.1} ms", rtt.as_secs_f64() * 1e3));
        let acked = self
            .receiver_state
            .acknowledged()
            .map_or_else(|| "none".to_string(), |id| id.to_string());
        info!(
            "summary: {:.1} fps, {:.2} Mbps ({:.2} Mbps last second), {:.0}% keyframes, {} packets ({} dropped), rtt {rtt}, acked {acked}",
            summary.frame_rate(),
            summary.megabits_per_second(),
            state.bandwidth.estimate_mbps(),
            summary.keyframe_ratio() * 100.0,
            summary.packets,
            summary.dropped_packets,
        );
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::color::ZstdColorCodec;
    use crate::codec::trvl::TrvlDecoder;
    use crate::stream::capture::SyntheticCamera;
    use crate::stream::collector::{FrameReassembler, StallPolicy};
    use crate::stream::transport::{ReceiverSocket, SenderListener};
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::net::SocketAddr;

    fn tiny() -> Calibration {
        Calibration {
            color_width: 16,
            color_height: 8,
            depth_width: 16,
            depth_height: 8,
        }
    }

    async fn session() -> (SenderSocket, ReceiverSocket) {
        let listener = SenderListener::bind("127.0.0.1:0".parse::<SocketAddr>().unwrap()).unwrap();
        let receiver = ReceiverSocket::connect(listener.local_addr().unwrap()).unwrap();
        receiver.ping().await.unwrap();
        let sender = tokio::time::timeout(Duration::from_millis(500), listener.accept())
            .await
            .unwrap()
            .unwrap();
        (sender, receiver)
    }

    async fn next_packet(receiver: &mut ReceiverSocket) -> SenderPacket {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(packet) = receiver.try_receive().unwrap() {
                    return packet;
                }
                receiver.wait_readable(Duration::from_millis(10)).await.unwrap();
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn session_ids_come_from_the_rng() {
        let mut a = StdRng::seed_from_u64(9);
        let mut b = StdRng::seed_from_u64(9);
        assert_eq!(new_session_id(&mut a), new_session_id(&mut b));
    }

    #[test]
    fn default_config() {
        let config = StreamServiceConfig::default();
        assert_eq!(config.fec_group_size, 5);
        assert_eq!(config.keyframe_lag, 5);
        assert_eq!(config.init_interval, Duration::from_millis(100));
        assert_eq!(config.summary_interval, Duration::from_secs(10));
    }

    #[test]
    fn invalid_config_rejected() {
        let zero_group = StreamServiceConfig {
            fec_group_size: 0,
            ..StreamServiceConfig::default()
        };
        assert!(matches!(zero_group.validate(), Err(KhError::Config(_))));
        let no_rate = StreamServiceConfig {
            frame_rate: 0.0,
            ..StreamServiceConfig::default()
        };
        assert!(no_rate.validate().is_err());
        assert!(StreamServiceConfig::default().validate().is_ok());
    }

    #[tokio::test]
    async fn init_comes_first_and_frames_decode() {
        let (sender, mut receiver) = session().await;
        let service = Arc::new(StreamService::new(sender, 77, StreamServiceConfig::default()));
        let camera = SyntheticCamera::new(tiny(), 60.0, 3);

        let svc = Arc::clone(&service);
        let task = tokio::spawn(async move {
            svc.run(Box::new(camera), Box::new(ZstdColorCodec::default()), None)
                .await
        });

        let SenderPacket::Init(init) = next_packet(&mut receiver).await else {
            panic!("first packet must be init");
        };
        assert_eq!(init.session_id, 77);
        assert_eq!(init.calibration, tiny());
        assert_eq!(init.fec_group_size, 5);

        let mut reassembler = FrameReassembler::new(77, 5, StallPolicy::Block);
        let mut depth = TrvlDecoder::new(tiny().depth_pixels());
        let mut decoded = 0;
        while decoded < 3 {
            match next_packet(&mut receiver).await {
                SenderPacket::Video(video) => {
                    reassembler.push_video(video);
                }
                SenderPacket::Parity(parity) => {
                    reassembler.push_parity(parity);
                }
                _ => continue,
            }
            reassembler.assemble();
            for message in reassembler.deliver() {
                assert_eq!(message.frame_id, decoded);
                if decoded == 0 {
                    assert!(message.keyframe);
                }
                depth.decode(&message.depth, message.keyframe).unwrap();
                receiver.ack(message.frame_id).await.unwrap();
                decoded += 1;
            }
        }

        service.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(service.receiver_state().acknowledged().is_some());
        assert!(!service.is_running());
    }

    #[tokio::test]
    async fn init_repeats_until_acked() {
        let (sender, mut receiver) = session().await;
        let config = StreamServiceConfig {
            init_interval: Duration::from_millis(20),
            ..StreamServiceConfig::default()
        };
        let service = Arc::new(StreamService::new(sender, 5, config));
        // Pacing without acks admits frames rarely; inits keep flowing.
        let camera = SyntheticCamera::new(tiny(), 30.0, 1);
        let svc = Arc::clone(&service);
        let task = tokio::spawn(async move {
            svc.run(Box::new(camera), Box::new(ZstdColorCodec::default()), None)
                .await
        });

        let mut inits = 0;
        while inits < 3 {
            if let SenderPacket::Init(_) = next_packet(&mut receiver).await {
                inits += 1;
            }
        }

        service.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
