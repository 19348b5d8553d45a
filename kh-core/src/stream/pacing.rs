//! Receiver-driven pacing and keyframe insertion.
//!
//! The only congestion control in the system. The sender compares its
//! next frame id with the last id the receiver acknowledged:
//!
//! ```text
//! lag       = frame_id − acked          (acked = −1 before the first ack)
//! admit     ⇔ elapsed_secs · rate ≥ 2^(lag − 3)
//! keyframe  ⇔ lag > keyframe_lag
//! ```
//!
//! A receiver that keeps up sees the nominal rate; one that falls
//! behind is sent exponentially fewer frames, and those are keyframes
//! so it can resynchronise without the missing delta chain.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

/// Nominal capture rate of the depth camera.
pub const NOMINAL_FRAME_RATE: f64 = 30.0;

/// Lag beyond which every sent frame is a keyframe.
pub const DEFAULT_KEYFRAME_LAG: i64 = 5;

/// Lag at which admission drops below the nominal rate.
const LAG_FREE_WINDOW: i64 = 3;

// ── ReceiverState ────────────────────────────────────────────────

/// Sender-side view of the receiver's progress, shared between the
/// send task (writer) and the capture task (reader).
#[derive(Debug)]
pub struct ReceiverState {
    acked: AtomicI64,
}

impl ReceiverState {
    pub fn new() -> Self {
        Self {
            acked: AtomicI64::new(-1),
        }
    }

    /// Last acknowledged frame id, if any.
    pub fn acknowledged(&self) -> Option<u32> {
        u32::try_from(self.acked.load(Ordering::Acquire)).ok()
    }

    /// Record an ack. Older acks arriving late never move it back.
    pub fn acknowledge(&self, frame_id: u32) {
        self.acked.fetch_max(i64::from(frame_id), Ordering::AcqRel);
    }
}

impl Default for ReceiverState {
    fn default() -> Self {
        Self::new()
    }
}

// ── PacingController ─────────────────────────────────────────────

/// Outcome of one capture tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingDecision {
    /// Drop this capture.
    Skip,
    /// Encode and send it.
    Send { keyframe: bool },
}

/// Per-tick admission control on the sender.
#[derive(Debug, Clone)]
pub struct PacingController {
    frame_rate: f64,
    keyframe_lag: i64,
    last_sent: Instant,
}

impl PacingController {
    pub fn new(frame_rate: f64, keyframe_lag: i64) -> Self {
        Self {
            frame_rate,
            keyframe_lag,
            last_sent: Instant::now(),
        }
    }

    /// Frames the receiver is behind.
    pub fn lag(frame_id: u32, acknowledged: Option<u32>) -> i64 {
        i64::from(frame_id) - acknowledged.map_or(-1, i64::from)
    }

    /// Decide for the frame that would get `frame_id`. Admitted frames
    /// restart the elapsed-time clock.
    pub fn decide(
        &mut self,
        now: Instant,
        frame_id: u32,
        acknowledged: Option<u32>,
    ) -> PacingDecision {
        let lag = Self::lag(frame_id, acknowledged);
        let elapsed = now.saturating_duration_since(self.last_sent).as_secs_f64();
        // Clamped so powi stays finite for absurd lags.
        let exponent = (lag - LAG_FREE_WINDOW).clamp(-64, 64) as i32;

        if elapsed * self.frame_rate < 2f64.powi(exponent) {
            return PacingDecision::Skip;
        }

        self.last_sent = now;
        PacingDecision::Send {
            keyframe: lag > self.keyframe_lag,
        }
    }
}

impl Default for PacingController {
    fn default() -> Self {
        Self::new(NOMINAL_FRAME_RATE, DEFAULT_KEYFRAME_LAG)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn receiver_state_starts_unacked() {
        let state = ReceiverState::new();
        assert_eq!(state.acknowledged(), None);
        state.acknowledge(4);
        state.acknowledge(2);
        assert_eq!(state.acknowledged(), Some(4));
        state.acknowledge(0);
        assert_eq!(state.acknowledged(), Some(4));
    }

    #[test]
    fn lag_counts_from_minus_one() {
        assert_eq!(PacingController::lag(0, None), 1);
        assert_eq!(PacingController::lag(10, Some(9)), 1);
        assert_eq!(PacingController::lag(10, Some(3)), 7);
    }

    #[test]
    fn keeps_nominal_rate_when_caught_up() {
        let mut pacing = PacingController::default();
        let t0 = pacing.last_sent;
        // lag 1 → threshold 2^-2 = 0.25 frame periods.
        assert_eq!(pacing.decide(t0 + ms(5), 5, Some(4)), PacingDecision::Skip);
        assert_eq!(
            pacing.decide(t0 + ms(9), 5, Some(4)),
            PacingDecision::Send { keyframe: false }
        );
    }

    #[test]
    fn admission_halves_per_lag_step() {
        let mut pacing = PacingController::default();
        let t0 = pacing.last_sent;
        // lag 4 → 2 frame periods (≈ 66.7 ms).
        assert_eq!(pacing.decide(t0 + ms(60), 10, Some(6)), PacingDecision::Skip);
        assert_eq!(
            pacing.decide(t0 + ms(67), 10, Some(6)),
            PacingDecision::Send { keyframe: false }
        );

        // lag 5 → 4 frame periods from the last admitted frame.
        let t1 = t0 + ms(67);
        assert_eq!(pacing.decide(t1 + ms(130), 11, Some(6)), PacingDecision::Skip);
        assert!(matches!(
            pacing.decide(t1 + ms(134), 11, Some(6)),
            PacingDecision::Send { .. }
        ));
    }

    #[test]
    fn keyframe_when_far_behind() {
        let mut pacing = PacingController::default();
        let t0 = pacing.last_sent;
        // lag 6 → 8 frame periods, and a keyframe.
        assert_eq!(
            pacing.decide(t0 + ms(270), 20, Some(14)),
            PacingDecision::Send { keyframe: true }
        );
        // lag exactly 5 is not yet a keyframe.
        assert_eq!(
            pacing.decide(t0 + ms(270 + 140), 20, Some(15)),
            PacingDecision::Send { keyframe: false }
        );
    }

    #[test]
    fn missing_acks_force_keyframes() {
        let mut pacing = PacingController::default();
        let t0 = pacing.last_sent;
        // No ack yet: frame 5 has lag 6 and must be a keyframe.
        assert_eq!(
            pacing.decide(t0 + Duration::from_secs(1), 5, None),
            PacingDecision::Send { keyframe: true }
        );
    }
}
