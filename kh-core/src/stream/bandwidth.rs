//! Send-side throughput and latency accounting.
//!
//! [`BandwidthEstimator`] keeps a rolling window of datagram sizes and
//! an EWMA of frame round-trip times (frame sent → frame acked).
//! [`SummaryWindow`] accumulates per-frame counters between the
//! periodic summaries the sender logs.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ── BandwidthEstimator ───────────────────────────────────────────

/// Rolling-window throughput estimator.
#[derive(Debug)]
pub struct BandwidthEstimator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    window_bytes: u64,
    smoothed_rtt_us: Option<u64>,
}

impl BandwidthEstimator {
    /// Estimator over the last second of traffic.
    pub fn new() -> Self {
        Self::with_window(Duration::from_secs(1))
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(1024),
            window,
            window_bytes: 0,
            smoothed_rtt_us: None,
        }
    }

    /// Record one datagram of `bytes` sent now.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, when: Instant, bytes: u64) {
        self.samples.push_back((when, bytes));
        self.window_bytes += bytes;
        self.evict(when);
    }

    /// Fold a round-trip sample into the EWMA (α = 1/8).
    pub fn record_rtt(&mut self, rtt: Duration) {
        let sample = rtt.as_micros() as u64;
        self.smoothed_rtt_us = Some(match self.smoothed_rtt_us {
            None => sample,
            Some(srtt) => srtt - srtt / 8 + sample / 8,
        });
    }

    /// Throughput in bytes/second over the window.
    pub fn estimate_bps(&self) -> u64 {
        let (Some((first, _)), Some((last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0;
        };
        let span = last.duration_since(*first).max(Duration::from_millis(1));
        (self.window_bytes as f64 / span.as_secs_f64()) as u64
    }

    /// Smoothed round-trip time, once measured.
    pub fn rtt(&self) -> Option<Duration> {
        self.smoothed_rtt_us.map(Duration::from_micros)
    }

    /// [`estimate_bps`](Self::estimate_bps) in megabits per second.
    pub fn estimate_mbps(&self) -> f64 {
        self.estimate_bps() as f64 * 8.0 / 1_000_000.0
    }

    // ── Internal ─────────────────────────────────────────────────

    fn evict(&mut self, now: Instant) {
        while let Some(&(when, bytes)) = self.samples.front() {
            if now.duration_since(when) <= self.window {
                break;
            }
            self.samples.pop_front();
            self.window_bytes = self.window_bytes.saturating_sub(bytes);
        }
    }
}

impl Default for BandwidthEstimator {
    fn default() -> Self {
        Self::new()
    }
}

// ── SummaryWindow ────────────────────────────────────────────────

/// Counters for one summary period.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamSummary {
    pub elapsed: Duration,
    pub frames: u64,
    pub keyframes: u64,
    pub bytes: u64,
    pub packets: u64,
    pub dropped_packets: u64,
}

impl StreamSummary {
    pub fn frame_rate(&self) -> f64 {
        self.frames as f64 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    pub fn megabits_per_second(&self) -> f64 {
        self.bytes as f64 * 8.0 / 1_000_000.0 / self.elapsed.as_secs_f64().max(f64::EPSILON)
    }

    pub fn keyframe_ratio(&self) -> f64 {
        if self.frames == 0 {
            0.0
        } else {
            self.keyframes as f64 / self.frames as f64
        }
    }
}

/// Accumulates [`StreamSummary`] counters until taken.
#[derive(Debug)]
pub struct SummaryWindow {
    started: Instant,
    current: StreamSummary,
}

impl SummaryWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            current: StreamSummary {
                elapsed: Duration::ZERO,
                frames: 0,
                keyframes: 0,
                bytes: 0,
                packets: 0,
                dropped_packets: 0,
            },
        }
    }

    pub fn record_frame(&mut self, keyframe: bool) {
        self.current.frames += 1;
        self.current.keyframes += u64::from(keyframe);
    }

    pub fn record_packet(&mut self, bytes: usize) {
        self.current.packets += 1;
        self.current.bytes += bytes as u64;
    }

    /// A datagram the socket refused (would-block).
    pub fn record_drop(&mut self) {
        self.current.dropped_packets += 1;
    }

    /// Time since the window opened.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    /// Close the window at `now` and open the next one.
    pub fn take(&mut self, now: Instant) -> StreamSummary {
        let mut summary = self.current;
        summary.elapsed = self.elapsed(now);
        *self = Self::new(now);
        summary
    }
}

// ── Tests ────────────────────────────────────────────────────────
