//! Console frame viewer.
//!
//! Stands in for a renderer: samples the latest decoded frame on a
//! fixed interval and logs what it shows, together with the client's
//! receive statistics and the audio that arrived since the last report.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::info;

use kh_core::stream::{DecodedFrame, FrameStats};

// ── DepthSummary ─────────────────────────────────────────────────

/// Condensed view of one depth image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthSummary {
    /// Share of pixels with a valid (non-zero) reading.
    pub valid_ratio: f64,
    pub min_mm: i16,
    pub max_mm: i16,
    pub mean_mm: f64,
    /// Reading at the image centre.
    pub center_mm: i16,
}

impl DepthSummary {
    /// `None` for an empty image.
    pub fn of(depth: &[i16], width: u32, height: u32) -> Option<Self> {
        if depth.is_empty() {
            return None;
        }
        let valid: Vec<i16> = depth.iter().copied().filter(|&d| d > 0).collect();
        let center = (height / 2) as usize * width as usize + (width / 2) as usize;
        Some(Self {
            valid_ratio: valid.len() as f64 / depth.len() as f64,
            min_mm: valid.iter().copied().min().unwrap_or(0),
            max_mm: valid.iter().copied().max().unwrap_or(0),
            mean_mm: if valid.is_empty() {
                0.0
            } else {
                valid.iter().map(|&d| f64::from(d)).sum::<f64>() / valid.len() as f64
            },
            center_mm: depth.get(center).copied().unwrap_or(0),
        })
    }
}

// ── FrameViewer ──────────────────────────────────────────────────

/// Periodic reporter over a [`StreamClient`](kh_core::StreamClient)'s
/// output channels.
pub struct FrameViewer {
    frames: watch::Receiver<Option<Arc<DecodedFrame>>>,
    stats: watch::Receiver<FrameStats>,
    audio: Option<mpsc::Receiver<Bytes>>,
    interval: Duration,
}

impl FrameViewer {
    pub fn new(
        frames: watch::Receiver<Option<Arc<DecodedFrame>>>,
        stats: watch::Receiver<FrameStats>,
        audio: Option<mpsc::Receiver<Bytes>>,
        interval: Duration,
    ) -> Self {
        Self {
            frames,
            stats,
            audio,
            interval: interval.max(Duration::from_millis(100)),
        }
    }

    /// Report until `running` clears or the client goes away.
    pub async fn run(mut self, running: Arc<AtomicBool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        while running.load(Ordering::SeqCst) {
            ticker.tick().await;
            if self.frames.has_changed().is_err() {
                break;
            }
            if let Some(line) = self.report() {
                info!("{line}");
            }
        }
    }

    /// One report line, or `None` while nothing new was shown.
    pub fn report(&mut self) -> Option<String> {
        let audio_bytes = self.drain_audio();
        if !self.frames.has_changed().unwrap_or(false) {
            return None;
        }
        let frame = self.frames.borrow_and_update().clone()?;
        let stats = self.stats.borrow().clone();

        let depth = match DepthSummary::of(&frame.depth, frame.depth_width, frame.depth_height) {
            Some(d) => format!(
                "depth {:.0}% valid, {}..{} mm, centre {} mm",
                d.valid_ratio * 100.0,
                d.min_mm,
                d.max_mm,
                d.center_mm
            ),
            None => "no depth".to_string(),
        };
        Some(format!(
            "frame {} @ {:.0} ms{}: {depth}; color {}x{}; {:.1} fps, {} delivered, {} skipped, {audio_bytes} audio bytes",
            frame.frame_id,
            frame.timestamp_ms,
            if frame.keyframe { " (key)" } else { "" },
            frame.color.width,
            frame.color.height,
            stats.fps,
            stats.delivered_frames,
            stats.skipped_frames,
        ))
    }

    fn drain_audio(&mut self) -> usize {
        let Some(audio) = self.audio.as_mut() else {
            return 0;
        };
        let mut bytes = 0;
        while let Ok(frame) = audio.try_recv() {
            bytes += frame.len();
        }
        bytes
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kh_core::YuvImage;

    fn frame(frame_id: u32, depth: Vec<i16>) -> DecodedFrame {
        DecodedFrame {
            frame_id,
            timestamp_ms: 33.0,
            keyframe: true,
            color: YuvImage::blank(2, 2),
            depth,
            depth_width: 2,
            depth_height: 2,
        }
    }

    #[test]
    fn summary_ignores_invalid_pixels() {
        let summary = DepthSummary::of(&[0, 1000, 3000, 0], 2, 2).unwrap();
        assert_eq!(summary.valid_ratio, 0.5);
        assert_eq!((summary.min_mm, summary.max_mm), (1000, 3000));
        assert_eq!(summary.mean_mm, 2000.0);
        // Centre of a 2x2 image is (1, 1).
        assert_eq!(summary.center_mm, 0);
    }

    #[test]
    fn summary_of_empty_image() {
        assert_eq!(DepthSummary::of(&[], 0, 0), None);
        let blind = DepthSummary::of(&[0, 0], 2, 1).unwrap();
        assert_eq!(blind.valid_ratio, 0.0);
        assert_eq!(blind.mean_mm, 0.0);
    }

    #[test]
    fn reports_only_new_frames() {
        let (frame_tx, frame_rx) = watch::channel(None);
        let (_stats_tx, stats_rx) = watch::channel(FrameStats::default());
        let (audio_tx, audio_rx) = mpsc::channel(4);
        let mut viewer = FrameViewer::new(frame_rx, stats_rx, Some(audio_rx), Duration::from_secs(1));

        assert_eq!(viewer.report(), None);

        audio_tx.try_send(Bytes::from_static(&[0; 10])).unwrap();
        frame_tx.send_replace(Some(Arc::new(frame(4, vec![1200, 1200, 0, 2500]))));
        let line = viewer.report().unwrap();
        assert!(line.starts_with("frame 4"), "{line}");
        assert!(line.contains("(key)"));
        assert!(line.contains("75% valid"));
        assert!(line.contains("10 audio bytes"));

        assert_eq!(viewer.report(), None);
    }
}
