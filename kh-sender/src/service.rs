//! Sender session loop.
//!
//! Each session binds the chosen port, waits for a receiver's ping,
//! picks a fresh session id and streams until the session fails or the
//! process is stopped. Failures are logged and lead back to the port
//! prompt.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{error, info, warn};

use kh_core::KhError;
use kh_core::codec::ZstdColorCodec;
use kh_core::console::{Console, parse_or_default};
use kh_core::stream::{
    AudioSource, SenderListener, StreamService, SyntheticCamera, ToneSource, new_session_id,
};

use crate::config::SenderConfig;

// ── SenderApp ────────────────────────────────────────────────────

/// The top-level sender: prompt, session, repeat.
pub struct SenderApp {
    config: SenderConfig,
    running: Arc<AtomicBool>,
}

impl SenderApp {
    pub fn new(config: SenderConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the sender from another
    /// task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run sessions until stopped or stdin closes.
    ///
    /// `port` skips the prompt for the first session.
    pub async fn run(&self, mut port: Option<u16>) -> Result<(), KhError> {
        self.running.store(true, Ordering::SeqCst);
        let mut console = Console::spawn();
        let mut rng = StdRng::from_os_rng();

        while self.running.load(Ordering::SeqCst) {
            let chosen = match port.take() {
                Some(port) => port,
                None => {
                    let answer = tokio::select! {
                        answer = self.prompt_port(&mut console) => answer,
                        _ = wait_for_stop(&self.running) => None,
                    };
                    match answer {
                        Some(port) => port,
                        None => break,
                    }
                }
            };

            match self.session(chosen, &mut rng).await {
                Ok(()) => info!("session on port {chosen} ended"),
                Err(e) => error!("session on port {chosen} failed: {e}"),
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("sender stopped");
        Ok(())
    }

    /// Signal the sender to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the sender is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn prompt_port(&self, console: &mut Console) -> Option<u16> {
        let default = self.config.network.port;
        loop {
            let answer = console
                .ask(&format!("Enter a port number to start sending frames (default {default}): "))
                .await?;
            match parse_or_default(&answer, default) {
                Ok(port) => return Some(port),
                Err(e) => warn!("invalid port {answer:?}: {e}"),
            }
        }
    }

    /// One session: bind, wait for a ping, stream.
    async fn session(&self, port: u16, rng: &mut StdRng) -> Result<(), KhError> {
        let listener = SenderListener::bind_port(port)?;
        info!("waiting for a receiver on {}", listener.local_addr()?);

        let socket = tokio::select! {
            socket = listener.accept() => socket?,
            _ = wait_for_stop(&self.running) => return Ok(()),
        };

        let session_id = new_session_id(rng);
        let service = StreamService::new(socket, session_id, self.config.to_service_config());

        let camera = SyntheticCamera::new(
            self.config.calibration(),
            self.config.camera.capture_rate,
            self.config.camera.seed,
        )
        .with_noise(self.config.camera.jitter_mm, self.config.camera.dropout_rate);
        let color = ZstdColorCodec::new(self.config.codec.color_level);
        let audio: Option<Box<dyn AudioSource>> = self
            .config
            .audio
            .enabled
            .then(|| Box::new(ToneSource::new(self.config.audio.tone_hz)) as Box<dyn AudioSource>);

        let run = service.run(Box::new(camera), Box::new(color), audio);
        tokio::pin!(run);
        let finished = tokio::select! {
            result = &mut run => Some(result),
            _ = wait_for_stop(&self.running) => None,
        };
        match finished {
            Some(result) => result,
            None => {
                service.stop();
                run.await
            }
        }
    }
}

/// Resolves once `running` becomes false.
async fn wait_for_stop(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_creates_with_defaults() {
        let app = SenderApp::new(SenderConfig::default());
        assert!(!app.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let app = SenderApp::new(SenderConfig::default());
        let handle = app.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(app.is_running());
        app.stop();
        assert!(!app.is_running());
    }

    #[tokio::test]
    async fn stop_while_waiting_for_receiver() {
        let app = Arc::new(SenderApp::new(SenderConfig::default()));
        let handle = app.stop_handle();
        let task = tokio::spawn({
            let app = Arc::clone(&app);
            async move { app.run(Some(0)).await }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("timeout")
            .unwrap()
            .unwrap();
    }
}
