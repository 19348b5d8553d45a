//! Receiver session loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{error, info, warn};

use kh_core::KhError;
use kh_core::codec::ZstdColorCodec;
use kh_core::console::{Console, parse_or_default};
use kh_core::stream::{ReceiverSocket, StreamClient};

use crate::config::ReceiverConfig;
use crate::viewer::FrameViewer;

// ── ReceiverApp ──────────────────────────────────────────────────

/// The top-level receiver: prompt for a sender, stream, repeat.
pub struct ReceiverApp {
    config: ReceiverConfig,
    running: Arc<AtomicBool>,
}

impl ReceiverApp {
    pub fn new(config: ReceiverConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Obtain a handle that can be used to stop the receiver.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run sessions until stopped or stdin closes.
    ///
    /// `sender` skips the prompts for the first session.
    pub async fn run(&self, mut sender: Option<SocketAddr>) -> Result<(), KhError> {
        self.running.store(true, Ordering::SeqCst);
        let mut console = Console::spawn();

        while self.running.load(Ordering::SeqCst) {
            let addr = match sender.take() {
                Some(addr) => addr,
                None => {
                    let answer = tokio::select! {
                        answer = self.prompt_sender(&mut console) => answer,
                        _ = wait_for_stop(&self.running) => None,
                    };
                    match answer {
                        Some(addr) => addr,
                        None => break,
                    }
                }
            };

            match self.session(addr).await {
                Ok(()) => info!("session with {addr} ended"),
                Err(e) => error!("session with {addr} failed: {e}"),
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("receiver stopped");
        Ok(())
    }

    /// Signal the receiver to stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the receiver is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn prompt_sender(&self, console: &mut Console) -> Option<SocketAddr> {
        let network = &self.config.network;
        let ip: IpAddr = loop {
            let default = network.address.as_str();
            let answer = console
                .ask(&format!("Enter an IP address to receive frames (default {default}): "))
                .await?;
            let answer = if answer.is_empty() { default } else { answer.as_str() };
            match answer.parse() {
                Ok(ip) => break ip,
                Err(e) => warn!("invalid IP address {answer:?}: {e}"),
            }
        };
        loop {
            let answer = console
                .ask(&format!("Enter a port number (default {}): ", network.port))
                .await?;
            match parse_or_default(&answer, network.port) {
                Ok(port) => return Some(SocketAddr::new(ip, port)),
                Err(e) => warn!("invalid port {answer:?}: {e}"),
            }
        }
    }

    /// One session: ping the sender and consume its stream.
    async fn session(&self, sender: SocketAddr) -> Result<(), KhError> {
        let socket = ReceiverSocket::connect(sender)?;
        info!("receiving from {sender} on {}", socket.local_addr()?);

        let mut client = StreamClient::new(
            socket,
            Box::new(ZstdColorCodec::default()),
            self.config.to_client_config(),
        );
        let client_stop = client.stop_handle();
        let viewer = FrameViewer::new(
            client.frame_receiver(),
            client.stats_receiver(),
            client.audio_receiver(),
            Duration::from_secs(self.config.viewer.report_interval_secs),
        );
        let viewer_task = tokio::spawn(viewer.run(Arc::clone(&client_stop)));

        let run = client.run();
        tokio::pin!(run);
        let finished = tokio::select! {
            result = &mut run => Some(result),
            _ = wait_for_stop(&self.running) => None,
        };
        let result = match finished {
            Some(result) => result,
            None => {
                client_stop.store(false, Ordering::SeqCst);
                run.await
            }
        };

        // A failed client leaves its flag set; the viewer must still end.
        client_stop.store(false, Ordering::SeqCst);
        let _ = viewer_task.await;
        result
    }
}

/// Resolves once `running` becomes false.
async fn wait_for_stop(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

// ── Tests ────────────────────────────────────────────────────────
