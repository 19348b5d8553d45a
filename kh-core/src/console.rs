//! Interactive prompts on stdin for the binaries.
//!
//! Lines are read on a dedicated thread so an unanswered prompt never
//! holds up runtime shutdown.

use std::io::Write;
use std::str::FromStr;

use tokio::sync::mpsc;
use tracing::warn;

/// Line-oriented console input.
pub struct Console {
    lines: mpsc::UnboundedReceiver<String>,
}

impl Console {
    /// Start reading stdin in the background.
    pub fn spawn() -> Self {
        let (tx, lines) = mpsc::unbounded_channel();
        let reader = std::thread::Builder::new()
            .name("stdin".into())
            .spawn(move || {
                for line in std::io::stdin().lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        if let Err(e) = reader {
            warn!("cannot read from stdin: {e}");
        }
        Self { lines }
    }

    /// Print `question` and wait for the next line. `None` once stdin
    /// is closed.
    pub async fn ask(&mut self, question: &str) -> Option<String> {
        print!("{question}");
        let _ = std::io::stdout().flush();
        self.lines.recv().await.map(|line| line.trim().to_string())
    }
}

/// Parse `input`, taking `default` for an empty answer.
pub fn parse_or_default<T: FromStr>(input: &str, default: T) -> Result<T, T::Err> {
    let input = input.trim();
    if input.is_empty() {
        Ok(default)
    } else {
        input.parse()
    }
}
