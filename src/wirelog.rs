//! Append-only JSON-lines archive of the wire event stream.

use crate::event::EventSink;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Sink half: hands serialized lines to the writer task. Sends never block
/// the event path; once the writer is gone they are silently discarded.
pub struct WireLog {
    tx: mpsc::UnboundedSender<String>,
}

impl EventSink for WireLog {
    fn handle(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }
}

/// Writer half: owns the file and drains the queue until shutdown.
pub struct WireLogWriter {
    path: PathBuf,
    rx: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
}

impl WireLog {
    #[must_use]
    pub fn new(path: PathBuf, cancel: CancellationToken) -> (WireLog, WireLogWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WireLog { tx }, WireLogWriter { path, rx, cancel })
    }
}

impl WireLogWriter {
    pub async fn run(mut self) {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir).await.ok();
            }
        }
        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(
                    "Cannot open wire log {}: {}. File logging disabled",
                    self.path.display(),
                    e
                );
                return;
            }
        };

        loop {
            let line = tokio::select! {
                line = self.rx.recv() => line,
                () = self.cancel.cancelled() => break,
            };
            let Some(line) = line else { break };
            if !self.write_line(&mut file, &line).await {
                return;
            }
        }

        // Shutdown: drain whatever is still queued before closing.
        while let Ok(line) = self.rx.try_recv() {
            if !self.write_line(&mut file, &line).await {
                return;
            }
        }
        file.flush().await.ok();
    }

    async fn write_line(&self, file: &mut tokio::fs::File, line: &str) -> bool {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        if let Err(e) = file.write_all(buf.as_bytes()).await {
            tracing::error!(
                "Write to wire log {} failed: {}. File logging disabled",
                self.path.display(),
                e
            );
            return false;
        }
        file.flush().await.is_ok()
    }
}
