//! Subprocess-to-stream bridge for live service logs.
//!
//! A log-tailing subprocess is spawned per request. A dedicated reader task
//! pushes each stdout line into a bounded queue; the queue closing is the only
//! end-of-stream signal, reached either when the caller cancels or when the
//! subprocess output ends.

use log::{debug, warn};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use super::runner::display_command;
use super::{ProviderError, ProviderResult};

/// Caller side of a stream's cancellation.
///
/// Cancelling is idempotent, and dropping the handle cancels as well.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even when every signal is gone
        self.tx.send_replace(true);
    }
}

/// Observer side of a stream's cancellation
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolves once cancellation is requested or the handle is dropped
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Create a linked cancellation handle and signal
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Lazily produced, non-restartable sequence of log lines
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::Receiver<String>,
    cancel: CancelSignal,
}

impl LogStream {
    /// Next line, or `None` once the stream has ended or been cancelled.
    ///
    /// Lines already queued when cancellation fires are not delivered.
    pub async fn next_line(&mut self) -> Option<String> {
        if self.cancel.is_cancelled() {
            self.rx.close();
            return None;
        }
        self.rx.recv().await
    }
}

/// One output line without its terminator. Invalid UTF-8 is replaced
/// rather than ending the stream.
fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

/// Spawn `command` and bridge its stdout into a [`LogStream`].
///
/// Fails immediately if the subprocess cannot be started.
pub fn spawn_line_stream(
    mut command: Command,
    cancel: CancelSignal,
    capacity: usize,
    label: String,
) -> ProviderResult<LogStream> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let program = command.as_std().get_program().to_string_lossy().to_string();
    let args: Vec<String> = command
        .as_std()
        .get_args()
        .map(|a| a.to_string_lossy().to_string())
        .collect();
    let command_line = display_command(&program, &args);

    debug!("Starting log stream for {}: {}", label, command_line);
    let mut child = command
        .spawn()
        .map_err(|e| ProviderError::execution(command_line.clone(), format!("failed to start: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProviderError::execution(command_line, "failed to capture stdout"))?;

    let (tx, rx) = mpsc::channel(capacity.max(1));
    let mut reader_cancel = cancel.clone();

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).split(b'\n');
        let mut cancelled = false;

        loop {
            tokio::select! {
                biased;
                _ = reader_cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = tx.closed() => {
                    debug!("Log consumer for {} went away", label);
                    cancelled = true;
                    break;
                }
                segment = lines.next_segment() => match segment {
                    Ok(Some(bytes)) => {
                        let line = decode_line(&bytes);
                        tokio::select! {
                            biased;
                            _ = reader_cancel.cancelled() => {
                                cancelled = true;
                                break;
                            }
                            sent = tx.send(line) => {
                                if sent.is_err() {
                                    debug!("Log consumer for {} went away", label);
                                    cancelled = true;
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Failed reading log output for {}: {}", label, e);
                        break;
                    }
                }
            }
        }

        drop(tx);

        if cancelled {
            debug!("Log stream for {} cancelled", label);
            if let Err(e) = child.start_kill() {
                debug!("Log process for {} already gone: {}", label, e);
            }
        } else {
            debug!("Log stream for {} ended", label);
        }
        if let Err(e) = child.wait().await {
            warn!("Failed to reap log process for {}: {}", label, e);
        }
    });

    Ok(LogStream { rx, cancel })
}
