use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// A classified line of test process output.
#[derive(Debug, Clone, PartialEq)]
pub enum ScannerEvent {
    /// A `[head, payload]` JSON array with a string head.
    Tagged { head: String, payload: Value, line: String },
    /// Anything else, verbatim without the line terminator.
    Output(String),
    /// The process failed or exited.
    RunnerError(String),
}

/// Classify one line of output.
pub fn classify_line(line: &str) -> ScannerEvent {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Array(mut items)) if items.len() == 2 && items[0].is_string() => {
            let payload = items.pop().unwrap_or(Value::Null);
            let head = items.pop().and_then(|h| h.as_str().map(str::to_string)).unwrap_or_default();
            ScannerEvent::Tagged {
                head,
                payload,
                line: line.to_string(),
            }
        }
        _ => ScannerEvent::Output(line.to_string()),
    }
}

/// Splits a test process's stdout and stderr into [`ScannerEvent`]s.
///
/// The scanner owns the process. Once both streams are drained and the
/// process has exited, a final [`ScannerEvent::RunnerError`] carries the
/// exit code. Dropping or disposing the scanner kills the process.
pub struct OutputScanner {
    events: mpsc::UnboundedReceiver<ScannerEvent>,
    kill: Option<oneshot::Sender<()>>,
}

impl OutputScanner {
    /// Take ownership of a child spawned with piped stdout and stderr.
    pub fn new(mut child: Child) -> crate::Result<Self> {
        let stdout = child
            .stdout
            .take()
            .ok_or(crate::Error::StreamUnavailable("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(crate::Error::StreamUnavailable("stderr"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let readers = [
            spawn_reader(stdout, tx.clone()),
            spawn_reader(stderr, tx.clone()),
        ];
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(supervise(child, readers, kill_rx, tx));

        Ok(Self {
            events: rx,
            kill: Some(kill_tx),
        })
    }

    /// Scanner for a process that never started: its only event is the
    /// runner error carrying `message`.
    pub fn failed(message: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(ScannerEvent::RunnerError(message));
        Self::from_events(rx)
    }

    /// Scanner over events produced elsewhere, e.g. output relayed from a
    /// remote runner. Disposal only closes the channel.
    pub fn from_events(events: mpsc::UnboundedReceiver<ScannerEvent>) -> Self {
        Self { events, kill: None }
    }

    /// Next event, or `None` once every producer is gone.
    pub async fn next_event(&mut self) -> Option<ScannerEvent> {
        self.events.recv().await
    }

    /// Kill the process (best effort) and stop receiving events.
    pub fn dispose(&mut self) {
        if let Some(kill) = self.kill.take() {
            // The supervisor is gone when the process already exited
            let _ = kill.send(());
        }
        self.events.close();
    }
}

impl Drop for OutputScanner {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn spawn_reader<R>(stream: R, tx: mpsc::UnboundedSender<ScannerEvent>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if buf.ends_with(b"\n") {
                        buf.pop();
                        if buf.ends_with(b"\r") {
                            buf.pop();
                        }
                    }
                    let line = String::from_utf8_lossy(&buf);
                    let event = classify_line(&line);
                    tracing::debug!("scanner: {:?}", event);
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("scanner: stream read failed: {}", e);
                    break;
                }
            }
        }
    })
}

async fn supervise(
    mut child: Child,
    readers: [JoinHandle<()>; 2],
    mut kill: oneshot::Receiver<()>,
    tx: mpsc::UnboundedSender<ScannerEvent>,
) {
    let aborts = readers.each_ref().map(JoinHandle::abort_handle);

    let status = tokio::select! {
        status = child.wait() => status,
        _ = &mut kill => {
            if let Err(e) = child.start_kill() {
                tracing::debug!("scanner: kill ignored: {}", e);
            }
            let _ = child.wait().await;
            for abort in &aborts {
                abort.abort();
            }
            return;
        }
    };

    // A grandchild may keep a pipe open after the process exits
    let drained = async {
        for reader in readers {
            let _ = reader.await;
        }
    };
    tokio::select! {
        _ = drained => {
            let message = match status {
                Ok(status) => format!(
                    "Test process exited with code {}",
                    status.code().map(|c| c.to_string()).unwrap_or_else(|| "null".to_string())
                ),
                Err(e) => e.to_string(),
            };
            let _ = tx.send(ScannerEvent::RunnerError(message));
        }
        _ = kill => {
            for abort in &aborts {
                abort.abort();
            }
        }
    }
}
