//! Companion output capture.
//!
//! Each stream gets its own reader task. Lines are re-emitted through
//! `tracing`, checked for a port announcement, and kept in a bounded
//! buffer for diagnostics. Readers keep draining after discovery so the
//! companion never blocks on a full pipe.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::discovery::{parse_port_announcement, PortSignal};

/// Lines retained per stream.
pub const DEFAULT_CAPTURE_LINES: usize = 200;

/// Stream type (stdout or stderr)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Stdout => write!(f, "stdout"),
            StreamType::Stderr => write!(f, "stderr"),
        }
    }
}

/// Keeps the last N lines of a stream.
#[derive(Debug, Clone)]
pub struct OutputBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().cloned().collect()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }
}

/// Reader tasks plus the buffers they fill.
#[derive(Debug)]
pub struct OutputCapture {
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    readers: Vec<JoinHandle<()>>,
}

impl OutputCapture {
    /// Takes the child's piped stdout/stderr and starts reading them.
    pub fn attach(child: &mut Child, signal: PortSignal, capacity: usize) -> Self {
        let pid = child.id().unwrap_or(0);
        let stdout = OutputBuffer::new(capacity);
        let stderr = OutputBuffer::new(capacity);
        let mut readers = Vec::with_capacity(2);

        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, StreamType::Stdout, stdout.clone(), signal.clone(), pid));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, StreamType::Stderr, stderr.clone(), signal, pid));
        }

        Self {
            stdout,
            stderr,
            readers,
        }
    }

    pub fn stdout(&self) -> &OutputBuffer {
        &self.stdout
    }

    pub fn stderr(&self) -> &OutputBuffer {
        &self.stderr
    }

    /// Waits briefly for the readers to hit EOF, then aborts stragglers.
    ///
    /// Descendants that inherited the pipes can keep them open after the
    /// companion itself is gone.
    pub async fn finish(&mut self, limit: Duration) {
        for reader in self.readers.iter_mut() {
            if tokio::time::timeout(limit, &mut *reader).await.is_err() {
                reader.abort();
            }
        }
        self.readers.clear();
    }

    pub fn abort(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

impl Drop for OutputCapture {
    fn drop(&mut self) {
        self.abort();
    }
}

fn spawn_reader<R>(
    reader: R,
    stream: StreamType,
    buffer: OutputBuffer,
    signal: PortSignal,
    pid: u32,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::with_capacity(256);

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    debug!(target: "companion", pid, stream = %stream, "{}", line);

                    if !signal.is_resolved() {
                        if let Some(port) = parse_port_announcement(&line) {
                            if signal.offer(port) {
                                info!(pid, port, stream = %stream, "Companion announced port");
                            }
                        }
                    }

                    buffer.push(line);
                }
                Err(e) => {
                    warn!(pid, stream = %stream, error = %e, "Companion output read failed");
                    break;
                }
            }
        }

        debug!(pid, stream = %stream, "Companion output closed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_is_bounded() {
        let buffer = OutputBuffer::new(3);
        for i in 0..5 {
            buffer.push(format!("line {}", i));
        }
        assert_eq!(buffer.lines(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(buffer.text(), "line 2\nline 3\nline 4");
    }

    #[tokio::test]
    async fn test_reader_offers_first_port_only() {
        let (signal, rx) = PortSignal::new();
        let buffer = OutputBuffer::new(10);
        let input: &[u8] = b"booting\r\n{\"port\":1111}\n{\"port\":2222}\n";

        let reader = spawn_reader(input, StreamType::Stdout, buffer.clone(), signal, 0);
        reader.await.unwrap();

        assert_eq!(rx.await.unwrap(), 1111);
        assert_eq!(buffer.lines(), vec!["booting", "{\"port\":1111}", "{\"port\":2222}"]);
    }

    #[tokio::test]
    async fn test_reader_tolerates_invalid_utf8() {
        let (signal, rx) = PortSignal::new();
        let buffer = OutputBuffer::new(10);
        let input: &[u8] = b"\xff\xfe garbage\nserver started on 127.0.0.1:4242\n";

        spawn_reader(input, StreamType::Stderr, buffer.clone(), signal, 0)
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), 4242);
        assert_eq!(buffer.lines().len(), 2);
    }
}
