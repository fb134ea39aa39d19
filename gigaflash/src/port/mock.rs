//! Scripted in-memory port for tests.

use crate::error::Result;
use crate::port::Port;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Bytes written by the code under test, shared with the test body.
pub(crate) type Transcript = Arc<Mutex<Vec<u8>>>;

/// A port that answers each written line with the next scripted reply.
///
/// Replies are released only after a `\n` is written, so a test can check
/// that the code under test never reads ahead of its own commands. Once the
/// script runs out, reads time out.
pub(crate) struct MockPort {
    timeout: Duration,
    replies: VecDeque<Vec<u8>>,
    rx: VecDeque<u8>,
    tx: Transcript,
    pub(crate) closed: Arc<Mutex<bool>>,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            replies: VecDeque::new(),
            rx: VecDeque::new(),
            tx: Arc::default(),
            closed: Arc::default(),
        }
    }

    /// Queue a raw reply for the next command line.
    pub(crate) fn reply(mut self, bytes: &[u8]) -> Self {
        self.replies.push_back(bytes.to_vec());
        self
    }

    /// Queue a CRLF-terminated reply line.
    pub(crate) fn reply_line(self, line: &str) -> Self {
        self.reply(format!("{line}\r\n").as_bytes())
    }

    pub(crate) fn transcript(&self) -> Transcript {
        Arc::clone(&self.tx)
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if *self.closed.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timed out"));
        }
        let n = buf.len().min(self.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.rx.pop_front().unwrap_or_default();
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if *self.closed.lock().unwrap() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "port closed"));
        }
        self.tx.lock().unwrap().extend_from_slice(buf);
        for _ in buf.iter().filter(|&&b| b == b'\n') {
            if let Some(reply) = self.replies.pop_front() {
                self.rx.extend(reply);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

impl Drop for MockPort {
    fn drop(&mut self) {
        *self.closed.lock().unwrap() = true;
    }
}
