use std::sync::{Arc, Mutex};

use tokio::sync::watch;

/// Cap on a single build's live log. Output beyond this is dropped with a
/// truncation marker so a runaway test cannot exhaust memory.
const MAX_LOG_BYTES: usize = 2 << 20;

const TRUNCATED_MARKER: &str = "\n... log truncated ...\n";

// ---------------------------------------------------------------------------
// LiveLog
// ---------------------------------------------------------------------------

/// Single-writer multi-reader streaming log buffer.
///
/// The owning build appends; any number of status-page readers follow along.
/// Readers observe appends in order and are woken through a watch channel
/// carrying the current length. Closing the log wakes all readers a final
/// time; a closed log accepts no further writes.
#[derive(Clone)]
pub struct LiveLog {
    inner: Arc<Mutex<Inner>>,
    len_tx: watch::Sender<usize>,
}

struct Inner {
    buf: Vec<u8>,
    truncated: bool,
    closed: bool,
}

impl LiveLog {
    pub fn new() -> Self {
        let (len_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buf: Vec::new(),
                truncated: false,
                closed: false,
            })),
            len_tx,
        }
    }

    /// Append bytes. Writes after close or beyond the size cap are dropped.
    pub fn write(&self, data: &[u8]) {
        let mut inner = self.inner.lock().expect("livelog lock poisoned");
        if inner.closed || inner.truncated {
            return;
        }
        if inner.buf.len() + data.len() > MAX_LOG_BYTES {
            let room = MAX_LOG_BYTES.saturating_sub(inner.buf.len());
            inner.buf.extend_from_slice(&data[..room]);
            inner.buf.extend_from_slice(TRUNCATED_MARKER.as_bytes());
            inner.truncated = true;
        } else {
            inner.buf.extend_from_slice(data);
        }
        let len = inner.buf.len();
        drop(inner);
        let _ = self.len_tx.send(len);
    }

    /// Append a line, adding the trailing newline.
    pub fn write_line(&self, line: &str) {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write(&data);
    }

    /// Close the log. Idempotent; wakes all readers.
    pub fn close(&self) {
        let len = {
            let mut inner = self.inner.lock().expect("livelog lock poisoned");
            inner.closed = true;
            inner.buf.len()
        };
        // send (not send_if_modified) so blocked readers always wake.
        let _ = self.len_tx.send(len);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("livelog lock poisoned").closed
    }

    /// Copy of the full contents so far.
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().expect("livelog lock poisoned").buf.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("livelog lock poisoned").buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A reader positioned at the start of the log.
    pub fn reader(&self) -> LiveLogReader {
        LiveLogReader {
            log: self.clone(),
            len_rx: self.len_tx.subscribe(),
            offset: 0,
        }
    }
}

impl Default for LiveLog {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// LiveLogReader
// ---------------------------------------------------------------------------

/// Cursor over a [`LiveLog`]. Each call to [`next_chunk`] returns bytes the
/// reader has not yet seen, waiting for more when caught up, and `None` once
/// the log is closed and fully drained.
///
/// [`next_chunk`]: LiveLogReader::next_chunk
pub struct LiveLogReader {
    log: LiveLog,
    len_rx: watch::Receiver<usize>,
    offset: usize,
}

impl LiveLogReader {
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        loop {
            {
                let inner = self.log.inner.lock().expect("livelog lock poisoned");
                if self.offset < inner.buf.len() {
                    let chunk = inner.buf[self.offset..].to_vec();
                    self.offset = inner.buf.len();
                    return Some(chunk);
                }
                if inner.closed {
                    return None;
                }
            }
            if self.len_rx.changed().await.is_err() {
                // Writer side gone; drain whatever is left.
                let inner = self.log.inner.lock().expect("livelog lock poisoned");
                if self.offset < inner.buf.len() {
                    let chunk = inner.buf[self.offset..].to_vec();
                    self.offset = inner.buf.len();
                    return Some(chunk);
                }
                return None;
            }
        }
    }
}
