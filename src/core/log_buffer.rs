//! Circular log buffer for storing process output

use chrono::Local;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// Default number of lines kept per process.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Thread-safe circular buffer of log lines.
///
/// One buffer exists per catalog process for the lifetime of the manager. The
/// PTY reader thread writes into it while the UI reads snapshots, so all
/// access goes through a short internal critical section. Eviction of the
/// oldest line is silent.
#[derive(Debug)]
pub struct LogBuffer {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    /// Create a buffer that keeps at most `capacity` lines.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_BUFFER_CAPACITY
        } else {
            capacity
        };
        Self {
            inner: Mutex::new(Inner {
                lines: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Append a single line, evicting the oldest when full.
    pub fn write_line(&self, line: &str) {
        let mut inner = self.inner.lock();
        if inner.lines.len() >= inner.capacity {
            inner.lines.pop_front();
        }
        inner.lines.push_back(line.to_string());
    }

    /// Split `bytes` on newlines and append each line with a `[HH:MM:SS]`
    /// timestamp. This is the sink the PTY reader feeds raw chunks into.
    pub fn write_bytes(&self, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let mut lines: Vec<&str> = text.split('\n').collect();
        // A trailing newline leaves an empty final segment, not a line.
        if lines.last() == Some(&"") {
            lines.pop();
        }
        for line in lines {
            let line = line.trim_end_matches('\r');
            let ts = Local::now().format("%H:%M:%S");
            self.write_line(&format!("[{}] {}", ts, line));
        }
    }

    /// Snapshot of all lines in insertion order.
    pub fn all(&self) -> Vec<String> {
        self.inner.lock().lines.iter().cloned().collect()
    }

    /// Last `n` lines in insertion order. `n <= 0` or `n` past the count
    /// returns everything.
    pub fn last(&self, n: isize) -> Vec<String> {
        let inner = self.inner.lock();
        let count = inner.lines.len();
        let n = if n <= 0 || n as usize > count {
            count
        } else {
            n as usize
        };
        inner.lines.iter().skip(count - n).cloned().collect()
    }

    /// Number of lines currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    /// Whether the buffer holds no lines.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().lines.is_empty()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY)
    }
}
