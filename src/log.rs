use chrono::{DateTime, Local};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Lines kept in memory per service.
pub const RING_CAPACITY: usize = 1000;

/// Per-subscriber channel depth; publishes drop records for a subscriber
/// whose channel is full rather than block.
pub const SUBSCRIBER_BUFFER: usize = 100;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub service: String,
    pub line: String,
    pub timestamp: DateTime<Local>,
    pub stream: LogStream,
}

// ---------------------------------------------------------------------------
// RingBuffer
// ---------------------------------------------------------------------------

/// Fixed-capacity FIFO of log records. Full buffer evicts the oldest entry.
#[derive(Debug)]
pub struct RingBuffer {
    items: VecDeque<LogRecord>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn add(&mut self, record: LogRecord) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(record);
    }

    /// Ordered copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.items.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// ---------------------------------------------------------------------------
// LogBus
// ---------------------------------------------------------------------------

struct Subscriber {
    tx: mpsc::Sender<LogRecord>,
    /// Empty set means every service.
    filter: HashSet<String>,
}

struct BusInner {
    buffers: HashMap<String, RingBuffer>,
    subscribers: HashMap<u64, Subscriber>,
}

/// Collects child output into per-service ring buffers and fans records out
/// to subscribers. Clones share one bus. One lock guards both the buffer
/// map and the subscriber set; publish holds it only for the buffer append
/// and the non-blocking sends.
#[derive(Clone)]
pub struct LogBus {
    inner: Arc<RwLock<BusInner>>,
    next_id: Arc<AtomicU64>,
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBus {
    pub fn new() -> Self {
        LogBus {
            inner: Arc::new(RwLock::new(BusInner {
                buffers: HashMap::new(),
                subscribers: HashMap::new(),
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A sink capturing a service's stdout.
    pub fn writer(&self, service: &str) -> LogSink {
        LogSink {
            bus: self.clone(),
            service: service.to_string(),
            stream: LogStream::Stdout,
            partial: String::new(),
        }
    }

    /// A sink capturing a service's stderr.
    pub fn stderr_writer(&self, service: &str) -> LogSink {
        LogSink {
            bus: self.clone(),
            service: service.to_string(),
            stream: LogStream::Stderr,
            partial: String::new(),
        }
    }

    /// Buffer the record and hand it to every matching subscriber. A
    /// subscriber with a full channel misses this record.
    pub fn publish(&self, record: LogRecord) {
        let mut inner = self.inner.write().expect("log bus lock poisoned");

        inner
            .buffers
            .entry(record.service.clone())
            .or_insert_with(|| RingBuffer::new(RING_CAPACITY))
            .add(record.clone());

        for sub in inner.subscribers.values() {
            if sub.filter.is_empty() || sub.filter.contains(&record.service) {
                let _ = sub.tx.try_send(record.clone());
            }
        }
    }

    /// Register a subscription filtered to `services` (empty means all).
    pub fn subscribe(&self, services: &[String]) -> (u64, mpsc::Receiver<LogRecord>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.write().expect("log bus lock poisoned");
        inner.subscribers.insert(
            id,
            Subscriber {
                tx,
                filter: services.iter().cloned().collect(),
            },
        );
        (id, rx)
    }

    /// Drop a subscription; its channel closes once in-flight records drain.
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.write().expect("log bus lock poisoned");
        inner.subscribers.remove(&id);
    }

    /// The buffered lines of the named services, concatenated in the order
    /// given, trimmed to the last `count` records.
    pub fn lines(&self, services: &[String], count: usize) -> Vec<LogRecord> {
        let inner = self.inner.read().expect("log bus lock poisoned");

        let mut result: Vec<LogRecord> = Vec::new();
        for service in services {
            if let Some(buf) = inner.buffers.get(service) {
                result.extend(buf.snapshot());
            }
        }

        if result.len() > count {
            result.split_off(result.len() - count)
        } else {
            result
        }
    }
}

// ---------------------------------------------------------------------------
// LogSink
// ---------------------------------------------------------------------------

/// Byte sink for one service stream. Splits input on newlines, publishing a
/// record per complete line and buffering a trailing partial line until its
/// newline arrives. Blank lines are dropped.
pub struct LogSink {
    bus: LogBus,
    service: String,
    stream: LogStream,
    partial: String,
}

impl LogSink {
    pub fn write(&mut self, chunk: &[u8]) {
        self.partial.push_str(&String::from_utf8_lossy(chunk));

        while let Some(idx) = self.partial.find('\n') {
            let line: String = self.partial.drain(..=idx).collect();
            let line = line.trim_end_matches('\n');
            if line.is_empty() {
                continue;
            }
            self.bus.publish(LogRecord {
                service: self.service.clone(),
                line: line.to_string(),
                timestamp: Local::now(),
                stream: self.stream,
            });
        }
    }
}
