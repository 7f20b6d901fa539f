//! Bounded FIFO with drop-oldest and drop telemetry, plus the replay buffer
//! built on top of it. Producers never block and never fail: when a queue is
//! full the front item is discarded and the drop is recorded.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::clock::{default_clock, ClockFn};
use crate::error::{ControlError, Result};
use crate::event::Envelope;

/// Why an item was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    Capacity,
    TtlExpired,
}

/// Telemetry for dropped items. Lives inside the queue mutex.
#[derive(Debug, Clone, Default)]
pub struct DropMetrics {
    pub total_dropped: u64,
    pub drops_since_last_read: u64,
    pub last_drop_time: f64,
    pub last_drop_reason: Option<DropReason>,
}

impl DropMetrics {
    fn record(&mut self, reason: DropReason, now: f64) {
        self.total_dropped += 1;
        self.drops_since_last_read += 1;
        self.last_drop_time = now;
        self.last_drop_reason = Some(reason);
    }
}

/// Snapshot returned by [`BoundedQueue::telemetry`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueTelemetry {
    pub name: String,
    pub size: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub total_dropped: u64,
    pub recent_drops: u64,
    pub last_drop_time: f64,
    pub last_drop_reason: Option<DropReason>,
}

struct Inner<T> {
    items: VecDeque<T>,
    metrics: DropMetrics,
}

/// Fixed-capacity FIFO with drop-oldest overflow. All operations are atomic
/// under one per-queue mutex and none of them suspends.
pub struct BoundedQueue<T> {
    name: String,
    maxsize: usize,
    inner: Mutex<Inner<T>>,
    clock: ClockFn,
}

impl<T> BoundedQueue<T> {
    pub fn new(maxsize: usize, name: &str) -> Result<Self> {
        Self::with_clock(maxsize, name, default_clock())
    }

    pub(crate) fn with_clock(maxsize: usize, name: &str, clock: ClockFn) -> Result<Self> {
        if maxsize == 0 {
            return Err(ControlError::Config("queue capacity must be positive".into()));
        }
        Ok(Self {
            name: name.to_string(),
            maxsize,
            inner: Mutex::new(Inner { items: VecDeque::with_capacity(maxsize), metrics: DropMetrics::default() }),
            clock,
        })
    }

    /// Append an item. If the queue is full the oldest item is discarded and
    /// recorded as a `capacity` drop. Never blocks, never rejects.
    pub fn put(&self, item: T) {
        let mut g = self.inner.lock().expect("queue mutex");
        if g.items.len() == self.maxsize {
            g.items.pop_front();
            let now = (self.clock)();
            g.metrics.record(DropReason::Capacity, now);
        }
        g.items.push_back(item);
    }

    /// Remove and return the front item, or None when empty.
    pub fn get(&self) -> Option<T> {
        self.inner.lock().expect("queue mutex").items.pop_front()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("queue mutex").items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.maxsize
    }

    pub fn capacity(&self) -> usize {
        self.maxsize
    }

    /// Remove all items; returns how many were removed. Drop counters keep
    /// their values; clearing is not a drop.
    pub fn clear(&self) -> usize {
        let mut g = self.inner.lock().expect("queue mutex");
        let n = g.items.len();
        g.items.clear();
        n
    }

    /// Remove and return all items in FIFO order.
    pub fn drain(&self) -> Vec<T> {
        let mut g = self.inner.lock().expect("queue mutex");
        g.items.drain(..).collect()
    }

    /// Read and reset the "drops since last read" counter.
    pub fn read_recent_drops(&self) -> u64 {
        let mut g = self.inner.lock().expect("queue mutex");
        let n = g.metrics.drops_since_last_read;
        g.metrics.drops_since_last_read = 0;
        n
    }

    pub fn telemetry(&self) -> QueueTelemetry {
        let g = self.inner.lock().expect("queue mutex");
        QueueTelemetry {
            name: self.name.clone(),
            size: g.items.len(),
            capacity: self.maxsize,
            utilization: g.items.len() as f64 / self.maxsize as f64,
            total_dropped: g.metrics.total_dropped,
            recent_drops: g.metrics.drops_since_last_read,
            last_drop_time: g.metrics.last_drop_time,
            last_drop_reason: g.metrics.last_drop_reason,
        }
    }

    /// Pop from the front while `pred` holds, recording each removal as a drop
    /// with the given reason. Used by TTL pruning.
    fn prune_front_while(&self, reason: DropReason, pred: impl Fn(&T) -> bool) {
        let mut g = self.inner.lock().expect("queue mutex");
        let now = (self.clock)();
        while let Some(front) = g.items.front() {
            if !pred(front) {
                break;
            }
            g.items.pop_front();
            g.metrics.record(reason, now);
        }
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Front item without removing it.
    pub fn peek(&self) -> Option<T> {
        self.inner.lock().expect("queue mutex").items.front().cloned()
    }

    /// Copy of the current contents in FIFO order.
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().expect("queue mutex").items.iter().cloned().collect()
    }
}

/// One retained envelope, stamped with the monotonic instant it was buffered.
#[derive(Debug, Clone)]
pub struct ReplayRecord {
    pub seq: u64,
    pub envelope: Envelope,
    pub timestamp: f64,
}

/// Sequence-indexed history of outbound envelopes, bounded by capacity
/// (drop-oldest) and by TTL. Backs reconnect-without-loss on the push channel.
pub struct ReplayBuffer {
    queue: BoundedQueue<ReplayRecord>,
    ttl_seconds: f64,
    clock: ClockFn,
}

impl ReplayBuffer {
    /// `ttl_seconds == 0.0` disables TTL pruning.
    pub fn new(maxsize: usize, ttl_seconds: f64) -> Result<Self> {
        Self::with_clock(maxsize, ttl_seconds, default_clock())
    }

    pub(crate) fn with_clock(maxsize: usize, ttl_seconds: f64, clock: ClockFn) -> Result<Self> {
        let queue = BoundedQueue::with_clock(maxsize, "replay_buffer", clock.clone())?;
        Ok(Self { queue, ttl_seconds, clock })
    }

    /// Prune expired records, then buffer the envelope stamped with now.
    pub fn add(&self, seq: u64, envelope: Envelope) {
        self.prune_expired();
        let timestamp = (self.clock)();
        self.queue.put(ReplayRecord { seq, envelope, timestamp });
    }

    /// Envelopes with `seq > last_seq`, in insertion order, after pruning.
    pub fn get_after(&self, last_seq: u64) -> Vec<Envelope> {
        self.prune_expired();
        self.queue
            .snapshot()
            .into_iter()
            .filter(|r| r.seq > last_seq)
            .map(|r| r.envelope)
            .collect()
    }

    pub fn telemetry(&self) -> QueueTelemetry {
        self.queue.telemetry()
    }

    pub fn size(&self) -> usize {
        self.queue.size()
    }

    fn prune_expired(&self) {
        if self.ttl_seconds <= 0.0 {
            return;
        }
        let cutoff = (self.clock)() - self.ttl_seconds;
        self.queue.prune_front_while(DropReason::TtlExpired, |r| r.timestamp < cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, EventStamper};
    use std::sync::{Arc, Mutex};

    fn manual_clock(start: f64) -> (Arc<Mutex<f64>>, ClockFn) {
        let t = Arc::new(Mutex::new(start));
        let clock: ClockFn = {
            let t = t.clone();
            Arc::new(move || *t.lock().unwrap())
        };
        (t, clock)
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            BoundedQueue::<u32>::new(0, "bad"),
            Err(ControlError::Config(_))
        ));
    }

    #[test]
    fn fifo_put_get() {
        let q = BoundedQueue::new(3, "t").unwrap();
        q.put("a");
        q.put("b");
        assert_eq!(q.size(), 2);
        assert_eq!(q.peek(), Some("a"));
        assert_eq!(q.get(), Some("a"));
        assert_eq!(q.get(), Some("b"));
        assert_eq!(q.get(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn drop_oldest_records_capacity_drop() {
        let q = BoundedQueue::new(2, "t").unwrap();
        q.put("a");
        q.put("b");
        assert!(q.is_full());
        q.put("c");

        let t = q.telemetry();
        assert_eq!(t.total_dropped, 1);
        assert_eq!(t.last_drop_reason, Some(DropReason::Capacity));
        assert!(t.last_drop_time > 0.0);
        assert_eq!(q.drain(), vec!["b", "c"]);
    }

    #[test]
    fn recent_drops_reads_and_resets() {
        let q = BoundedQueue::new(1, "t").unwrap();
        q.put(1);
        q.put(2);
        q.put(3);
        assert_eq!(q.read_recent_drops(), 2);
        assert_eq!(q.read_recent_drops(), 0);
        assert_eq!(q.telemetry().total_dropped, 2);
    }

    #[test]
    fn clear_is_not_a_drop() {
        let q = BoundedQueue::new(2, "t").unwrap();
        q.put(1);
        q.put(2);
        assert_eq!(q.clear(), 2);
        assert_eq!(q.telemetry().total_dropped, 0);
        assert!(q.is_empty());
    }

    #[test]
    fn telemetry_shape() {
        let q = BoundedQueue::new(4, "inbox").unwrap();
        q.put(1);
        let t = q.telemetry();
        assert_eq!(t.name, "inbox");
        assert_eq!(t.size, 1);
        assert_eq!(t.capacity, 4);
        assert!((t.utilization - 0.25).abs() < 1e-9);
    }

    fn envelope(seq: u64) -> Envelope {
        // Payload content is irrelevant for buffer behavior.
        let mut stamper = EventStamper::new();
        let mut env = stamper.stamp(EventPayload::PartialEn { text: format!("m{seq}") });
        env.seq = seq;
        env
    }

    #[test]
    fn replay_returns_after_last_seq_in_order() {
        let (_, clock) = manual_clock(100.0);
        let buf = ReplayBuffer::with_clock(5, 10.0, clock).unwrap();
        for seq in 1..=3 {
            buf.add(seq, envelope(seq));
        }
        let got = buf.get_after(1);
        assert_eq!(got.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn replay_ttl_expires_everything() {
        let (t, clock) = manual_clock(100.0);
        let buf = ReplayBuffer::with_clock(5, 10.0, clock).unwrap();
        for seq in 1..=3 {
            buf.add(seq, envelope(seq));
        }
        *t.lock().unwrap() = 113.0;
        assert!(buf.get_after(0).is_empty());
        let telemetry = buf.telemetry();
        assert_eq!(telemetry.total_dropped, 3);
        assert_eq!(telemetry.last_drop_reason, Some(DropReason::TtlExpired));
    }

    #[test]
    fn replay_zero_ttl_never_expires() {
        let (t, clock) = manual_clock(0.0);
        let buf = ReplayBuffer::with_clock(5, 0.0, clock).unwrap();
        buf.add(1, envelope(1));
        *t.lock().unwrap() = 1e9;
        assert_eq!(buf.get_after(0).len(), 1);
    }

    #[test]
    fn replay_capacity_uses_drop_oldest() {
        let (_, clock) = manual_clock(0.0);
        let buf = ReplayBuffer::with_clock(2, 0.0, clock).unwrap();
        for seq in 1..=4 {
            buf.add(seq, envelope(seq));
        }
        assert_eq!(
            buf.get_after(0).iter().map(|e| e.seq).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(buf.telemetry().total_dropped, 2);
    }
}
