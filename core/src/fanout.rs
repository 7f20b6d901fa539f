//! Subscriber registry and broadcast. Each subscriber is a bounded outbound
//! queue drained by its own connection handler; broadcast walks a snapshot of
//! the channel's subscribers and uses non-blocking sends, so one slow or dead
//! connection can never stall the pump or its neighbors. Any failed send
//! evicts that subscriber.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::event::{Envelope, EventPayload};

/// Reserved channel for download progress events not tied to any session.
pub const DOWNLOAD_CHANNEL: &str = "_download";

/// Outbound frames buffered per subscriber before it is considered stuck.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Handle returned to a connection handler: drain `rx` and push frames to the
/// peer; drop it (or let the hub evict you) to unsubscribe.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<String>,
}

/// Set of push connections per channel (session id or `_download`).
pub struct SubscriberHub {
    channels: DashMap<String, Vec<Slot>>,
    next_id: AtomicU64,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self { channels: DashMap::new(), next_id: AtomicU64::new(1) }
    }

    /// Register a subscriber on `channel`. The hello frame is queued first so
    /// the connection always opens with `{type: hello, sid}`.
    pub fn subscribe(&self, channel: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let hello = EventPayload::Hello { sid: channel.to_string() };
        if let Ok(frame) = serde_json::to_string(&hello) {
            let _ = tx.try_send(frame);
        }
        self.channels.entry(channel.to_string()).or_default().push(Slot { id, tx });
        Subscription { id, rx }
    }

    /// Remove one subscriber; drops its sender so the handler's drain ends.
    pub fn unsubscribe(&self, channel: &str, id: u64) {
        if let Some(mut slots) = self.channels.get_mut(channel) {
            slots.retain(|s| s.id != id);
        }
        self.channels.remove_if(channel, |_, slots| slots.is_empty());
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|s| s.len()).unwrap_or(0)
    }

    /// Broadcast a pre-serialized frame. Failed subscribers (full queue or
    /// closed connection) are evicted; failures never reach the caller.
    pub fn broadcast(&self, channel: &str, frame: &str) {
        // Snapshot the senders so no lock is held across sends.
        let targets: Vec<(u64, mpsc::Sender<String>)> = match self.channels.get(channel) {
            Some(slots) => slots.iter().map(|s| (s.id, s.tx.clone())).collect(),
            None => return,
        };

        let mut evict = Vec::new();
        for (id, tx) in targets {
            if tx.try_send(frame.to_string()).is_err() {
                evict.push(id);
            }
        }
        if !evict.is_empty() {
            eprintln!(
                "[LiveCap] dropping {} slow/dead subscriber(s) on channel {channel}",
                evict.len()
            );
            if let Some(mut slots) = self.channels.get_mut(channel) {
                slots.retain(|s| !evict.contains(&s.id));
            }
        }
    }

    /// Serialize once, then broadcast.
    pub fn broadcast_envelope(&self, channel: &str, env: &Envelope) {
        match serde_json::to_string(env) {
            Ok(frame) => self.broadcast(channel, &frame),
            Err(e) => eprintln!("[LiveCap] failed to serialize envelope: {e}"),
        }
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, EventStamper};

    #[test]
    fn hello_is_first_frame() {
        let hub = SubscriberHub::new();
        let mut sub = hub.subscribe("sess-1");
        let hello = sub.rx.try_recv().unwrap();
        let v: serde_json::Value = serde_json::from_str(&hello).unwrap();
        assert_eq!(v["type"], "hello");
        assert_eq!(v["sid"], "sess-1");
    }

    #[test]
    fn broadcast_reaches_all_subscribers_in_order() {
        let hub = SubscriberHub::new();
        let mut a = hub.subscribe("s");
        let mut b = hub.subscribe("s");
        a.rx.try_recv().unwrap();
        b.rx.try_recv().unwrap();

        hub.broadcast("s", "one");
        hub.broadcast("s", "two");
        for sub in [&mut a, &mut b] {
            assert_eq!(sub.rx.try_recv().unwrap(), "one");
            assert_eq!(sub.rx.try_recv().unwrap(), "two");
        }
    }

    #[test]
    fn dead_subscriber_is_evicted_without_affecting_others() {
        let hub = SubscriberHub::new();
        let mut alive = hub.subscribe("s");
        let dead = hub.subscribe("s");
        alive.rx.try_recv().unwrap();
        drop(dead.rx);
        assert_eq!(hub.subscriber_count("s"), 2);

        hub.broadcast("s", "ping");
        assert_eq!(hub.subscriber_count("s"), 1);
        assert_eq!(alive.rx.try_recv().unwrap(), "ping");
    }

    #[test]
    fn slow_subscriber_is_evicted_when_buffer_fills() {
        let hub = SubscriberHub::new();
        let _stuck = hub.subscribe("s");
        // Never drained: the hello frame plus SUBSCRIBER_BUFFER - 1 sends fill it.
        for i in 0..SUBSCRIBER_BUFFER {
            hub.broadcast("s", &format!("frame {i}"));
        }
        assert_eq!(hub.subscriber_count("s"), 0);
    }

    #[test]
    fn unsubscribe_removes_channel_when_empty() {
        let hub = SubscriberHub::new();
        let sub = hub.subscribe("s");
        hub.unsubscribe("s", sub.id);
        assert_eq!(hub.subscriber_count("s"), 0);
        // Broadcast to a gone channel is a no-op.
        hub.broadcast("s", "frame");
    }

    #[test]
    fn broadcast_envelope_serializes_flat() {
        let hub = SubscriberHub::new();
        let mut sub = hub.subscribe("s");
        sub.rx.try_recv().unwrap();

        let mut stamper = EventStamper::new();
        let env = stamper.stamp(EventPayload::Vu { rms: 0.1, peak: 0.4 });
        hub.broadcast_envelope("s", &env);

        let frame = sub.rx.try_recv().unwrap();
        let v: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "vu");
        assert_eq!(v["seq"], 1);
    }
}
