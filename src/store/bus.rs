//! Event fan-out: one bounded broadcast channel per Kind, subscribers
//! filtered by namespace.
//!
//! Publishing never blocks. A subscriber that falls more than
//! [`WATCH_QUEUE_DEPTH`] events behind loses the oldest ones; it observes
//! no error, only a gap in the resourceVersion sequence. Per-Kind delivery
//! order matches commit order because backends publish under their write
//! lock.

use std::collections::VecDeque;

use dashmap::DashMap;
use tokio::sync::broadcast;

use super::ResourceEvent;
use crate::resources::Gvk;

/// Bound on each subscriber's event queue.
pub const WATCH_QUEUE_DEPTH: usize = 100;

/// Per-Kind broadcast registry shared by a store and all its watchers.
pub struct EventBus {
    channels: DashMap<String, broadcast::Sender<ResourceEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender(&self, gvk: &Gvk) -> broadcast::Sender<ResourceEvent> {
        self.channels
            .entry(gvk.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_QUEUE_DEPTH).0)
            .clone()
    }

    /// Publish an event to every current subscriber of its Kind.
    /// A send with no subscribers is not an error.
    pub fn publish(&self, event: ResourceEvent) {
        let _ = self.sender(&event.gvk).send(event);
    }

    /// Subscribe to a Kind, optionally scoped to one namespace. The
    /// handle first yields `pending` (the subscribe-time Bookmark), then
    /// live events.
    pub fn subscribe(&self, gvk: &Gvk, namespace: &str, pending: ResourceEvent) -> WatchHandle {
        let rx = self.sender(gvk).subscribe();
        WatchHandle {
            rx: Some(rx),
            namespace: namespace.to_string(),
            pending: VecDeque::from([pending]),
        }
    }

    /// Drop every channel, ending all subscriptions. Any event still
    /// queued for a subscriber is delivered before its stream closes.
    pub fn shutdown(&self) {
        self.channels.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscription. Owns its queue; closing (or dropping) releases
/// it. Closing twice is a no-op.
pub struct WatchHandle {
    rx: Option<broadcast::Receiver<ResourceEvent>>,
    namespace: String,
    pending: VecDeque<ResourceEvent>,
}

impl WatchHandle {
    /// Receive the next event, blocking until one arrives or the
    /// subscription ends. Returns `None` once the store has shut down or
    /// the handle was closed.
    pub async fn recv(&mut self) -> Option<ResourceEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        let namespace = self.namespace.clone();
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if Self::matches_namespace(&namespace, &event) {
                        return Some(event);
                    }
                }
                // Oldest events were dropped under backpressure; the
                // subscriber just sees a resourceVersion gap.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Non-blocking variant; returns `None` when no event is ready.
    pub fn try_recv(&mut self) -> Option<ResourceEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        let namespace = self.namespace.clone();
        let rx = self.rx.as_mut()?;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    if Self::matches_namespace(&namespace, &event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    fn matches_namespace(namespace: &str, event: &ResourceEvent) -> bool {
        namespace.is_empty() || event.namespace == namespace
    }

    /// End the subscription and release its queue.
    pub fn close(&mut self) {
        self.rx = None;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{Gvk, Pod, Resource};
    use crate::store::EventType;

    fn pod_event(name: &str, namespace: &str, version: u64) -> ResourceEvent {
        ResourceEvent::added(
            Resource::Pod(Pod::new(name, namespace)),
            version.to_string(),
        )
    }

    #[tokio::test]
    async fn test_bookmark_then_live_events() {
        let bus = EventBus::new();
        let bookmark = ResourceEvent::bookmark(Gvk::pod(), "7".to_string());
        let mut handle = bus.subscribe(&Gvk::pod(), "", bookmark);

        bus.publish(pod_event("a", "default", 8));

        let first = handle.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::Bookmark);
        assert_eq!(first.resource_version, "7");

        let second = handle.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::Added);
        assert_eq!(second.object.unwrap().name(), "a");
    }

    #[tokio::test]
    async fn test_namespace_filtering() {
        let bus = EventBus::new();
        let bookmark = ResourceEvent::bookmark(Gvk::pod(), "0".to_string());
        let mut scoped = bus.subscribe(&Gvk::pod(), "prod", bookmark);
        let _ = scoped.recv().await;

        bus.publish(pod_event("a", "default", 1));
        bus.publish(pod_event("b", "prod", 2));

        let event = scoped.recv().await.unwrap();
        assert_eq!(event.object.unwrap().namespace(), "prod");
        assert!(scoped.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest_without_blocking() {
        let bus = EventBus::new();
        let bookmark = ResourceEvent::bookmark(Gvk::pod(), "0".to_string());
        let mut handle = bus.subscribe(&Gvk::pod(), "", bookmark);
        let _ = handle.recv().await;

        for i in 0..(WATCH_QUEUE_DEPTH as u64 + 50) {
            bus.publish(pod_event(&format!("p{}", i), "default", i + 1));
        }

        // The first event still deliverable is past the dropped window.
        let first = handle.recv().await.unwrap();
        let first_version: u64 = first.resource_version.parse().unwrap();
        assert!(first_version > 1, "oldest events should have been dropped");

        // Everything after the gap arrives in order.
        let mut last = first_version;
        while let Some(event) = handle.try_recv() {
            let version: u64 = event.resource_version.parse().unwrap();
            assert!(version > last);
            last = version;
        }
        assert_eq!(last, WATCH_QUEUE_DEPTH as u64 + 50);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let bus = EventBus::new();
        let bookmark = ResourceEvent::bookmark(Gvk::pod(), "0".to_string());
        let mut handle = bus.subscribe(&Gvk::pod(), "", bookmark);

        handle.close();
        handle.close();
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscriptions() {
        let bus = EventBus::new();
        let bookmark = ResourceEvent::bookmark(Gvk::pod(), "0".to_string());
        let mut handle = bus.subscribe(&Gvk::pod(), "", bookmark);
        let _ = handle.recv().await;

        bus.shutdown();
        assert!(handle.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_kinds_are_isolated() {
        let bus = EventBus::new();
        let bookmark = ResourceEvent::bookmark(Gvk::node(), "0".to_string());
        let mut nodes = bus.subscribe(&Gvk::node(), "", bookmark);
        let _ = nodes.recv().await;

        bus.publish(pod_event("a", "default", 1));
        assert!(nodes.try_recv().is_none());
    }
}
