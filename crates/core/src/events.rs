//! Change notifications.
//!
//! Subscribers receive an [`Event`] for every committed mutation they are
//! allowed to see. Events about one node arrive in commit order; across
//! nodes, `sequence` gives the global order. Publishing never blocks a
//! writer: each subscription is an unbounded channel, and a subscription
//! whose receiver has been dropped is pruned on the next publish.

use crate::vector::distance::cosine_similarity;
use crate::{NodeId, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    NodeInserted,
    NodeUpdated,
    NodeDeleted,
    EdgeAdded { to: NodeId, relation: String },
    EdgeRemoved { to: NodeId, relation: String },
    PermissionChanged { user: UserId },
    SdmWritten,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub kind: EventKind,
    /// Node the event is about (the source for edge events).
    pub node: Option<NodeId>,
    /// New vector for inserts and vector-changing updates.
    pub vector: Option<Vec<f32>>,
}

/// What a subscription wants to hear about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventFilter {
    All,
    /// Events about one node, including edges leaving or entering it.
    Node(NodeId),
    /// Inserts and updates whose vector has cosine similarity >= `threshold`
    /// to `query`.
    Vector { query: Vec<f32>, threshold: f32 },
}

impl EventFilter {
    fn wants(&self, event: &Event) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Node(id) => {
                event.node == Some(*id)
                    || matches!(&event.kind,
                        EventKind::EdgeAdded { to, .. } | EventKind::EdgeRemoved { to, .. } if to == id)
            }
            EventFilter::Vector { query, threshold } => event
                .vector
                .as_ref()
                .is_some_and(|v| v.len() == query.len() && cosine_similarity(query, v) >= *threshold),
        }
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: Receiver<Event>,
}

impl Subscription {
    pub fn try_recv(&self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(e) => Some(e),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(e) => Some(e),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}

impl Iterator for Subscription {
    type Item = Event;

    /// Blocks until the next event; ends when the database is dropped.
    fn next(&mut self) -> Option<Event> {
        self.rx.recv().ok()
    }
}

struct Subscriber {
    user: UserId,
    filter: EventFilter,
    tx: Sender<Event>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user: UserId, filter: EventFilter) -> Subscription {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(Subscriber { user, filter, tx });
        Subscription { rx }
    }

    /// Deliver `event` to every subscriber whose filter matches and for whom
    /// `visible` returns true.
    pub fn publish(&self, event: &Event, visible: impl Fn(UserId) -> bool) {
        let mut subs = self.subscribers.lock();
        if subs.is_empty() {
            return;
        }
        subs.retain(|s| {
            if !s.filter.wants(event) || !visible(s.user) {
                return true;
            }
            s.tx.send(event.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inserted(node: NodeId, vector: Vec<f32>) -> Event {
        Event {
            sequence: node,
            kind: EventKind::NodeInserted,
            node: Some(node),
            vector: Some(vector),
        }
    }

    #[test]
    fn all_filter_sees_everything_visible() {
        let bus = EventBus::new();
        let sub = bus.subscribe(1, EventFilter::All);
        bus.publish(&inserted(1, vec![1.0]), |_| true);
        bus.publish(&inserted(2, vec![1.0]), |u| u != 1);
        let got = sub.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].node, Some(1));
    }

    #[test]
    fn node_filter_matches_edges_into_the_node() {
        let bus = EventBus::new();
        let sub = bus.subscribe(1, EventFilter::Node(5));
        bus.publish(
            &Event {
                sequence: 1,
                kind: EventKind::EdgeAdded { to: 5, relation: "r".into() },
                node: Some(9),
                vector: None,
            },
            |_| true,
        );
        bus.publish(&inserted(6, vec![1.0]), |_| true);
        assert_eq!(sub.drain().len(), 1);
    }

    #[test]
    fn vector_filter_uses_similarity_threshold() {
        let bus = EventBus::new();
        let sub = bus.subscribe(
            1,
            EventFilter::Vector {
                query: vec![1.0, 0.0],
                threshold: 0.9,
            },
        );
        bus.publish(&inserted(1, vec![1.0, 0.1]), |_| true);
        bus.publish(&inserted(2, vec![0.0, 1.0]), |_| true);
        let got = sub.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].node, Some(1));
    }

    #[test]
    fn dropped_subscriptions_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe(1, EventFilter::All);
        let _keep = bus.subscribe(2, EventFilter::All);
        drop(sub);
        bus.publish(&inserted(1, vec![1.0]), |_| true);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
