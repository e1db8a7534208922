//! Live fan-out of fleet and session snapshots
//!
//! One broadcast channel per topic plus the last published message, so a late
//! subscriber gets the current snapshot immediately and then every update.
//! A subscriber that falls behind the channel buffer is dropped and expected
//! to resubscribe for a fresh snapshot; gaps are never replayed.

use std::fmt;

use armdock_protocol::ServerMessage;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

const TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Fleet,
    Session(String),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Fleet => write!(f, "fleet"),
            Topic::Session(id) => write!(f, "session:{id}"),
        }
    }
}

struct TopicState {
    tx: broadcast::Sender<ServerMessage>,
    last: Option<ServerMessage>,
}

impl TopicState {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(TOPIC_CAPACITY);
        Self { tx, last: None }
    }
}

/// What a new subscriber receives: the current snapshot, then live updates.
pub struct Subscription {
    pub initial: Option<ServerMessage>,
    pub rx: broadcast::Receiver<ServerMessage>,
}

#[derive(Default)]
pub struct LiveFanout {
    topics: DashMap<Topic, TopicState>,
}

impl LiveFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot and receiver are taken under the same topic lock, so nothing
    /// published concurrently is missed or delivered twice.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let entry = self.topics.entry(topic).or_insert_with(TopicState::new);
        Subscription {
            initial: entry.last.clone(),
            rx: entry.tx.subscribe(),
        }
    }

    /// Record `msg` as the topic's current snapshot and send it to every
    /// subscriber. Returns how many subscribers it reached.
    pub fn publish(&self, topic: Topic, msg: ServerMessage) -> usize {
        let mut entry = self.topics.entry(topic.clone()).or_insert_with(TopicState::new);
        entry.last = Some(msg.clone());
        let reached = entry.tx.send(msg).unwrap_or(0);
        debug!(
            component = "fanout",
            event = "fanout.published",
            topic = %topic,
            subscribers = reached,
        );
        reached
    }

    /// Publish only when `msg` differs from the topic's current snapshot.
    pub fn publish_if_changed(&self, topic: Topic, msg: ServerMessage) -> bool {
        let mut entry = self.topics.entry(topic.clone()).or_insert_with(TopicState::new);
        if entry.last.as_ref() == Some(&msg) {
            return false;
        }
        entry.last = Some(msg.clone());
        let reached = entry.tx.send(msg).unwrap_or(0);
        debug!(
            component = "fanout",
            event = "fanout.published",
            topic = %topic,
            subscribers = reached,
        );
        true
    }

    pub fn last(&self, topic: &Topic) -> Option<ServerMessage> {
        self.topics.get(topic).and_then(|entry| entry.last.clone())
    }

    /// Send a final message and drop the topic; its subscribers see the
    /// channel close after draining.
    pub fn close(&self, topic: &Topic, farewell: Option<ServerMessage>) {
        if let Some((_, state)) = self.topics.remove(topic) {
            if let Some(msg) = farewell {
                let _ = state.tx.send(msg);
            }
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics
            .get(topic)
            .map(|entry| entry.tx.receiver_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    fn ack(message: &str) -> ServerMessage {
        ServerMessage::Ack {
            session_id: None,
            message: message.to_string(),
        }
    }

    #[tokio::test]
    async fn late_subscriber_gets_current_snapshot_first() {
        let fanout = LiveFanout::new();
        fanout.publish(Topic::Fleet, ack("one"));
        fanout.publish(Topic::Fleet, ack("two"));

        let mut sub = fanout.subscribe(Topic::Fleet);
        assert_eq!(sub.initial, Some(ack("two")));
        assert!(matches!(sub.rx.try_recv(), Err(TryRecvError::Empty)));

        fanout.publish(Topic::Fleet, ack("three"));
        assert_eq!(sub.rx.recv().await.expect("recv"), ack("three"));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let fanout = LiveFanout::new();
        let mut a = fanout.subscribe(Topic::Session("a".into()));
        let sub_b = fanout.subscribe(Topic::Session("b".into()));
        assert!(sub_b.initial.is_none());

        fanout.publish(Topic::Session("b".into()), ack("for b"));
        assert!(matches!(a.rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn unchanged_message_is_not_republished() {
        let fanout = LiveFanout::new();
        let mut sub = fanout.subscribe(Topic::Fleet);
        assert!(fanout.publish_if_changed(Topic::Fleet, ack("x")));
        assert!(!fanout.publish_if_changed(Topic::Fleet, ack("x")));
        assert!(fanout.publish_if_changed(Topic::Fleet, ack("y")));

        assert_eq!(sub.rx.try_recv().expect("first"), ack("x"));
        assert_eq!(sub.rx.try_recv().expect("second"), ack("y"));
        assert!(matches!(sub.rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn slow_subscriber_does_not_block_publisher() {
        let fanout = LiveFanout::new();
        let mut slow = fanout.subscribe(Topic::Fleet);
        for i in 0..(TOPIC_CAPACITY + 10) {
            fanout.publish(Topic::Fleet, ack(&i.to_string()));
        }
        assert!(matches!(slow.rx.try_recv(), Err(TryRecvError::Lagged(_))));
        // A fresh subscription still starts from the latest snapshot.
        let fresh = fanout.subscribe(Topic::Fleet);
        assert_eq!(fresh.initial, Some(ack(&(TOPIC_CAPACITY + 9).to_string())));
    }

    #[tokio::test]
    async fn close_delivers_farewell_then_ends_stream() {
        let fanout = LiveFanout::new();
        let topic = Topic::Session("s1".into());
        let mut sub = fanout.subscribe(topic.clone());

        fanout.close(&topic, Some(ack("bye")));
        assert_eq!(sub.rx.recv().await.expect("farewell"), ack("bye"));
        assert!(matches!(sub.rx.recv().await, Err(RecvError::Closed)));
        assert_eq!(fanout.subscriber_count(&topic), 0);
        assert!(fanout.last(&topic).is_none());
    }
}
