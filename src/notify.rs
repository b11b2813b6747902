use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use ulid::Ulid;

use crate::model::BookingStatus;

const CHANNEL_CAPACITY: usize = 256;

/// Channels clients can listen on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Bookings and availability of one instructor.
    Instructor(Ulid),
    /// Messages and status of one booking.
    Booking(Ulid),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Instructor(id) => write!(f, "instructor:{id}"),
            Topic::Booking(id) => write!(f, "booking:{id}"),
        }
    }
}

/// A hint that something changed. Receivers refetch; the notice itself is never authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    AvailabilityChanged { instructor_id: Ulid },
    BookingChanged { booking_id: Ulid, status: BookingStatus },
    MessagePosted { booking_id: Ulid, message_id: Ulid },
}

/// Broadcast hub with one channel per topic.
pub struct NotifyHub {
    channels: DashMap<Topic, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a topic, creating its channel if needed.
    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Notice> {
        self.channels
            .entry(topic)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Like `subscribe`, but the topic's channel is released once the last
    /// subscription drops, whether or not anything was ever sent on it.
    pub fn watch(self: &Arc<Self>, topic: Topic) -> Subscription {
        Subscription {
            rx: self.subscribe(topic),
            _lease: TopicLease {
                hub: Arc::clone(self),
                topic,
            },
        }
    }

    fn release(&self, topic: Topic) {
        self.channels
            .remove_if(&topic, |_, sender| sender.receiver_count() == 0);
    }

    /// No-op if nobody is listening. Channels whose last receiver is gone are dropped.
    pub fn send(&self, topic: Topic, notice: &Notice) {
        let orphaned = match self.channels.get(&topic) {
            Some(sender) => sender.send(notice.clone()).is_err(),
            None => return,
        };
        if orphaned {
            self.release(topic);
        }
    }

    pub fn topic_count(&self) -> usize {
        self.channels.len()
    }
}

/// A topic receiver that gives its channel back to the hub on drop.
pub struct Subscription {
    // Declared before the lease so the receiver is gone when the lease runs.
    rx: broadcast::Receiver<Notice>,
    _lease: TopicLease,
}

impl Subscription {
    pub async fn recv(&mut self) -> Result<Notice, RecvError> {
        self.rx.recv().await
    }
}

struct TopicLease {
    hub: Arc<NotifyHub>,
    topic: Topic,
}

impl Drop for TopicLease {
    fn drop(&mut self) {
        self.hub.release(self.topic);
    }
}
