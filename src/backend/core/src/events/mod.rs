//! Outbound lifecycle notifications.
//!
//! Every state transition that clients care about produces a [`LiveEvent`] on a
//! bounded channel owned by the engine. The notification collaborator drains
//! the other end through [`spawn_dispatcher`]. Publishing never blocks a
//! request or a background cycle:
//! - a full channel drops the event and counts it
//! - a closed channel (no dispatcher) is ignored

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;
use crate::model::{Answer, FeedbackTally, QuestionId, QuestionSnapshot, RoomId, UserId};

/// A notification for connected clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveEvent {
    RoundStarted {
        question_id: QuestionId,
        room_id: RoomId,
        round: u8,
        ends_at: Option<DateTime<Utc>>,
    },
    RoundEnded {
        question_id: QuestionId,
        room_id: RoomId,
        round: u8,
        auto_closed: bool,
    },
    RoundCancelled {
        question_id: QuestionId,
        room_id: RoomId,
        round: u8,
    },
    RoundReset {
        question_id: QuestionId,
        room_id: RoomId,
        deleted_answers: u64,
    },
    NewAnswer {
        answer: Answer,
        question: QuestionSnapshot,
    },
    FeedbackChanged {
        room_id: RoomId,
        tally: FeedbackTally,
    },
    /// One user lost votes in one or more rooms.
    FeedbackReset {
        user_id: UserId,
        room_ids: Vec<RoomId>,
    },
}

impl LiveEvent {
    /// Short name used for logging and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoundStarted { .. } => "round_started",
            Self::RoundEnded { .. } => "round_ended",
            Self::RoundCancelled { .. } => "round_cancelled",
            Self::RoundReset { .. } => "round_reset",
            Self::NewAnswer { .. } => "new_answer",
            Self::FeedbackChanged { .. } => "feedback_changed",
            Self::FeedbackReset { .. } => "feedback_reset",
        }
    }
}

/// Counters for the event channel.
#[derive(Debug, Default)]
pub struct EventStats {
    published: AtomicU64,
    dropped: AtomicU64,
}

impl EventStats {
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer side of the event channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: mpsc::Sender<LiveEvent>,
    stats: Arc<EventStats>,
}

/// Consumer side of the event channel.
pub struct EventStream {
    receiver: mpsc::Receiver<LiveEvent>,
}

impl EventBus {
    /// Create a bus with room for `capacity` undelivered events.
    pub fn channel(capacity: usize) -> (Self, EventStream) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                stats: Arc::new(EventStats::default()),
            },
            EventStream { receiver },
        )
    }

    /// Publish an event without waiting.
    pub fn publish(&self, event: LiveEvent) {
        let kind = event.kind();
        match self.sender.try_send(event) {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                counter!("pulse_events_published_total", "kind" => kind).increment(1);
            }
            Err(TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("pulse_events_dropped_total", "kind" => kind).increment(1);
                warn!(kind, "Event channel full, notification dropped");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(kind, "No event dispatcher attached");
            }
        }
    }

    pub fn stats(&self) -> &EventStats {
        &self.stats
    }
}

impl EventStream {
    /// Wait for the next event. `None` once every bus handle is dropped.
    pub async fn recv(&mut self) -> Option<LiveEvent> {
        self.receiver.recv().await
    }

    /// Take an event if one is ready.
    pub fn try_recv(&mut self) -> Option<LiveEvent> {
        self.receiver.try_recv().ok()
    }

    /// Take every event that is ready right now.
    pub fn drain_ready(&mut self) -> Vec<LiveEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Delivery end of the notification channel (e.g. a websocket fan-out).
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn deliver(&self, event: LiveEvent) -> Result<()>;
}

/// Sink that writes every event to the log.
#[derive(Debug, Default)]
pub struct LoggingSink;

#[async_trait]
impl NotificationSink for LoggingSink {
    async fn deliver(&self, event: LiveEvent) -> Result<()> {
        let payload = serde_json::to_string(&event)?;
        tracing::info!(kind = event.kind(), payload = %payload, "Live event");
        Ok(())
    }
}

/// Drain `stream` into `sink` until every producer is gone.
///
/// Delivery failures are logged by the dispatcher and never reach the engine.
pub fn spawn_dispatcher<S: NotificationSink>(mut stream: EventStream, sink: Arc<S>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            let kind = event.kind();
            if let Err(e) = sink.deliver(event).await {
                counter!("pulse_events_failed_total", "kind" => kind).increment(1);
                warn!(kind, error = %e, "Notification delivery failed");
            }
        }
        debug!("Event dispatcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn changed(room_id: RoomId) -> LiveEvent {
        LiveEvent::FeedbackChanged {
            room_id,
            tally: FeedbackTally::default(),
        }
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let (bus, mut stream) = EventBus::channel(8);
        let rooms: Vec<RoomId> = (0..3).map(|_| RoomId::new()).collect();
        for room in &rooms {
            bus.publish(changed(*room));
        }

        let received: Vec<RoomId> = stream
            .drain_ready()
            .into_iter()
            .map(|e| match e {
                LiveEvent::FeedbackChanged { room_id, .. } => room_id,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(received, rooms);
        assert_eq!(bus.stats().published(), 3);
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (bus, mut stream) = EventBus::channel(2);
        for _ in 0..5 {
            bus.publish(changed(RoomId::new()));
        }
        assert_eq!(bus.stats().published(), 2);
        assert_eq!(bus.stats().dropped(), 3);
        assert_eq!(stream.drain_ready().len(), 2);
    }

    #[tokio::test]
    async fn test_closed_channel_is_ignored() {
        let (bus, stream) = EventBus::channel(2);
        drop(stream);
        bus.publish(changed(RoomId::new()));
        assert_eq!(bus.stats().published(), 0);
        assert_eq!(bus.stats().dropped(), 0);
    }

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl NotificationSink for CollectingSink {
        async fn deliver(&self, event: LiveEvent) -> Result<()> {
            self.events.lock().push(event.kind());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatcher_drains_until_closed() {
        let (bus, stream) = EventBus::channel(8);
        let sink = Arc::new(CollectingSink::default());
        let handle = spawn_dispatcher(stream, sink.clone());

        bus.publish(changed(RoomId::new()));
        bus.publish(LiveEvent::FeedbackReset {
            user_id: UserId::from("u"),
            room_ids: vec![RoomId::new()],
        });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(*sink.events.lock(), vec!["feedback_changed", "feedback_reset"]);
    }
}
