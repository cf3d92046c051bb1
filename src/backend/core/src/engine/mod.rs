//! Wiring of the live engine and its background loops.
//!
//! [`LiveEngine`] owns one instance of every component and hands out shared
//! references to the request path. [`LiveEngine::start`] spawns the periodic
//! flush and cleanup loops plus the room-deletion listener; the returned
//! [`EngineHandle`] stops them again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::answers::{AnswerBuffer, AnswerIntake, FlushOutcome};
use crate::config::EngineConfig;
use crate::events::EventBus;
use crate::feedback::FeedbackAggregator;
use crate::model::QuestionId;
use crate::rounds::RoundController;
use crate::session::SessionRegistry;
use crate::store::{Authorizer, EntityStore, RoomDirectory};
use crate::timer::TimerRegistry;

pub struct LiveEngine {
    config: EngineConfig,
    rooms: Arc<dyn RoomDirectory>,
    timers: Arc<TimerRegistry<QuestionId>>,
    buffer: Arc<AnswerBuffer>,
    intake: Arc<AnswerIntake>,
    rounds: RoundController,
    feedback: Arc<FeedbackAggregator>,
    sessions: Arc<SessionRegistry>,
}

impl LiveEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn EntityStore>,
        rooms: Arc<dyn RoomDirectory>,
        authorizer: Arc<dyn Authorizer>,
        events: EventBus,
    ) -> Self {
        let timers = Arc::new(TimerRegistry::new("round_close"));
        let buffer = Arc::new(AnswerBuffer::new(store.clone(), events.clone()));
        let intake = Arc::new(AnswerIntake::new(store.clone(), buffer.clone()));
        let feedback = Arc::new(
            FeedbackAggregator::new(rooms.clone(), events.clone())
                .with_reset_on_round_end(config.reset_feedback_on_round_end),
        );

        let rounds = RoundController::new(store, authorizer, buffer.clone(), timers.clone(), events);
        rounds.add_observer(feedback.clone());

        Self {
            config,
            rooms,
            timers,
            buffer,
            intake,
            rounds,
            feedback,
            sessions: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rounds(&self) -> &RoundController {
        &self.rounds
    }

    pub fn intake(&self) -> &Arc<AnswerIntake> {
        &self.intake
    }

    pub fn buffer(&self) -> &Arc<AnswerBuffer> {
        &self.buffer
    }

    pub fn feedback(&self) -> &Arc<FeedbackAggregator> {
        &self.feedback
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn timers(&self) -> &Arc<TimerRegistry<QuestionId>> {
        &self.timers
    }

    /// Spawn the background loops. Requires a running tokio runtime.
    pub fn start(&self) -> EngineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let flush = {
            let buffer = self.buffer.clone();
            spawn_periodic("answer_flush", self.config.flush_interval, shutdown_rx.clone(), move || {
                let buffer = buffer.clone();
                async move {
                    buffer.flush_cycle().await;
                }
            })
        };

        let cleanup = {
            let feedback = self.feedback.clone();
            let max_age = self.config.feedback_max_age;
            spawn_periodic("feedback_cleanup", self.config.cleanup_interval, shutdown_rx, move || {
                let feedback = feedback.clone();
                async move {
                    feedback.cleanup_cycle(max_age).await;
                }
            })
        };

        let deletions = self.feedback.spawn_room_deletion_listener(self.rooms.clone());

        info!(
            flush_interval = ?self.config.flush_interval,
            cleanup_interval = ?self.config.cleanup_interval,
            feedback_max_age = ?self.config.feedback_max_age,
            "Live engine started"
        );

        EngineHandle {
            shutdown: shutdown_tx,
            loops: vec![flush, cleanup],
            deletions,
            buffer: self.buffer.clone(),
            timers: self.timers.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

/// Run `cycle` every `period` until shutdown is signalled.
///
/// A cycle that overruns its period delays the next tick instead of queueing
/// catch-up runs.
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    cycle: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(loop_name = name, "Background loop started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => cycle().await,
            }
        }

        debug!(loop_name = name, "Background loop stopped");
    })
}

/// Handle for stopping a started engine.
pub struct EngineHandle {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
    deletions: JoinHandle<()>,
    buffer: Arc<AnswerBuffer>,
    timers: Arc<TimerRegistry<QuestionId>>,
    sessions: Arc<SessionRegistry>,
}

impl EngineHandle {
    /// Stop the loops, disarm pending auto-closes and flush what is still
    /// buffered. Returns the outcome of that final flush.
    pub async fn shutdown(self) -> FlushOutcome {
        let _ = self.shutdown.send(true);
        for handle in self.loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
        self.deletions.abort();
        self.timers.cancel_all();

        let outcome = self.buffer.flush_cycle().await;
        self.sessions.clear();
        info!(final_flush = ?outcome, "Live engine stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnswerValue, Question, QuestionFormat, RoomId, UserId};
    use crate::store::{InMemoryEntityStore, InMemoryRoomDirectory};

    fn engine(config: EngineConfig) -> (LiveEngine, Arc<InMemoryEntityStore>) {
        let store = Arc::new(InMemoryEntityStore::new());
        let rooms = Arc::new(InMemoryRoomDirectory::new());
        let (events, _stream) = EventBus::channel(16);
        let engine = LiveEngine::new(config, store.clone(), rooms.clone(), rooms, events);
        (engine, store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_loop_runs_on_its_period() {
        let (engine, store) = engine(EngineConfig {
            flush_interval: Duration::from_secs(60),
            ..Default::default()
        });
        let mut question = Question::new(RoomId::new(), QuestionFormat::Binary);
        question.round_state.start(question.format, None);
        store.insert_question(question.clone());

        let handle = engine.start();
        engine
            .intake()
            .submit_answer(question.id, UserId::from("u"), AnswerValue::Choices { selected: vec![1] }, None)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(engine.buffer().pending(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(engine.buffer().pending(), 0);
        assert_eq!(store.answers().len(), 1);

        assert_eq!(handle.shutdown().await, FlushOutcome::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_remaining_answers() {
        let (engine, store) = engine(EngineConfig::default());
        let mut question = Question::new(RoomId::new(), QuestionFormat::FreeText);
        question.round_state.start(question.format, None);
        store.insert_question(question.clone());

        let handle = engine.start();
        let value = AnswerValue::Text {
            subject: "Pace".to_string(),
            body: "Slow down on proofs".to_string(),
        };
        engine
            .intake()
            .submit_answer(question.id, UserId::from("u"), value, None)
            .await
            .unwrap();

        assert_eq!(
            handle.shutdown().await,
            FlushOutcome::Flushed { persisted: 1, dropped: 0 }
        );
        assert_eq!(store.answers().len(), 1);
    }
}
