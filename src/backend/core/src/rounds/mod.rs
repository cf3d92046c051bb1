//! Round Controller: presenter-driven, optionally timed voting rounds.
//!
//! Every transition for a question runs under that question's own lock, so
//! concurrent `start`/`end`/`cancel`/`reset` calls for one question are totally
//! ordered while different questions never contend. A transition is:
//!
//! 1. load the question (`QuestionNotFound`) and check the actor (`Forbidden`)
//! 2. apply the pure [`RoundState`](crate::model::RoundState) transition
//! 3. persist it; a storage failure aborts before any timer or event changes
//! 4. re-arm or cancel the auto-close timer, publish the lifecycle event
//!
//! The auto-close timer calls back into the same close logic as a manual end.
//! The callback remembers the round generation and `round_end` it was armed
//! for and does nothing unless the stored question still carries both.
//!
//! Reset persists the new state before deleting answers and waits out any
//! in-flight answer flush first, so a flushed batch cannot land after it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::answers::AnswerBuffer;
use crate::error::{PulseError, Result};
use crate::events::{EventBus, LiveEvent};
use crate::model::{Question, QuestionId, UserId};
use crate::store::{Authorizer, EntityStore};
use crate::timer::TimerRegistry;

/// Hook notified after a round of a question has closed.
#[async_trait]
pub trait RoundObserver: Send + Sync {
    async fn round_ended(&self, question: &Question) -> Result<()>;
}

struct Inner {
    store: Arc<dyn EntityStore>,
    authorizer: Arc<dyn Authorizer>,
    buffer: Arc<AnswerBuffer>,
    timers: Arc<TimerRegistry<QuestionId>>,
    events: EventBus,
    locks: DashMap<QuestionId, Arc<Mutex<()>>>,
    observers: RwLock<Vec<Arc<dyn RoundObserver>>>,
}

/// Drives the round state machine of every question.
#[derive(Clone)]
pub struct RoundController {
    inner: Arc<Inner>,
}

impl RoundController {
    pub fn new(
        store: Arc<dyn EntityStore>,
        authorizer: Arc<dyn Authorizer>,
        buffer: Arc<AnswerBuffer>,
        timers: Arc<TimerRegistry<QuestionId>>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                authorizer,
                buffer,
                timers,
                events,
                locks: DashMap::new(),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a hook to run after every round end.
    pub fn add_observer(&self, observer: Arc<dyn RoundObserver>) {
        self.inner.observers.write().push(observer);
    }

    /// Open a round, optionally closing itself at `end_at`.
    ///
    /// Any pending auto-close is replaced as part of the same transition. An
    /// `end_at` already in the past closes the round on the next scheduler turn.
    #[instrument(skip_all, fields(question_id = %question_id, actor = %actor))]
    pub async fn start_round(
        &self,
        actor: &UserId,
        question_id: QuestionId,
        end_at: Option<DateTime<Utc>>,
    ) -> Result<Question> {
        let lock = self.inner.lock_for(question_id);
        let _guard = lock.lock().await;

        let mut question = self.inner.load_authorized(actor, question_id).await?;
        let round = question.round_state.start(question.format, end_at);
        self.inner.store.save_question(&question).await?;

        match end_at {
            Some(end_at) => self.arm_auto_close(question_id, question.round_state.generation, end_at),
            None => {
                self.inner.timers.cancel(&question_id);
            }
        }

        counter!("pulse_round_transitions_total", "transition" => "start").increment(1);
        info!(round, ends_at = ?end_at, "Round started");
        self.inner.events.publish(LiveEvent::RoundStarted {
            question_id,
            room_id: question.room_id,
            round,
            ends_at: end_at,
        });

        Ok(question)
    }

    /// Close the current round now. Closing an already closed round is a no-op.
    #[instrument(skip_all, fields(question_id = %question_id, actor = %actor))]
    pub async fn end_round_now(&self, actor: &UserId, question_id: QuestionId) -> Result<Question> {
        let (question, closed) = {
            let lock = self.inner.lock_for(question_id);
            let _guard = lock.lock().await;

            let question = self.inner.load_authorized(actor, question_id).await?;
            self.inner.close(question, false).await?
        };

        if closed {
            self.inner.notify_round_ended(&question).await;
        }
        Ok(question)
    }

    /// Abort the current round without counting it.
    #[instrument(skip_all, fields(question_id = %question_id, actor = %actor))]
    pub async fn cancel_round(&self, actor: &UserId, question_id: QuestionId) -> Result<Question> {
        let lock = self.inner.lock_for(question_id);
        let _guard = lock.lock().await;

        let mut question = self.inner.load_authorized(actor, question_id).await?;
        question.round_state.cancel(question.format);
        self.inner.store.save_question(&question).await?;
        self.inner.timers.cancel(&question_id);

        let round = question.round_state.round;
        counter!("pulse_round_transitions_total", "transition" => "cancel").increment(1);
        info!(round, "Round cancelled");
        self.inner.events.publish(LiveEvent::RoundCancelled {
            question_id,
            room_id: question.room_id,
            round,
        });

        Ok(question)
    }

    /// Return the question to its base round and discard all of its answers,
    /// stored and still buffered. On failure the question keeps its state and
    /// its answers.
    #[instrument(skip_all, fields(question_id = %question_id, actor = %actor))]
    pub async fn reset_round(&self, actor: &UserId, question_id: QuestionId) -> Result<Question> {
        let lock = self.inner.lock_for(question_id);
        let _guard = lock.lock().await;

        let original = self.inner.load_authorized(actor, question_id).await?;
        let paused = self.inner.buffer.pause_flush().await;

        let mut question = original.clone();
        question.round_state.reset(question.format);
        self.inner.store.save_question(&question).await?;

        let deleted = match self.inner.store.delete_answers_for_question(question_id).await {
            Ok(deleted) => deleted,
            Err(e) => return Err(self.inner.roll_back(&original, e).await),
        };
        let discarded = self.inner.buffer.discard_question(question_id) as u64;
        drop(paused);
        self.inner.timers.cancel(&question_id);

        counter!("pulse_round_transitions_total", "transition" => "reset").increment(1);
        info!(deleted, discarded, "Round reset");
        self.inner.events.publish(LiveEvent::RoundReset {
            question_id,
            room_id: question.room_id,
            deleted_answers: deleted + discarded,
        });

        Ok(question)
    }

    /// Drop all engine state for a deleted question.
    pub fn forget_question(&self, question_id: QuestionId) {
        self.inner.timers.cancel_and_purge(&question_id);
        self.inner.locks.remove(&question_id);
        self.inner.buffer.discard_question(question_id);
        debug!(question_id = %question_id, "Question forgotten");
    }

    /// Whether an auto-close is armed for the question.
    pub fn has_pending_close(&self, question_id: QuestionId) -> bool {
        self.inner.timers.is_pending(&question_id)
    }

    fn arm_auto_close(&self, question_id: QuestionId, generation: u32, end_at: DateTime<Utc>) {
        let delay = (end_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);

        self.inner.timers.schedule(question_id, delay, move || async move {
            if let Some(inner) = inner.upgrade() {
                inner.auto_close(question_id, generation, end_at).await;
            }
        });
        debug!(question_id = %question_id, delay_ms = delay.as_millis() as u64, "Auto-close armed");
    }
}

impl Inner {
    fn lock_for(&self, question_id: QuestionId) -> Arc<Mutex<()>> {
        self.locks
            .entry(question_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_authorized(&self, actor: &UserId, question_id: QuestionId) -> Result<Question> {
        let question = self
            .store
            .get_question(question_id)
            .await?
            .ok_or_else(|| PulseError::question_not_found(question_id))?;

        if !self.authorizer.can_moderate(actor, question.room_id).await? {
            return Err(PulseError::forbidden("Only the room's presenters can control rounds")
                .with_context("room_id", question.room_id));
        }
        Ok(question)
    }

    /// Shared by manual and timed closes. Returns whether a round was open.
    async fn close(&self, mut question: Question, auto_closed: bool) -> Result<(Question, bool)> {
        if !question.round_state.end(question.format) {
            self.timers.cancel(&question.id);
            debug!(question_id = %question.id, "Round already closed");
            return Ok((question, false));
        }

        self.store.save_question(&question).await?;
        self.timers.cancel(&question.id);

        let round = question.round_state.round;
        let transition = if auto_closed { "auto_close" } else { "end" };
        counter!("pulse_round_transitions_total", "transition" => transition).increment(1);
        info!(question_id = %question.id, round, auto_closed, "Round ended");
        self.events.publish(LiveEvent::RoundEnded {
            question_id: question.id,
            room_id: question.room_id,
            round,
            auto_closed,
        });

        Ok((question, true))
    }

    async fn auto_close(&self, question_id: QuestionId, generation: u32, armed_for: DateTime<Utc>) {
        let closed = {
            let lock = self.lock_for(question_id);
            let _guard = lock.lock().await;

            let question = match self.store.get_question(question_id).await {
                Ok(Some(question)) => question,
                Ok(None) => {
                    debug!(question_id = %question_id, "Auto-close for a question that no longer exists");
                    return;
                }
                Err(e) => {
                    e.log();
                    return;
                }
            };

            let state = &question.round_state;
            if state.generation != generation || state.round_end != Some(armed_for) {
                debug!(question_id = %question_id, "Auto-close superseded by a later transition");
                return;
            }

            match self.close(question, true).await {
                Ok((question, true)) => question,
                Ok((_, false)) => return,
                Err(e) => {
                    e.log();
                    warn!(question_id = %question_id, "Auto-close could not be persisted");
                    return;
                }
            }
        };

        self.notify_round_ended(&closed).await;
    }

    /// Put back the state a failed reset already persisted.
    async fn roll_back(&self, original: &Question, cause: PulseError) -> PulseError {
        match self.store.save_question(original).await {
            Ok(()) => {
                warn!(question_id = %original.id, "Answer delete failed, reset rolled back");
                cause
            }
            Err(e) => {
                e.log();
                let error = PulseError::internal(format!(
                    "question {} was reset but its answers were not deleted",
                    original.id
                ))
                .with_source(cause);
                error.log();
                error
            }
        }
    }

    async fn notify_round_ended(&self, question: &Question) {
        let observers: Vec<_> = self.observers.read().iter().cloned().collect();
        for observer in observers {
            if let Err(e) = observer.round_ended(question).await {
                e.log();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::events::EventStream;
    use crate::model::{QuestionFormat, RoomId};
    use crate::model::{Answer, AnswerValue, BufferedAnswer};
    use crate::store::{BulkWriteReport, InMemoryEntityStore, InMemoryRoomDirectory, RoomSettings, WriteKind};

    struct Fixture {
        store: Arc<InMemoryEntityStore>,
        buffer: Arc<AnswerBuffer>,
        controller: RoundController,
        stream: EventStream,
        presenter: UserId,
        room: RoomId,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryEntityStore::new());
        fixture_over(store.clone(), store)
    }

    /// `backend` is what the engine talks to; `store` is the state underneath it.
    fn fixture_over(store: Arc<InMemoryEntityStore>, backend: Arc<dyn EntityStore>) -> Fixture {
        let rooms = Arc::new(InMemoryRoomDirectory::new());
        let room = RoomId::new();
        rooms.insert_room(room, RoomSettings::moderated_by("presenter"));

        let (events, stream) = EventBus::channel(256);
        let buffer = Arc::new(AnswerBuffer::new(backend.clone(), events.clone()));
        let controller = RoundController::new(
            backend,
            rooms,
            buffer.clone(),
            Arc::new(TimerRegistry::new("rounds")),
            events,
        );

        Fixture {
            store,
            buffer,
            controller,
            stream,
            presenter: UserId::from("presenter"),
            room,
        }
    }

    /// Store one answer and buffer another for the question's active round.
    async fn seed_answers(fx: &Fixture, q: QuestionId) {
        let question = fx.store.question(q).unwrap();
        let stored = Answer::new(&question, UserId::from("stored"), AnswerValue::Abstention);
        fx.store.save_answers_bulk(&[stored]).await.unwrap();

        let pending = Answer::new(&question, UserId::from("pending"), AnswerValue::Abstention);
        fx.buffer.submit(BufferedAnswer::new(pending, &question));
    }

    fn add_question(fx: &Fixture, format: QuestionFormat) -> QuestionId {
        let question = Question::new(fx.room, format);
        let id = question.id;
        fx.store.insert_question(question);
        id
    }

    fn kinds(stream: &mut EventStream) -> Vec<&'static str> {
        stream.drain_ready().iter().map(LiveEvent::kind).collect()
    }

    #[tokio::test]
    async fn test_end_twice_is_noop() {
        let mut fx = fixture();
        let q = add_question(&fx, QuestionFormat::SingleChoice);

        fx.controller.start_round(&fx.presenter, q, None).await.unwrap();
        let once = fx.controller.end_round_now(&fx.presenter, q).await.unwrap();
        let twice = fx.controller.end_round_now(&fx.presenter, q).await.unwrap();

        assert_eq!(once.round_state, twice.round_state);
        assert_eq!(kinds(&mut fx.stream), vec!["round_started", "round_ended"]);
    }

    #[tokio::test]
    async fn test_unknown_question_and_stranger() {
        let fx = fixture();
        let err = fx
            .controller
            .start_round(&fx.presenter, QuestionId::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::QuestionNotFound);

        let q = add_question(&fx, QuestionFormat::SingleChoice);
        let err = fx
            .controller
            .start_round(&UserId::from("student"), q, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
        assert_eq!(fx.store.question(q).unwrap().round_state.round, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_aborts_transition() {
        let mut fx = fixture();
        let q = add_question(&fx, QuestionFormat::SingleChoice);

        fx.store.set_fail_writes(true);
        let err = fx
            .controller
            .start_round(&fx.presenter, q, Some(Utc::now() + chrono::Duration::seconds(5)))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
        assert!(!fx.controller.has_pending_close(q));
        assert!(fx.stream.drain_ready().is_empty());
        assert!(!fx.store.question(q).unwrap().round_state.responses_enabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_round_closes_itself() {
        let mut fx = fixture();
        let q = add_question(&fx, QuestionFormat::Binary);

        fx.controller
            .start_round(&fx.presenter, q, Some(Utc::now() + chrono::Duration::seconds(2)))
            .await
            .unwrap();
        assert!(fx.controller.has_pending_close(q));

        tokio::time::sleep(Duration::from_secs(3)).await;

        let state = fx.store.question(q).unwrap().round_state;
        assert!(!state.responses_enabled);
        assert!(state.round_end.is_none());
        assert!(!fx.controller.has_pending_close(q));

        let events = fx.stream.drain_ready();
        assert!(matches!(
            events.last(),
            Some(LiveEvent::RoundEnded { auto_closed: true, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_replaces_timer() {
        let fx = fixture();
        let q = add_question(&fx, QuestionFormat::SingleChoice);

        for seconds in [2, 4, 6] {
            fx.controller
                .start_round(&fx.presenter, q, Some(Utc::now() + chrono::Duration::seconds(seconds)))
                .await
                .unwrap();
            assert!(fx.controller.has_pending_close(q));
        }

        fx.controller.start_round(&fx.presenter, q, None).await.unwrap();
        assert!(!fx.controller.has_pending_close(q));
    }

    #[tokio::test]
    async fn test_reset_discards_answers() {
        let mut fx = fixture();
        let q = add_question(&fx, QuestionFormat::SingleChoice);

        fx.controller.start_round(&fx.presenter, q, None).await.unwrap();
        fx.controller.end_round_now(&fx.presenter, q).await.unwrap();
        fx.controller.start_round(&fx.presenter, q, None).await.unwrap();

        let question = fx.store.question(q).unwrap();
        let answer = crate::model::Answer::new(
            &question,
            UserId::from("s"),
            crate::model::AnswerValue::Abstention,
        );
        fx.store.save_answers_bulk(&[answer]).await.unwrap();

        let reset = fx.controller.reset_round(&fx.presenter, q).await.unwrap();
        assert_eq!(reset.round_state.round, 1);
        assert!(!reset.round_state.responses_enabled);
        assert!(fx.store.answers().is_empty());

        let events = fx.stream.drain_ready();
        assert!(matches!(
            events.last(),
            Some(LiveEvent::RoundReset { deleted_answers: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_save_failure_keeps_answers() {
        let mut fx = fixture();
        let q = add_question(&fx, QuestionFormat::SingleChoice);
        fx.controller.start_round(&fx.presenter, q, None).await.unwrap();
        fx.stream.drain_ready();
        seed_answers(&fx, q).await;

        fx.store.set_failing(WriteKind::SaveQuestion, true);
        let err = fx.controller.reset_round(&fx.presenter, q).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
        assert_eq!(fx.store.answers().len(), 1);
        assert_eq!(fx.buffer.pending(), 1);
        assert!(fx.store.question(q).unwrap().round_state.responses_enabled);
        assert!(fx.stream.drain_ready().is_empty());
    }

    #[tokio::test]
    async fn test_reset_delete_failure_rolls_back_state() {
        let mut fx = fixture();
        let q = add_question(&fx, QuestionFormat::SingleChoice);
        fx.controller.start_round(&fx.presenter, q, None).await.unwrap();
        let before = fx.store.question(q).unwrap();
        fx.stream.drain_ready();
        seed_answers(&fx, q).await;

        fx.store.set_failing(WriteKind::DeleteAnswers, true);
        let err = fx.controller.reset_round(&fx.presenter, q).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
        assert_eq!(fx.store.question(q).unwrap(), before);
        assert_eq!(fx.store.answers().len(), 1);
        assert_eq!(fx.buffer.pending(), 1);
        assert!(fx.stream.drain_ready().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_storage_failure_keeps_timer_and_state() {
        let mut fx = fixture();
        let q = add_question(&fx, QuestionFormat::SingleChoice);
        fx.controller
            .start_round(&fx.presenter, q, Some(Utc::now() + chrono::Duration::seconds(30)))
            .await
            .unwrap();
        let before = fx.store.question(q).unwrap();
        fx.stream.drain_ready();

        fx.store.set_failing(WriteKind::SaveQuestion, true);
        let err = fx.controller.cancel_round(&fx.presenter, q).await.unwrap_err();

        assert_eq!(err.code(), ErrorCode::StorageUnavailable);
        assert_eq!(fx.store.question(q).unwrap(), before);
        assert!(fx.controller.has_pending_close(q));
        assert!(fx.stream.drain_ready().is_empty());
    }

    /// Bulk writes take a while; everything else goes straight to `inner`.
    struct SlowBulkStore {
        inner: Arc<InMemoryEntityStore>,
    }

    #[async_trait]
    impl EntityStore for SlowBulkStore {
        async fn get_question(&self, id: QuestionId) -> Result<Option<Question>> {
            self.inner.get_question(id).await
        }

        async fn save_question(&self, question: &Question) -> Result<()> {
            self.inner.save_question(question).await
        }

        async fn save_answers_bulk(&self, answers: &[Answer]) -> Result<BulkWriteReport> {
            tokio::time::sleep(Duration::from_secs(1)).await;
            self.inner.save_answers_bulk(answers).await
        }

        async fn delete_answers_for_question(&self, id: QuestionId) -> Result<u64> {
            self.inner.delete_answers_for_question(id).await
        }

        async fn find_answers(&self, id: QuestionId, round: u8) -> Result<Vec<Answer>> {
            self.inner.find_answers(id, round).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_during_flush_deletes_the_flushed_batch() {
        let store = Arc::new(InMemoryEntityStore::new());
        let mut fx = fixture_over(store.clone(), Arc::new(SlowBulkStore { inner: store }));
        let q = add_question(&fx, QuestionFormat::SingleChoice);
        fx.controller.start_round(&fx.presenter, q, None).await.unwrap();

        let question = fx.store.question(q).unwrap();
        let answer = Answer::new(&question, UserId::from("early"), AnswerValue::Abstention);
        fx.buffer.submit(BufferedAnswer::new(answer, &question));

        let flush = tokio::spawn({
            let buffer = fx.buffer.clone();
            async move { buffer.flush_cycle().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.buffer.pending(), 0);

        fx.controller.reset_round(&fx.presenter, q).await.unwrap();
        flush.await.unwrap();

        assert!(fx.store.answers().is_empty());
        let events = fx.stream.drain_ready();
        assert!(matches!(
            events.last(),
            Some(LiveEvent::RoundReset { deleted_answers: 1, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_auto_close_with_same_end_is_ignored() {
        let fx = fixture();
        let q = add_question(&fx, QuestionFormat::SingleChoice);
        let end_at = Utc::now() + chrono::Duration::seconds(30);

        fx.controller.start_round(&fx.presenter, q, Some(end_at)).await.unwrap();
        let first = fx.store.question(q).unwrap().round_state.generation;
        fx.controller.start_round(&fx.presenter, q, Some(end_at)).await.unwrap();

        // A callback from the first start that had already fired.
        fx.controller.inner.auto_close(q, first, end_at).await;

        let state = fx.store.question(q).unwrap().round_state;
        assert!(state.responses_enabled);
        assert_eq!(state.round_end, Some(end_at));
    }

    #[tokio::test]
    async fn test_observer_runs_after_manual_end() {
        struct Recorder(parking_lot::Mutex<Vec<QuestionId>>);

        #[async_trait]
        impl RoundObserver for Recorder {
            async fn round_ended(&self, question: &Question) -> Result<()> {
                self.0.lock().push(question.id);
                Ok(())
            }
        }

        let fx = fixture();
        let recorder = Arc::new(Recorder(parking_lot::Mutex::new(Vec::new())));
        fx.controller.add_observer(recorder.clone());
        let q = add_question(&fx, QuestionFormat::SingleChoice);

        fx.controller.start_round(&fx.presenter, q, None).await.unwrap();
        fx.controller.end_round_now(&fx.presenter, q).await.unwrap();
        fx.controller.end_round_now(&fx.presenter, q).await.unwrap();

        assert_eq!(*recorder.0.lock(), vec![q]);
    }
}
