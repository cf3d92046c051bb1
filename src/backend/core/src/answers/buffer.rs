//! Concurrent answer queue with batched flushes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::events::{EventBus, LiveEvent};
use crate::model::{Answer, BufferedAnswer, QuestionId};
use crate::store::EntityStore;

/// Result of one flush cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another cycle was still running.
    Skipped,
    /// Nothing was buffered.
    Empty,
    /// The bulk write went through, possibly partially.
    Flushed { persisted: usize, dropped: usize },
    /// The bulk write failed and the whole batch was dropped.
    Failed { dropped: usize },
}

/// Holds flush cycles off while alive. See [`AnswerBuffer::pause_flush`].
pub struct FlushPause<'a> {
    _running: tokio::sync::MutexGuard<'a, ()>,
}

/// Counters for the answer buffer.
#[derive(Debug, Default)]
pub struct BufferStats {
    submitted: AtomicU64,
    stale: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    skipped_cycles: AtomicU64,
}

impl BufferStats {
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub fn stale(&self) -> u64 {
        self.stale.load(Ordering::Relaxed)
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn skipped_cycles(&self) -> u64 {
        self.skipped_cycles.load(Ordering::Relaxed)
    }
}

/// Many-producer, single-drainer answer queue.
///
/// `submit` holds the queue lock only for a push. `flush_cycle` swaps the whole
/// queue out in one step, so anything appended afterwards lands in the next
/// batch and nothing is seen twice.
pub struct AnswerBuffer {
    queue: Mutex<Vec<BufferedAnswer>>,
    flushing: tokio::sync::Mutex<()>,
    store: Arc<dyn EntityStore>,
    events: EventBus,
    stats: BufferStats,
}

impl AnswerBuffer {
    pub fn new(store: Arc<dyn EntityStore>, events: EventBus) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            flushing: tokio::sync::Mutex::new(()),
            store,
            events,
            stats: BufferStats::default(),
        }
    }

    /// Queue an answer for the next flush. Never blocks on I/O.
    pub fn submit(&self, envelope: BufferedAnswer) {
        if envelope.is_stale() {
            self.stats.stale.fetch_add(1, Ordering::Relaxed);
            counter!("pulse_answers_stale_total").increment(1);
            debug!(
                question_id = %envelope.answer.question_id,
                target_round = envelope.answer.round,
                active_round = envelope.question.round,
                "Buffered answer targets a round that is not active"
            );
        }

        let pending = {
            let mut queue = self.queue.lock();
            queue.push(envelope);
            queue.len()
        };

        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        counter!("pulse_answers_buffered_total").increment(1);
        gauge!("pulse_answers_pending").set(pending as f64);
    }

    /// Number of answers waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drop every buffered answer of a question. Returns how many were removed.
    pub fn discard_question(&self, question_id: QuestionId) -> usize {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|b| b.answer.question_id != question_id);
        let removed = before - queue.len();
        if removed > 0 {
            debug!(question_id = %question_id, removed, "Discarded buffered answers");
        }
        removed
    }

    /// Wait for an in-flight flush to finish, then keep new cycles from starting.
    ///
    /// Cycles that tick while the pause is held return
    /// [`FlushOutcome::Skipped`] and leave the queue untouched.
    pub async fn pause_flush(&self) -> FlushPause<'_> {
        FlushPause {
            _running: self.flushing.lock().await,
        }
    }

    /// Drain the queue into one bulk write and announce what was persisted.
    ///
    /// Overlapping calls do not wait: if a cycle is already running the call
    /// returns [`FlushOutcome::Skipped`] immediately.
    pub async fn flush_cycle(&self) -> FlushOutcome {
        let Ok(_running) = self.flushing.try_lock() else {
            self.stats.skipped_cycles.fetch_add(1, Ordering::Relaxed);
            debug!("Flush already in progress, skipping cycle");
            return FlushOutcome::Skipped;
        };

        let batch = std::mem::take(&mut *self.queue.lock());
        gauge!("pulse_answers_pending").set(0.0);
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        let size = batch.len();
        let (answers, snapshots): (Vec<Answer>, Vec<_>) =
            batch.into_iter().map(|b| (b.answer, b.question)).unzip();

        let started = Instant::now();
        let result = self.store.save_answers_bulk(&answers).await;
        histogram!("pulse_answer_flush_duration_seconds").record(started.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                let failed: HashSet<usize> = report.failed.into_iter().collect();
                let dropped = failed.len();
                let persisted = size - dropped;

                for (index, (answer, question)) in answers.into_iter().zip(snapshots).enumerate() {
                    if failed.contains(&index) {
                        continue;
                    }
                    self.events.publish(LiveEvent::NewAnswer { answer, question });
                }

                self.stats.persisted.fetch_add(persisted as u64, Ordering::Relaxed);
                counter!("pulse_answers_flushed_total").increment(persisted as u64);
                if dropped > 0 {
                    self.stats.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
                    counter!("pulse_answers_dropped_total").increment(dropped as u64);
                    warn!(persisted, dropped, "Bulk answer write was partial, unwritten answers dropped");
                } else {
                    info!(persisted, "Flushed answer batch");
                }

                FlushOutcome::Flushed { persisted, dropped }
            }
            Err(e) => {
                e.log();
                self.stats.dropped.fetch_add(size as u64, Ordering::Relaxed);
                counter!("pulse_answers_dropped_total").increment(size as u64);
                warn!(dropped = size, error = %e, "Bulk answer write failed, batch dropped");
                FlushOutcome::Failed { dropped: size }
            }
        }
    }

    pub fn stats(&self) -> &BufferStats {
        &self.stats
    }
}
