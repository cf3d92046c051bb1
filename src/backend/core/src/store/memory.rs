//! In-memory collaborators for development and testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Authorizer, BulkWriteReport, EntityStore, RoomDirectory};
use crate::error::{PulseError, Result};
use crate::model::{Answer, Question, QuestionId, RoomId, UserId};

/// Capacity of the room deletion broadcast channel.
const DELETION_CHANNEL_CAPACITY: usize = 256;

/// Kind of store write, for targeted failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    SaveQuestion,
    SaveAnswers,
    DeleteAnswers,
}

/// In-memory [`EntityStore`] with write-failure injection.
#[derive(Default)]
pub struct InMemoryEntityStore {
    questions: DashMap<QuestionId, Question>,
    answers: Mutex<Vec<Answer>>,
    fail_writes: AtomicBool,
    failing: Mutex<HashSet<WriteKind>>,
    bulk_writes: AtomicU64,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a question directly.
    pub fn insert_question(&self, question: Question) {
        self.questions.insert(question.id, question);
    }

    /// Remove a question directly.
    pub fn remove_question(&self, id: QuestionId) -> Option<Question> {
        self.questions.remove(&id).map(|(_, q)| q)
    }

    /// Snapshot of a stored question.
    pub fn question(&self, id: QuestionId) -> Option<Question> {
        self.questions.get(&id).map(|q| q.clone())
    }

    /// Make every subsequent write fail with `StorageUnavailable` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make one kind of write fail with `StorageUnavailable` until reset.
    pub fn set_failing(&self, kind: WriteKind, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(kind);
        } else {
            failing.remove(&kind);
        }
    }

    /// Number of successful bulk answer writes.
    pub fn bulk_write_count(&self) -> u64 {
        self.bulk_writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored answer in insertion order.
    pub fn answers(&self) -> Vec<Answer> {
        self.answers.lock().clone()
    }

    fn check_writable(&self, kind: WriteKind) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) || self.failing.lock().contains(&kind) {
            return Err(PulseError::storage_unavailable("in-memory store write failure injected"));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn get_question(&self, id: QuestionId) -> Result<Option<Question>> {
        Ok(self.question(id))
    }

    async fn save_question(&self, question: &Question) -> Result<()> {
        self.check_writable(WriteKind::SaveQuestion)?;
        self.questions.insert(question.id, question.clone());
        Ok(())
    }

    async fn save_answers_bulk(&self, answers: &[Answer]) -> Result<BulkWriteReport> {
        self.check_writable(WriteKind::SaveAnswers)?;
        self.answers.lock().extend_from_slice(answers);
        self.bulk_writes.fetch_add(1, Ordering::SeqCst);
        debug!(count = answers.len(), "Answers stored");
        Ok(BulkWriteReport::complete())
    }

    async fn delete_answers_for_question(&self, id: QuestionId) -> Result<u64> {
        self.check_writable(WriteKind::DeleteAnswers)?;
        let mut answers = self.answers.lock();
        let before = answers.len();
        answers.retain(|a| a.question_id != id);
        Ok((before - answers.len()) as u64)
    }

    async fn find_answers(&self, id: QuestionId, round: u8) -> Result<Vec<Answer>> {
        Ok(self
            .answers
            .lock()
            .iter()
            .filter(|a| a.question_id == id && a.round == round)
            .cloned()
            .collect())
    }
}

/// Settings of a room known to [`InMemoryRoomDirectory`].
#[derive(Debug, Clone, Default)]
pub struct RoomSettings {
    pub quick_survey: bool,
    pub moderators: HashSet<UserId>,
}

impl RoomSettings {
    pub fn moderated_by(user: impl Into<UserId>) -> Self {
        let mut moderators = HashSet::new();
        moderators.insert(user.into());
        Self {
            quick_survey: false,
            moderators,
        }
    }

    pub fn with_quick_survey(mut self, enabled: bool) -> Self {
        self.quick_survey = enabled;
        self
    }
}

/// In-memory [`RoomDirectory`] that also answers [`Authorizer`] checks from
/// each room's moderator list.
pub struct InMemoryRoomDirectory {
    rooms: DashMap<RoomId, RoomSettings>,
    deletions: broadcast::Sender<RoomId>,
}

impl Default for InMemoryRoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRoomDirectory {
    pub fn new() -> Self {
        let (deletions, _) = broadcast::channel(DELETION_CHANNEL_CAPACITY);
        Self {
            rooms: DashMap::new(),
            deletions,
        }
    }

    pub fn insert_room(&self, room_id: RoomId, settings: RoomSettings) {
        self.rooms.insert(room_id, settings);
    }

    pub fn set_quick_survey(&self, room_id: RoomId, enabled: bool) -> Result<()> {
        let mut room = self
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| PulseError::room_not_found(room_id))?;
        room.quick_survey = enabled;
        Ok(())
    }

    /// Remove a room and announce its deletion to subscribers.
    pub fn delete_room(&self, room_id: RoomId) -> bool {
        let removed = self.rooms.remove(&room_id).is_some();
        if removed {
            // No subscribers is fine; nobody holds state for the room then.
            let _ = self.deletions.send(room_id);
        }
        removed
    }
}

#[async_trait]
impl RoomDirectory for InMemoryRoomDirectory {
    async fn is_quick_survey_enabled(&self, room_id: RoomId) -> Result<bool> {
        self.rooms
            .get(&room_id)
            .map(|r| r.quick_survey)
            .ok_or_else(|| PulseError::room_not_found(room_id))
    }

    async fn room_exists(&self, room_id: RoomId) -> Result<bool> {
        Ok(self.rooms.contains_key(&room_id))
    }

    fn subscribe_deletions(&self) -> broadcast::Receiver<RoomId> {
        self.deletions.subscribe()
    }
}

#[async_trait]
impl Authorizer for InMemoryRoomDirectory {
    async fn can_moderate(&self, user: &UserId, room_id: RoomId) -> Result<bool> {
        Ok(self
            .rooms
            .get(&room_id)
            .map(|r| r.moderators.contains(user))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnswerValue, QuestionFormat};

    #[tokio::test]
    async fn test_failed_write_stores_nothing() {
        let store = InMemoryEntityStore::new();
        let question = Question::new(RoomId::new(), QuestionFormat::Binary);
        let answer = Answer::new(&question, UserId::from("u"), AnswerValue::Abstention);

        store.set_fail_writes(true);
        let err = store.save_answers_bulk(&[answer.clone()]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.answers().is_empty());
        assert_eq!(store.bulk_write_count(), 0);

        store.set_fail_writes(false);
        store.save_answers_bulk(&[answer]).await.unwrap();
        assert_eq!(store.answers().len(), 1);
        assert_eq!(store.bulk_write_count(), 1);
    }

    #[tokio::test]
    async fn test_targeted_failure_hits_one_kind() {
        let store = InMemoryEntityStore::new();
        let question = Question::new(RoomId::new(), QuestionFormat::Binary);
        let answer = Answer::new(&question, UserId::from("u"), AnswerValue::Abstention);

        store.set_failing(WriteKind::SaveQuestion, true);
        assert!(store.save_question(&question).await.is_err());
        store.save_answers_bulk(&[answer]).await.unwrap();
        assert_eq!(store.delete_answers_for_question(question.id).await.unwrap(), 1);

        store.set_failing(WriteKind::SaveQuestion, false);
        store.save_question(&question).await.unwrap();
        assert!(store.question(question.id).is_some());
    }

    #[tokio::test]
    async fn test_room_deletion_is_broadcast() {
        let rooms = InMemoryRoomDirectory::new();
        let room = RoomId::new();
        rooms.insert_room(room, RoomSettings::moderated_by("lecturer"));

        let mut deletions = rooms.subscribe_deletions();
        assert!(rooms.delete_room(room));
        assert_eq!(deletions.recv().await.unwrap(), room);
        assert!(!rooms.room_exists(room).await.unwrap());
    }

    #[tokio::test]
    async fn test_moderator_check() {
        let rooms = InMemoryRoomDirectory::new();
        let room = RoomId::new();
        rooms.insert_room(room, RoomSettings::moderated_by("lecturer"));

        assert!(rooms.can_moderate(&UserId::from("lecturer"), room).await.unwrap());
        assert!(!rooms.can_moderate(&UserId::from("student"), room).await.unwrap());
        assert!(!rooms.can_moderate(&UserId::from("lecturer"), RoomId::new()).await.unwrap());
    }
}
