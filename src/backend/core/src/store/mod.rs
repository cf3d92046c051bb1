//! Interfaces to the collaborators the engine runs against.
//!
//! Durable storage, room management and authorization live outside this crate.
//! The engine only sees the traits below; [`memory`] provides in-process
//! implementations for development and tests.

pub mod memory;

pub use memory::{InMemoryEntityStore, InMemoryRoomDirectory, RoomSettings, WriteKind};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;
use crate::model::{Answer, Question, QuestionId, RoomId, UserId};

/// Outcome of a bulk answer write.
///
/// A store may persist a batch partially; the indexes it could not write are
/// reported so the caller knows exactly which answers were dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteReport {
    /// Indexes into the submitted slice that were not persisted.
    pub failed: Vec<usize>,
}

impl BulkWriteReport {
    pub fn complete() -> Self {
        Self::default()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Durable storage for questions and answers.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Load a question by id.
    async fn get_question(&self, id: QuestionId) -> Result<Option<Question>>;

    /// Persist a question document, including its round state.
    async fn save_question(&self, question: &Question) -> Result<()>;

    /// Persist a batch of answers in one write.
    async fn save_answers_bulk(&self, answers: &[Answer]) -> Result<BulkWriteReport>;

    /// Delete every answer of a question. Returns the number deleted.
    async fn delete_answers_for_question(&self, id: QuestionId) -> Result<u64>;

    /// Load the answers of a question for one round.
    async fn find_answers(&self, id: QuestionId, round: u8) -> Result<Vec<Answer>>;
}

/// Room settings and lifecycle.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Whether the room's feedback is in quick-survey mode.
    async fn is_quick_survey_enabled(&self, room_id: RoomId) -> Result<bool>;

    /// Whether the room exists.
    async fn room_exists(&self, room_id: RoomId) -> Result<bool>;

    /// Stream of deleted room ids.
    fn subscribe_deletions(&self) -> broadcast::Receiver<RoomId>;
}

/// Authorization check performed before any round transition.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `user` may control rounds in `room_id`.
    async fn can_moderate(&self, user: &UserId, room_id: RoomId) -> Result<bool>;
}
