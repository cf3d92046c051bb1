#![allow(clippy::result_large_err)]
//! # Pulse Core
//!
//! Live round and feedback engine for classroom audience response.
//!
//! ## Architecture
//!
//! - **Rounds**: per-question voting rounds with optional timed auto-close
//! - **Answers**: validated submissions buffered in memory and flushed in batches
//! - **Feedback**: latest "faster / ok / slower / away" vote per participant per room,
//!   with periodic eviction of stale votes
//! - **Timer**: named, cancellable delayed callbacks with race-free replacement
//! - **Events**: bounded outbound notification channel drained by a sink
//! - **Sessions**: which user owns a connection and which room a user is in
//! - **Store**: interfaces to durable storage, rooms and authorization, plus
//!   in-memory implementations
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod answers;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feedback;
pub mod model;
pub mod rounds;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod timer;

pub use error::{ErrorCode, ErrorDetails, ErrorSeverity, PulseError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::answers::{AnswerBuffer, AnswerIntake, FlushOutcome};
    pub use crate::config::{Config, EngineConfig};
    pub use crate::engine::{EngineHandle, LiveEngine};
    pub use crate::error::{ErrorCode, ErrorDetails, ErrorSeverity, PulseError, Result};
    pub use crate::events::{EventBus, EventStream, LiveEvent, LoggingSink, NotificationSink};
    pub use crate::feedback::{CleanupReport, FeedbackAggregator};
    pub use crate::model::{
        Answer, AnswerId, AnswerStatistics, AnswerValue, FeedbackTally, FeedbackValue, Question,
        QuestionFormat, QuestionId, RoomId, RoundState, SessionId, UserId,
    };
    pub use crate::rounds::{RoundController, RoundObserver};
    pub use crate::session::SessionRegistry;
    pub use crate::store::{Authorizer, EntityStore, RoomDirectory};
    pub use crate::timer::TimerRegistry;
}
