//! Domain types shared by the round, answer and feedback engines.

pub mod answer;
pub mod feedback;
pub mod question;

pub use answer::{Answer, AnswerStatistics, AnswerValue, BufferedAnswer, QuestionSnapshot};
pub use feedback::{FeedbackTally, FeedbackValue, FeedbackVote};
pub use question::{Question, QuestionFormat, RoundState, MAX_ROUND};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a question (content) inside a room.
    QuestionId
);
uuid_id!(
    /// Identifier of a room.
    RoomId
);
uuid_id!(
    /// Identifier of a submitted answer.
    AnswerId
);
uuid_id!(
    /// Identifier of a connected client session (one socket).
    SessionId
);

/// Opaque identifier of an authenticated user.
///
/// Issued by the identity provider; the engine never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}
