//! Questions and their round state machine.
//!
//! Round-based formats move through `RoundOpen(n)` and
//! `RoundEndedPendingReview(n)` for `n` in `1..=MAX_ROUND`. Formats that do not
//! use rounds keep `round == 0` and only toggle `responses_enabled`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{QuestionId, RoomId};

/// Highest round a question can reach. Starting another round after it only reopens it.
pub const MAX_ROUND: u8 = 2;

/// Format of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionFormat {
    SingleChoice,
    MultipleChoice,
    Binary,
    Scale,
    Sort,
    FreeText,
    Flashcard,
    Slide,
}

impl QuestionFormat {
    /// Whether the format takes part in round advancing.
    pub const fn uses_rounds(&self) -> bool {
        !matches!(self, Self::FreeText | Self::Flashcard | Self::Slide)
    }

    /// Whether participants can answer this format at all.
    pub const fn accepts_answers(&self) -> bool {
        !matches!(self, Self::Flashcard | Self::Slide)
    }

    /// Round a fresh or reset question of this format sits at.
    pub const fn base_round(&self) -> u8 {
        if self.uses_rounds() {
            1
        } else {
            0
        }
    }
}

/// Round state of a question. Mutated only through the transition methods below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState {
    /// 0 for formats without rounds and for round-based questions never started.
    pub round: u8,
    /// Whether new answers are currently accepted.
    pub responses_enabled: bool,
    /// When the scheduled auto-close fires, if any.
    pub round_end: Option<DateTime<Utc>>,
    /// The current round has run and been closed.
    pub round_finished: bool,
    pub solution_visible: bool,
    pub responses_visible: bool,
    /// Bumped by every start, never reset. Ties an auto-close to the start that armed it.
    #[serde(default)]
    pub generation: u32,
}

impl Default for RoundState {
    fn default() -> Self {
        Self {
            round: 0,
            responses_enabled: false,
            round_end: None,
            round_finished: false,
            solution_visible: false,
            responses_visible: false,
            generation: 0,
        }
    }
}

impl RoundState {
    /// Open a round. Returns the round that is now open.
    ///
    /// The first start moves a round-based question to round 1; starting again
    /// after a finished round advances to the next one, capped at [`MAX_ROUND`].
    pub fn start(&mut self, format: QuestionFormat, end_at: Option<DateTime<Utc>>) -> u8 {
        if format.uses_rounds() {
            if self.round == 0 {
                self.round = 1;
            } else if self.round_finished {
                self.round = (self.round + 1).min(MAX_ROUND);
            }
        } else {
            self.round = 0;
        }

        self.generation = self.generation.wrapping_add(1);
        self.responses_enabled = true;
        self.round_end = end_at;
        self.round_finished = false;
        self.solution_visible = false;
        self.responses_visible = false;
        self.round
    }

    /// Close the current round. Returns `false` if nothing was open.
    pub fn end(&mut self, format: QuestionFormat) -> bool {
        if !self.is_open() {
            return false;
        }

        self.responses_enabled = false;
        self.round_end = None;
        if format.uses_rounds() {
            self.round_finished = true;
        }
        true
    }

    /// Abort the current round.
    ///
    /// Cancelling round 2 falls back to the finished round 1; cancelling round 0
    /// or 1 only clears the finished marker.
    pub fn cancel(&mut self, format: QuestionFormat) {
        self.responses_enabled = false;
        self.round_end = None;
        self.solution_visible = false;
        self.responses_visible = false;

        if format.uses_rounds() && self.round >= MAX_ROUND {
            self.round = MAX_ROUND - 1;
            self.round_finished = true;
        } else {
            self.round_finished = false;
        }
    }

    /// Return to the base round with responses closed.
    pub fn reset(&mut self, format: QuestionFormat) {
        *self = Self {
            round: format.base_round(),
            generation: self.generation,
            ..Self::default()
        };
    }

    /// A round is open if responses are enabled or an auto-close is pending.
    pub fn is_open(&self) -> bool {
        self.responses_enabled || self.round_end.is_some()
    }
}

/// A question as the engine sees it. Only the fields the core reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub room_id: RoomId,
    pub format: QuestionFormat,
    #[serde(default)]
    pub round_state: RoundState,
}

impl Question {
    pub fn new(room_id: RoomId, format: QuestionFormat) -> Self {
        Self {
            id: QuestionId::new(),
            room_id,
            format,
            round_state: RoundState::default(),
        }
    }

    /// The round an answer submitted right now belongs to.
    pub fn active_round(&self) -> u8 {
        if self.format.uses_rounds() {
            self.round_state.round.max(1)
        } else {
            0
        }
    }
}
