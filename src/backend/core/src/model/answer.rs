//! Answers, the buffered envelope, and per-round statistics.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AnswerId, Question, QuestionFormat, QuestionId, RoomId, UserId};

/// The content of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerValue {
    /// Selected option indexes (choice, binary, scale and sort formats).
    Choices { selected: Vec<u16> },
    /// Free-text answer.
    Text { subject: String, body: String },
    /// Participant explicitly chose not to answer.
    Abstention,
}

impl AnswerValue {
    /// Whether this value is a legal answer for `format`.
    pub fn fits(&self, format: QuestionFormat) -> bool {
        match self {
            Self::Abstention => format.accepts_answers(),
            Self::Choices { selected } => match format {
                QuestionFormat::SingleChoice | QuestionFormat::Scale => selected.len() == 1,
                QuestionFormat::Binary => matches!(selected.as_slice(), [0] | [1]),
                QuestionFormat::MultipleChoice | QuestionFormat::Sort => {
                    !selected.is_empty() && distinct(selected).len() == selected.len()
                }
                _ => false,
            },
            Self::Text { body, .. } => format == QuestionFormat::FreeText && !body.trim().is_empty(),
        }
    }
}

fn distinct(selected: &[u16]) -> BTreeSet<u16> {
    selected.iter().copied().collect()
}

/// A submitted answer. `round` is stamped at submission and never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub id: AnswerId,
    pub question_id: QuestionId,
    pub room_id: RoomId,
    pub creator_id: UserId,
    pub value: AnswerValue,
    pub round: u8,
    pub submitted_at: DateTime<Utc>,
}

impl Answer {
    pub fn new(question: &Question, creator_id: UserId, value: AnswerValue) -> Self {
        Self {
            id: AnswerId::new(),
            question_id: question.id,
            room_id: question.room_id,
            creator_id,
            value,
            round: question.active_round(),
            submitted_at: Utc::now(),
        }
    }
}

/// The slice of a question needed to announce an answer after it is flushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionSnapshot {
    pub id: QuestionId,
    pub room_id: RoomId,
    pub format: QuestionFormat,
    pub round: u8,
}

impl From<&Question> for QuestionSnapshot {
    fn from(question: &Question) -> Self {
        Self {
            id: question.id,
            room_id: question.room_id,
            format: question.format,
            round: question.active_round(),
        }
    }
}

/// An answer waiting in the ingestion buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedAnswer {
    pub answer: Answer,
    pub question: QuestionSnapshot,
}

impl BufferedAnswer {
    pub fn new(answer: Answer, question: &Question) -> Self {
        Self {
            answer,
            question: QuestionSnapshot::from(question),
        }
    }

    /// The answer targets a round other than the one active when the snapshot was taken.
    pub fn is_stale(&self) -> bool {
        self.answer.round != self.question.round
    }
}

/// Answer counts for one question and one round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerStatistics {
    pub question_id: QuestionId,
    pub round: u8,
    pub answer_count: u32,
    pub abstention_count: u32,
    /// Count per option index, sized to the highest index seen.
    pub choice_counts: Vec<u32>,
    pub text_count: u32,
}

impl AnswerStatistics {
    /// Tally `answers`, ignoring any that belong to another question or round.
    pub fn from_answers<'a>(
        question_id: QuestionId,
        round: u8,
        answers: impl IntoIterator<Item = &'a Answer>,
    ) -> Self {
        let mut stats = Self {
            question_id,
            round,
            ..Self::default()
        };

        for answer in answers
            .into_iter()
            .filter(|a| a.question_id == question_id && a.round == round)
        {
            stats.answer_count += 1;
            match &answer.value {
                AnswerValue::Abstention => stats.abstention_count += 1,
                AnswerValue::Text { .. } => stats.text_count += 1,
                AnswerValue::Choices { selected } => {
                    for index in distinct(selected) {
                        let index = usize::from(index);
                        if stats.choice_counts.len() <= index {
                            stats.choice_counts.resize(index + 1, 0);
                        }
                        stats.choice_counts[index] += 1;
                    }
                }
            }
        }

        stats
    }
}
