//! Request-path entry point for answer submissions and round statistics.

use std::sync::Arc;

use tracing::instrument;

use super::AnswerBuffer;
use crate::error::{PulseError, Result};
use crate::model::{
    Answer, AnswerStatistics, AnswerValue, BufferedAnswer, Question, QuestionId, UserId, MAX_ROUND,
};
use crate::store::EntityStore;

/// Validates submissions and feeds them to the [`AnswerBuffer`].
pub struct AnswerIntake {
    store: Arc<dyn EntityStore>,
    buffer: Arc<AnswerBuffer>,
}

impl AnswerIntake {
    pub fn new(store: Arc<dyn EntityStore>, buffer: Arc<AnswerBuffer>) -> Self {
        Self { store, buffer }
    }

    /// Accept an answer for a question whose responses are enabled.
    ///
    /// `target_round` is the round the participant saw when answering. It is
    /// kept as given even if the question has moved on, but may not name a
    /// round that has not started. Without it the question's active round is
    /// used. The returned answer is provisional: it
    /// reaches storage with the next flush.
    #[instrument(skip_all, fields(question_id = %question_id, creator = %creator))]
    pub async fn submit_answer(
        &self,
        question_id: QuestionId,
        creator: UserId,
        value: AnswerValue,
        target_round: Option<u8>,
    ) -> Result<Answer> {
        let question = self.load(question_id).await?;

        if !question.format.accepts_answers() {
            return Err(PulseError::invalid_input("This question does not take answers")
                .with_context("format", question.format));
        }
        if !question.round_state.responses_enabled {
            return Err(PulseError::responses_closed(question_id));
        }
        if !value.fits(question.format) {
            return Err(PulseError::invalid_input("Answer does not match the question format")
                .with_context("format", question.format));
        }

        let mut answer = Answer::new(&question, creator, value);
        if let Some(round) = target_round {
            check_round(&question, round)?;
            if round > question.active_round() {
                return Err(PulseError::invalid_input(format!("Round {} has not started yet", round))
                    .with_context("active_round", question.active_round()));
            }
            answer.round = round;
        }

        self.buffer.submit(BufferedAnswer::new(answer.clone(), &question));
        Ok(answer)
    }

    /// Answer statistics for one round, defaulting to the active round.
    #[instrument(skip_all, fields(question_id = %question_id))]
    pub async fn statistics(&self, question_id: QuestionId, round: Option<u8>) -> Result<AnswerStatistics> {
        let question = self.load(question_id).await?;
        let round = round.unwrap_or_else(|| question.active_round());
        check_round(&question, round)?;

        let answers = self.store.find_answers(question_id, round).await?;
        Ok(AnswerStatistics::from_answers(question_id, round, &answers))
    }

    async fn load(&self, question_id: QuestionId) -> Result<Question> {
        self.store
            .get_question(question_id)
            .await?
            .ok_or_else(|| PulseError::question_not_found(question_id))
    }
}

fn check_round(question: &Question, round: u8) -> Result<()> {
    let valid = if question.format.uses_rounds() {
        (1..=MAX_ROUND).contains(&round)
    } else {
        round == 0
    };

    if valid {
        Ok(())
    } else {
        Err(PulseError::invalid_input(format!("Round {} does not exist for this question", round))
            .with_context("format", question.format))
    }
}
