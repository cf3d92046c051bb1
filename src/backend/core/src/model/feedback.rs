//! Live feedback votes and room tallies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PulseError;

/// One of the four fixed feedback codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FeedbackValue {
    Faster = 0,
    Ok = 1,
    Slower = 2,
    Away = 3,
}

impl FeedbackValue {
    pub const ALL: [FeedbackValue; 4] = [Self::Faster, Self::Ok, Self::Slower, Self::Away];

    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Away votes survive age-based eviction.
    pub const fn is_sticky(self) -> bool {
        matches!(self, Self::Away)
    }
}

impl TryFrom<u8> for FeedbackValue {
    type Error = PulseError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Self::Faster),
            1 => Ok(Self::Ok),
            2 => Ok(Self::Slower),
            3 => Ok(Self::Away),
            other => Err(PulseError::invalid_input(format!(
                "Unknown feedback value: {}",
                other
            ))),
        }
    }
}

/// The latest vote of one participant in one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackVote {
    pub value: FeedbackValue,
    pub recorded_at: DateTime<Utc>,
}

impl FeedbackVote {
    pub fn new(value: FeedbackValue) -> Self {
        Self {
            value,
            recorded_at: Utc::now(),
        }
    }
}

/// Vote counts of a room, indexed by [`FeedbackValue::code`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedbackTally(pub [u32; 4]);

impl FeedbackTally {
    pub fn add(&mut self, value: FeedbackValue) {
        self.0[usize::from(value.code())] += 1;
    }

    pub fn count(&self, value: FeedbackValue) -> u32 {
        self.0[usize::from(value.code())]
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl<'a> FromIterator<&'a FeedbackVote> for FeedbackTally {
    fn from_iter<I: IntoIterator<Item = &'a FeedbackVote>>(iter: I) -> Self {
        let mut tally = Self::default();
        for vote in iter {
            tally.add(vote.value);
        }
        tally
    }
}
