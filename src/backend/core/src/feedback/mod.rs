//! Feedback Aggregator: the latest live-feedback vote per participant per room.
//!
//! Votes live only in memory and are rebuilt empty on restart. Each room's vote
//! table sits behind its own map shard lock, so writers, readers and the
//! cleanup cycle contend per room and never on a global lock. A vote recorded
//! while its room is being cleaned is applied either before the eviction pass
//! (and judged on its fresh timestamp) or after it; it is never lost.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::events::{EventBus, LiveEvent};
use crate::model::{FeedbackTally, FeedbackValue, FeedbackVote, Question, RoomId, UserId};
use crate::rounds::RoundObserver;
use crate::store::RoomDirectory;

/// Summary of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Rooms that lost at least one vote.
    pub rooms_changed: usize,
    /// Total votes evicted.
    pub evicted: usize,
    /// Rooms left alone because quick survey is enabled.
    pub rooms_skipped: usize,
}

pub struct FeedbackAggregator {
    rooms: DashMap<RoomId, HashMap<UserId, FeedbackVote>>,
    directory: Arc<dyn RoomDirectory>,
    events: EventBus,
    reset_on_round_end: bool,
}

impl FeedbackAggregator {
    pub fn new(directory: Arc<dyn RoomDirectory>, events: EventBus) -> Self {
        Self {
            rooms: DashMap::new(),
            directory,
            events,
            reset_on_round_end: true,
        }
    }

    /// Whether a closed round clears the feedback of rooms without quick survey.
    pub fn with_reset_on_round_end(mut self, enabled: bool) -> Self {
        self.reset_on_round_end = enabled;
        self
    }

    /// Upsert a participant's vote. The caller has already checked the room.
    pub fn record_vote(&self, room_id: RoomId, user_id: UserId, value: FeedbackValue) -> FeedbackTally {
        let tally = {
            let mut votes = self.rooms.entry(room_id).or_default();
            votes.insert(user_id, FeedbackVote::new(value));
            votes.values().collect::<FeedbackTally>()
        };

        counter!("pulse_feedback_votes_total", "value" => value_label(value)).increment(1);
        self.events.publish(LiveEvent::FeedbackChanged { room_id, tally });
        tally
    }

    /// Vote counts of a room. A room without votes has an all-zero tally.
    pub fn tally(&self, room_id: RoomId) -> FeedbackTally {
        self.rooms
            .get(&room_id)
            .map(|votes| votes.values().collect())
            .unwrap_or_default()
    }

    /// The participant's current vote in the room, if any.
    pub fn vote_for(&self, room_id: RoomId, user_id: &UserId) -> Option<FeedbackValue> {
        self.rooms
            .get(&room_id)
            .and_then(|votes| votes.get(user_id).map(|vote| vote.value))
    }

    /// Number of rooms currently holding votes.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Evict expired votes in every room that is not in quick-survey mode.
    ///
    /// A zero `max_age` evicts every vote, away votes included.
    #[instrument(skip_all, fields(max_age_secs = max_age.as_secs()))]
    pub async fn cleanup_cycle(&self, max_age: Duration) -> CleanupReport {
        let room_ids: Vec<RoomId> = self.rooms.iter().map(|entry| *entry.key()).collect();
        let now = Utc::now();

        let mut report = CleanupReport::default();
        let mut by_user: BTreeMap<UserId, Vec<RoomId>> = BTreeMap::new();

        for room_id in room_ids {
            match self.directory.is_quick_survey_enabled(room_id).await {
                Ok(true) => {
                    report.rooms_skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    // An unknown room is cleaned like any other; it is purged
                    // separately once its deletion is announced.
                    debug!(room_id = %room_id, error = %e, "Quick survey flag unavailable");
                }
            }

            let evicted = self.evict(room_id, max_age, now);
            if evicted.is_empty() {
                continue;
            }

            report.rooms_changed += 1;
            report.evicted += evicted.len();
            for user_id in evicted {
                by_user.entry(user_id).or_default().push(room_id);
            }
        }

        self.announce_resets(by_user);
        gauge!("pulse_feedback_rooms").set(self.rooms.len() as f64);
        if report.evicted > 0 {
            info!(
                evicted = report.evicted,
                rooms = report.rooms_changed,
                "Feedback cleanup evicted votes"
            );
        }
        report
    }

    /// Clean a single room regardless of its quick-survey flag.
    ///
    /// With a zero `max_age` this is the forced reset used when a presenter
    /// disables feedback or closes the room.
    pub fn cleanup_room(&self, room_id: RoomId, max_age: Duration) -> usize {
        self.cleanup_room_at(room_id, max_age, Utc::now())
    }

    fn cleanup_room_at(&self, room_id: RoomId, max_age: Duration, now: DateTime<Utc>) -> usize {
        let evicted = self.evict(room_id, max_age, now);
        let count = evicted.len();

        let by_user = evicted
            .into_iter()
            .map(|user_id| (user_id, vec![room_id]))
            .collect();
        self.announce_resets(by_user);
        count
    }

    /// Drop every vote of a deleted room without notifying anyone.
    pub fn purge_room(&self, room_id: RoomId) -> usize {
        let removed = self
            .rooms
            .remove(&room_id)
            .map(|(_, votes)| votes.len())
            .unwrap_or(0);
        gauge!("pulse_feedback_rooms").set(self.rooms.len() as f64);
        debug!(room_id = %room_id, removed, "Purged room feedback");
        removed
    }

    /// Purge rooms as the directory announces their deletion.
    pub fn spawn_room_deletion_listener(self: &Arc<Self>, directory: Arc<dyn RoomDirectory>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        let mut deletions = directory.subscribe_deletions();

        tokio::spawn(async move {
            loop {
                match deletions.recv().await {
                    Ok(room_id) => {
                        aggregator.purge_room(room_id);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Room deletion listener lagged, some rooms keep stale votes until cleanup");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Room deletion listener stopped");
        })
    }

    /// Remove expired votes of one room under its shard lock.
    fn evict(&self, room_id: RoomId, max_age: Duration, now: DateTime<Utc>) -> Vec<UserId> {
        let force = max_age.is_zero();
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age));

        let evicted = {
            let Some(mut votes) = self.rooms.get_mut(&room_id) else {
                return Vec::new();
            };

            let mut evicted = Vec::new();
            votes.retain(|user_id, vote| {
                let expired = force
                    || (!vote.value.is_sticky()
                        && cutoff.is_some_and(|cutoff| vote.recorded_at < cutoff));
                if expired {
                    evicted.push(user_id.clone());
                }
                !expired
            });
            evicted
        };

        // Only drop the table if no vote slipped in after the eviction pass.
        self.rooms.remove_if(&room_id, |_, votes| votes.is_empty());

        if !evicted.is_empty() {
            counter!("pulse_feedback_evicted_total").increment(evicted.len() as u64);
            self.events.publish(LiveEvent::FeedbackChanged {
                room_id,
                tally: self.tally(room_id),
            });
        }
        evicted
    }

    fn announce_resets(&self, by_user: BTreeMap<UserId, Vec<RoomId>>) {
        for (user_id, room_ids) in by_user {
            self.events.publish(LiveEvent::FeedbackReset { user_id, room_ids });
        }
    }
}

#[async_trait]
impl RoundObserver for FeedbackAggregator {
    async fn round_ended(&self, question: &Question) -> Result<()> {
        if !self.reset_on_round_end {
            return Ok(());
        }
        if self.directory.is_quick_survey_enabled(question.room_id).await? {
            return Ok(());
        }

        let cleared = self.cleanup_room(question.room_id, Duration::ZERO);
        if cleared > 0 {
            debug!(room_id = %question.room_id, cleared, "Feedback reset after round end");
        }
        Ok(())
    }
}

fn value_label(value: FeedbackValue) -> &'static str {
    match value {
        FeedbackValue::Faster => "faster",
        FeedbackValue::Ok => "ok",
        FeedbackValue::Slower => "slower",
        FeedbackValue::Away => "away",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStream;
    use crate::model::QuestionFormat;
    use crate::store::{InMemoryRoomDirectory, RoomSettings};

    fn aggregator() -> (FeedbackAggregator, Arc<InMemoryRoomDirectory>, EventStream) {
        let directory = Arc::new(InMemoryRoomDirectory::new());
        let (events, stream) = EventBus::channel(256);
        (FeedbackAggregator::new(directory.clone(), events), directory, stream)
    }

    fn room(directory: &InMemoryRoomDirectory, quick_survey: bool) -> RoomId {
        let room_id = RoomId::new();
        directory.insert_room(room_id, RoomSettings::default().with_quick_survey(quick_survey));
        room_id
    }

    #[tokio::test]
    async fn test_tally_and_forced_cleanup() {
        let (feedback, directory, _stream) = aggregator();
        let r = room(&directory, false);

        feedback.record_vote(r, UserId::from("a"), FeedbackValue::Ok);
        feedback.record_vote(r, UserId::from("b"), FeedbackValue::Ok);
        feedback.record_vote(r, UserId::from("c"), FeedbackValue::Away);
        assert_eq!(feedback.tally(r), FeedbackTally([0, 2, 0, 1]));

        let report = feedback.cleanup_cycle(Duration::ZERO).await;
        assert_eq!(report.evicted, 3);
        assert_eq!(feedback.tally(r), FeedbackTally::default());
        assert_eq!(feedback.room_count(), 0);
    }

    #[test]
    fn test_revote_replaces_previous_vote() {
        let (feedback, directory, _stream) = aggregator();
        let r = room(&directory, false);
        let user = UserId::from("a");

        feedback.record_vote(r, user.clone(), FeedbackValue::Faster);
        feedback.record_vote(r, user.clone(), FeedbackValue::Slower);

        assert_eq!(feedback.tally(r), FeedbackTally([0, 0, 1, 0]));
        assert_eq!(feedback.vote_for(r, &user), Some(FeedbackValue::Slower));
        assert_eq!(feedback.vote_for(r, &UserId::from("b")), None);
    }

    #[test]
    fn test_away_votes_survive_age_eviction() {
        let (feedback, directory, _stream) = aggregator();
        let r = room(&directory, false);

        feedback.record_vote(r, UserId::from("gone"), FeedbackValue::Away);
        feedback.record_vote(r, UserId::from("here"), FeedbackValue::Ok);

        let later = Utc::now() + chrono::Duration::minutes(10);
        assert_eq!(feedback.cleanup_room_at(r, Duration::from_secs(300), later), 1);
        assert_eq!(feedback.tally(r), FeedbackTally([0, 0, 0, 1]));

        assert_eq!(feedback.cleanup_room_at(r, Duration::ZERO, later), 1);
        assert!(feedback.tally(r).is_empty());
    }

    #[test]
    fn test_fresh_votes_are_kept() {
        let (feedback, directory, _stream) = aggregator();
        let r = room(&directory, false);
        feedback.record_vote(r, UserId::from("a"), FeedbackValue::Faster);

        assert_eq!(feedback.cleanup_room(r, Duration::from_secs(300)), 0);
        assert_eq!(feedback.tally(r).total(), 1);
    }

    #[tokio::test]
    async fn test_quick_survey_rooms_are_skipped() {
        let (feedback, directory, _stream) = aggregator();
        let survey = room(&directory, true);
        let lecture = room(&directory, false);

        feedback.record_vote(survey, UserId::from("a"), FeedbackValue::Ok);
        feedback.record_vote(lecture, UserId::from("a"), FeedbackValue::Ok);

        let report = feedback.cleanup_cycle(Duration::ZERO).await;
        assert_eq!(report.rooms_skipped, 1);
        assert_eq!(feedback.tally(survey).total(), 1);
        assert!(feedback.tally(lecture).is_empty());
    }

    #[tokio::test]
    async fn test_resets_are_grouped_per_user() {
        let (feedback, directory, mut stream) = aggregator();
        let first = room(&directory, false);
        let second = room(&directory, false);

        feedback.record_vote(first, UserId::from("a"), FeedbackValue::Ok);
        feedback.record_vote(second, UserId::from("a"), FeedbackValue::Slower);
        feedback.record_vote(second, UserId::from("b"), FeedbackValue::Faster);
        stream.drain_ready();

        feedback.cleanup_cycle(Duration::ZERO).await;

        let mut resets: Vec<(UserId, usize)> = stream
            .drain_ready()
            .into_iter()
            .filter_map(|e| match e {
                LiveEvent::FeedbackReset { user_id, room_ids } => Some((user_id, room_ids.len())),
                _ => None,
            })
            .collect();
        resets.sort();
        assert_eq!(resets, vec![(UserId::from("a"), 2), (UserId::from("b"), 1)]);
    }

    #[tokio::test]
    async fn test_round_end_resets_lecture_room() {
        let (feedback, directory, _stream) = aggregator();
        let lecture = room(&directory, false);
        let survey = room(&directory, true);

        feedback.record_vote(lecture, UserId::from("a"), FeedbackValue::Away);
        feedback.record_vote(survey, UserId::from("a"), FeedbackValue::Away);

        feedback
            .round_ended(&Question::new(lecture, QuestionFormat::SingleChoice))
            .await
            .unwrap();
        feedback
            .round_ended(&Question::new(survey, QuestionFormat::SingleChoice))
            .await
            .unwrap();

        assert!(feedback.tally(lecture).is_empty());
        assert_eq!(feedback.tally(survey).total(), 1);
    }

    #[tokio::test]
    async fn test_deleted_room_is_purged() {
        let (feedback, directory, _stream) = aggregator();
        let feedback = Arc::new(feedback);
        let r = room(&directory, false);
        feedback.record_vote(r, UserId::from("a"), FeedbackValue::Ok);

        let listener = feedback.spawn_room_deletion_listener(directory.clone());
        directory.delete_room(r);

        for _ in 0..10 {
            if feedback.room_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(feedback.room_count(), 0);
        listener.abort();
    }
}
