//! Connected-client bookkeeping: which user owns a session and which room a
//! user is in.
//!
//! One registry instance is created by the engine and shared by reference. All
//! maps sit behind a single mutex so a session and its user's room membership
//! always change together.

use std::collections::{HashMap, HashSet};

use metrics::gauge;
use parking_lot::Mutex;
use tracing::debug;

use crate::model::{RoomId, SessionId, UserId};

#[derive(Debug, Default)]
struct Maps {
    sessions: HashMap<SessionId, UserId>,
    session_counts: HashMap<UserId, usize>,
    rooms: HashMap<UserId, RoomId>,
    members: HashMap<RoomId, HashSet<UserId>>,
}

impl Maps {
    fn leave(&mut self, user_id: &UserId) -> Option<RoomId> {
        let room_id = self.rooms.remove(user_id)?;
        if let Some(members) = self.members.get_mut(&room_id) {
            members.remove(user_id);
            if members.is_empty() {
                self.members.remove(&room_id);
            }
        }
        Some(room_id)
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    maps: Mutex<Maps>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a session to a user. Rebinding a session moves it to the new user.
    pub fn bind(&self, session_id: SessionId, user_id: UserId) {
        let mut maps = self.maps.lock();
        match maps.sessions.insert(session_id, user_id.clone()) {
            Some(previous) if previous == user_id => return,
            Some(previous) => release_session(&mut maps, &previous),
            None => {}
        }
        *maps.session_counts.entry(user_id).or_default() += 1;
        gauge!("pulse_sessions_active").set(maps.sessions.len() as f64);
    }

    /// Detach a session. A user whose last session goes away also leaves
    /// their room. Returns the user the session belonged to.
    pub fn unbind(&self, session_id: SessionId) -> Option<UserId> {
        let mut maps = self.maps.lock();
        let user_id = maps.sessions.remove(&session_id)?;
        release_session(&mut maps, &user_id);
        gauge!("pulse_sessions_active").set(maps.sessions.len() as f64);
        Some(user_id)
    }

    /// Put a user into a room, leaving any previous one. Returns the room left.
    pub fn join_room(&self, user_id: UserId, room_id: RoomId) -> Option<RoomId> {
        let mut maps = self.maps.lock();
        let previous = maps.leave(&user_id);
        maps.members.entry(room_id).or_default().insert(user_id.clone());
        maps.rooms.insert(user_id, room_id);
        previous
    }

    /// Take a user out of their room. Returns the room left.
    pub fn leave_room(&self, user_id: &UserId) -> Option<RoomId> {
        self.maps.lock().leave(user_id)
    }

    pub fn user_for(&self, session_id: SessionId) -> Option<UserId> {
        self.maps.lock().sessions.get(&session_id).cloned()
    }

    pub fn room_for(&self, user_id: &UserId) -> Option<RoomId> {
        self.maps.lock().rooms.get(user_id).copied()
    }

    /// Number of distinct users currently in the room.
    pub fn online_count(&self, room_id: RoomId) -> usize {
        self.maps
            .lock()
            .members
            .get(&room_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    /// Number of bound sessions.
    pub fn session_count(&self) -> usize {
        self.maps.lock().sessions.len()
    }

    /// Forget everything, e.g. on shutdown.
    pub fn clear(&self) {
        let mut maps = self.maps.lock();
        let sessions = maps.sessions.len();
        *maps = Maps::default();
        gauge!("pulse_sessions_active").set(0.0);
        debug!(sessions, "Session registry cleared");
    }
}

fn release_session(maps: &mut Maps, user_id: &UserId) {
    let remaining = match maps.session_counts.get_mut(user_id) {
        Some(count) => {
            *count = count.saturating_sub(1);
            *count
        }
        None => 0,
    };
    if remaining == 0 {
        maps.session_counts.remove(user_id);
        maps.leave(user_id);
    }
}
