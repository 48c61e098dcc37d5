//! Room registry
//!
//! Maps room names to their connected members. Rooms are created by the first
//! join and removed by the last leave, so an empty room is never observable.
//! A single registry-wide lock serializes membership changes and snapshots;
//! fanout happens on a snapshot after the lock is released.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{Member, MemberId};

/// Default time a fanout waits on one member's full queue
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// State of a room after a member left it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Other members remain
    Occupied { remaining: usize },
    /// The room became empty and was removed
    Empty,
}

/// Outcome of a single fanout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Registry of active rooms and their members
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, HashMap<MemberId, Member>>>,
    send_timeout: Duration,
}

impl RoomRegistry {
    /// Create an empty registry
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }

    /// Create an empty registry with a custom per-member send timeout
    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Add a member to a room, creating the room if needed
    ///
    /// Returns `false` without changing anything if the member is already in
    /// the room.
    pub async fn join(&self, room: &str, member: Member) -> bool {
        let mut rooms = self.rooms.write().await;
        let members = rooms.entry(room.to_string()).or_default();

        if members.contains_key(&member.id()) {
            return false;
        }

        debug!(
            room,
            member = %member.id(),
            identity = %member.identity(),
            "Member joined room"
        );
        members.insert(member.id(), member);
        true
    }

    /// Remove a member from a room
    ///
    /// Returns `None` if the member was not in the room. When the last member
    /// leaves, the room is deleted and `RoomState::Empty` is returned.
    pub async fn leave(&self, room: &str, member_id: MemberId) -> Option<RoomState> {
        let mut rooms = self.rooms.write().await;
        let members = rooms.get_mut(room)?;
        members.remove(&member_id)?;

        if members.is_empty() {
            rooms.remove(room);
            debug!(room, member = %member_id, "Last member left, room removed");
            Some(RoomState::Empty)
        } else {
            let remaining = members.len();
            debug!(room, member = %member_id, remaining, "Member left room");
            Some(RoomState::Occupied { remaining })
        }
    }

    /// Point-in-time copy of a room's members
    pub async fn snapshot(&self, room: &str) -> Vec<Member> {
        self.rooms
            .read()
            .await
            .get(room)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver `text` to every member of `room` except `exclude`
    ///
    /// Deliveries run concurrently on a snapshot. A failed delivery is logged
    /// and counted; it never stops delivery to the remaining members.
    pub async fn broadcast(
        &self,
        room: &str,
        text: &str,
        exclude: Option<MemberId>,
    ) -> FanoutReport {
        let recipients: Vec<Member> = self
            .snapshot(room)
            .await
            .into_iter()
            .filter(|m| Some(m.id()) != exclude)
            .collect();

        let results = join_all(
            recipients
                .iter()
                .map(|m| m.deliver(text.to_string(), self.send_timeout)),
        )
        .await;

        let mut report = FanoutReport::default();
        for (member, result) in recipients.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(room, identity = %member.identity(), "Dropping message: {}", e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Number of rooms with at least one member
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Number of members in a room (0 if the room does not exist)
    pub async fn member_count(&self, room: &str) -> usize {
        self.rooms.read().await.get(room).map_or(0, HashMap::len)
    }

    /// Check whether a room currently exists
    #[allow(dead_code)]
    pub async fn contains_room(&self, room: &str) -> bool {
        self.rooms.read().await.contains_key(room)
    }

    /// Names of all active rooms, sorted
    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
