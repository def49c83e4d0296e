use std::io;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;

use crate::engine::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoomInfo {
    pub name: String,
    pub capacity: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Room and user metadata owned outside the scheduling engine.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn room(&self, room_id: &str) -> Option<RoomInfo>;

    /// Display name for conflict reports and override notes.
    async fn user_name(&self, user_id: &str) -> Option<String>;
}

/// In-process directory, optionally seeded from a JSON file:
///
/// ```json
/// { "rooms": { "r1": { "name": "Everest", "capacity": 8 } },
///   "users": { "u1": "Alice" } }
/// ```
#[derive(Default)]
pub struct StaticDirectory {
    rooms: DashMap<String, RoomInfo>,
    users: DashMap<String, String>,
}

#[derive(Deserialize)]
struct Seed {
    #[serde(default)]
    rooms: std::collections::HashMap<String, RoomInfo>,
    #[serde(default)]
    users: std::collections::HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> io::Result<Self> {
        let seed: Seed = serde_json::from_str(json)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let dir = Self::new();
        for (id, room) in seed.rooms {
            dir.rooms.insert(id, room);
        }
        for (id, name) in seed.users {
            dir.users.insert(id, name);
        }
        Ok(dir)
    }

    pub fn from_file(path: &Path) -> io::Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn add_room(&self, room_id: impl Into<String>, room: RoomInfo) {
        self.rooms.insert(room_id.into(), room);
    }

    pub fn add_user(&self, user_id: impl Into<String>, name: impl Into<String>) {
        self.users.insert(user_id.into(), name.into());
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn room(&self, room_id: &str) -> Option<RoomInfo> {
        self.rooms.get(room_id).map(|r| r.value().clone())
    }

    async fn user_name(&self, user_id: &str) -> Option<String> {
        self.users.get(user_id).map(|n| n.value().clone())
    }
}

/// Boundary check before a booking reaches the engine: the room must exist,
/// be active and seat everyone.
pub async fn validate_room(
    directory: &dyn Directory,
    room_id: &str,
    attendees: u32,
) -> Result<RoomInfo, EngineError> {
    let room = directory
        .room(room_id)
        .await
        .filter(|r| r.is_active)
        .ok_or_else(|| EngineError::NotFound(format!("room {room_id} (missing or inactive)")))?;
    if attendees > room.capacity {
        return Err(EngineError::BadRequest(format!(
            "attendees ({attendees}) exceed room capacity ({})",
            room.capacity
        )));
    }
    Ok(room)
}
