//! Scan Target Policy
//!
//! Which advertised name a resident's room lock and building entrance lock
//! go by. Room locks are found by exact name, entrance locks by prefix.

use std::fmt;
use thiserror::Error;

const ROOM_NAME_PREFIX: &str = "unist_";
const ENTRANCE_NAME_PREFIX: &str = "unistdoor_";

/// Resident's room as handed over by the identity layer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomIdentity {
    /// Building label, e.g. `306동`
    pub building: String,
    pub room: String,
    /// Explicit lock identity, preferred over building and room when present
    pub device_id: Option<String>,
}

impl RoomIdentity {
    pub fn new(building: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            building: building.into(),
            room: room.into(),
            device_id: None,
        }
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanTarget {
    Exact(String),
    Prefix(String),
}

impl ScanTarget {
    pub fn name(&self) -> &str {
        match self {
            Self::Exact(name) | Self::Prefix(name) => name,
        }
    }
}

impl fmt::Display for ScanTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => write!(f, "{}", name),
            Self::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("No room information (building and room number are required)")]
    MissingRoom,

    #[error("No building information")]
    MissingBuilding,
}

fn digits(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

/// Exact name of the resident's room lock
///
/// `unist_<device id digits>` when a device id is known, otherwise
/// `unist_<building digits><room digits>`.
pub fn room_target(identity: &RoomIdentity) -> Result<ScanTarget, TargetError> {
    if let Some(id) = identity.device_id.as_deref().map(digits) {
        if !id.is_empty() {
            return Ok(ScanTarget::Exact(format!("{}{}", ROOM_NAME_PREFIX, id)));
        }
    }

    let building = digits(&identity.building);
    let room = digits(&identity.room);
    if building.is_empty() || room.is_empty() {
        return Err(TargetError::MissingRoom);
    }
    Ok(ScanTarget::Exact(format!(
        "{}{}{}",
        ROOM_NAME_PREFIX, building, room
    )))
}

/// Name prefix shared by the entrance locks of the resident's building
pub fn entrance_target(identity: &RoomIdentity) -> Result<ScanTarget, TargetError> {
    let building = digits(&identity.building);
    if building.is_empty() {
        return Err(TargetError::MissingBuilding);
    }
    Ok(ScanTarget::Prefix(format!(
        "{}{}",
        ENTRANCE_NAME_PREFIX, building
    )))
}
