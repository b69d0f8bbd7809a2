//! Application Models
//!
//! Events and state snapshots published by the transport link and the
//! command orchestrator.

use crate::infrastructure::bluetooth::error::{CommandError, LinkError};
use crate::infrastructure::bluetooth::orchestrator::CommandOutcome;
use crate::infrastructure::bluetooth::protocol::ResponseFrame;
use std::fmt;

/// One matching advertisement, reported once per scan session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    pub signal_strength: Option<i16>,
}

/// Transport link lifecycle
///
/// `Idle -> Scanning -> Connecting -> ServiceDiscovery -> Ready -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    Ready,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Scanning => "scanning",
            LinkState::Connecting => "connecting",
            LinkState::ServiceDiscovery => "service discovery",
            LinkState::Ready => "ready",
        };
        f.write_str(name)
    }
}

/// Identity of the device the link is pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDevice {
    pub id: String,
    pub name: String,
}

/// Snapshot of the transport link, pushed on every transition
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub link_state: LinkState,
    pub is_connected: bool,
    pub active_device: Option<ActiveDevice>,
    pub is_scanning: bool,
    pub is_service_discovered: bool,
}

/// Command orchestrator progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandEvent {
    /// Full buffer produced for a command
    Encoded { code: u8, bytes: Vec<u8> },
    /// A byte was written; `remaining` bytes still queued
    Progress { byte: u8, remaining: usize },
    TransmissionComplete,
    AwaitingResponse,
    Resolved(CommandOutcome),
    Failed(CommandError),
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(DeviceRecord),
    ConnectionState(ConnectionState),
    DataReceived(Vec<u8>),
    Response(ResponseFrame),
    TransportError(LinkError),
    Command(CommandEvent),
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
