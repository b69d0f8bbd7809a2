//! Door Session
//!
//! One-call "open this door" flows composed from the transport link and
//! the command orchestrator.

use crate::domain::models::AppEvent;
use crate::domain::settings::{Settings, TimingSettings};
use crate::domain::target::{self, RoomIdentity, ScanTarget, TargetError};
use crate::infrastructure::bluetooth::{
    connection::ConnectionConfig,
    error::{CommandError, LinkError},
    orchestrator::{CommandOrchestrator, CommandOutcome, CommandTimings},
    protocol::{CommandCode, CommandParams},
    radio::Radio,
    service::BluetoothService,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Delays the session adds around the command itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimings {
    /// Wait after connecting before the first command byte
    pub service_settle: Duration,
    /// Disconnect delay after an entrance open
    pub entrance_disconnect: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self::from_settings(&TimingSettings::default())
    }
}

impl SessionTimings {
    pub fn from_settings(t: &TimingSettings) -> Self {
        Self {
            service_settle: Duration::from_millis(t.service_settle_ms),
            entrance_disconnect: Duration::from_millis(t.entrance_disconnect_ms),
        }
    }
}

pub struct DoorSession {
    link: BluetoothService,
    orchestrator: CommandOrchestrator,
    timings: SessionTimings,
}

impl DoorSession {
    pub fn new(
        link: BluetoothService,
        orchestrator: CommandOrchestrator,
        timings: SessionTimings,
    ) -> Self {
        Self {
            link,
            orchestrator,
            timings,
        }
    }

    /// Wire a transport link and orchestrator from persisted settings
    pub fn from_settings(
        radio: Arc<dyn Radio>,
        settings: &Settings,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<Self, LinkError> {
        let config = ConnectionConfig::from_settings(settings)?;
        let link = BluetoothService::new(radio, config, event_sender.clone());
        let orchestrator = CommandOrchestrator::new(
            link.clone(),
            CommandTimings::from_settings(&settings.timings),
            event_sender,
        );
        Ok(Self::new(
            link,
            orchestrator,
            SessionTimings::from_settings(&settings.timings),
        ))
    }

    pub fn link(&self) -> &BluetoothService {
        &self.link
    }

    pub fn orchestrator(&self) -> &CommandOrchestrator {
        &self.orchestrator
    }

    /// Find the resident's room lock by exact name and open it
    pub async fn open_room_door(
        &self,
        identity: &RoomIdentity,
    ) -> Result<CommandOutcome, SessionError> {
        let target = target::room_target(identity)?;
        self.prepare(&target).await?;
        Ok(self.orchestrator.open_door().await?)
    }

    /// Find any entrance lock of the resident's building and open it
    ///
    /// The entrance lock never answers, so the link is dropped on a timer.
    pub async fn open_entrance_door(
        &self,
        identity: &RoomIdentity,
    ) -> Result<CommandOutcome, SessionError> {
        let target = target::entrance_target(identity)?;
        self.prepare(&target).await?;
        let outcome = self.orchestrator.open_entrance().await?;
        if outcome.is_success() {
            self.link.schedule_disconnect(self.timings.entrance_disconnect);
        }
        Ok(outcome)
    }

    /// Connect to a lock by exact name and send an arbitrary command
    pub async fn send_to(
        &self,
        device_name: &str,
        code: u8,
        parameters: Option<CommandParams>,
    ) -> Result<CommandOutcome, SessionError> {
        self.prepare(&ScanTarget::Exact(device_name.to_string()))
            .await?;
        let outcome = self.orchestrator.send_command(code, parameters).await?;
        if code == CommandCode::EntranceOpen.as_u8() {
            self.link.schedule_disconnect(self.timings.entrance_disconnect);
        }
        Ok(outcome)
    }

    /// Preconditions, discovery and connection, then the settle delay
    async fn prepare(&self, target: &ScanTarget) -> Result<(), SessionError> {
        self.link.initialize().await?;

        info!("Looking for {}", target);
        match target {
            ScanTarget::Exact(name) => self.link.scan_and_auto_connect(name).await?,
            ScanTarget::Prefix(prefix) => self.link.scan_and_auto_connect_by_prefix(prefix).await?,
        }

        tokio::time::sleep(self.timings.service_settle).await;

        let name = self
            .link
            .connected_device_name()
            .unwrap_or_else(|| target.name().to_string());
        self.orchestrator.set_connected_device_name(name);
        Ok(())
    }

    pub async fn dispose(&self) {
        self.orchestrator.cancel_sending();
        self.link.dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::{advert, FakeRadio};
    use chrono::NaiveDate;
    use tokio::time::Instant;

    fn session(radio: &FakeRadio) -> DoorSession {
        let (tx, _rx) = mpsc::unbounded_channel();
        let link = BluetoothService::new(
            Arc::new(radio.clone()),
            ConnectionConfig::default(),
            tx.clone(),
        );
        let orchestrator = CommandOrchestrator::new(link.clone(), CommandTimings::default(), tx)
            .with_clock(|| {
                NaiveDate::from_ymd_opt(2025, 1, 15)
                    .unwrap()
                    .and_hms_opt(12, 0, 0)
                    .unwrap()
            });
        DoorSession::new(link, orchestrator, SessionTimings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_room_door() {
        let radio = FakeRadio::new();
        radio.advertise(Duration::from_millis(400), advert("R", "unist_306301"));
        radio.reply_after(30, Duration::from_millis(100), vec![0xCC, 0x81, 0x01]);
        let session = session(&radio);

        let start = Instant::now();
        let outcome = session
            .open_room_door(&RoomIdentity::new("306동", "301"))
            .await
            .unwrap();
        assert!(outcome.is_success());
        // scan, settle, 29 byte gaps, reply
        assert_eq!(
            start.elapsed(),
            Duration::from_millis(400 + 1000 + 29 * 50 + 100)
        );
        assert_eq!(&radio.written()[10..18], &[0x2F, 3, 0, 6, 3, 0, 1, 0x2F]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_entrance_door_disconnects_on_timer() {
        let radio = FakeRadio::new();
        radio.advertise(Duration::from_secs(1), advert("E", "unistdoor_30601"));
        let session = session(&radio);

        let outcome = session
            .open_entrance_door(&RoomIdentity::new("306동", "301"))
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Dispatched);
        assert_eq!(
            radio.written(),
            vec![0xCC, 0x21, 0x01, 0, 0, 0, 0, 0, 0, 0xEE]
        );

        tokio::time::sleep(Duration::from_millis(1999)).await;
        assert!(session.link().is_connected());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(!session.link().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_tagged_by_layer() {
        let radio = FakeRadio::new();
        let session = session(&radio);

        assert_eq!(
            session.open_entrance_door(&RoomIdentity::default()).await,
            Err(SessionError::Target(TargetError::MissingBuilding))
        );

        radio.set_powered(false);
        assert_eq!(
            session
                .open_room_door(&RoomIdentity::new("306", "301"))
                .await,
            Err(SessionError::Link(LinkError::PoweredOff))
        );
        assert_eq!(radio.scan_counts(), (0, 0));

        radio.set_powered(true);
        let result = session
            .open_room_door(&RoomIdentity::new("306", "301"))
            .await;
        assert!(matches!(
            result,
            Err(SessionError::Link(LinkError::DiscoveryTimeout { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_opens_reuse_the_link() {
        let radio = FakeRadio::new();
        radio.advertise(Duration::from_millis(400), advert("R", "unist_306301"));
        radio.reply_after(30, Duration::from_millis(100), vec![0xCC, 0x81, 0x01]);
        let session = session(&radio);
        let identity = RoomIdentity::new("306동", "301");

        assert!(session.open_room_door(&identity).await.unwrap().is_success());

        radio.reply_after(60, Duration::from_millis(100), vec![0xCC, 0x81, 0x01]);
        let start = Instant::now();
        let second = session.open_room_door(&identity).await.unwrap();
        assert!(second.is_success());
        assert_eq!(
            start.elapsed(),
            Duration::from_millis(1000 + 29 * 50 + 100)
        );
        assert_eq!(radio.connects(), 1);
        assert_eq!(radio.scan_counts(), (1, 1));

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert!(!session.link().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_transmission_still_releases_the_lock() {
        let radio = FakeRadio::new();
        radio.advertise(Duration::from_millis(400), advert("R", "unist_306301"));
        radio.fail_writes(3);
        let session = session(&radio);

        let result = session
            .open_room_door(&RoomIdentity::new("306동", "301"))
            .await;
        assert_eq!(
            result,
            Err(SessionError::Command(CommandError::Transmission {
                byte: 0xCC,
                attempts: 3
            }))
        );
        assert!(session.link().is_connected());
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(!session.link().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_command_still_releases_the_lock() {
        let radio = FakeRadio::new();
        radio.advertise(Duration::from_millis(400), advert("R", "unist_306301"));
        let session = Arc::new(session(&radio));

        let running = session.clone();
        let inflight = tokio::spawn(async move {
            running
                .open_room_door(&RoomIdentity::new("306동", "301"))
                .await
        });
        // scan 400, settle 1000, 30 bytes paced at 50ms
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(session.orchestrator().is_sending());

        session.orchestrator().cancel_sending();
        assert_eq!(
            inflight.await.unwrap(),
            Err(SessionError::Command(CommandError::Cancelled))
        );
        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(!session.link().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_to_named_lock() {
        let radio = FakeRadio::new();
        radio.advertise(Duration::from_millis(200), advert("R", "unist_306301"));
        radio.reply_after(10, Duration::from_millis(100), vec![0xCC, 0x81, 0x1C]);
        let session = session(&radio);

        let outcome = session.send_to("unist_306301", 0x1C, None).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Accepted(f) if f.command_echo == 0x1C));
        assert_eq!(&radio.written()[..2], &[0xCC, 0x1C]);
    }
}
