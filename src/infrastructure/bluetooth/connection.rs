//! BLE Connection Module
//!
//! Opens the physical link to a lock, resolves the lock service and its
//! command/notify characteristics, and subscribes to notifications.

use crate::domain::models::{AppEvent, MessageSeverity, StatusMessage};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::radio::{NotificationStream, Radio, RadioLink};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Configuration for connection and discovery behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Lock service UUID
    pub service_uuid: Uuid,
    /// Characteristic command bytes are written to
    pub command_char_uuid: Uuid,
    /// Characteristic responses arrive on
    pub notify_char_uuid: Uuid,
    /// Name prefix used by the generic scan
    pub device_name_prefix: String,
    /// General and prefix-match scan window
    pub scan_timeout: Duration,
    /// Exact-name scan window
    pub exact_scan_timeout: Duration,
    pub connect_timeout: Duration,
    /// Grace period before dropping the link after a 0x81 notification
    pub notify_disconnect_delay: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SERVICE,
            command_char_uuid: protocol::COMMAND_CHAR,
            notify_char_uuid: protocol::NOTIFY_CHAR,
            device_name_prefix: protocol::DEVICE_NAME_PREFIX.to_string(),
            scan_timeout: Duration::from_millis(12_000),
            exact_scan_timeout: Duration::from_millis(8_000),
            connect_timeout: Duration::from_millis(8_000),
            notify_disconnect_delay: Duration::from_millis(500),
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, LinkError> {
        let t = &settings.timings;
        Ok(Self {
            service_uuid: protocol::parse_uuid(&settings.ble_service_uuid)?,
            command_char_uuid: protocol::parse_uuid(&settings.ble_command_char_uuid)?,
            notify_char_uuid: protocol::parse_uuid(&settings.ble_notify_char_uuid)?,
            device_name_prefix: settings.device_name_prefix.clone(),
            scan_timeout: Duration::from_millis(t.scan_timeout_ms),
            exact_scan_timeout: Duration::from_millis(t.exact_scan_timeout_ms),
            connect_timeout: Duration::from_millis(t.connect_timeout_ms),
            notify_disconnect_delay: Duration::from_millis(t.notify_disconnect_ms),
        })
    }
}

/// Characteristic wiring of a resolved link
pub struct ConnectionResult {
    pub command_char: Uuid,
    /// Characteristic the notification stream is attached to
    pub notify_char: Option<Uuid>,
    pub notifications: Option<NotificationStream>,
}

/// BLE Connection handler
pub struct BleConnection {
    event_sender: mpsc::UnboundedSender<AppEvent>,
    config: ConnectionConfig,
}

impl BleConnection {
    /// Create a new connection handler
    pub fn new(event_sender: mpsc::UnboundedSender<AppEvent>, config: ConnectionConfig) -> Self {
        Self {
            event_sender,
            config,
        }
    }

    /// Open the physical link, bounded by the connect timeout
    pub async fn open(
        &self,
        radio: &dyn Radio,
        device_id: &str,
    ) -> Result<Arc<dyn RadioLink>, LinkError> {
        info!("Connecting to lock: {}", device_id);
        self.send_log("Connecting to lock...", MessageSeverity::Info);

        match tokio::time::timeout(self.config.connect_timeout, radio.connect(device_id)).await {
            Ok(Ok(link)) => {
                info!("Physical link established: {}", device_id);
                Ok(link)
            }
            Ok(Err(e)) => {
                error!("Connection to {} failed: {}", device_id, e);
                Err(match e {
                    LinkError::Radio(msg) => LinkError::Connection(msg),
                    other => other,
                })
            }
            Err(_) => {
                error!(
                    "Connection to {} timed out after {:?}",
                    device_id, self.config.connect_timeout
                );
                Err(LinkError::ConnectTimeout(self.config.connect_timeout))
            }
        }
    }

    /// Discover services, locate characteristics and subscribe to notifications
    ///
    /// A missing service or command characteristic is fatal. A missing
    /// notify characteristic falls back to the command characteristic, and
    /// a refused subscription only degrades the link.
    pub async fn resolve(&self, link: &dyn RadioLink) -> Result<ConnectionResult, LinkError> {
        let services = link.discover_services().await?;
        info!("Discovered {} services", services.len());

        let service = services
            .iter()
            .find(|s| s.uuid == self.config.service_uuid)
            .ok_or_else(|| {
                error!("Lock service {} not found", self.config.service_uuid);
                LinkError::ServiceNotFound(self.config.service_uuid)
            })?;
        info!(
            "Found lock service with {} characteristics",
            service.characteristics.len()
        );

        let command_char = self.config.command_char_uuid;
        if !service.characteristics.contains(&command_char) {
            error!("Command characteristic {} not found", command_char);
            return Err(LinkError::CharacteristicNotFound(command_char));
        }

        let notify_char = if service.characteristics.contains(&self.config.notify_char_uuid) {
            self.config.notify_char_uuid
        } else {
            warn!("Notify characteristic missing, listening on the command characteristic");
            self.send_log(
                "Notify characteristic missing, using command characteristic",
                MessageSeverity::Warning,
            );
            command_char
        };

        let (notify_char, notifications) = match link.subscribe(notify_char).await {
            Ok(stream) => {
                info!("Notifications enabled on {}", notify_char);
                (Some(notify_char), Some(stream))
            }
            Err(e) => {
                warn!("Notification subscription failed: {}", e);
                self.send_log(
                    "Connected (responses may not be received)",
                    MessageSeverity::Warning,
                );
                (None, None)
            }
        };

        Ok(ConnectionResult {
            command_char,
            notify_char,
            notifications,
        })
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::FakeRadio;
    use crate::infrastructure::bluetooth::radio::GattService;

    fn connection() -> BleConnection {
        let (tx, _rx) = mpsc::unbounded_channel();
        BleConnection::new(tx, ConnectionConfig::default())
    }

    #[test]
    fn test_config_from_settings() {
        let mut settings = Settings::default();
        settings.timings.connect_timeout_ms = 5_000;
        let config = ConnectionConfig::from_settings(&settings).unwrap();
        assert_eq!(config.service_uuid, protocol::SERVICE);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.exact_scan_timeout, Duration::from_secs(8));

        settings.ble_notify_char_uuid = "bogus".to_string();
        assert!(matches!(
            ConnectionConfig::from_settings(&settings),
            Err(LinkError::InvalidUuid { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_times_out() {
        let radio = FakeRadio::new();
        radio.set_connect_delay(Duration::from_secs(30));
        let result = connection().open(&radio, "AA:BB").await;
        assert_eq!(
            result.err(),
            Some(LinkError::ConnectTimeout(Duration::from_secs(8)))
        );
    }

    #[tokio::test]
    async fn test_resolve_subscribes_to_notify_characteristic() {
        let radio = FakeRadio::new();
        let link = radio.connect("AA:BB").await.unwrap();
        let result = connection().resolve(link.as_ref()).await.unwrap();
        assert_eq!(result.command_char, protocol::COMMAND_CHAR);
        assert_eq!(result.notify_char, Some(protocol::NOTIFY_CHAR));
        assert_eq!(radio.subscribed_to(), Some(protocol::NOTIFY_CHAR));
    }

    #[tokio::test]
    async fn test_resolve_falls_back_to_command_characteristic() {
        let radio = FakeRadio::new();
        radio.set_services(vec![GattService {
            uuid: protocol::SERVICE,
            characteristics: vec![protocol::COMMAND_CHAR],
        }]);
        let link = radio.connect("AA:BB").await.unwrap();
        let result = connection().resolve(link.as_ref()).await.unwrap();
        assert_eq!(result.notify_char, Some(protocol::COMMAND_CHAR));
        assert_eq!(radio.subscribed_to(), Some(protocol::COMMAND_CHAR));
    }

    #[tokio::test]
    async fn test_resolve_missing_service_and_characteristic() {
        let radio = FakeRadio::new();
        radio.set_services(vec![]);
        let link = radio.connect("AA:BB").await.unwrap();
        assert_eq!(
            connection().resolve(link.as_ref()).await.err(),
            Some(LinkError::ServiceNotFound(protocol::SERVICE))
        );

        radio.set_services(vec![GattService {
            uuid: protocol::SERVICE,
            characteristics: vec![protocol::NOTIFY_CHAR],
        }]);
        assert_eq!(
            connection().resolve(link.as_ref()).await.err(),
            Some(LinkError::CharacteristicNotFound(protocol::COMMAND_CHAR))
        );
    }

    #[tokio::test]
    async fn test_refused_subscription_is_not_fatal() {
        let radio = FakeRadio::new();
        radio.fail_subscribe();
        let link = radio.connect("AA:BB").await.unwrap();
        let result = connection().resolve(link.as_ref()).await.unwrap();
        assert!(result.notifications.is_none());
        assert_eq!(result.notify_char, None);
    }
}
