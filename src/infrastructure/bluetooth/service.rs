//! Bluetooth Service Module
//!
//! The transport link: owns the single connection to a lock and its
//! characteristic wiring, and reports everything it does on the event
//! channel as well as through return values.

use crate::domain::models::{
    ActiveDevice, AppEvent, ConnectionState, DeviceRecord, LinkState, MessageSeverity,
    StatusMessage,
};
use crate::infrastructure::bluetooth::{
    connection::{BleConnection, ConnectionConfig},
    error::LinkError,
    protocol,
    radio::{NotificationStream, Radio, RadioLink},
    scanner::{self, BleScanner, NameMatch},
};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DATA_CHANNEL_CAPACITY: usize = 64;

/// Handle and characteristic of the connected lock
struct ActiveLink {
    handle: Arc<dyn RadioLink>,
    command_char: Uuid,
    device: ActiveDevice,
    generation: u64,
}

#[derive(Default)]
struct LinkSlot {
    state: ConnectionState,
    link: Option<ActiveLink>,
    notify_task: Option<JoinHandle<()>>,
    /// Bumped on every successful connect; stale timers compare against it
    generation: u64,
    /// Bumped when a link is reused; disconnect timers armed earlier stand down
    disconnect_epoch: u64,
    /// Names of devices seen during scans, by id
    known_devices: HashMap<String, String>,
}

struct LinkInner {
    radio: Arc<dyn Radio>,
    config: ConnectionConfig,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    data_sender: broadcast::Sender<Vec<u8>>,
    slot: Mutex<LinkSlot>,
    scanner: tokio::sync::Mutex<BleScanner>,
}

/// Transport link to one door lock at a time
#[derive(Clone)]
pub struct BluetoothService {
    inner: Arc<LinkInner>,
}

impl BluetoothService {
    /// Create a new Bluetooth service
    pub fn new(
        radio: Arc<dyn Radio>,
        config: ConnectionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        let (data_sender, _) = broadcast::channel(DATA_CHANNEL_CAPACITY);
        let scanner = BleScanner::new(radio.clone(), event_sender.clone());
        Self {
            inner: Arc::new(LinkInner {
                radio,
                config,
                event_sender,
                data_sender,
                slot: Mutex::new(LinkSlot::default()),
                scanner: tokio::sync::Mutex::new(scanner),
            }),
        }
    }

    /// Check permission grants and radio power
    pub async fn initialize(&self) -> Result<(), LinkError> {
        let result = self.check_preconditions().await;
        match &result {
            Ok(()) => {
                info!("Bluetooth ready");
                self.send_log("Bluetooth ready", MessageSeverity::Success);
            }
            Err(e) => self.report_error(e),
        }
        result
    }

    async fn check_preconditions(&self) -> Result<(), LinkError> {
        if !self.inner.radio.permissions_granted().await? {
            return Err(LinkError::PermissionDenied);
        }
        if !self.inner.radio.is_powered_on().await? {
            return Err(LinkError::PoweredOff);
        }
        Ok(())
    }

    pub async fn is_bluetooth_powered_on(&self) -> bool {
        match self.inner.radio.is_powered_on().await {
            Ok(on) => on,
            Err(e) => {
                warn!("Could not read adapter state: {}", e);
                false
            }
        }
    }

    /// Report every lock advertising the configured name prefix
    ///
    /// Runs in the background and stops by itself after the scan timeout.
    pub async fn start_scan(&self) -> Result<(), LinkError> {
        let filter = NameMatch::prefix(&self.inner.config.device_name_prefix)
            .inspect_err(|e| self.report_error(e))?;

        self.update_state(|s| {
            if s.link_state == LinkState::Idle {
                s.link_state = LinkState::Scanning;
            }
            s.is_scanning = true;
        });

        let weak = Arc::downgrade(&self.inner);
        let result = self
            .inner
            .scanner
            .lock()
            .await
            .start(filter, self.inner.config.scan_timeout, move || {
                if let Some(inner) = weak.upgrade() {
                    BluetoothService { inner }.finish_scanning();
                }
            })
            .await;

        if let Err(e) = &result {
            self.report_error(e);
            self.finish_scanning();
        }
        result
    }

    pub async fn stop_scan(&self) -> Result<(), LinkError> {
        let result = self.inner.scanner.lock().await.stop().await;
        self.finish_scanning();
        result
    }

    fn finish_scanning(&self) {
        self.update_state(|s| {
            if s.link_state == LinkState::Scanning {
                s.link_state = LinkState::Idle;
            }
            s.is_scanning = false;
        });
    }

    /// Scan for a device with exactly this name and connect to it
    pub async fn scan_and_auto_connect(&self, device_name: &str) -> Result<(), LinkError> {
        let filter = NameMatch::exact(device_name).inspect_err(|e| self.report_error(e))?;
        self.scan_and_connect(filter, self.inner.config.exact_scan_timeout)
            .await
    }

    /// Scan for the first device whose name starts with `prefix` and connect to it
    pub async fn scan_and_auto_connect_by_prefix(&self, prefix: &str) -> Result<(), LinkError> {
        let filter = NameMatch::prefix(prefix).inspect_err(|e| self.report_error(e))?;
        self.scan_and_connect(filter, self.inner.config.scan_timeout)
            .await
    }

    async fn scan_and_connect(&self, filter: NameMatch, window: Duration) -> Result<(), LinkError> {
        if let Some(name) = self.connected_device_name() {
            if filter.matches(&name) {
                self.lock_slot().disconnect_epoch += 1;
                info!("Already connected to {}, reusing the link", name);
                return Ok(());
            }
            info!("Dropping link to {} before scanning for {}", name, filter);
            self.disconnect().await?;
        }

        if let Err(e) = self.inner.scanner.lock().await.stop().await {
            warn!("Failed to stop previous scan: {}", e);
        }

        info!("Searching for {} ({:?})", filter, window);
        self.send_log(&format!("Searching for {}...", filter), MessageSeverity::Info);
        self.update_state(|s| {
            s.link_state = LinkState::Scanning;
            s.is_scanning = true;
        });

        let mut stream = match self.inner.radio.start_scan().await {
            Ok(stream) => stream,
            Err(e) => {
                let e = scanner::scan_failure(e);
                self.reset_to_idle();
                self.report_error(&e);
                return Err(e);
            }
        };

        let found = scanner::wait_for_match(&mut stream, &filter, window).await;
        drop(stream);
        if let Err(e) = self.inner.radio.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        self.update_state(|s| s.is_scanning = false);

        let Some(adv) = found else {
            let e = LinkError::DiscoveryTimeout {
                target: filter.to_string(),
                waited: window,
            };
            self.reset_to_idle();
            self.report_error(&e);
            return Err(e);
        };

        let name = adv.name.clone().unwrap_or_default();
        info!("Found {} ({})", name, adv.id);
        self.lock_slot()
            .known_devices
            .insert(adv.id.clone(), name.clone());
        let _ = self
            .inner
            .event_sender
            .send(AppEvent::DeviceFound(DeviceRecord {
                id: adv.id.clone(),
                name: name.clone(),
                signal_strength: adv.rssi,
            }));

        self.connect_named(&adv.id, &name).await
    }

    /// Connect to a device seen in an earlier scan
    pub async fn connect_to_device(&self, device_id: &str) -> Result<(), LinkError> {
        let name = self
            .lock_slot()
            .known_devices
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| device_id.to_string());
        self.connect_named(device_id, &name).await
    }

    async fn connect_named(&self, device_id: &str, name: &str) -> Result<(), LinkError> {
        if self.is_connected() {
            self.disconnect().await?;
        }

        let device = ActiveDevice {
            id: device_id.to_string(),
            name: name.to_string(),
        };
        self.update_state(|s| {
            s.link_state = LinkState::Connecting;
            s.active_device = Some(device.clone());
        });

        let connection = BleConnection::new(
            self.inner.event_sender.clone(),
            self.inner.config.clone(),
        );

        let handle = match connection.open(self.inner.radio.as_ref(), device_id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.reset_to_idle();
                self.report_error(&e);
                return Err(e);
            }
        };

        self.update_state(|s| s.link_state = LinkState::ServiceDiscovery);

        let wiring = match connection.resolve(handle.as_ref()).await {
            Ok(wiring) => wiring,
            Err(e) => {
                if let Err(close) = handle.disconnect().await {
                    debug!("Closing half-open link failed: {}", close);
                }
                self.reset_to_idle();
                self.report_error(&e);
                return Err(e);
            }
        };

        let generation = {
            let mut slot = self.lock_slot();
            slot.generation += 1;
            let generation = slot.generation;
            if let Some(task) = slot.notify_task.take() {
                task.abort();
            }
            slot.notify_task = wiring
                .notifications
                .map(|stream| self.spawn_notify_pump(stream, generation));
            slot.link = Some(ActiveLink {
                handle,
                command_char: wiring.command_char,
                device: device.clone(),
                generation,
            });
            generation
        };

        self.update_state(|s| {
            s.link_state = LinkState::Ready;
            s.is_connected = true;
            s.is_service_discovered = true;
            s.active_device = Some(device.clone());
        });
        info!("Connected to {} (link #{})", device.name, generation);
        self.send_log(
            &format!("Connected to {}", device.name),
            MessageSeverity::Success,
        );
        Ok(())
    }

    /// Forward notifications to the event and data channels until the stream ends
    fn spawn_notify_pump(&self, mut stream: NotificationStream, generation: u64) -> JoinHandle<()> {
        let weak: Weak<LinkInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(bytes) = stream.next().await {
                let Some(inner) = weak.upgrade() else { return };
                let service = BluetoothService { inner };
                service.handle_notification(bytes, generation);
            }
            if let Some(inner) = weak.upgrade() {
                BluetoothService { inner }.handle_remote_disconnect(generation);
            }
        })
    }

    fn handle_notification(&self, bytes: Vec<u8>, generation: u64) {
        debug!("Notification: {}", protocol::bytes_to_hex(&bytes));
        let _ = self
            .inner
            .event_sender
            .send(AppEvent::DataReceived(bytes.clone()));

        if let Some(frame) = protocol::decode_response(&bytes) {
            info!("Lock response: {}", frame);
            let _ = self.inner.event_sender.send(AppEvent::Response(frame));
            if frame.is_success() {
                self.send_log("Lock accepted the command", MessageSeverity::Success);
                self.schedule_disconnect_for(self.inner.config.notify_disconnect_delay, generation);
            }
        }

        // No receivers just means nobody is waiting for a response
        let _ = self.inner.data_sender.send(bytes);
    }

    fn handle_remote_disconnect(&self, generation: u64) {
        let dropped = {
            let mut slot = self.lock_slot();
            match &slot.link {
                Some(link) if link.generation == generation => {
                    slot.link = None;
                    slot.notify_task = None;
                    true
                }
                _ => false,
            }
        };
        if dropped {
            warn!("Notification stream closed, link lost");
            self.send_log("Connection lost", MessageSeverity::Warning);
            self.reset_to_idle();
        }
    }

    /// Disconnect after `delay` unless the link has been replaced or reused meanwhile
    pub fn schedule_disconnect(&self, delay: Duration) {
        let generation = self.lock_slot().generation;
        self.schedule_disconnect_for(delay, generation);
    }

    fn schedule_disconnect_for(&self, delay: Duration, generation: u64) {
        let epoch = self.lock_slot().disconnect_epoch;
        let weak = Arc::downgrade(&self.inner);
        debug!("Disconnect scheduled in {:?}", delay);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else { return };
            let service = BluetoothService { inner };
            let (current, current_epoch) = {
                let slot = service.lock_slot();
                (slot.generation, slot.disconnect_epoch)
            };
            if current != generation {
                debug!("Scheduled disconnect skipped, link was replaced");
                return;
            }
            if current_epoch != epoch {
                debug!("Scheduled disconnect skipped, link was reused");
                return;
            }
            if let Err(e) = service.disconnect().await {
                warn!("Scheduled disconnect failed: {}", e);
            }
        });
    }

    /// Write one byte to the command characteristic
    pub async fn send_byte(&self, byte: u8) -> Result<(), LinkError> {
        self.send_byte_array(&[byte]).await
    }

    /// Write bytes to the command characteristic without waiting for an ack
    pub async fn send_byte_array(&self, bytes: &[u8]) -> Result<(), LinkError> {
        let (handle, command_char) = {
            let slot = self.lock_slot();
            let link = slot.link.as_ref().ok_or(LinkError::NotConnected)?;
            (link.handle.clone(), link.command_char)
        };

        debug!("Write: {}", protocol::bytes_to_hex(bytes));
        handle
            .write_without_response(command_char, bytes)
            .await
            .inspect_err(|e| {
                warn!("Write failed: {}", e);
                let _ = self
                    .inner
                    .event_sender
                    .send(AppEvent::TransportError(e.clone()));
            })
    }

    /// Disconnect from the current device
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let taken = {
            let mut slot = self.lock_slot();
            if let Some(task) = slot.notify_task.take() {
                task.abort();
            }
            slot.link.take()
        };

        let Some(link) = taken else {
            self.reset_to_idle();
            return Ok(());
        };

        let result = link.handle.disconnect().await;
        if let Err(e) = &result {
            warn!("Disconnect from {} reported: {}", link.device.name, e);
        }
        self.reset_to_idle();

        info!("Disconnected from {}", link.device.name);
        self.send_log("Disconnected from device", MessageSeverity::Info);
        result
    }

    /// Stop any scan and drop the link
    pub async fn dispose(&self) {
        if let Err(e) = self.stop_scan().await {
            warn!("Stopping scan on dispose failed: {}", e);
        }
        if let Err(e) = self.disconnect().await {
            warn!("Disconnect on dispose failed: {}", e);
        }
    }

    /// True iff a device handle and command characteristic are held
    pub fn is_connected(&self) -> bool {
        self.lock_slot().link.is_some()
    }

    pub fn connected_device_name(&self) -> Option<String> {
        self.lock_slot()
            .link
            .as_ref()
            .map(|link| link.device.name.clone())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.lock_slot().state.clone()
    }

    /// Raw notification bytes as they arrive
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Vec<u8>> {
        self.inner.data_sender.subscribe()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    fn lock_slot(&self) -> MutexGuard<'_, LinkSlot> {
        // Nothing panics while holding the slot, so a poisoned lock is still consistent
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update_state(&self, change: impl FnOnce(&mut ConnectionState)) {
        let (before, after) = {
            let mut slot = self.lock_slot();
            let before = slot.state.link_state;
            change(&mut slot.state);
            (before, slot.state.clone())
        };
        if before != after.link_state {
            info!("Link state: {} -> {}", before, after.link_state);
        }
        let _ = self
            .inner
            .event_sender
            .send(AppEvent::ConnectionState(after));
    }

    fn reset_to_idle(&self) {
        self.update_state(|s| *s = ConnectionState::default());
    }

    fn report_error(&self, e: &LinkError) {
        error!("{}", e);
        let _ = self
            .inner
            .event_sender
            .send(AppEvent::TransportError(e.clone()));
        self.send_log(&e.to_string(), MessageSeverity::Error);
    }

    /// Send a log message
    fn send_log(&self, message: &str, severity: MessageSeverity) {
        let _ = self.inner.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.to_string(),
            severity,
        }));
    }
}
