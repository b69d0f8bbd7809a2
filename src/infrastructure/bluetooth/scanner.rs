//! BLE Scanner Module
//!
//! Name filters, per-session de-duplication of advertisements, and the
//! background scan that reports every lock in range.

use crate::domain::models::{AppEvent, DeviceRecord, MessageSeverity, StatusMessage};
use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::radio::{Advertisement, AdvertisementStream, Radio};
use futures::StreamExt;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How an advertised name is matched against a scan target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameMatch {
    /// Case-sensitive full name
    Exact(String),
    /// Case-insensitive leading substring
    Prefix(String),
}

impl NameMatch {
    pub fn exact(name: &str) -> Result<Self, LinkError> {
        if name.trim().is_empty() {
            return Err(LinkError::InvalidTarget("empty device name".to_string()));
        }
        Ok(Self::Exact(name.to_string()))
    }

    pub fn prefix(prefix: &str) -> Result<Self, LinkError> {
        if prefix.trim().is_empty() {
            return Err(LinkError::InvalidTarget("empty device name prefix".to_string()));
        }
        Ok(Self::Prefix(prefix.to_string()))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(target) => name == target,
            Self::Prefix(prefix) => name
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix)),
        }
    }
}

impl fmt::Display for NameMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => write!(f, "{}", name),
            Self::Prefix(prefix) => write!(f, "{}*", prefix),
        }
    }
}

/// Tracks which devices one scan session has already reported
#[derive(Debug)]
pub struct DiscoverySession {
    filter: NameMatch,
    seen: HashSet<String>,
}

impl DiscoverySession {
    pub fn new(filter: NameMatch) -> Self {
        Self {
            filter,
            seen: HashSet::new(),
        }
    }

    /// Record for the first sighting of a matching device, `None` otherwise
    pub fn observe(&mut self, adv: &Advertisement) -> Option<DeviceRecord> {
        let name = adv.name.as_deref()?;
        if !self.filter.matches(name) || !self.seen.insert(adv.id.clone()) {
            return None;
        }
        Some(DeviceRecord {
            id: adv.id.clone(),
            name: name.to_string(),
            signal_strength: adv.rssi,
        })
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }
}

/// First advertisement matching `filter` within `window`
///
/// A stream that ends early still waits out the window, so a miss always
/// takes the full scan time.
pub async fn wait_for_match(
    stream: &mut AdvertisementStream,
    filter: &NameMatch,
    window: Duration,
) -> Option<Advertisement> {
    let search = async {
        while let Some(adv) = stream.next().await {
            if adv.name.as_deref().is_some_and(|n| filter.matches(n)) {
                return adv;
            }
        }
        std::future::pending::<Advertisement>().await
    };
    tokio::time::timeout(window, search).await.ok()
}

/// Keep permission and power errors as they are, wrap everything else
pub(crate) fn scan_failure(e: LinkError) -> LinkError {
    if e.is_precondition() {
        e
    } else {
        LinkError::Scan(e.to_string())
    }
}

struct ActiveScan {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Background scan reporting matching devices as `DeviceFound` events
pub struct BleScanner {
    radio: Arc<dyn Radio>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    active: Option<ActiveScan>,
}

impl BleScanner {
    /// Create a new scanner
    pub fn new(radio: Arc<dyn Radio>, event_sender: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            radio,
            event_sender,
            active: None,
        }
    }

    /// Start scanning; stops by itself after `window`
    ///
    /// `on_finish` runs when the scan ends on its own, not after [`stop`](Self::stop).
    pub async fn start<F>(
        &mut self,
        filter: NameMatch,
        window: Duration,
        on_finish: F,
    ) -> Result<(), LinkError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.stop().await?;

        info!("Starting BLE scan for {} ({:?})", filter, window);
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: format!("Scanning for {}...", filter),
            severity: MessageSeverity::Info,
        }));

        let mut stream = self
            .radio
            .start_scan()
            .await
            .map_err(scan_failure)?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let radio = self.radio.clone();
        let sender = self.event_sender.clone();

        let task = tokio::spawn(async move {
            let mut session = DiscoverySession::new(filter);
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = &mut deadline => {
                        info!("Scan window elapsed, {} device(s) found", session.seen_count());
                        break;
                    }
                    adv = stream.next() => match adv {
                        Some(adv) => {
                            if let Some(record) = session.observe(&adv) {
                                debug!("Found {} ({}) rssi {:?}", record.name, record.id, record.signal_strength);
                                let _ = sender.send(AppEvent::DeviceFound(record));
                            }
                        }
                        None => {
                            debug!("Advertisement stream ended");
                            break;
                        }
                    }
                }
            }

            if let Err(e) = radio.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
            on_finish();
        });

        self.active = Some(ActiveScan { cancel, task });
        Ok(())
    }

    /// Stop scanning
    pub async fn stop(&mut self) -> Result<(), LinkError> {
        if let Some(scan) = self.active.take() {
            scan.cancel.cancel();
            if !scan.task.is_finished() {
                info!("Stopping BLE scan...");
                let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
                    message: "Scan stopped.".to_string(),
                    severity: MessageSeverity::Info,
                }));
                self.radio.stop_scan().await?;
            }
        }
        Ok(())
    }

    /// Check if currently scanning
    pub fn is_scanning(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|scan| !scan.task.is_finished())
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(scan) = self.active.take() {
            scan.cancel.cancel();
        }
    }
}
