//! Scripted in-memory radio for tests.

use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::radio::{
    Advertisement, AdvertisementStream, GattService, NotificationStream, Radio, RadioLink,
};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub(crate) fn lock_services() -> Vec<GattService> {
    vec![GattService {
        uuid: protocol::SERVICE,
        characteristics: vec![protocol::COMMAND_CHAR, protocol::NOTIFY_CHAR],
    }]
}

pub(crate) fn advert(id: &str, name: &str) -> Advertisement {
    Advertisement {
        id: id.to_string(),
        name: Some(name.to_string()),
        rssi: Some(-60),
    }
}

struct AutoReply {
    after_writes: usize,
    delay: Duration,
    bytes: Vec<u8>,
}

struct FakeState {
    permissions: bool,
    powered: bool,
    advertisements: Vec<(Duration, Advertisement)>,
    services: Vec<GattService>,
    connect_delay: Option<Duration>,
    subscribe_fails: bool,
    write_failures: usize,
    write_attempts: usize,
    written: Vec<u8>,
    reply: Option<AutoReply>,
    notify_tx: Option<fmpsc::UnboundedSender<Vec<u8>>>,
    subscribed_to: Option<Uuid>,
    scan_starts: usize,
    scan_stops: usize,
    connects: usize,
    disconnects: usize,
}

#[derive(Clone)]
pub(crate) struct FakeRadio {
    state: Arc<Mutex<FakeState>>,
}

impl FakeRadio {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                permissions: true,
                powered: true,
                advertisements: Vec::new(),
                services: lock_services(),
                connect_delay: None,
                subscribe_fails: false,
                write_failures: 0,
                write_attempts: 0,
                written: Vec::new(),
                reply: None,
                notify_tx: None,
                subscribed_to: None,
                scan_starts: 0,
                scan_stops: 0,
                connects: 0,
                disconnects: 0,
            })),
        }
    }

    pub(crate) fn set_permissions(&self, granted: bool) {
        self.state.lock().unwrap().permissions = granted;
    }

    pub(crate) fn set_powered(&self, powered: bool) {
        self.state.lock().unwrap().powered = powered;
    }

    /// Advertise `adv` `at` after each scan start
    pub(crate) fn advertise(&self, at: Duration, adv: Advertisement) {
        self.state.lock().unwrap().advertisements.push((at, adv));
    }

    pub(crate) fn set_services(&self, services: Vec<GattService>) {
        self.state.lock().unwrap().services = services;
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().unwrap().connect_delay = Some(delay);
    }

    pub(crate) fn fail_subscribe(&self) {
        self.state.lock().unwrap().subscribe_fails = true;
    }

    /// Fail the next `count` writes
    pub(crate) fn fail_writes(&self, count: usize) {
        self.state.lock().unwrap().write_failures = count;
    }

    /// Push `bytes` as a notification `delay` after the `after_writes`-th successful write
    pub(crate) fn reply_after(&self, after_writes: usize, delay: Duration, bytes: Vec<u8>) {
        self.state.lock().unwrap().reply = Some(AutoReply {
            after_writes,
            delay,
            bytes,
        });
    }

    pub(crate) fn notify(&self, bytes: Vec<u8>) {
        if let Some(tx) = self.state.lock().unwrap().notify_tx.as_ref() {
            let _ = tx.unbounded_send(bytes);
        }
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state.lock().unwrap().written.clone()
    }

    pub(crate) fn write_attempts(&self) -> usize {
        self.state.lock().unwrap().write_attempts
    }

    pub(crate) fn subscribed_to(&self) -> Option<Uuid> {
        self.state.lock().unwrap().subscribed_to
    }

    pub(crate) fn scan_counts(&self) -> (usize, usize) {
        let s = self.state.lock().unwrap();
        (s.scan_starts, s.scan_stops)
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub(crate) fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }
}

#[async_trait]
impl Radio for FakeRadio {
    async fn permissions_granted(&self) -> Result<bool, LinkError> {
        Ok(self.state.lock().unwrap().permissions)
    }

    async fn is_powered_on(&self) -> Result<bool, LinkError> {
        Ok(self.state.lock().unwrap().powered)
    }

    async fn start_scan(&self) -> Result<AdvertisementStream, LinkError> {
        let mut adverts = {
            let mut s = self.state.lock().unwrap();
            s.scan_starts += 1;
            s.advertisements.clone()
        };
        adverts.sort_by_key(|(at, _)| *at);
        let start = Instant::now();
        Ok(futures::stream::iter(adverts)
            .then(move |(at, adv)| async move {
                tokio::time::sleep_until(start + at).await;
                adv
            })
            .boxed())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.state.lock().unwrap().scan_stops += 1;
        Ok(())
    }

    async fn connect(&self, _device_id: &str) -> Result<Arc<dyn RadioLink>, LinkError> {
        let delay = {
            let mut s = self.state.lock().unwrap();
            s.connects += 1;
            s.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(Arc::new(FakeLink {
            state: self.state.clone(),
        }))
    }
}

struct FakeLink {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl RadioLink for FakeLink {
    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        Ok(self.state.lock().unwrap().services.clone())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, LinkError> {
        let mut s = self.state.lock().unwrap();
        if s.subscribe_fails {
            return Err(LinkError::Radio("subscribe refused".to_string()));
        }
        let (tx, rx) = fmpsc::unbounded();
        s.notify_tx = Some(tx);
        s.subscribed_to = Some(characteristic);
        Ok(rx.boxed())
    }

    async fn write_without_response(
        &self,
        _characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), LinkError> {
        let mut s = self.state.lock().unwrap();
        s.write_attempts += 1;
        if s.write_failures > 0 {
            s.write_failures -= 1;
            return Err(LinkError::Write("injected failure".to_string()));
        }
        s.written.extend_from_slice(value);

        let fire = s
            .reply
            .as_ref()
            .filter(|r| r.after_writes == s.written.len())
            .map(|r| (r.delay, r.bytes.clone()));
        if let Some((delay, bytes)) = fire {
            let state = self.state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(tx) = state.lock().unwrap().notify_tx.as_ref() {
                    let _ = tx.unbounded_send(bytes);
                }
            });
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let mut s = self.state.lock().unwrap();
        s.disconnects += 1;
        s.notify_tx = None;
        Ok(())
    }
}
