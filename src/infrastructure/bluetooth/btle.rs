//! btleplug Radio Backend
//!
//! Uses the first adapter reported by the platform manager.

use crate::infrastructure::bluetooth::error::LinkError;
use crate::infrastructure::bluetooth::radio::{
    Advertisement, AdvertisementStream, GattService, NotificationStream, Radio, RadioLink,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

impl From<btleplug::Error> for LinkError {
    fn from(e: btleplug::Error) -> Self {
        match e {
            btleplug::Error::NotConnected => LinkError::NotConnected,
            btleplug::Error::PermissionDenied => LinkError::PermissionDenied,
            btleplug::Error::DeviceNotFound => LinkError::Connection(e.to_string()),
            other => LinkError::Radio(other.to_string()),
        }
    }
}

/// Radio backed by the platform Bluetooth stack
pub struct BtleplugRadio {
    adapter: Adapter,
}

impl BtleplugRadio {
    /// Open the default Bluetooth adapter
    pub async fn new() -> Result<Self, LinkError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(LinkError::NoAdapter)?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }
        Ok(Self { adapter })
    }

    async fn find_peripheral(&self, device_id: &str) -> Result<Peripheral, LinkError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| LinkError::Connection(format!("Unknown device: {}", device_id)))
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn permissions_granted(&self) -> Result<bool, LinkError> {
        // Desktop stacks have no runtime permission prompt; denial surfaces as
        // btleplug::Error::PermissionDenied from the scan call instead.
        Ok(true)
    }

    async fn is_powered_on(&self) -> Result<bool, LinkError> {
        let state = self.adapter.adapter_state().await?;
        Ok(matches!(state, CentralState::PoweredOn))
    }

    async fn start_scan(&self) -> Result<AdvertisementStream, LinkError> {
        let events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let adapter = self.adapter.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let props = peripheral.properties().await.ok().flatten()?;
                Some(Advertisement {
                    id: id.to_string(),
                    name: props.local_name,
                    rssi: props.rssi,
                })
            }
        });
        Ok(stream.boxed())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<Arc<dyn RadioLink>, LinkError> {
        let peripheral = self.find_peripheral(device_id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(Arc::new(BtleplugLink { peripheral }))
    }
}

/// Open link to one lock
struct BtleplugLink {
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, LinkError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(LinkError::CharacteristicNotFound(uuid))
    }
}

#[async_trait]
impl RadioLink for BtleplugLink {
    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError> {
        self.peripheral.discover_services().await?;
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattService {
                uuid: s.uuid,
                characteristics: s.characteristics.iter().map(|c| c.uuid).collect(),
            })
            .collect())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, LinkError> {
        let target = self.characteristic(characteristic)?;
        let notifications = self.peripheral.notifications().await?;
        self.peripheral.subscribe(&target).await?;
        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) })
            .boxed())
    }

    async fn write_without_response(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), LinkError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .write(&target, value, WriteType::WithoutResponse)
            .await
            .map_err(|e| LinkError::Write(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Peripheral disconnect reported: {}", e);
            return Err(e.into());
        }
        Ok(())
    }
}
