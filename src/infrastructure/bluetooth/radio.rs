//! Radio Backend Traits
//!
//! The transport link only talks to hardware through these two traits.
//! [`super::btle::BtleplugRadio`] is the real implementation.

use crate::infrastructure::bluetooth::error::LinkError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use uuid::Uuid;

/// One advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// A discovered GATT service and the UUIDs of its characteristics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

pub type AdvertisementStream = BoxStream<'static, Advertisement>;
pub type NotificationStream = BoxStream<'static, Vec<u8>>;

/// Adapter-level operations
#[async_trait]
pub trait Radio: Send + Sync {
    /// Platform permission grants needed for scanning and connecting
    async fn permissions_granted(&self) -> Result<bool, LinkError>;

    async fn is_powered_on(&self) -> Result<bool, LinkError>;

    /// Start an unfiltered scan; the stream yields every advertisement
    async fn start_scan(&self) -> Result<AdvertisementStream, LinkError>;

    async fn stop_scan(&self) -> Result<(), LinkError>;

    /// Open the physical link to a previously advertised device
    async fn connect(&self, device_id: &str) -> Result<Arc<dyn RadioLink>, LinkError>;
}

/// Operations on one open physical link
#[async_trait]
pub trait RadioLink: Send + Sync {
    async fn discover_services(&self) -> Result<Vec<GattService>, LinkError>;

    async fn subscribe(&self, characteristic: Uuid) -> Result<NotificationStream, LinkError>;

    /// Fire-and-forget write; success only means the local call succeeded
    async fn write_without_response(
        &self,
        characteristic: Uuid,
        value: &[u8],
    ) -> Result<(), LinkError>;

    async fn disconnect(&self) -> Result<(), LinkError>;
}
