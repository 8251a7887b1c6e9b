// Desktop radio driver backed by btleplug
//
// Peripherals are remembered by address as they show up in scan events,
// so `connect` can hand the manager's PeripheralIdentity back to the
// btleplug Peripheral it came from. The map is reset at every scan start.
// Open links are kept by handle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use gattlink_core::{
    Advertisement, AdvertisementStream, CharacteristicDescriptor, CharacteristicProperties,
    LinkError, LinkEvent, LinkEventStream, LinkHandle, PeripheralAddress, PeripheralIdentity,
    RadioDriver, ScanFilter, ServiceDescriptor, WriteKind, CCCD_UUID,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Peripherals advertised during the current scan session, by address
struct Sightings<P> {
    by_address: Arc<Mutex<HashMap<String, P>>>,
}

impl<P> Clone for Sightings<P> {
    fn clone(&self) -> Self {
        Self {
            by_address: Arc::clone(&self.by_address),
        }
    }
}

impl<P: Clone> Sightings<P> {
    fn new() -> Self {
        Self {
            by_address: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Forget the previous session
    fn reset(&self) {
        self.by_address.lock().clear();
    }

    fn remember(&self, address: String, peripheral: P) {
        self.by_address.lock().insert(address, peripheral);
    }

    fn get(&self, address: &str) -> Option<P> {
        self.by_address.lock().get(address).cloned()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.by_address.lock().len()
    }
}

/// Finish setting up a connected device, disconnecting it if that fails
async fn or_disconnect<T, S, D>(setup: S, disconnect: D) -> Result<T, btleplug::Error>
where
    S: Future<Output = Result<T, btleplug::Error>>,
    D: Future<Output = Result<(), btleplug::Error>>,
{
    match setup.await {
        Ok(value) => Ok(value),
        Err(e) => {
            if let Err(close) = disconnect.await {
                warn!("Failed to disconnect after setup error: {}", close);
            }
            Err(e)
        }
    }
}

pub struct BtleplugRadio {
    adapter: Adapter,
    seen: Sightings<Peripheral>,
    links: Mutex<HashMap<LinkHandle, Peripheral>>,
    next_link: AtomicU64,
}

impl BtleplugRadio {
    /// Open the adapter at `index` in the OS adapter list
    pub async fn open(index: usize) -> Result<Self> {
        let manager = Manager::new()
            .await
            .context("Failed to start the Bluetooth manager")?;
        let adapters = manager.adapters().await.context("Failed to list adapters")?;
        let adapter = adapters
            .into_iter()
            .nth(index)
            .with_context(|| format!("No Bluetooth adapter at index {}", index))?;

        if let Ok(info) = adapter.adapter_info().await {
            info!("Using adapter {}", info);
        }

        Ok(Self {
            adapter,
            seen: Sightings::new(),
            links: Mutex::new(HashMap::new()),
            next_link: AtomicU64::new(1),
        })
    }

    fn device(&self, link: LinkHandle) -> Result<Peripheral, LinkError> {
        self.links.lock().get(&link).cloned().ok_or(LinkError::LinkLost)
    }

    fn characteristic(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<(Peripheral, btleplug::api::Characteristic), LinkError> {
        let device = self.device(link)?;
        let found = device
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid)
            .ok_or(LinkError::CharacteristicNotFound(characteristic.uuid))?;
        Ok((device, found))
    }
}

fn radio_error(error: btleplug::Error) -> LinkError {
    match error {
        btleplug::Error::NotConnected | btleplug::Error::DeviceNotFound => LinkError::LinkLost,
        btleplug::Error::TimedOut(_) => LinkError::OperationTimeout,
        btleplug::Error::NoSuchCharacteristic => {
            LinkError::Rejected("no such characteristic".to_string())
        }
        btleplug::Error::PermissionDenied => LinkError::Rejected("permission denied".to_string()),
        other => LinkError::Radio(other.to_string()),
    }
}

fn properties(flags: CharPropFlags) -> CharacteristicProperties {
    CharacteristicProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY),
        indicate: flags.contains(CharPropFlags::INDICATE),
    }
}

#[async_trait]
impl RadioDriver for BtleplugRadio {
    async fn start_scan(&self, filter: &ScanFilter) -> Result<AdvertisementStream, LinkError> {
        let events = self.adapter.events().await.map_err(radio_error)?;
        // Only peripherals advertising in this session can be connected
        self.seen.reset();

        let services = match filter {
            ScanFilter::Service(uuid) => vec![*uuid],
            ScanFilter::Name(_) => Vec::new(),
        };
        self.adapter
            .start_scan(btleplug::api::ScanFilter { services })
            .await
            .map_err(radio_error)?;

        let adapter = self.adapter.clone();
        let seen = self.seen.clone();
        let advertisements = events.filter_map(move |event| {
            let adapter = adapter.clone();
            let seen = seen.clone();
            async move {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => return None,
                };
                let peripheral = adapter.peripheral(&id).await.ok()?;
                let properties = peripheral.properties().await.ok()??;
                let address = peripheral.address().to_string();
                seen.remember(address.clone(), peripheral);

                Some(Advertisement {
                    peripheral: PeripheralIdentity::new(
                        PeripheralAddress::new(address),
                        properties.local_name,
                    ),
                    services: properties.services,
                    rssi: properties.rssi,
                })
            }
        });

        Ok(advertisements.boxed())
    }

    async fn stop_scan(&self) -> Result<(), LinkError> {
        self.adapter.stop_scan().await.map_err(radio_error)
    }

    async fn connect(
        &self,
        peripheral: &PeripheralIdentity,
    ) -> Result<(LinkHandle, LinkEventStream), LinkError> {
        let device = self
            .seen
            .get(peripheral.address().as_str())
            .ok_or_else(|| LinkError::ConnectFailed(format!("{} was not seen by the adapter", peripheral)))?;

        device
            .connect()
            .await
            .map_err(|e| LinkError::ConnectFailed(e.to_string()))?;

        let streams = async {
            let notifications = device.notifications().await?;
            let central = self.adapter.events().await?;
            Ok::<_, btleplug::Error>((notifications, central))
        };
        let (notifications, central) = or_disconnect(streams, device.disconnect())
            .await
            .map_err(radio_error)?;
        let id = device.id();

        let values = notifications.map(|n| LinkEvent::Notification {
            characteristic: n.uuid,
            value: n.value,
        });
        let drops = central.filter_map(move |event| {
            let gone = matches!(&event, CentralEvent::DeviceDisconnected(other) if *other == id);
            async move { gone.then_some(LinkEvent::Disconnected) }
        });

        let link = LinkHandle(self.next_link.fetch_add(1, Ordering::Relaxed));
        self.links.lock().insert(link, device);
        debug!("Opened {} to {}", link, peripheral);

        Ok((link, futures::stream::select(values, drops).boxed()))
    }

    async fn discover_services(&self, link: LinkHandle) -> Result<Vec<ServiceDescriptor>, LinkError> {
        let device = self.device(link)?;
        device.discover_services().await.map_err(radio_error)?;

        Ok(device
            .services()
            .into_iter()
            .map(|service| ServiceDescriptor {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| CharacteristicDescriptor {
                        uuid: c.uuid,
                        properties: properties(c.properties),
                        config_descriptor: c
                            .descriptors
                            .iter()
                            .find(|d| d.uuid == CCCD_UUID)
                            .map(|d| d.uuid),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn read(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
    ) -> Result<Vec<u8>, LinkError> {
        let (device, target) = self.characteristic(link, characteristic)?;
        device.read(&target).await.map_err(radio_error)
    }

    async fn write(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
        payload: &[u8],
        kind: WriteKind,
    ) -> Result<(), LinkError> {
        let (device, target) = self.characteristic(link, characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        device
            .write(&target, payload, write_type)
            .await
            .map_err(radio_error)
    }

    async fn set_notify(
        &self,
        link: LinkHandle,
        characteristic: &CharacteristicDescriptor,
        enabled: bool,
    ) -> Result<(), LinkError> {
        let (device, target) = self.characteristic(link, characteristic)?;
        let result = if enabled {
            device.subscribe(&target).await
        } else {
            device.unsubscribe(&target).await
        };
        result.map_err(radio_error)
    }

    async fn close(&self, link: LinkHandle) -> Result<(), LinkError> {
        let Some(device) = self.links.lock().remove(&link) else {
            return Ok(());
        };
        if device.is_connected().await.unwrap_or(false) {
            device.disconnect().await.map_err(radio_error)?;
        }
        debug!("Closed {}", link);
        Ok(())
    }
}
