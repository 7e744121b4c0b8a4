//! btleplug backend
//!
//! Client role only: btleplug can scan, connect, write and subscribe but has
//! no peripheral (GATT server) support, so advertising and accepting report
//! [`LinkError::RoleUnsupported`].

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dashmap::DashMap;
use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::adapter::{AdapterEvent, DiscoveryFilter, LinkAdapter, LinkAddress, LinkHandle, Role};
use super::advertisement::Advertisement;
use super::protocol::{CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::error::LinkError;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

struct PeripheralConnection {
    peripheral: Peripheral,
    characteristic: Option<Characteristic>,
}

pub struct BtleplugAdapter {
    adapter: Adapter,
    known: Arc<DashMap<LinkAddress, PeripheralId>>,
    connections: DashMap<LinkAddress, PeripheralConnection>,
    events_tx: mpsc::UnboundedSender<AdapterEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<AdapterEvent>>>,
    max_write_size: usize,
}

fn address_of(id: &PeripheralId) -> LinkAddress {
    LinkAddress::new(format!("{:?}", id))
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on the system and start forwarding
    /// its central events.
    pub async fn new(max_write_size: usize) -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(|e| {
            warn!("Failed to create Bluetooth manager: {}", e);
            LinkError::AdapterUnavailable
        })?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|_| LinkError::AdapterUnavailable)?
            .into_iter()
            .next()
            .ok_or(LinkError::AdapterUnavailable)?;
        match adapter.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter: {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let known = Arc::new(DashMap::new());

        let events = adapter
            .events()
            .await
            .map_err(|_| LinkError::AdapterUnavailable)?;
        tokio::spawn(forward_central_events(
            adapter.clone(),
            events,
            known.clone(),
            events_tx.clone(),
        ));

        Ok(Self {
            adapter,
            known,
            connections: DashMap::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            max_write_size,
        })
    }

    async fn peripheral(&self, address: &LinkAddress) -> Result<Peripheral, LinkError> {
        if let Some(connection) = self.connections.get(address) {
            return Ok(connection.peripheral.clone());
        }
        let id = self
            .known
            .get(address)
            .map(|id| id.clone())
            .ok_or_else(|| LinkError::connect_failed(address, "device was never discovered"))?;
        self.adapter
            .peripheral(&id)
            .await
            .map_err(|e| LinkError::connect_failed(address, e))
    }

    fn characteristic(&self, address: &LinkAddress) -> Option<(Peripheral, Characteristic)> {
        let connection = self.connections.get(address)?;
        let characteristic = connection.characteristic.clone()?;
        Some((connection.peripheral.clone(), characteristic))
    }
}

async fn forward_central_events(
    adapter: Adapter,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    known: Arc<DashMap<LinkAddress, PeripheralId>>,
    tx: mpsc::UnboundedSender<AdapterEvent>,
) {
    while let Some(event) = events.next().await {
        let event = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                if !properties.services.contains(&SERVICE_UUID) {
                    continue;
                }
                let address = address_of(&id);
                known.insert(address.clone(), id);
                AdapterEvent::Discovered {
                    address,
                    rssi: properties.rssi,
                    manufacturer_data: properties.manufacturer_data,
                }
            }
            CentralEvent::DeviceDisconnected(id) => AdapterEvent::Disconnected {
                link: LinkHandle::client(address_of(&id)),
            },
            _ => continue,
        };
        if tx.send(event).is_err() {
            break;
        }
    }
    debug!("Central event stream ended");
}

#[async_trait]
impl LinkAdapter for BtleplugAdapter {
    fn max_write_size(&self) -> usize {
        self.max_write_size
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<AdapterEvent>> {
        self.events_rx.lock().take()
    }

    async fn start_advertise(&self, _advertisement: &Advertisement) -> Result<(), LinkError> {
        Err(LinkError::RoleUnsupported(Role::IncomingServer))
    }

    async fn stop_advertise(&self) -> Result<(), LinkError> {
        Ok(())
    }

    async fn start_discovery(&self, filter: &DiscoveryFilter) -> Result<(), LinkError> {
        let scan_filter = ScanFilter {
            services: vec![filter.service_uuid],
        };
        self.adapter.start_scan(scan_filter).await.map_err(|e| {
            warn!("Failed to start BLE scan: {}", e);
            LinkError::AdapterUnavailable
        })?;
        info!("Scanning for mesh peers");
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<(), LinkError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|_| LinkError::AdapterUnavailable)
    }

    async fn accept_incoming(&self) -> Result<(), LinkError> {
        Err(LinkError::RoleUnsupported(Role::IncomingServer))
    }

    async fn connect(&self, address: &LinkAddress) -> Result<(), LinkError> {
        let peripheral = self.peripheral(address).await?;
        match tokio::time::timeout(CONNECTION_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(LinkError::connect_failed(address, e)),
            Err(_) => return Err(LinkError::connect_failed(address, "connection timed out")),
        }
        self.connections.insert(
            address.clone(),
            PeripheralConnection {
                peripheral,
                characteristic: None,
            },
        );
        Ok(())
    }

    async fn discover_services(&self, address: &LinkAddress) -> Result<(), LinkError> {
        let peripheral = self.peripheral(address).await?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| LinkError::connect_failed(address, e))?;

        let characteristic = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == SERVICE_UUID)
            .and_then(|s| {
                s.characteristics
                    .into_iter()
                    .find(|c| c.uuid == CHARACTERISTIC_UUID)
            })
            .ok_or_else(|| LinkError::connect_failed(address, "mesh characteristic not found"))?;

        match self.connections.get_mut(address) {
            Some(mut connection) => connection.characteristic = Some(characteristic),
            None => return Err(LinkError::connect_failed(address, "not connected")),
        }
        Ok(())
    }

    async fn subscribe_notifications(&self, address: &LinkAddress) -> Result<(), LinkError> {
        let (peripheral, characteristic) = self
            .characteristic(address)
            .ok_or_else(|| LinkError::subscription_failed(address, "services not discovered"))?;
        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| LinkError::subscription_failed(address, e))?;
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| LinkError::subscription_failed(address, e))?;

        let tx = self.events_tx.clone();
        let link = LinkHandle::client(address.clone());
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != CHARACTERISTIC_UUID {
                    continue;
                }
                let event = AdapterEvent::FrameReceived {
                    link: link.clone(),
                    bytes: notification.value,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
            debug!("Notification stream ended for {}", link.address);
        });
        Ok(())
    }

    async fn send_frame(&self, link: &LinkHandle, bytes: &[u8]) -> Result<(), LinkError> {
        if link.role != Role::OutgoingClient {
            return Err(LinkError::RoleUnsupported(link.role));
        }
        if bytes.len() > self.max_write_size {
            return Err(LinkError::write_failed(
                &link.address,
                format!("{} bytes exceeds max write {}", bytes.len(), self.max_write_size),
            ));
        }
        let (peripheral, characteristic) = self
            .characteristic(&link.address)
            .ok_or_else(|| LinkError::write_failed(&link.address, "not connected"))?;
        peripheral
            .write(&characteristic, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| LinkError::write_failed(&link.address, e))
    }

    async fn disconnect(&self, link: &LinkHandle) -> Result<(), LinkError> {
        if link.role != Role::OutgoingClient {
            return Err(LinkError::RoleUnsupported(link.role));
        }
        let peripheral = self
            .connections
            .get(&link.address)
            .map(|c| c.peripheral.clone())
            .ok_or_else(|| LinkError::NotLinked(link.address.clone()))?;
        peripheral
            .disconnect()
            .await
            .map_err(|e| LinkError::connect_failed(&link.address, e))
    }

    async fn close(&self, link: &LinkHandle) -> Result<(), LinkError> {
        self.connections.remove(&link.address);
        Ok(())
    }
}
