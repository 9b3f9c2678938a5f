//! WinRT BLE Transport
//!
//! Native Windows backend: advertisement-based discovery by name prefix,
//! GATT characteristic lookup, CCCD subscription and value writes.

use crate::infrastructure::bluetooth::transport::{
    BleTransport, Endpoint, EndpointKind, PeerHandle, TransportError, TransportEvent,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattValueChangedEventArgs,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter};

#[derive(Default)]
struct Linked {
    device: Option<BluetoothLEDevice>,
    service: Option<GattDeviceService>,
    characteristics: HashMap<String, GattCharacteristic>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

pub struct WinRtTransport {
    scan_timeout: Duration,
    linked: Mutex<Linked>,
}

impl WinRtTransport {
    pub fn new(scan_timeout: Duration) -> Self {
        Self {
            scan_timeout,
            linked: Mutex::new(Linked::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Linked> {
        self.linked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn characteristic(&self, uuid: &str) -> Result<GattCharacteristic, TransportError> {
        self.lock()
            .characteristics
            .get(&uuid.to_lowercase())
            .cloned()
            .ok_or(TransportError::NotConnected)
    }

    async fn service(&self, service_uuid: &str) -> Result<GattDeviceService, TransportError> {
        let (device, cached) = {
            let linked = self.lock();
            (linked.device.clone(), linked.service.clone())
        };
        if let Some(service) = cached {
            return Ok(service);
        }
        let device = device.ok_or(TransportError::NotConnected)?;

        let result = device
            .GetGattServicesForUuidAsync(parse_uuid(service_uuid)?)
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        check(result.Status().map_err(gatt)?)?;

        let services = result.Services().map_err(gatt)?;
        if services.Size().map_err(gatt)? == 0 {
            return Err(TransportError::NotFound(format!("Service {}", service_uuid)));
        }
        let service = services.GetAt(0).map_err(gatt)?;
        info!("Found tactile service");
        self.lock().service = Some(service.clone());
        Ok(service)
    }
}

fn gatt(e: windows::core::Error) -> TransportError {
    TransportError::Gatt(e.to_string())
}

fn check(status: GattCommunicationStatus) -> Result<(), TransportError> {
    if status == GattCommunicationStatus::Success {
        Ok(())
    } else {
        Err(TransportError::Gatt(format!("{:?}", status)))
    }
}

/// Parse a UUID string into a Windows GUID
fn parse_uuid(uuid_str: &str) -> Result<GUID, TransportError> {
    let hex = uuid_str.replace('-', "");
    let invalid = || TransportError::Gatt(format!("Invalid UUID: {}", uuid_str));
    if hex.len() != 32 || !hex.is_ascii() {
        return Err(invalid());
    }

    let field = |range: std::ops::Range<usize>| {
        u64::from_str_radix(&hex[range], 16).map_err(|_| invalid())
    };
    let mut data4 = [0u8; 8];
    for (i, byte) in data4.iter_mut().enumerate() {
        *byte = field(16 + i * 2..18 + i * 2)? as u8;
    }

    Ok(GUID {
        data1: field(0..8)? as u32,
        data2: field(8..12)? as u16,
        data3: field(12..16)? as u16,
        data4,
    })
}

#[async_trait]
impl BleTransport for WinRtTransport {
    fn is_available(&self) -> bool {
        BluetoothLEAdvertisementWatcher::new().is_ok()
    }

    async fn request_device(&self, name_prefix: &str) -> Result<PeerHandle, TransportError> {
        info!("Scanning for devices named '{}*'", name_prefix);
        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(|_| TransportError::Unsupported)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(gatt)?;

        let (found_tx, mut found_rx) = mpsc::unbounded_channel();
        let prefix = name_prefix.to_string();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let name = args.Advertisement()?.LocalName()?.to_string();
                    if !name.is_empty() && name.starts_with(&prefix) {
                        let _ = found_tx.send((args.BluetoothAddress()?, name));
                    }
                }
                Ok(())
            },
        );
        watcher.Received(&handler).map_err(gatt)?;
        watcher.Start().map_err(gatt)?;

        let found = tokio::time::timeout(self.scan_timeout, found_rx.recv()).await;
        let _ = watcher.Stop();

        match found {
            Ok(Some((address, name))) => {
                info!("Found {} at {:#X}", name, address);
                Ok(PeerHandle {
                    id: format!("{:012X}", address),
                    name,
                })
            }
            _ => Err(TransportError::NotFound(format!(
                "Device with prefix '{}'",
                name_prefix
            ))),
        }
    }

    async fn connect(
        &self,
        peer: &PeerHandle,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let address = u64::from_str_radix(&peer.id, 16)
            .map_err(|_| TransportError::NotFound(format!("Device {}", peer.id)))?;
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address)
            .map_err(gatt)?
            .await
            .map_err(gatt)?;

        let sender = events.clone();
        let status_handler =
            TypedEventHandler::new(move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                if let Some(dev) = dev.as_ref() {
                    if dev.ConnectionStatus()? == BluetoothConnectionStatus::Disconnected {
                        let _ = sender.send(TransportEvent::Disconnected);
                    }
                }
                Ok(())
            });
        device
            .ConnectionStatusChanged(&status_handler)
            .map_err(gatt)?;

        let mut linked = self.lock();
        linked.device = Some(device);
        linked.service = None;
        linked.characteristics.clear();
        linked.events = Some(events);
        Ok(())
    }

    async fn resolve_endpoint(
        &self,
        service_uuid: &str,
        kind: EndpointKind,
        char_uuid: &str,
    ) -> Result<Endpoint, TransportError> {
        let service = self.service(service_uuid).await?;
        let result = service
            .GetCharacteristicsForUuidAsync(parse_uuid(char_uuid)?)
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        check(result.Status().map_err(gatt)?)?;

        let characteristics = result.Characteristics().map_err(gatt)?;
        if characteristics.Size().map_err(gatt)? == 0 {
            return Err(TransportError::NotFound(format!(
                "{:?} characteristic {}",
                kind, char_uuid
            )));
        }
        let characteristic = characteristics.GetAt(0).map_err(gatt)?;
        debug!("Resolved {:?} characteristic", kind);

        let uuid = char_uuid.to_lowercase();
        self.lock()
            .characteristics
            .insert(uuid.clone(), characteristic);
        Ok(Endpoint { kind, uuid })
    }

    async fn subscribe(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        let characteristic = self.characteristic(&endpoint.uuid)?;
        let sender = self
            .lock()
            .events
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let uuid = endpoint.uuid.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let reader = DataReader::FromBuffer(&args.CharacteristicValue()?)?;
                    let mut data = vec![0u8; reader.UnconsumedBufferLength()? as usize];
                    reader.ReadBytes(&mut data)?;
                    let _ = sender.send(TransportEvent::Notification {
                        uuid: uuid.clone(),
                        data,
                    });
                }
                Ok(())
            },
        );
        characteristic.ValueChanged(&handler).map_err(gatt)?;

        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(
                GattClientCharacteristicConfigurationDescriptorValue::Notify,
            )
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        check(status)
    }

    async fn write(&self, endpoint: &Endpoint, payload: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(&endpoint.uuid)?;
        let writer = DataWriter::new().map_err(gatt)?;
        writer.WriteBytes(payload).map_err(gatt)?;
        let buffer = writer.DetachBuffer().map_err(gatt)?;

        let status = characteristic
            .WriteValueAsync(&buffer)
            .map_err(gatt)?
            .await
            .map_err(gatt)?;
        check(status)
    }

    async fn disconnect(&self) {
        let mut linked = self.lock();
        linked.events = None;
        linked.characteristics.clear();
        if let Some(service) = linked.service.take() {
            let _ = service.Close();
        }
        if let Some(device) = linked.device.take() {
            if let Err(e) = device.Close() {
                warn!("Closing device failed: {}", e);
            }
        }
        info!("GATT session closed");
    }

    fn is_linked(&self) -> bool {
        self.lock()
            .device
            .as_ref()
            .and_then(|d| d.ConnectionStatus().ok())
            .map(|s| s == BluetoothConnectionStatus::Connected)
            .unwrap_or(false)
    }
}
