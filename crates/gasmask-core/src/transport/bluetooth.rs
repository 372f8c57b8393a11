//! Bluetooth Low Energy link via BlueZ.
//!
//! The mask advertises itself by name and streams text frames as
//! notifications on a single characteristic. This module provides:
//! - Discovery of named devices during a bounded window
//! - Connecting and locating the data characteristic
//! - Turning notifications into [`SessionEvent`]s

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use bluer::{Adapter, AdapterEvent, Address, Device, ErrorKind};
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Session, SessionEvent, Transport, TransportError};
use crate::config::BluetoothConfig;
use crate::decoder::Payload;
use crate::types::{DeviceDescriptor, TransportKind};

type Notifications = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Bluetooth transport backed by the system's default adapter.
pub struct BluetoothTransport {
    // Keeps the D-Bus connection alive for the adapter.
    _session: bluer::Session,
    adapter: Adapter,
    name_prefix: Option<String>,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
}

impl BluetoothTransport {
    /// Opens the default adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if BlueZ is not running or no adapter is present.
    pub async fn new(config: &BluetoothConfig) -> Result<Self, TransportError> {
        let session = bluer::Session::new().await.map_err(adapter_error)?;
        let adapter = session.default_adapter().await.map_err(adapter_error)?;

        info!(adapter = adapter.name(), "Bluetooth adapter opened");

        Ok(Self {
            _session: session,
            adapter,
            name_prefix: config.name_prefix.clone().filter(|p| !p.is_empty()),
            service_uuid: config.service_uuid,
            characteristic_uuid: config.characteristic_uuid,
        })
    }

    fn name_matches(&self, name: &str) -> bool {
        self.name_prefix
            .as_deref()
            .map_or(true, |prefix| name.starts_with(prefix))
    }

    async fn describe(&self, address: Address) -> Option<DeviceDescriptor> {
        let device = self.adapter.device(address).ok()?;
        let name = device.name().await.ok().flatten()?;
        if !self.name_matches(&name) {
            return None;
        }
        let mut descriptor = DeviceDescriptor::bluetooth(address.to_string(), Some(name));
        descriptor.rssi_dbm = device.rssi().await.ok().flatten();
        Some(descriptor)
    }

    async fn open_notifications(
        &self,
        device: &Device,
        device_id: &str,
    ) -> Result<Notifications, TransportError> {
        let services = device.services().await.map_err(|e| connect_error(device_id, &e))?;

        for service in services {
            if service.uuid().await.ok() != Some(self.service_uuid) {
                continue;
            }
            let characteristics = service
                .characteristics()
                .await
                .map_err(|e| connect_error(device_id, &e))?;
            for characteristic in characteristics {
                if characteristic.uuid().await.ok() != Some(self.characteristic_uuid) {
                    continue;
                }
                let stream = characteristic
                    .notify()
                    .await
                    .map_err(|e| connect_error(device_id, &e))?;
                return Ok(Box::pin(stream));
            }
        }

        Err(TransportError::EndpointNotFound {
            device_id: device_id.to_string(),
            endpoint: format!("characteristic {}", self.characteristic_uuid),
        })
    }
}

impl Transport for BluetoothTransport {
    type Session = BluetoothSession;

    fn kind(&self) -> TransportKind {
        TransportKind::Bluetooth
    }

    async fn check_permissions(&self) -> Result<(), TransportError> {
        match self.adapter.is_powered().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::AdapterUnavailable {
                message: format!("adapter {} is powered off", self.adapter.name()),
            }),
            Err(e) => Err(adapter_error(e)),
        }
    }

    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| TransportError::ScanFailed {
                message: e.to_string(),
            })?;
        futures::pin_mut!(events);

        let mut found: HashMap<String, DeviceDescriptor> = HashMap::new();
        let collect = async {
            while let Some(event) = events.next().await {
                if let AdapterEvent::DeviceAdded(address) = event {
                    if let Some(descriptor) = self.describe(address).await {
                        debug!(device_id = %descriptor.id, "Discovered device");
                        found.insert(descriptor.id.clone(), descriptor);
                    }
                }
            }
        };
        // The discovery stream never ends on its own; the window closes it.
        let _ = tokio::time::timeout(window, collect).await;

        let mut devices: Vec<DeviceDescriptor> = found.into_values().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<BluetoothSession, TransportError> {
        let address: Address =
            descriptor
                .id
                .parse()
                .map_err(|_| TransportError::ConnectFailed {
                    device_id: descriptor.id.clone(),
                    message: "not a Bluetooth address".to_string(),
                })?;
        let device = self
            .adapter
            .device(address)
            .map_err(|e| connect_error(&descriptor.id, &e))?;

        if !device.is_connected().await.unwrap_or(false) {
            device
                .connect()
                .await
                .map_err(|e| connect_error(&descriptor.id, &e))?;
        }

        match self.open_notifications(&device, &descriptor.id).await {
            Ok(notifications) => {
                info!(device_id = %descriptor.id, "Subscribed to notifications");
                Ok(BluetoothSession {
                    device,
                    notifications,
                })
            }
            Err(e) => {
                let _ = device.disconnect().await;
                Err(e)
            }
        }
    }
}

/// An open notification subscription.
pub struct BluetoothSession {
    device: Device,
    notifications: Notifications,
}

impl Session for BluetoothSession {
    async fn next_event(&mut self) -> SessionEvent {
        match self.notifications.next().await {
            Some(bytes) => SessionEvent::Payload(Payload::from_bytes(&bytes)),
            None => SessionEvent::Disconnected {
                reason: "notification stream ended".to_string(),
            },
        }
    }

    async fn close(self) {
        drop(self.notifications);
        if let Err(e) = self.device.disconnect().await {
            warn!(device_id = %self.device.address(), error = %e, "Disconnect failed");
        }
    }
}

fn adapter_error(err: bluer::Error) -> TransportError {
    match err.kind {
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => TransportError::PermissionDenied {
            message: format!("Bluetooth access denied: {}", err.message),
        },
        _ => TransportError::AdapterUnavailable {
            message: err.to_string(),
        },
    }
}

fn connect_error(device_id: &str, err: &bluer::Error) -> TransportError {
    TransportError::ConnectFailed {
        device_id: device_id.to_string(),
        message: err.to_string(),
    }
}
