//! Local-network link over WebSocket.
//!
//! The mask's Wi-Fi module serves a WebSocket on a fixed port and pushes one
//! JSON object per reading. Discovery probes a configured list of candidate
//! hosts with a plain TCP connect.

use std::time::Duration;

use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::{Session, SessionEvent, Transport, TransportError};
use crate::config::NetworkConfig;
use crate::decoder::Payload;
use crate::types::{DeviceDescriptor, TransportKind};

/// WebSocket transport to devices on the local network.
#[derive(Debug, Clone)]
pub struct NetworkTransport {
    hosts: Vec<String>,
    port: u16,
    connect_timeout: Duration,
}

impl NetworkTransport {
    /// Creates a transport probing `config.hosts` on `config.port`.
    #[must_use]
    pub fn new(config: &NetworkConfig, connect_timeout: Duration) -> Self {
        Self {
            hosts: config.hosts.clone(),
            port: config.port,
            connect_timeout,
        }
    }

    fn address_of(&self, device: &DeviceDescriptor) -> String {
        device
            .address
            .clone()
            .unwrap_or_else(|| format!("{}:{}", device.id, self.port))
    }

    async fn probe(&self, host: &str, window: Duration) -> Option<DeviceDescriptor> {
        let address = format!("{host}:{}", self.port);
        match tokio::time::timeout(window, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => {
                debug!(%address, "Host reachable");
                Some(DeviceDescriptor::network(
                    host,
                    Some(format!("GasMask WiFi ({host})")),
                    address,
                ))
            }
            Ok(Err(e)) => {
                debug!(%address, error = %e, "Host unreachable");
                None
            }
            Err(_) => None,
        }
    }
}

impl Transport for NetworkTransport {
    type Session = NetworkSession;

    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    async fn check_permissions(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let probes = self.hosts.iter().map(|host| self.probe(host, window));
        let mut devices: Vec<DeviceDescriptor> = Vec::new();
        for device in join_all(probes).await.into_iter().flatten() {
            if !devices.iter().any(|d| d.id == device.id) {
                devices.push(device);
            }
        }
        Ok(devices)
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<NetworkSession, TransportError> {
        let url = format!("ws://{}", self.address_of(device));
        debug!(%url, "Opening WebSocket");

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "WebSocket connect",
                after: self.connect_timeout,
            })?
            .map_err(|e| TransportError::ConnectFailed {
                device_id: device.id.clone(),
                message: e.to_string(),
            })?;

        info!(device_id = %device.id, %url, "WebSocket connected");
        Ok(NetworkSession { ws })
    }
}

/// An open WebSocket session.
pub struct NetworkSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Session for NetworkSession {
    async fn next_event(&mut self) -> SessionEvent {
        loop {
            let reason = match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return SessionEvent::Payload(Payload::from_message(&text));
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return SessionEvent::Payload(Payload::from_bytes(&bytes));
                }
                Some(Ok(Message::Close(frame))) => frame.map_or_else(
                    || "closed by device".to_string(),
                    |f| format!("closed by device: {}", f.reason),
                ),
                Some(Ok(_)) => continue,
                Some(Err(e)) => e.to_string(),
                None => "connection closed".to_string(),
            };
            return SessionEvent::Disconnected { reason };
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
        let _ = self.ws.flush().await;
    }
}
