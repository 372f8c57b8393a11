//! Device links.
//!
//! A [`Transport`] discovers devices and opens a [`Session`] to one of them;
//! a session yields payloads until the link drops. Two links exist:
//!
//! - [`bluetooth`] - Bluetooth Low Energy notifications via BlueZ (feature `bluetooth`)
//! - [`network`] - WebSocket connection to the mask on the local network
//!
//! Both are interchangeable from the connection manager's point of view.
//! [`AnyTransport`] picks one at runtime.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::decoder::Payload;
use crate::types::{DeviceDescriptor, TransportKind};

#[cfg(feature = "bluetooth")]
pub mod bluetooth;
#[cfg(any(test, feature = "mock-transport"))]
pub mod mock;
pub mod network;

#[cfg(feature = "bluetooth")]
pub use bluetooth::{BluetoothSession, BluetoothTransport};
#[cfg(any(test, feature = "mock-transport"))]
pub use mock::{MockSession, MockTransport};
pub use network::{NetworkSession, NetworkTransport};

/// Errors raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The platform refused access to the link.
    #[error("{message}")]
    PermissionDenied {
        /// Description of the missing permission.
        message: String,
    },

    /// The local radio or network interface is not usable.
    #[error("Adapter unavailable: {message}")]
    AdapterUnavailable {
        /// Description of the problem.
        message: String,
    },

    /// Discovery failed.
    #[error("Scan failed: {message}")]
    ScanFailed {
        /// Description of the problem.
        message: String,
    },

    /// The session could not be opened.
    #[error("Could not connect to {device_id}: {message}")]
    ConnectFailed {
        /// Device the connection was attempted to.
        device_id: String,
        /// Description of the problem.
        message: String,
    },

    /// The device is reachable but does not expose the data endpoint.
    #[error("Device {device_id} does not expose {endpoint}")]
    EndpointNotFound {
        /// Device that was connected to.
        device_id: String,
        /// Endpoint that was looked for.
        endpoint: String,
    },

    /// An operation did not complete in time.
    #[error("{operation} timed out after {} ms", .after.as_millis())]
    Timeout {
        /// Operation that timed out.
        operation: &'static str,
        /// How long it was given.
        after: Duration,
    },

    /// The session was already closed.
    #[error("Session closed")]
    Closed,

    /// Low-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that happened on an open session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The device sent a payload.
    Payload(Payload),
    /// The link dropped.
    Disconnected {
        /// Why the link dropped, as reported by the transport.
        reason: String,
    },
}

/// An open link to one device.
pub trait Session: Send + 'static {
    /// Waits for the next event on the link.
    ///
    /// After a [`SessionEvent::Disconnected`] the session is finished.
    fn next_event(&mut self) -> impl Future<Output = SessionEvent> + Send;

    /// Tears the link down.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// A way of discovering and reaching devices.
pub trait Transport: Send + Sync + 'static {
    /// Session type produced by [`Transport::connect`].
    type Session: Session;

    /// Which link this is.
    fn kind(&self) -> TransportKind;

    /// Verifies that the platform lets us use the link.
    ///
    /// Called before any scan or connect.
    fn check_permissions(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Lists reachable devices, waiting at most `window`.
    fn scan(
        &self,
        window: Duration,
    ) -> impl Future<Output = Result<Vec<DeviceDescriptor>, TransportError>> + Send;

    /// Opens a session and subscribes to the device's data stream.
    fn connect(
        &self,
        device: &DeviceDescriptor,
    ) -> impl Future<Output = Result<Self::Session, TransportError>> + Send;
}

// ============================================================================
// Runtime selection
// ============================================================================

/// A transport chosen at runtime.
pub enum AnyTransport {
    /// Bluetooth Low Energy link.
    #[cfg(feature = "bluetooth")]
    Bluetooth(BluetoothTransport),
    /// Local-network link.
    Network(NetworkTransport),
    /// Scripted link for tests and demo mode.
    #[cfg(any(test, feature = "mock-transport"))]
    Mock(MockTransport),
}

/// A session opened by an [`AnyTransport`].
pub enum AnySession {
    /// Bluetooth Low Energy session.
    #[cfg(feature = "bluetooth")]
    Bluetooth(BluetoothSession),
    /// Local-network session.
    Network(NetworkSession),
    /// Scripted session.
    #[cfg(any(test, feature = "mock-transport"))]
    Mock(MockSession),
}

impl Session for AnySession {
    async fn next_event(&mut self) -> SessionEvent {
        match self {
            #[cfg(feature = "bluetooth")]
            Self::Bluetooth(session) => session.next_event().await,
            Self::Network(session) => session.next_event().await,
            #[cfg(any(test, feature = "mock-transport"))]
            Self::Mock(session) => session.next_event().await,
        }
    }

    async fn close(self) {
        match self {
            #[cfg(feature = "bluetooth")]
            Self::Bluetooth(session) => session.close().await,
            Self::Network(session) => session.close().await,
            #[cfg(any(test, feature = "mock-transport"))]
            Self::Mock(session) => session.close().await,
        }
    }
}

impl Transport for AnyTransport {
    type Session = AnySession;

    fn kind(&self) -> TransportKind {
        match self {
            #[cfg(feature = "bluetooth")]
            Self::Bluetooth(transport) => transport.kind(),
            Self::Network(transport) => transport.kind(),
            #[cfg(any(test, feature = "mock-transport"))]
            Self::Mock(transport) => transport.kind(),
        }
    }

    async fn check_permissions(&self) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "bluetooth")]
            Self::Bluetooth(transport) => transport.check_permissions().await,
            Self::Network(transport) => transport.check_permissions().await,
            #[cfg(any(test, feature = "mock-transport"))]
            Self::Mock(transport) => transport.check_permissions().await,
        }
    }

    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        match self {
            #[cfg(feature = "bluetooth")]
            Self::Bluetooth(transport) => transport.scan(window).await,
            Self::Network(transport) => transport.scan(window).await,
            #[cfg(any(test, feature = "mock-transport"))]
            Self::Mock(transport) => transport.scan(window).await,
        }
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<AnySession, TransportError> {
        match self {
            #[cfg(feature = "bluetooth")]
            Self::Bluetooth(transport) => transport.connect(device).await.map(AnySession::Bluetooth),
            Self::Network(transport) => transport.connect(device).await.map(AnySession::Network),
            #[cfg(any(test, feature = "mock-transport"))]
            Self::Mock(transport) => transport.connect(device).await.map(AnySession::Mock),
        }
    }
}
