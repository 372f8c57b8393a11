//! Scripted transport for tests and demo mode.
//!
//! A [`MockTransport`] hands out sessions backed by in-memory channels. The
//! owner pushes frames into the live session and can drop the link or make
//! the next connects fail, which is enough to drive every connection-manager
//! path without hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;

use super::{Session, SessionEvent, Transport, TransportError};
use crate::decoder::Payload;
use crate::types::{DeviceDescriptor, TransportKind};

#[derive(Default)]
struct MockState {
    devices: Vec<DeviceDescriptor>,
    permission_denied: bool,
    scan_delay: Option<Duration>,
    connect_delay: Option<Duration>,
    connect_failures: VecDeque<TransportError>,
    link: Option<mpsc::UnboundedSender<SessionEvent>>,
    connect_attempts: u32,
    scans: u32,
    closed_sessions: u32,
}

/// In-memory transport.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Creates a transport that discovers `devices`.
    #[must_use]
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        let transport = Self::default();
        transport.state().devices = devices;
        transport
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every permission check fail.
    pub fn deny_permission(&self) {
        self.state().permission_denied = true;
    }

    /// Makes each scan wait this long before answering.
    pub fn set_scan_delay(&self, delay: Duration) {
        self.state().scan_delay = Some(delay);
    }

    /// Makes each connect wait this long before opening the session.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// Makes the next `count` connects fail.
    pub fn fail_next_connects(&self, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state.connect_failures.push_back(TransportError::ConnectFailed {
                device_id: "mock".to_string(),
                message: "scripted failure".to_string(),
            });
        }
    }

    /// Pushes a raw payload into the open session.
    ///
    /// Returns `false` when no session is open.
    pub fn push(&self, payload: Payload) -> bool {
        self.state()
            .link
            .as_ref()
            .is_some_and(|link| link.send(SessionEvent::Payload(payload)).is_ok())
    }

    /// Pushes a text frame into the open session.
    pub fn push_frame(&self, frame: &str) -> bool {
        self.push(Payload::Text(frame.to_string()))
    }

    /// Drops the open session as if the device went out of range.
    pub fn drop_link(&self, reason: &str) -> bool {
        self.state().link.take().is_some_and(|link| {
            link.send(SessionEvent::Disconnected {
                reason: reason.to_string(),
            })
            .is_ok()
        })
    }

    /// Whether a session is currently open.
    #[must_use]
    pub fn is_linked(&self) -> bool {
        self.state().link.as_ref().is_some_and(|link| !link.is_closed())
    }

    /// Number of connect calls so far.
    #[must_use]
    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    /// Number of scans so far.
    #[must_use]
    pub fn scans(&self) -> u32 {
        self.state().scans
    }

    /// Number of sessions closed through [`Session::close`].
    #[must_use]
    pub fn closed_sessions(&self) -> u32 {
        self.state().closed_sessions
    }
}

impl Transport for MockTransport {
    type Session = MockSession;

    fn kind(&self) -> TransportKind {
        self.state()
            .devices
            .first()
            .map_or(TransportKind::Bluetooth, |d| d.kind)
    }

    async fn check_permissions(&self) -> Result<(), TransportError> {
        if self.state().permission_denied {
            return Err(TransportError::PermissionDenied {
                message: "Bluetooth permission not granted".to_string(),
            });
        }
        Ok(())
    }

    async fn scan(&self, window: Duration) -> Result<Vec<DeviceDescriptor>, TransportError> {
        let delay = {
            let mut state = self.state();
            state.scans += 1;
            state.scan_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay.min(window)).await;
        }
        Ok(self.state().devices.clone())
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<MockSession, TransportError> {
        let delay = {
            let mut state = self.state();
            state.connect_attempts += 1;
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(err) = state.connect_failures.pop_front() {
            return Err(err);
        }
        if !state.devices.iter().any(|d| d.id == device.id) {
            return Err(TransportError::EndpointNotFound {
                device_id: device.id.clone(),
                endpoint: "mock data channel".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.link = Some(tx);
        Ok(MockSession {
            events: rx,
            transport: self.clone(),
        })
    }
}

/// Session fed by [`MockTransport::push`].
pub struct MockSession {
    events: mpsc::UnboundedReceiver<SessionEvent>,
    transport: MockTransport,
}

impl Session for MockSession {
    async fn next_event(&mut self) -> SessionEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| SessionEvent::Disconnected {
                reason: "link dropped".to_string(),
            })
    }

    async fn close(self) {
        let mut state = self.transport.state();
        state.closed_sessions += 1;
        state.link = None;
    }
}
