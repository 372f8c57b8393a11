//! Connection manager.
//!
//! Owns the link to one device and turns its payloads into classified
//! [`Reading`]s. The manager is generic over a [`Transport`], so the radio
//! and network links share one state machine:
//!
//! ```text
//! Disconnected --scan--> Scanning --window closed--> Disconnected
//! Disconnected --connect--> Connecting --ok--> Connected --link lost--> Reconnecting
//!                                 \--failed--> Disconnected                |
//!                         Connected <--reconnected-- Reconnecting ----------+
//!                         Disconnected <--retries exhausted--/
//! ```
//!
//! Every state change goes through [`transition`] while holding one async
//! lock, so an in-progress reconnect and an explicit [`disconnect`] can
//! never interleave. `disconnect` also bumps an epoch counter; any scan,
//! connect, backoff timer or stream loop started under an older epoch sees
//! the change and stops.
//!
//! Readings fan out to every [`subscribe`]r through unbounded channels in
//! decode order. Status snapshots go through a `watch` channel and
//! noteworthy events through a `broadcast` channel.
//!
//! [`disconnect`]: ConnectionManager::disconnect
//! [`subscribe`]: ConnectionManager::subscribe

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::clock::{Clock, SystemClock};
use crate::decoder::{decode_reading, DecodeError, Payload};
use crate::thresholds::ThresholdConfig;
use crate::transport::{Session, SessionEvent, Transport, TransportError};
use crate::types::{ConnectionState, ConnectionStatus, DeviceDescriptor, Reading};

/// Capacity of the connection event channel.
const EVENT_CAPACITY: usize = 64;

// ============================================================================
// Errors and events
// ============================================================================

/// Errors surfaced by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The platform refused access to the link.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Description of the missing permission.
        message: String,
    },

    /// The session could not be opened or the data endpoint was missing.
    #[error("Connection to {device_id} failed: {reason}")]
    ConnectionFailed {
        /// Device the connection was attempted to.
        device_id: String,
        /// What went wrong.
        reason: String,
    },

    /// The link dropped and every retry failed.
    #[error("Gave up reconnecting to {device_id} after {attempts} attempts")]
    ReconnectExhausted {
        /// Device that was lost.
        device_id: String,
        /// Retries made before giving up.
        attempts: u32,
    },

    /// Discovery failed.
    #[error("Scan failed: {message}")]
    ScanFailed {
        /// Description of the problem.
        message: String,
    },

    /// The operation is not allowed in the current state.
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was refused.
        operation: &'static str,
        /// State the manager was in.
        state: ConnectionState,
    },

    /// A `disconnect()` interrupted the operation.
    #[error("Operation cancelled by disconnect")]
    Cancelled,
}

/// Something that happened on the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The manager moved to a new state.
    StateChanged {
        /// Previous state.
        from: ConnectionState,
        /// New state.
        to: ConnectionState,
    },
    /// A payload was dropped because it did not decode.
    ReadingRejected {
        /// Device that sent the payload.
        device_id: String,
        /// Why it was rejected.
        error: DecodeError,
    },
    /// The reconnect budget ran out; the manager is disconnected.
    ReconnectExhausted {
        /// Device that was lost.
        device_id: String,
        /// Retries made before giving up.
        attempts: u32,
    },
}

impl ConnectionEvent {
    /// The error this event reports, if any.
    #[must_use]
    pub fn error(&self) -> Option<ConnectionError> {
        match self {
            Self::ReconnectExhausted {
                device_id,
                attempts,
            } => Some(ConnectionError::ReconnectExhausted {
                device_id: device_id.clone(),
                attempts: *attempts,
            }),
            _ => None,
        }
    }
}

// ============================================================================
// State machine
// ============================================================================

/// Inputs that move the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// A discovery window opens.
    Scan,
    /// The discovery window closed.
    ScanFinished,
    /// A session is being opened to a chosen device.
    Connect,
    /// The session (or a retried session) is open.
    Established,
    /// The session could not be opened.
    ConnectFailed,
    /// The transport reported the link dropped.
    LinkLost {
        /// Retries already spent since the last accepted reading.
        retries_spent: u32,
    },
    /// A reconnect attempt failed and another one follows.
    RetryFailed,
    /// The reconnect budget ran out.
    RetriesExhausted,
    /// Explicit disconnect.
    Disconnect,
}

impl Trigger {
    const fn operation(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::ScanFinished => "finish scanning",
            Self::Connect => "connect",
            Self::Established => "complete a connection",
            Self::ConnectFailed => "fail a connection",
            Self::LinkLost { .. } => "handle a lost link",
            Self::RetryFailed => "retry",
            Self::RetriesExhausted => "give up reconnecting",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Computes the state that follows `state` on `trigger`.
///
/// `Disconnect` is accepted from every state.
///
/// # Errors
///
/// Returns [`ConnectionError::InvalidState`] for any other pair the state
/// machine does not define.
pub fn transition(
    state: ConnectionState,
    trigger: Trigger,
) -> Result<ConnectionState, ConnectionError> {
    use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting, Scanning};

    match (state, trigger) {
        (_, Trigger::Disconnect)
        | (Scanning, Trigger::ScanFinished)
        | (Connecting, Trigger::ConnectFailed)
        | (Reconnecting { .. }, Trigger::RetriesExhausted) => Ok(Disconnected),
        (Disconnected, Trigger::Scan) => Ok(Scanning),
        (Disconnected, Trigger::Connect) => Ok(Connecting),
        (Connecting | Reconnecting { .. }, Trigger::Established) => Ok(Connected),
        (Connected, Trigger::LinkLost { retries_spent }) => Ok(Reconnecting {
            attempt: retries_spent.saturating_add(1),
        }),
        (Reconnecting { attempt }, Trigger::RetryFailed) => Ok(Reconnecting {
            attempt: attempt.saturating_add(1),
        }),
        (state, trigger) => Err(ConnectionError::InvalidState {
            operation: trigger.operation(),
            state,
        }),
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Timing and classification settings of a [`ConnectionManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    /// How long a discovery window stays open.
    pub scan_window: Duration,
    /// Upper bound on opening a session.
    pub connect_timeout: Duration,
    /// Retry schedule after a lost link.
    pub reconnect: ReconnectPolicy,
    /// Thresholds used to classify readings.
    pub thresholds: ThresholdConfig,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            scan_window: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::default(),
            thresholds: ThresholdConfig::default(),
        }
    }
}

struct Control {
    state: ConnectionState,
    stream: Option<JoinHandle<()>>,
}

struct Inner<T: Transport> {
    transport: T,
    clock: Arc<dyn Clock>,
    settings: ConnectionSettings,
    control: Mutex<Control>,
    epoch: watch::Sender<u64>,
    status: watch::Sender<ConnectionStatus>,
    events: broadcast::Sender<ConnectionEvent>,
    subscribers: StdMutex<Vec<mpsc::UnboundedSender<Reading>>>,
}

/// Manages discovery, the live session and reconnects for one device.
///
/// Cloning is cheap; clones share the same connection.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// Creates a disconnected manager stamping readings with the system clock.
    #[must_use]
    pub fn new(transport: T, settings: ConnectionSettings) -> Self {
        Self::with_clock(transport, settings, Arc::new(SystemClock))
    }

    /// Creates a disconnected manager with an explicit clock.
    #[must_use]
    pub fn with_clock(transport: T, settings: ConnectionSettings, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                clock,
                settings,
                control: Mutex::new(Control {
                    state: ConnectionState::Disconnected,
                    stream: None,
                }),
                epoch: watch::Sender::new(0),
                status: watch::Sender::new(ConnectionStatus::default()),
                events,
                subscribers: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Settings the manager runs with.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    /// Snapshot of the current status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Receiver that observes every status change.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Receiver for connection events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a reading subscriber.
    ///
    /// The subscription survives reconnects and ends on [`shutdown`].
    ///
    /// [`shutdown`]: Self::shutdown
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Reading> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers().push(tx);
        rx
    }

    /// Lists reachable devices, deduplicated by identifier.
    ///
    /// # Errors
    ///
    /// Fails without touching the transport when permission is missing,
    /// with `InvalidState` unless disconnected, and with `Cancelled` if a
    /// disconnect interrupts the window.
    pub async fn scan(&self) -> Result<Vec<DeviceDescriptor>, ConnectionError> {
        let inner = &self.inner;
        inner
            .transport
            .check_permissions()
            .await
            .map_err(|e| permission_error(e, |message| ConnectionError::ScanFailed { message }))?;

        let epoch = {
            let mut control = inner.control.lock().await;
            inner.apply(&mut control, Trigger::Scan)?;
            inner.current_epoch()
        };

        let window = inner.settings.scan_window;
        debug!(window = ?window, "Scanning");
        let result = tokio::select! {
            result = inner.transport.scan(window) => result,
            () = inner.cancelled(epoch) => return Err(ConnectionError::Cancelled),
        };

        {
            let mut control = inner.control.lock().await;
            if inner.current_epoch() != epoch {
                return Err(ConnectionError::Cancelled);
            }
            inner.apply(&mut control, Trigger::ScanFinished)?;
        }

        let devices = dedupe(result.map_err(|e| ConnectionError::ScanFailed {
            message: e.to_string(),
        })?);
        info!(count = devices.len(), "Scan finished");
        Ok(devices)
    }

    /// Opens a session to `device` and starts streaming readings.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionFailed` (and goes back to disconnected) when the
    /// session cannot be opened, `PermissionDenied` before any transport
    /// call, `InvalidState` unless disconnected, and `Cancelled` if a
    /// disconnect interrupts the attempt.
    pub async fn connect(&self, device: DeviceDescriptor) -> Result<(), ConnectionError> {
        let inner = &self.inner;
        inner.transport.check_permissions().await.map_err(|e| {
            permission_error(e, |reason| ConnectionError::ConnectionFailed {
                device_id: device.id.clone(),
                reason,
            })
        })?;

        let epoch = {
            let mut control = inner.control.lock().await;
            inner.apply(&mut control, Trigger::Connect)?;
            inner.status.send_modify(|status| {
                status.device_id = Some(device.id.clone());
                status.device_name = device.name.clone();
            });
            inner.current_epoch()
        };

        info!(device_id = %device.id, kind = %device.kind, "Connecting");
        let result = tokio::select! {
            result = inner.open_session(&device) => result,
            () = inner.cancelled(epoch) => return Err(ConnectionError::Cancelled),
        };

        let mut control = inner.control.lock().await;
        if inner.current_epoch() != epoch {
            drop(control);
            if let Ok(session) = result {
                session.close().await;
            }
            return Err(ConnectionError::Cancelled);
        }

        match result {
            Ok(session) => {
                inner.apply(&mut control, Trigger::Established)?;
                let stream = Arc::clone(inner).stream(session, device, epoch);
                control.stream = Some(tokio::spawn(stream));
                Ok(())
            }
            Err(error) => {
                inner.apply(&mut control, Trigger::ConnectFailed)?;
                inner.clear_device();
                warn!(device_id = %device.id, %error, "Connection failed");
                Err(ConnectionError::ConnectionFailed {
                    device_id: device.id,
                    reason: error.to_string(),
                })
            }
        }
    }

    /// Tears down the session and cancels scans, connects and retry timers.
    ///
    /// Idempotent and valid in every state.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let stream = {
            let mut control = inner.control.lock().await;
            inner.epoch.send_modify(|epoch| *epoch += 1);
            let _ = inner.apply(&mut control, Trigger::Disconnect);
            inner.clear_device();
            control.stream.take()
        };

        // The stream loop closes its own session once it sees the new epoch.
        if let Some(task) = stream {
            if let Err(e) = task.await {
                error!(error = %e, "Reading stream task failed");
            }
        }
    }

    /// Disconnects and ends every reading subscription.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.subscribers().clear();
        info!("Connection manager shut down");
    }
}

impl<T: Transport> Inner<T> {
    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<Reading>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> u64 {
        *self.epoch.borrow()
    }

    /// Resolves once `disconnect()` has moved past `epoch`.
    async fn cancelled(&self, epoch: u64) {
        let mut rx = self.epoch.subscribe();
        let _ = rx.wait_for(|current| *current != epoch).await;
    }

    /// Applies a transition. Must be called with the control lock held.
    fn apply(
        &self,
        control: &mut Control,
        trigger: Trigger,
    ) -> Result<ConnectionState, ConnectionError> {
        let from = control.state;
        let to = transition(from, trigger)?;
        control.state = to;
        if from != to {
            self.status.send_modify(|status| status.state = to);
            info!(%from, %to, "Connection state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged { from, to });
        }
        Ok(to)
    }

    fn clear_device(&self) {
        self.status.send_modify(|status| {
            status.device_id = None;
            status.device_name = None;
        });
    }

    async fn open_session(&self, device: &DeviceDescriptor) -> Result<T::Session, TransportError> {
        let timeout = self.settings.connect_timeout;
        tokio::time::timeout(timeout, self.transport.connect(device))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                after: timeout,
            })?
    }

    fn publish(&self, reading: &Reading) {
        self.subscribers()
            .retain(|subscriber| subscriber.send(reading.clone()).is_ok());
    }

    /// Decodes one payload and publishes the reading.
    ///
    /// Returns `true` if a reading was published.
    fn accept(
        &self,
        payload: &Payload,
        device: &DeviceDescriptor,
        epoch: u64,
        last_timestamp: &mut i64,
    ) -> bool {
        if self.current_epoch() != epoch {
            return false;
        }

        let timestamp = self.clock.now_ms().max(*last_timestamp);
        match decode_reading(payload, &device.id, timestamp, &self.settings.thresholds) {
            Ok(reading) => {
                *last_timestamp = timestamp;
                debug!(
                    device_id = %device.id,
                    timestamp,
                    level = reading.alert_level.label(),
                    "Reading accepted"
                );
                self.status
                    .send_modify(|status| status.last_update = Some(timestamp));
                self.publish(&reading);
                true
            }
            Err(error) => {
                warn!(device_id = %device.id, %error, "Dropping malformed payload");
                let _ = self.events.send(ConnectionEvent::ReadingRejected {
                    device_id: device.id.clone(),
                    error,
                });
                false
            }
        }
    }

    /// Streams one device until disconnect or until reconnecting gives up.
    async fn stream(self: Arc<Self>, mut session: T::Session, device: DeviceDescriptor, epoch: u64) {
        let mut last_timestamp = i64::MIN;
        // Retries spent since the last accepted reading. A link that keeps
        // dropping before delivering anything does not refill the budget.
        let mut retries_spent = 0;

        loop {
            let event = tokio::select! {
                event = session.next_event() => event,
                () = self.cancelled(epoch) => {
                    session.close().await;
                    debug!(device_id = %device.id, "Stream stopped by disconnect");
                    return;
                }
            };

            match event {
                SessionEvent::Payload(payload) => {
                    if self.accept(&payload, &device, epoch, &mut last_timestamp) {
                        retries_spent = 0;
                    }
                }
                SessionEvent::Disconnected { reason } => {
                    warn!(device_id = %device.id, %reason, "Link lost");
                    session.close().await;
                    match self.reconnect(&device, epoch, retries_spent).await {
                        Some((next, spent)) => {
                            session = next;
                            retries_spent = spent;
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// Retries the session with backoff.
    ///
    /// Returns the new session and the retries spent so far, or `None` once
    /// the budget is exhausted or a disconnect cancelled the loop.
    async fn reconnect(
        &self,
        device: &DeviceDescriptor,
        epoch: u64,
        retries_spent: u32,
    ) -> Option<(T::Session, u32)> {
        let policy = self.settings.reconnect;
        {
            let mut control = self.control.lock().await;
            if self.current_epoch() != epoch {
                return None;
            }
            let _ = self.apply(&mut control, Trigger::LinkLost { retries_spent });
        }

        let mut attempt = retries_spent + 1;
        loop {
            let delay = {
                let mut control = self.control.lock().await;
                if self.current_epoch() != epoch {
                    return None;
                }
                match policy.delay_for(attempt) {
                    Some(delay) => delay,
                    None => {
                        self.exhaust(&mut control, device, attempt - 1);
                        return None;
                    }
                }
            };

            debug!(device_id = %device.id, attempt, delay = ?delay, "Reconnect scheduled");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancelled(epoch) => return None,
            }

            let result = tokio::select! {
                result = self.open_session(device) => result,
                () = self.cancelled(epoch) => return None,
            };

            let mut control = self.control.lock().await;
            if self.current_epoch() != epoch {
                drop(control);
                if let Ok(session) = result {
                    session.close().await;
                }
                return None;
            }

            match result {
                Ok(session) => {
                    let _ = self.apply(&mut control, Trigger::Established);
                    info!(device_id = %device.id, attempt, "Reconnected");
                    return Some((session, attempt));
                }
                Err(error) => {
                    warn!(device_id = %device.id, attempt, %error, "Reconnect attempt failed");
                    attempt += 1;
                    if policy.delay_for(attempt).is_some() {
                        let _ = self.apply(&mut control, Trigger::RetryFailed);
                    }
                }
            }
        }
    }

    fn exhaust(&self, control: &mut Control, device: &DeviceDescriptor, attempts: u32) {
        let _ = self.apply(control, Trigger::RetriesExhausted);
        // This runs on the stream task itself; detach its handle.
        control.stream = None;
        self.clear_device();
        warn!(device_id = %device.id, attempts, "Reconnect attempts exhausted");
        let _ = self.events.send(ConnectionEvent::ReconnectExhausted {
            device_id: device.id.clone(),
            attempts,
        });
    }
}

fn permission_error(
    err: TransportError,
    otherwise: impl FnOnce(String) -> ConnectionError,
) -> ConnectionError {
    match err {
        TransportError::PermissionDenied { message } => ConnectionError::PermissionDenied { message },
        other => otherwise(other.to_string()),
    }
}

fn dedupe(devices: Vec<DeviceDescriptor>) -> Vec<DeviceDescriptor> {
    let mut seen = HashSet::new();
    devices
        .into_iter()
        .filter(|device| seen.insert(device.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::thresholds::AlertLevel;
    use crate::transport::MockTransport;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor::bluetooth("AA:BB:CC:DD:EE:FF", Some("GasMask".to_string()))
    }

    fn manager(transport: &MockTransport) -> (ConnectionManager<MockTransport>, ManualClock) {
        let clock = ManualClock::new(1_000);
        let manager = ConnectionManager::with_clock(
            transport.clone(),
            ConnectionSettings::default(),
            Arc::new(clock.clone()),
        );
        (manager, clock)
    }

    async fn wait_for_state(
        manager: &ConnectionManager<MockTransport>,
        predicate: impl Fn(&ConnectionState) -> bool,
    ) {
        let mut rx = manager.watch_status();
        let _ = rx.wait_for(|status| predicate(&status.state)).await.unwrap();
    }

    fn drain(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn states(events: &[ConnectionEvent]) -> Vec<ConnectionState> {
        events
            .iter()
            .filter_map(|event| match event {
                ConnectionEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_transition_table() {
        use ConnectionState::*;

        assert_eq!(transition(Disconnected, Trigger::Scan), Ok(Scanning));
        assert_eq!(transition(Scanning, Trigger::ScanFinished), Ok(Disconnected));
        assert_eq!(transition(Disconnected, Trigger::Connect), Ok(Connecting));
        assert_eq!(transition(Connecting, Trigger::Established), Ok(Connected));
        assert_eq!(transition(Connecting, Trigger::ConnectFailed), Ok(Disconnected));
        assert_eq!(
            transition(Connected, Trigger::LinkLost { retries_spent: 0 }),
            Ok(Reconnecting { attempt: 1 })
        );
        assert_eq!(
            transition(Reconnecting { attempt: 2 }, Trigger::RetryFailed),
            Ok(Reconnecting { attempt: 3 })
        );
        assert_eq!(transition(Reconnecting { attempt: 3 }, Trigger::Established), Ok(Connected));
        assert_eq!(
            transition(Reconnecting { attempt: 5 }, Trigger::RetriesExhausted),
            Ok(Disconnected)
        );
    }

    #[test]
    fn test_disconnect_is_accepted_from_every_state() {
        use ConnectionState::*;

        for state in [Disconnected, Scanning, Connecting, Connected, Reconnecting { attempt: 4 }] {
            assert_eq!(transition(state, Trigger::Disconnect), Ok(Disconnected));
        }
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        use ConnectionState::*;

        assert_eq!(
            transition(Connected, Trigger::Scan),
            Err(ConnectionError::InvalidState {
                operation: "scan",
                state: Connected,
            })
        );
        assert!(transition(Scanning, Trigger::Connect).is_err());
        assert!(transition(Disconnected, Trigger::Established).is_err());
        assert!(transition(Connected, Trigger::RetryFailed).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_deduplicates_and_returns_to_disconnected() {
        let transport = MockTransport::new(vec![
            device(),
            DeviceDescriptor::bluetooth("11:22:33:44:55:66", Some("GasMask-2".to_string())),
            device(),
        ]);
        let (manager, _) = manager(&transport);
        let mut events = manager.events();

        let devices = manager.scan().await.unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "AA:BB:CC:DD:EE:FF");
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(
            states(&drain(&mut events)),
            vec![ConnectionState::Scanning, ConnectionState::Disconnected]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_before_any_transport_call() {
        let transport = MockTransport::new(vec![device()]);
        transport.deny_permission();
        let (manager, _) = manager(&transport);

        let scan = manager.scan().await;
        let connect = manager.connect(device()).await;

        assert!(matches!(scan, Err(ConnectionError::PermissionDenied { .. })));
        assert!(matches!(connect, Err(ConnectionError::PermissionDenied { .. })));
        assert_eq!(transport.scans(), 0);
        assert_eq!(transport.connect_attempts(), 0);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_stream_publishes_readings_in_order() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, clock) = manager(&transport);
        let mut readings = manager.subscribe();
        let mut events = manager.events();

        manager.connect(device()).await.unwrap();
        assert_eq!(manager.status().state, ConnectionState::Connected);
        assert_eq!(manager.status().device_name.as_deref(), Some("GasMask"));

        assert!(transport.push_frame("mq2:100,mq4:200,mq9:300,mq135:400"));
        assert!(transport.push_frame("mq2:1,mq4:2,mq9:3"));
        let first = readings.recv().await.unwrap();

        clock.advance(250);
        assert!(transport.push_frame("mq2:4500,mq4:0,mq9:0,mq135:0"));
        let second = readings.recv().await.unwrap();

        assert!((first.levels.lpg - 100.0).abs() < f64::EPSILON);
        assert_eq!(first.alert_level, AlertLevel::Normal);
        assert_eq!(first.timestamp, 1_000);
        assert!((second.levels.lpg - 4500.0).abs() < f64::EPSILON);
        assert_eq!(second.alert_level, AlertLevel::Danger);
        assert_eq!(second.timestamp, 1_250);
        assert_eq!(manager.status().last_update, Some(1_250));
        assert_eq!(manager.status().state, ConnectionState::Connected);

        let rejected = drain(&mut events)
            .into_iter()
            .filter(|event| matches!(event, ConnectionEvent::ReadingRejected { .. }))
            .count();
        assert_eq!(rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timestamps_never_go_backwards() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, clock) = manager(&transport);
        let mut readings = manager.subscribe();
        manager.connect(device()).await.unwrap();

        transport.push_frame("mq2:1,mq4:1,mq9:1,mq135:1");
        let first = readings.recv().await.unwrap();
        clock.set(500);
        transport.push_frame("mq2:2,mq4:2,mq9:2,mq135:2");
        let second = readings.recv().await.unwrap();

        assert_eq!(first.timestamp, 1_000);
        assert_eq!(second.timestamp, 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_returns_to_disconnected() {
        let transport = MockTransport::new(vec![device()]);
        transport.fail_next_connects(1);
        let (manager, _) = manager(&transport);

        let err = manager.connect(device()).await.unwrap_err();

        assert!(matches!(err, ConnectionError::ConnectionFailed { ref device_id, .. } if device_id == "AA:BB:CC:DD:EE:FF"));
        let status = manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.device_id, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_endpoint_is_a_connection_failure() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, _) = manager(&transport);
        let stranger = DeviceDescriptor::bluetooth("00:00:00:00:00:01", None);

        let err = manager.connect(stranger).await.unwrap_err();
        assert!(matches!(err, ConnectionError::ConnectionFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_refused_while_connected() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, _) = manager(&transport);
        manager.connect(device()).await.unwrap();

        assert!(matches!(
            manager.scan().await,
            Err(ConnectionError::InvalidState { operation: "scan", .. })
        ));
        assert!(matches!(
            manager.connect(device()).await,
            Err(ConnectionError::InvalidState { operation: "connect", .. })
        ));
        assert_eq!(transport.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_keeps_subscribers() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, _) = manager(&transport);
        let mut readings = manager.subscribe();
        let mut events = manager.events();
        manager.connect(device()).await.unwrap();

        transport.push_frame("mq2:1,mq4:1,mq9:1,mq135:1");
        readings.recv().await.unwrap();

        transport.drop_link("out of range");
        wait_for_state(&manager, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        wait_for_state(&manager, |s| *s == ConnectionState::Connected).await;

        transport.push_frame("mq2:7,mq4:7,mq9:7,mq135:7");
        let after = readings.recv().await.unwrap();
        assert!((after.levels.ammonia - 7.0).abs() < f64::EPSILON);
        assert_eq!(transport.connect_attempts(), 2);
        assert_eq!(transport.closed_sessions(), 1);

        assert_eq!(
            states(&drain(&mut events)),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Reconnecting { attempt: 1 },
                ConnectionState::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_budget() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, _) = manager(&transport);
        let mut events = manager.events();
        manager.connect(device()).await.unwrap();

        transport.fail_next_connects(100);
        let started = tokio::time::Instant::now();
        transport.drop_link("out of range");
        wait_for_state(&manager, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        wait_for_state(&manager, |s| *s == ConnectionState::Disconnected).await;

        // 1 + 1.5 + 2.25 + 3.375 + 5.062 seconds of backoff.
        assert!(started.elapsed() >= Duration::from_millis(13_187));
        assert_eq!(transport.connect_attempts(), 1 + 5);

        let events = drain(&mut events);
        let exhausted: Vec<_> = events.iter().filter_map(ConnectionEvent::error).collect();
        assert_eq!(
            exhausted,
            vec![ConnectionError::ReconnectExhausted {
                device_id: "AA:BB:CC:DD:EE:FF".to_string(),
                attempts: 5,
            }]
        );
        assert!(states(&events).contains(&ConnectionState::Reconnecting { attempt: 5 }));
        assert_eq!(manager.status().device_id, None);

        // No further retries once exhausted.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.connect_attempts(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_links_dropping_before_any_reading_share_one_budget() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, _) = manager(&transport);
        manager.connect(device()).await.unwrap();

        for _ in 0..5 {
            transport.drop_link("flaky");
            wait_for_state(&manager, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
            wait_for_state(&manager, |s| *s == ConnectionState::Connected).await;
        }
        transport.drop_link("flaky");
        wait_for_state(&manager, |s| *s == ConnectionState::Disconnected).await;

        assert_eq!(transport.connect_attempts(), 1 + 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_retry() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, _) = manager(&transport);
        manager.connect(device()).await.unwrap();

        transport.drop_link("out of range");
        wait_for_state(&manager, |s| matches!(s, ConnectionState::Reconnecting { .. })).await;
        manager.disconnect().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.connect_attempts(), 1);
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_scan() {
        let transport = MockTransport::new(vec![device()]);
        transport.set_scan_delay(Duration::from_secs(10));
        let (manager, _) = manager(&transport);

        let scanning = manager.clone();
        let scan = tokio::spawn(async move { scanning.scan().await });
        wait_for_state(&manager, |s| *s == ConnectionState::Scanning).await;
        manager.disconnect().await;

        assert_eq!(scan.await.unwrap(), Err(ConnectionError::Cancelled));
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_in_flight_connect() {
        let transport = MockTransport::new(vec![device()]);
        transport.set_connect_delay(Duration::from_secs(2));
        let (manager, _) = manager(&transport);

        let connecting = manager.clone();
        let connect = tokio::spawn(async move { connecting.connect(device()).await });
        wait_for_state(&manager, |s| *s == ConnectionState::Connecting).await;
        manager.disconnect().await;

        assert_eq!(connect.await.unwrap(), Err(ConnectionError::Cancelled));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(manager.status().device_id, None);
        assert_eq!(transport.connect_attempts(), 1);
        assert!(!transport.is_linked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_opened_after_disconnect_is_closed() {
        let transport = MockTransport::new(vec![device()]);
        transport.set_connect_delay(Duration::from_secs(2));
        let (manager, _) = manager(&transport);

        let connecting = manager.clone();
        let connect = tokio::spawn(async move { connecting.connect(device()).await });
        wait_for_state(&manager, |s| *s == ConnectionState::Connecting).await;

        // Disconnect wins the control lock right after the session opens.
        let inner = &manager.inner;
        let mut control = inner.control.lock().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(transport.is_linked());
        inner.epoch.send_modify(|epoch| *epoch += 1);
        inner.apply(&mut control, Trigger::Disconnect).unwrap();
        inner.clear_device();
        drop(control);

        assert_eq!(connect.await.unwrap(), Err(ConnectionError::Cancelled));
        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(transport.closed_sessions(), 1);
        assert!(!transport.is_linked());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent_and_closes_session() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, _) = manager(&transport);
        let mut events = manager.events();

        manager.disconnect().await;
        manager.connect(device()).await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(manager.status().state, ConnectionState::Disconnected);
        assert_eq!(transport.closed_sessions(), 1);
        assert!(!transport.is_linked());
        assert_eq!(
            states(&drain(&mut events)),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_subscriptions() {
        let transport = MockTransport::new(vec![device()]);
        let (manager, _) = manager(&transport);
        let mut readings = manager.subscribe();
        manager.connect(device()).await.unwrap();

        manager.shutdown().await;
        assert!(readings.recv().await.is_none());
    }
}
