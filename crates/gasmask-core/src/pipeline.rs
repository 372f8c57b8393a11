//! Reading fan-out.
//!
//! One task drains a connection manager's reading subscription and, for
//! each reading in arrival order, admits it to retention, evaluates it in
//! the alert dispatcher and hands it to the persistence sink. A reading is
//! fully handled before the next one is looked at. Alert toggle changes are
//! applied between readings.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::alerts::{AlertDispatcher, AlertOutcome, AlertSession};
use crate::retention::RetentionService;
use crate::storage::ReadingSink;
use crate::types::Reading;

/// Handle to a running pipeline task.
#[derive(Debug)]
pub struct PipelineHandle {
    alert_session: watch::Receiver<Option<AlertSession>>,
    processed: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Receiver that observes the open alert session.
    #[must_use]
    pub fn alert_session(&self) -> watch::Receiver<Option<AlertSession>> {
        self.alert_session.clone()
    }

    /// Receiver for the number of readings handled so far.
    #[must_use]
    pub fn processed(&self) -> watch::Receiver<u64> {
        self.processed.clone()
    }

    /// Waits for the task to finish. It finishes once the reading
    /// subscription closes.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Pipeline task failed");
        }
    }
}

/// Starts the pipeline task.
#[must_use]
pub fn spawn(
    mut readings: mpsc::UnboundedReceiver<Reading>,
    retention: RetentionService,
    mut dispatcher: AlertDispatcher,
    sink: Arc<dyn ReadingSink>,
) -> PipelineHandle {
    let alert_session = dispatcher.watch_session();
    let (processed_tx, processed) = watch::channel(0_u64);

    let mut preferences = dispatcher.watch_preferences();

    let task = tokio::spawn(async move {
        let mut follow_preferences = true;
        loop {
            tokio::select! {
                reading = readings.recv() => {
                    let Some(reading) = reading else { break };
                    handle(&reading, &retention, &mut dispatcher, sink.as_ref());
                    processed_tx.send_modify(|count| *count += 1);
                }
                changed = preferences.changed(), if follow_preferences => {
                    if changed.is_ok() {
                        dispatcher.apply_preferences();
                    } else {
                        follow_preferences = false;
                    }
                }
            }
        }

        // No more readings can arrive, so no reading can close the session.
        dispatcher.close();
        info!(processed = *processed_tx.borrow(), "Reading stream ended");
    });

    PipelineHandle {
        alert_session,
        processed,
        task,
    }
}

fn handle(
    reading: &Reading,
    retention: &RetentionService,
    dispatcher: &mut AlertDispatcher,
    sink: &dyn ReadingSink,
) {
    let seq = retention.admit(reading.clone());

    match dispatcher.on_reading(reading) {
        AlertOutcome::Idle | AlertOutcome::Maintained { .. } => {}
        outcome => info!(?outcome, "Alert state changed"),
    }

    sink.record(reading);
    debug!(
        device_id = %reading.device_id,
        timestamp = reading.timestamp,
        level = reading.alert_level.label(),
        seq,
        "Reading handled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{
        AlertNotification, AlertPreferences, Notifier, SinkError, Speaker, VibrationPattern,
        Vibrator,
    };
    use crate::connection::{ConnectionManager, ConnectionSettings};
    use crate::retention::RetentionConfig;
    use crate::thresholds::{AlertLevel, ThresholdConfig};
    use crate::transport::MockTransport;
    use crate::types::DeviceDescriptor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_test::assert_ok;

    struct ChannelSink(mpsc::UnboundedSender<Reading>);

    impl ReadingSink for ChannelSink {
        fn record(&self, reading: &Reading) {
            let _ = self.0.send(reading.clone());
        }
    }

    #[derive(Default)]
    struct Counter {
        notifications: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl Vibrator for Counter {
        fn start(&self, _pattern: &VibrationPattern) -> Result<(), SinkError> {
            Ok(())
        }
        fn cancel(&self) -> Result<(), SinkError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Speaker for Counter {
        fn speak(&self, _message: &str) -> Result<(), SinkError> {
            Ok(())
        }
        fn stop(&self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    impl Notifier for Counter {
        fn notify(&self, _notification: &AlertNotification) -> Result<(), SinkError> {
            self.notifications.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Harness {
        transport: MockTransport,
        manager: ConnectionManager<MockTransport>,
        retention: RetentionService,
        counter: Arc<Counter>,
        preferences: watch::Sender<AlertPreferences>,
        stored: mpsc::UnboundedReceiver<Reading>,
        handle: PipelineHandle,
    }

    fn harness() -> Harness {
        let device = DeviceDescriptor::bluetooth("AA:BB:CC:DD:EE:FF", None);
        let transport = MockTransport::new(vec![device]);
        let manager = ConnectionManager::new(transport.clone(), ConnectionSettings::default());
        let retention = RetentionService::new(RetentionConfig::default());
        let counter = Arc::new(Counter::default());
        let (preferences, prefs_rx) = watch::channel(AlertPreferences {
            alerts_enabled: true,
            vibration_enabled: true,
        });
        let dispatcher =
            AlertDispatcher::with_sink(ThresholdConfig::default(), prefs_rx, counter.clone());
        let (stored_tx, stored) = mpsc::unbounded_channel();

        let handle = spawn(
            manager.subscribe(),
            retention.clone(),
            dispatcher,
            Arc::new(ChannelSink(stored_tx)),
        );

        Harness {
            transport,
            manager,
            retention,
            counter,
            preferences,
            stored,
            handle,
        }
    }

    async fn connect(h: &Harness) {
        let device = DeviceDescriptor::bluetooth("AA:BB:CC:DD:EE:FF", None);
        assert_ok!(h.manager.connect(device).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readings_reach_every_consumer_in_order() {
        let mut h = harness();
        connect(&h).await;

        assert!(h.transport.push_frame("mq2:1,mq4:2,mq9:3,mq135:4"));
        assert!(h.transport.push_frame("mq2:10,mq4:20,mq9:30,mq135:40"));

        let first = h.stored.recv().await.unwrap();
        let second = h.stored.recv().await.unwrap();
        assert!((first.levels.lpg - 1.0).abs() < f64::EPSILON);
        assert!((second.levels.lpg - 10.0).abs() < f64::EPSILON);

        assert_eq!(h.retention.current(), Some(second));
        assert_eq!(h.retention.pending(), 2);
        assert_eq!(*h.handle.processed().borrow(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_never_reach_consumers() {
        let mut h = harness();
        connect(&h).await;

        assert!(h.transport.push_frame("mq2:1,mq4:2,mq9:3"));
        assert!(h.transport.push_frame("mq2:5,mq4:5,mq9:5,mq135:5"));

        let stored = h.stored.recv().await.unwrap();
        assert!((stored.levels.ammonia - 5.0).abs() < f64::EPSILON);
        assert_eq!(*h.handle.processed().borrow(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_danger_run_notifies_once() {
        let mut h = harness();
        connect(&h).await;
        let mut session = h.handle.alert_session();

        for frame in [
            "mq2:100,mq4:0,mq9:0,mq135:0",
            "mq2:4500,mq4:0,mq9:0,mq135:0",
            "mq2:4800,mq4:0,mq9:0,mq135:0",
            "mq2:100,mq4:0,mq9:0,mq135:0",
        ] {
            assert!(h.transport.push_frame(frame));
        }
        let mut levels = Vec::new();
        for _ in 0..4 {
            levels.push(h.stored.recv().await.unwrap().alert_level);
        }

        assert_eq!(
            levels,
            vec![
                AlertLevel::Normal,
                AlertLevel::Danger,
                AlertLevel::Danger,
                AlertLevel::Normal
            ]
        );
        assert_eq!(h.counter.notifications.load(Ordering::SeqCst), 1);
        assert_eq!(h.counter.cancels.load(Ordering::SeqCst), 1);
        assert!(session.borrow_and_update().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_open_session() {
        let mut h = harness();
        connect(&h).await;

        assert!(h.transport.push_frame("mq2:0,mq4:0,mq9:9000,mq135:0"));
        let _ = h.stored.recv().await.unwrap();
        assert!(h.handle.alert_session().borrow().is_some());

        h.manager.shutdown().await;
        let session = h.handle.alert_session();
        h.handle.join().await;

        assert!(session.borrow().is_none());
        assert_eq!(h.counter.cancels.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_alerts_stops_effects_between_readings() {
        let mut h = harness();
        connect(&h).await;

        assert!(h.transport.push_frame("mq2:0,mq4:0,mq9:9000,mq135:0"));
        let _ = h.stored.recv().await.unwrap();
        let mut session = h.handle.alert_session();
        assert!(session.borrow_and_update().as_ref().is_some_and(|s| s.effects_started));

        h.preferences.send_replace(AlertPreferences::default());
        assert_ok!(session.changed().await);

        assert_eq!(h.counter.cancels.load(Ordering::SeqCst), 1);
        assert!(session.borrow().as_ref().is_some_and(|s| !s.effects_started));
        assert_eq!(*h.handle.processed().borrow(), 1);
    }
}
