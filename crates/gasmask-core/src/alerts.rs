//! Danger alert dispatcher.
//!
//! Watches classified readings and escalates dangerous air into side
//! effects: a repeating vibration, a spoken evacuation message and one
//! high-priority notification per alert session.
//!
//! An [`AlertSession`] opens on the first reading with any gas at
//! [`AlertLevel::Danger`] and closes on the first reading with none. Closing
//! cancels vibration and speech. The next session notifies again.
//!
//! Side effects go through the [`Vibrator`], [`Speaker`] and [`Notifier`]
//! sinks. Sink failures are logged and never stop the other sinks. User
//! preferences arrive through a `watch` channel, so toggles take effect on
//! the next reading.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::thresholds::{AlertLevel, ThresholdConfig};
use crate::types::{Gas, Reading};

// ============================================================================
// Preferences and sinks
// ============================================================================

/// User toggles for alert side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct AlertPreferences {
    /// Master switch for vibration, speech and notifications.
    pub alerts_enabled: bool,
    /// Whether alerts vibrate.
    pub vibration_enabled: bool,
}

/// A side-effect sink failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Vibration pattern in milliseconds: wait, vibrate, wait, vibrate, ...
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct VibrationPattern {
    /// Alternating off/on durations.
    pub timings_ms: Vec<u64>,
    /// Whether the pattern loops until cancelled.
    pub repeat: bool,
}

impl Default for VibrationPattern {
    fn default() -> Self {
        Self {
            timings_ms: vec![0, 500, 500],
            repeat: true,
        }
    }
}

/// A notification to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct AlertNotification {
    /// Short title.
    pub title: String,
    /// Message body.
    pub body: String,
    /// Gases that triggered it, in canonical order.
    pub gases: Vec<Gas>,
    /// Reading timestamp (milliseconds since epoch).
    pub timestamp: i64,
}

/// Drives the vibration motor.
pub trait Vibrator: Send + Sync {
    /// Starts vibrating with `pattern`.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the motor is unavailable.
    fn start(&self, pattern: &VibrationPattern) -> Result<(), SinkError>;

    /// Stops any vibration in progress.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if the motor is unavailable.
    fn cancel(&self) -> Result<(), SinkError>;
}

/// Text-to-speech output.
pub trait Speaker: Send + Sync {
    /// Speaks `message`.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if speech is unavailable.
    fn speak(&self, message: &str) -> Result<(), SinkError>;

    /// Stops speaking.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if speech is unavailable.
    fn stop(&self) -> Result<(), SinkError>;
}

/// Push notification delivery.
pub trait Notifier: Send + Sync {
    /// Delivers `notification` at high priority.
    ///
    /// # Errors
    ///
    /// Returns a [`SinkError`] if delivery failed.
    fn notify(&self, notification: &AlertNotification) -> Result<(), SinkError>;
}

/// Sink that only writes log lines. Used where no hardware is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl Vibrator for LogSink {
    fn start(&self, pattern: &VibrationPattern) -> Result<(), SinkError> {
        info!(pattern = ?pattern.timings_ms, repeat = pattern.repeat, "Vibration started");
        Ok(())
    }

    fn cancel(&self) -> Result<(), SinkError> {
        info!("Vibration cancelled");
        Ok(())
    }
}

impl Speaker for LogSink {
    fn speak(&self, message: &str) -> Result<(), SinkError> {
        warn!(text = message, "Speaking alert");
        Ok(())
    }

    fn stop(&self) -> Result<(), SinkError> {
        info!("Speech stopped");
        Ok(())
    }
}

impl Notifier for LogSink {
    fn notify(&self, notification: &AlertNotification) -> Result<(), SinkError> {
        warn!(title = %notification.title, body = %notification.body, "Alert notification");
        Ok(())
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// One continuous danger escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct AlertSession {
    /// Session identifier.
    pub id: Uuid,
    /// Gases currently at danger level, in canonical order.
    pub gases_in_danger: Vec<Gas>,
    /// Timestamp of the reading that opened the session.
    pub started_at: i64,
    /// Whether the session's notification went out.
    pub notified: bool,
    /// Whether vibration and speech are running.
    pub effects_started: bool,
}

impl AlertSession {
    fn open(gases_in_danger: Vec<Gas>, started_at: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            gases_in_danger,
            started_at,
            notified: false,
            effects_started: false,
        }
    }
}

/// Side effects fired while handling one reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EffectsFired {
    /// Vibration was started.
    pub vibration: bool,
    /// The evacuation message was spoken.
    pub speech: bool,
    /// The notification was sent.
    pub notification: bool,
}

/// What the dispatcher did with a reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertOutcome {
    /// Nothing in danger and no session open.
    Idle,
    /// A new session opened.
    Opened {
        /// Session identifier.
        session_id: Uuid,
        /// Gases in danger.
        gases: Vec<Gas>,
        /// Effects fired.
        effects: EffectsFired,
    },
    /// The open session continues.
    Maintained {
        /// Session identifier.
        session_id: Uuid,
        /// Gases in danger.
        gases: Vec<Gas>,
        /// Effects fired.
        effects: EffectsFired,
    },
    /// The session closed.
    Closed {
        /// Session identifier.
        session_id: Uuid,
        /// Whether running vibration and speech were cancelled.
        cancelled_effects: bool,
    },
}

/// Joins gas labels: `A`, `A and B`, `A, B and C`.
fn join_labels(gases: &[Gas]) -> String {
    match gases {
        [] => String::new(),
        [only] => only.label().to_string(),
        [init @ .., last] => {
            let head: Vec<&str> = init.iter().map(|gas| gas.label()).collect();
            format!("{} and {}", head.join(", "), last.label())
        }
    }
}

/// The spoken evacuation message for `gases`.
#[must_use]
pub fn evacuation_message(gases: &[Gas]) -> String {
    format!(
        "Danger! Dangerous levels of {} detected. Evacuate the area immediately.",
        join_labels(gases)
    )
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Evaluates readings and owns the alert session.
pub struct AlertDispatcher {
    thresholds: ThresholdConfig,
    preferences: watch::Receiver<AlertPreferences>,
    pattern: VibrationPattern,
    vibrator: Arc<dyn Vibrator>,
    speaker: Arc<dyn Speaker>,
    notifier: Arc<dyn Notifier>,
    session: Option<AlertSession>,
    published: watch::Sender<Option<AlertSession>>,
}

impl AlertDispatcher {
    /// Creates a dispatcher with no open session.
    #[must_use]
    pub fn new(
        thresholds: ThresholdConfig,
        preferences: watch::Receiver<AlertPreferences>,
        vibrator: Arc<dyn Vibrator>,
        speaker: Arc<dyn Speaker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            thresholds,
            preferences,
            pattern: VibrationPattern::default(),
            vibrator,
            speaker,
            notifier,
            session: None,
            published: watch::Sender::new(None),
        }
    }

    /// Creates a dispatcher whose three sinks are one object.
    #[must_use]
    pub fn with_sink<S>(
        thresholds: ThresholdConfig,
        preferences: watch::Receiver<AlertPreferences>,
        sink: Arc<S>,
    ) -> Self
    where
        S: Vibrator + Speaker + Notifier + 'static,
    {
        Self::new(thresholds, preferences, sink.clone(), sink.clone(), sink)
    }

    /// Replaces the vibration pattern.
    #[must_use]
    pub fn with_pattern(mut self, pattern: VibrationPattern) -> Self {
        self.pattern = pattern;
        self
    }

    /// The open session, if any.
    #[must_use]
    pub const fn session(&self) -> Option<&AlertSession> {
        self.session.as_ref()
    }

    /// Receiver that observes session changes.
    #[must_use]
    pub fn watch_session(&self) -> watch::Receiver<Option<AlertSession>> {
        self.published.subscribe()
    }

    /// Evaluates one reading.
    pub fn on_reading(&mut self, reading: &Reading) -> AlertOutcome {
        let preferences = *self.preferences.borrow_and_update();
        let gases = self.thresholds.gases_at(&reading.levels, AlertLevel::Danger);

        let outcome = if gases.is_empty() {
            self.close_session()
        } else {
            self.hold_session(gases, reading.timestamp, preferences)
        };

        self.published.send_replace(self.session.clone());
        outcome
    }

    /// Receiver for the alert toggles this dispatcher follows.
    #[must_use]
    pub fn watch_preferences(&self) -> watch::Receiver<AlertPreferences> {
        self.preferences.clone()
    }

    /// Applies the current toggles without waiting for a reading.
    ///
    /// Disabling alerts stops the running vibration and speech right away.
    /// Enabling them starts nothing until the next danger reading. Returns
    /// whether effects were cancelled.
    pub fn apply_preferences(&mut self) -> bool {
        let preferences = *self.preferences.borrow_and_update();
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if preferences.alerts_enabled || !session.effects_started {
            return false;
        }

        session.effects_started = false;
        let session_id = session.id;
        self.cancel_effects();
        self.published.send_replace(self.session.clone());
        info!(%session_id, "Alerts disabled, effects cancelled");
        true
    }

    /// Closes any open session, cancelling its effects.
    pub fn close(&mut self) -> AlertOutcome {
        let outcome = self.close_session();
        self.published.send_replace(None);
        outcome
    }

    fn close_session(&mut self) -> AlertOutcome {
        let Some(session) = self.session.take() else {
            return AlertOutcome::Idle;
        };

        if session.effects_started {
            self.cancel_effects();
        }
        info!(session_id = %session.id, "Alert session closed");
        AlertOutcome::Closed {
            session_id: session.id,
            cancelled_effects: session.effects_started,
        }
    }

    fn hold_session(
        &mut self,
        gases: Vec<Gas>,
        timestamp: i64,
        preferences: AlertPreferences,
    ) -> AlertOutcome {
        let opened = self.session.is_none();
        let mut session = self
            .session
            .take()
            .unwrap_or_else(|| AlertSession::open(gases.clone(), timestamp));
        session.gases_in_danger.clone_from(&gases);

        if opened {
            warn!(session_id = %session.id, gases = %join_labels(&gases), "Alert session opened");
        }

        let mut effects = EffectsFired::default();
        if preferences.alerts_enabled {
            if !session.effects_started {
                effects = self.start_effects(&mut session, preferences);
            }
        } else if session.effects_started {
            self.cancel_effects();
            session.effects_started = false;
        }

        let session_id = session.id;
        self.session = Some(session);
        if opened {
            AlertOutcome::Opened {
                session_id,
                gases,
                effects,
            }
        } else {
            AlertOutcome::Maintained {
                session_id,
                gases,
                effects,
            }
        }
    }

    fn start_effects(
        &self,
        session: &mut AlertSession,
        preferences: AlertPreferences,
    ) -> EffectsFired {
        let mut fired = EffectsFired::default();
        let message = evacuation_message(&session.gases_in_danger);

        if preferences.vibration_enabled {
            match self.vibrator.start(&self.pattern) {
                Ok(()) => fired.vibration = true,
                Err(e) => warn!(session_id = %session.id, error = %e, "Vibration failed"),
            }
        }

        match self.speaker.speak(&message) {
            Ok(()) => fired.speech = true,
            Err(e) => warn!(session_id = %session.id, error = %e, "Speech failed"),
        }

        if !session.notified {
            let notification = AlertNotification {
                title: format!("Gas Alert: {}", join_labels(&session.gases_in_danger)),
                body: message,
                gases: session.gases_in_danger.clone(),
                timestamp: session.started_at,
            };
            // One attempt per session, delivered or not.
            session.notified = true;
            match self.notifier.notify(&notification) {
                Ok(()) => fired.notification = true,
                Err(e) => warn!(session_id = %session.id, error = %e, "Notification failed"),
            }
        }

        session.effects_started = true;
        fired
    }

    fn cancel_effects(&self) {
        if let Err(e) = self.vibrator.cancel() {
            warn!(error = %e, "Cancelling vibration failed");
        }
        if let Err(e) = self.speaker.stop() {
            warn!(error = %e, "Stopping speech failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GasLevels;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_notify: bool,
        fail_vibrate: bool,
    }

    impl Recorder {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn count(&self, prefix: &str) -> usize {
            self.calls().iter().filter(|c| c.starts_with(prefix)).count()
        }
    }

    impl Vibrator for Recorder {
        fn start(&self, _pattern: &VibrationPattern) -> Result<(), SinkError> {
            self.record("vibrate");
            if self.fail_vibrate {
                return Err(SinkError("no motor".into()));
            }
            Ok(())
        }

        fn cancel(&self) -> Result<(), SinkError> {
            self.record("cancel_vibration");
            Ok(())
        }
    }

    impl Speaker for Recorder {
        fn speak(&self, message: &str) -> Result<(), SinkError> {
            self.record(format!("speak:{message}"));
            Ok(())
        }

        fn stop(&self) -> Result<(), SinkError> {
            self.record("stop_speech");
            Ok(())
        }
    }

    impl Notifier for Recorder {
        fn notify(&self, notification: &AlertNotification) -> Result<(), SinkError> {
            self.record(format!("notify:{}", notification.title));
            if self.fail_notify {
                return Err(SinkError("push service down".into()));
            }
            Ok(())
        }
    }

    fn reading(values: [f64; 4]) -> Reading {
        let thresholds = ThresholdConfig::default();
        let levels = GasLevels::from_array(values);
        Reading {
            device_id: "dev".to_string(),
            timestamp: 1_000,
            alert_level: thresholds.overall_level(&levels),
            levels,
        }
    }

    const NORMAL: [f64; 4] = [100.0, 100.0, 100.0, 100.0];
    const LPG_DANGER: [f64; 4] = [4500.0, 100.0, 100.0, 100.0];

    fn enabled() -> AlertPreferences {
        AlertPreferences {
            alerts_enabled: true,
            vibration_enabled: true,
        }
    }

    fn dispatcher(
        recorder: &Arc<Recorder>,
        preferences: AlertPreferences,
    ) -> (AlertDispatcher, watch::Sender<AlertPreferences>) {
        let (tx, rx) = watch::channel(preferences);
        let dispatcher = AlertDispatcher::with_sink(ThresholdConfig::default(), rx, recorder.clone());
        (dispatcher, tx)
    }

    #[test]
    fn test_session_lifecycle_notifies_once() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, _prefs) = dispatcher(&recorder, enabled());

        assert_eq!(dispatcher.on_reading(&reading(NORMAL)), AlertOutcome::Idle);
        let opened = dispatcher.on_reading(&reading(LPG_DANGER));
        let maintained = dispatcher.on_reading(&reading(LPG_DANGER));
        let closed = dispatcher.on_reading(&reading(NORMAL));

        assert!(matches!(opened, AlertOutcome::Opened { effects, .. } if effects.notification && effects.vibration && effects.speech));
        assert!(matches!(maintained, AlertOutcome::Maintained { effects, .. } if effects == EffectsFired::default()));
        assert!(matches!(closed, AlertOutcome::Closed { cancelled_effects: true, .. }));

        assert_eq!(recorder.count("notify"), 1);
        assert_eq!(recorder.count("vibrate"), 1);
        assert_eq!(recorder.count("cancel_vibration"), 1);
        assert_eq!(recorder.count("stop_speech"), 1);
        assert!(dispatcher.session().is_none());
    }

    #[test]
    fn test_new_session_notifies_again() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, _prefs) = dispatcher(&recorder, enabled());

        let first = dispatcher.on_reading(&reading(LPG_DANGER));
        dispatcher.on_reading(&reading(NORMAL));
        let second = dispatcher.on_reading(&reading(LPG_DANGER));

        let id = |outcome: &AlertOutcome| match outcome {
            AlertOutcome::Opened { session_id, .. } => Some(*session_id),
            _ => None,
        };
        assert!(id(&first).is_some());
        assert_ne!(id(&first), id(&second));
        assert_eq!(recorder.count("notify"), 2);
    }

    #[test]
    fn test_session_aggregates_gases_in_canonical_order() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, _prefs) = dispatcher(&recorder, enabled());

        dispatcher.on_reading(&reading([100.0, 100.0, 4100.0, 9000.0]));
        assert_eq!(
            dispatcher.session().unwrap().gases_in_danger,
            vec![Gas::CarbonMonoxide, Gas::Ammonia]
        );
        assert!(recorder
            .calls()
            .contains(&"notify:Gas Alert: Carbon Monoxide and Ammonia".to_string()));

        dispatcher.on_reading(&reading([4000.0, 100.0, 100.0, 9000.0]));
        assert_eq!(
            dispatcher.session().unwrap().gases_in_danger,
            vec![Gas::Lpg, Gas::Ammonia]
        );
        assert_eq!(recorder.count("notify"), 1);
    }

    #[test]
    fn test_disabled_alerts_still_track_but_fire_nothing() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, _prefs) = dispatcher(&recorder, AlertPreferences::default());

        let opened = dispatcher.on_reading(&reading(LPG_DANGER));
        let closed = dispatcher.on_reading(&reading(NORMAL));

        assert!(matches!(opened, AlertOutcome::Opened { effects, .. } if effects == EffectsFired::default()));
        assert!(matches!(closed, AlertOutcome::Closed { cancelled_effects: false, .. }));
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_enabling_mid_session_starts_effects_once() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, prefs) = dispatcher(&recorder, AlertPreferences::default());

        dispatcher.on_reading(&reading(LPG_DANGER));
        prefs.send_replace(enabled());
        let started = dispatcher.on_reading(&reading(LPG_DANGER));
        dispatcher.on_reading(&reading(LPG_DANGER));

        assert!(matches!(started, AlertOutcome::Maintained { effects, .. } if effects.notification));
        assert_eq!(recorder.count("notify"), 1);
        assert_eq!(recorder.count("vibrate"), 1);
    }

    #[test]
    fn test_disabling_mid_session_cancels_effects() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, prefs) = dispatcher(&recorder, enabled());

        dispatcher.on_reading(&reading(LPG_DANGER));
        prefs.send_replace(AlertPreferences::default());
        dispatcher.on_reading(&reading(LPG_DANGER));
        prefs.send_replace(enabled());
        dispatcher.on_reading(&reading(LPG_DANGER));

        assert_eq!(recorder.count("cancel_vibration"), 1);
        assert_eq!(recorder.count("vibrate"), 2);
        assert_eq!(recorder.count("notify"), 1);
    }

    #[test]
    fn test_disabling_alerts_cancels_effects_without_a_reading() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, prefs) = dispatcher(&recorder, enabled());
        let session = dispatcher.watch_session();

        dispatcher.on_reading(&reading(LPG_DANGER));
        assert!(!dispatcher.apply_preferences());

        prefs.send_replace(AlertPreferences::default());
        assert!(dispatcher.apply_preferences());
        assert_eq!(recorder.count("cancel_vibration"), 1);
        assert_eq!(recorder.count("stop_speech"), 1);
        assert!(session.borrow().as_ref().is_some_and(|s| !s.effects_started));

        // Nothing left to cancel.
        assert!(!dispatcher.apply_preferences());
        dispatcher.on_reading(&reading(LPG_DANGER));
        assert_eq!(recorder.count("cancel_vibration"), 1);
    }

    #[test]
    fn test_enabling_alerts_waits_for_a_danger_reading() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, prefs) = dispatcher(&recorder, AlertPreferences::default());

        dispatcher.on_reading(&reading(LPG_DANGER));
        prefs.send_replace(enabled());
        assert!(!dispatcher.apply_preferences());
        assert_eq!(recorder.count("vibrate"), 0);

        dispatcher.on_reading(&reading(LPG_DANGER));
        assert_eq!(recorder.count("vibrate"), 1);
    }

    #[test]
    fn test_vibration_toggle() {
        let recorder = Arc::new(Recorder::default());
        let preferences = AlertPreferences {
            alerts_enabled: true,
            vibration_enabled: false,
        };
        let (mut dispatcher, _prefs) = dispatcher(&recorder, preferences);

        dispatcher.on_reading(&reading(LPG_DANGER));

        assert_eq!(recorder.count("vibrate"), 0);
        assert_eq!(recorder.count("speak"), 1);
        assert_eq!(recorder.count("notify"), 1);
    }

    #[test]
    fn test_sink_failures_do_not_stop_other_sinks() {
        let recorder = Arc::new(Recorder {
            fail_notify: true,
            fail_vibrate: true,
            ..Recorder::default()
        });
        let (mut dispatcher, _prefs) = dispatcher(&recorder, enabled());

        let outcome = dispatcher.on_reading(&reading(LPG_DANGER));
        dispatcher.on_reading(&reading(LPG_DANGER));

        assert!(matches!(
            outcome,
            AlertOutcome::Opened { effects: EffectsFired { vibration: false, speech: true, notification: false }, .. }
        ));
        assert!(dispatcher.session().unwrap().notified);
        assert_eq!(recorder.count("notify"), 1);
    }

    #[test]
    fn test_close_publishes_empty_session() {
        let recorder = Arc::new(Recorder::default());
        let (mut dispatcher, _prefs) = dispatcher(&recorder, enabled());
        let session = dispatcher.watch_session();

        dispatcher.on_reading(&reading(LPG_DANGER));
        assert!(session.borrow().is_some());

        dispatcher.close();
        assert!(session.borrow().is_none());
        assert_eq!(recorder.count("cancel_vibration"), 1);
    }

    #[test]
    fn test_evacuation_message_lists_gases() {
        assert_eq!(
            evacuation_message(&[Gas::Lpg]),
            "Danger! Dangerous levels of LPG detected. Evacuate the area immediately."
        );
        assert!(evacuation_message(&[Gas::Lpg, Gas::Methane, Gas::Ammonia])
            .contains("LPG, Methane and Ammonia"));
    }
}
