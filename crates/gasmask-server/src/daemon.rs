//! Pipeline assembly and teardown.
//!
//! [`Daemon::start`] wires the connection manager, retention, alert
//! dispatcher and storage together and returns the state the HTTP API works
//! on. [`Daemon::shutdown`] disconnects, drains the pipeline and saves the
//! history.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use gasmask_core::pipeline::{self, PipelineHandle};
use gasmask_core::transport::AnyTransport;
use gasmask_core::{
    AlertDispatcher, Config, ConnectionManager, DeviceDescriptor, LogSink, PromotionOutcome,
    RetentionService, Storage, StorageSink, TransportKind,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::state::{AppState, SharedState};

/// A running pipeline and the state shared with the API.
pub struct Daemon {
    state: SharedState,
    manager: ConnectionManager<AnyTransport>,
    retention: RetentionService,
    storage: Arc<Storage>,
    pipeline: PipelineHandle,
    retention_timer: JoinHandle<()>,
    storage_writer: JoinHandle<()>,
    history_saver: JoinHandle<()>,
}

impl Daemon {
    /// Starts every pipeline task. Nothing connects until asked to.
    ///
    /// A saved history is restored; an unreadable one is logged and ignored.
    pub fn start(config: Config, config_path: Option<PathBuf>, transport: AnyTransport) -> Self {
        let storage = Arc::new(Storage::new(config.system.data_dir()));
        let retention = RetentionService::new(config.retention);
        match storage.load_history() {
            Ok(Some(snapshot)) => {
                info!(entries = snapshot.entries.len(), "History restored");
                retention.restore(snapshot);
            }
            Ok(None) => debug!("No saved history"),
            Err(e) => warn!(error = %e, "Ignoring unreadable history"),
        }
        let retention_timer = retention.spawn();

        let manager = ConnectionManager::new(transport, config.connection_settings());
        let (preferences, preferences_rx) = watch::channel(config.alerts);
        let dispatcher =
            AlertDispatcher::with_sink(config.thresholds.clone(), preferences_rx, Arc::new(LogSink));
        let (sink, storage_writer) = StorageSink::spawn(storage.clone());
        let pipeline = pipeline::spawn(
            manager.subscribe(),
            retention.clone(),
            dispatcher,
            Arc::new(sink),
        );
        let history_saver = spawn_history_saver(retention.clone(), storage.clone());

        let state = Arc::new(RwLock::new(AppState {
            config,
            config_path,
            manager: manager.clone(),
            retention: retention.clone(),
            storage: storage.clone(),
            preferences,
            alert_session: pipeline.alert_session(),
            processed: pipeline.processed(),
            started_at: Instant::now(),
        }));

        info!("Pipeline started");
        Self {
            state,
            manager,
            retention,
            storage,
            pipeline,
            retention_timer,
            storage_writer,
            history_saver,
        }
    }

    /// State for the HTTP API.
    #[must_use]
    pub fn state(&self) -> SharedState {
        self.state.clone()
    }

    /// Connects to the preferred device when the configuration asks for it.
    pub async fn auto_connect(&self) {
        let device = {
            let state = self.state.read().await;
            let transport = &state.config.transport;
            if !transport.auto_connect {
                return;
            }
            let Some(id) = transport.preferred_device.clone() else {
                return;
            };
            preferred_descriptor(id, transport.kind, transport.network.port)
        };

        info!(device_id = %device.id, "Auto-connecting");
        if let Err(e) = self.manager.connect(device).await {
            warn!(error = %e, "Auto-connect failed");
        }
    }

    /// Disconnects, drains the pipeline and saves the history.
    pub async fn shutdown(self) {
        info!("Shutting down pipeline");
        self.manager.shutdown().await;
        self.pipeline.join().await;
        if let Err(e) = self.storage_writer.await {
            error!(error = %e, "Storage writer failed");
        }

        self.history_saver.abort();
        self.retention.stop();
        if let Err(e) = self.retention_timer.await {
            error!(error = %e, "Retention timer failed");
        }

        save_history(&self.retention, &self.storage).await;
        info!("Pipeline stopped");
    }
}

/// Descriptor for a device known only by its configured identifier.
#[must_use]
pub fn preferred_descriptor(id: String, kind: TransportKind, port: u16) -> DeviceDescriptor {
    match kind {
        TransportKind::Bluetooth => DeviceDescriptor::bluetooth(id, None),
        TransportKind::Network => {
            let address = if id.contains(':') {
                id.clone()
            } else {
                format!("{id}:{port}")
            };
            DeviceDescriptor::network(id, None, address)
        }
    }
}

/// Saves the history after every promotion.
fn spawn_history_saver(retention: RetentionService, storage: Arc<Storage>) -> JoinHandle<()> {
    let mut outcomes = retention.outcomes();
    tokio::spawn(async move {
        loop {
            match outcomes.recv().await {
                Ok(PromotionOutcome::Promoted { .. }) | Err(RecvError::Lagged(_)) => {
                    save_history(&retention, &storage).await;
                }
                Ok(outcome) => debug!(?outcome, "Promotion not applied"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn save_history(retention: &RetentionService, storage: &Arc<Storage>) {
    let snapshot = retention.snapshot();
    let storage = storage.clone();
    match tokio::task::spawn_blocking(move || storage.save_history(&snapshot)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Failed to save history"),
        Err(e) => error!(error = %e, "History save task failed"),
    }
}
