//! Application state shared across handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use gasmask_core::transport::AnyTransport;
use gasmask_core::{
    AlertPreferences, AlertSession, Config, ConfigResult, ConnectionManager, RetentionService,
    Storage,
};
use tokio::sync::{watch, RwLock};

/// Shared application state.
pub type SharedState = Arc<RwLock<AppState>>;

/// Everything a handler can reach.
///
/// The pipeline components are cheap handles; clone what you need and drop
/// the lock before awaiting on them.
pub struct AppState {
    /// Loaded configuration.
    pub config: Config,

    /// Where configuration changes are written. `None` keeps them in memory.
    pub config_path: Option<PathBuf>,

    /// Connection manager for the configured link.
    pub manager: ConnectionManager<AnyTransport>,

    /// Current reading and history.
    pub retention: RetentionService,

    /// Reading log and history snapshot.
    pub storage: Arc<Storage>,

    /// Pushes alert toggles to the dispatcher.
    pub preferences: watch::Sender<AlertPreferences>,

    /// Observes the open alert session.
    pub alert_session: watch::Receiver<Option<AlertSession>>,

    /// Number of readings handled by the pipeline.
    pub processed: watch::Receiver<u64>,

    /// When the daemon started.
    pub started_at: Instant,
}

impl AppState {
    /// Saves `config`, if the configuration has a home, and makes it
    /// current.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written. The current
    /// configuration is then left untouched.
    pub fn commit_config(&mut self, config: Config) -> ConfigResult<()> {
        if let Some(path) = &self.config_path {
            config.save_to(path)?;
        }
        self.config = config;
        Ok(())
    }

    /// Server uptime in seconds.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
