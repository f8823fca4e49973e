//! Wiring shared by every command: configuration, job store, worker.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, Span};

use mapsched::config::{default_config_path, load_config, Config};
use mapsched::error::ConfigError;
use mapsched::notify::{EmailNotifier, NoopNotifier, Notifier};
use mapsched::render::{CommandRenderer, NominatimGeocoder, ThumbnailGenerator};
use mapsched::{OutputStorage, SqliteJobStore, Worker};

use crate::commands::CliError;

pub struct App {
    pub config: Config,
    pub config_path: PathBuf,
}

impl App {
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, CliError> {
        let config_path = match config_path {
            Some(path) => path,
            None => default_config_path().ok_or(ConfigError::NoDefaultPath("config"))?,
        };
        let config = load_config(&config_path)?;
        info!(config = %config_path.display(), "Configuration loaded");
        Ok(Self {
            config,
            config_path,
        })
    }

    /// Job store over the output directory, which must exist before
    /// anything renders into it.
    pub fn open_store(&self) -> Result<Arc<SqliteJobStore>, CliError> {
        Ok(Arc::new(SqliteJobStore::open(&self.config)?))
    }

    pub fn worker(&self, storage: OutputStorage, span: Span) -> Result<Worker, CliError> {
        let notifier: Arc<dyn Notifier> = match &self.config.notifications {
            Some(notifications) => Arc::new(EmailNotifier::new(notifications.clone())),
            None => Arc::new(NoopNotifier),
        };
        Ok(Worker::new(
            Arc::new(CommandRenderer::from_config(&self.config.renderer)),
            Arc::new(NominatimGeocoder::from_config(&self.config.geocoder)?),
            notifier,
            ThumbnailGenerator::from_config(&self.config.thumbnail),
            storage,
            span,
        ))
    }

    /// Arguments that make a child `mapsched` process see the same config.
    pub fn child_args(&self) -> Vec<String> {
        vec![
            "--config".to_string(),
            self.config_path.to_string_lossy().into_owned(),
        ]
    }
}
