use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database_path: Option<String>,
    pub output_directory: String,
    #[serde(default = "default_output_formats")]
    pub output_formats: Vec<String>,
    #[serde(default = "default_storage_capacity_gb")]
    pub storage_capacity_gb: f64,
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub thumbnail: ThumbnailConfig,
    #[serde(default)]
    pub notifications: Option<NotificationConfig>,
}

fn default_output_formats() -> Vec<String> {
    ["png", "pdf", "svg", "csv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_storage_capacity_gb() -> f64 {
    20.0
}

impl Config {
    /// Resolves the job database location, falling back to
    /// `~/.mapsched/data/mapsched.db`.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => crate::db::default_database_path()
                .ok_or(ConfigError::NoDefaultPath("database_path")),
        }
    }

    pub fn output_directory(&self) -> &Path {
        Path::new(&self.output_directory)
    }

    /// Configured storage capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        (self.storage_capacity_gb * BYTES_PER_GIB) as u64
    }

    /// Usage above which the collector starts evicting.
    pub fn gc_threshold_bytes(&self) -> u64 {
        (self.gc.threshold_ratio * self.capacity_bytes() as f64) as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One OS process per job, killed on timeout.
    Process,
    /// One OS thread per job. Degraded mode: a timed out thread can only be
    /// asked to stop and is then abandoned.
    Thread,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_isolation")]
    pub isolation: Isolation,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_job_timeout_secs() -> u64 {
    1200
}

fn default_isolation() -> Isolation {
    Isolation::Process
}

fn default_worker_count() -> usize {
    1
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            job_timeout_secs: default_job_timeout_secs(),
            isolation: default_isolation(),
            worker_count: default_worker_count(),
        }
    }
}

impl DaemonConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_gc_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_threshold_ratio")]
    pub threshold_ratio: f64,
}

fn default_gc_interval_secs() -> u64 {
    20
}

fn default_threshold_ratio() -> f64 {
    0.8
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_gc_interval_secs(),
            threshold_ratio: default_threshold_ratio(),
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RendererConfig {
    #[serde(default = "default_renderer_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub layouts: BTreeMap<String, LayoutConfig>,
}

fn default_renderer_program() -> String {
    "mapsched-render".to_string()
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            program: default_renderer_program(),
            args: Vec::new(),
            layouts: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub formats: Vec<String>,
    #[serde(default)]
    pub paper_sizes: Vec<PaperSize>,
    #[serde(default)]
    pub multi_page: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperSize {
    pub name: String,
    pub width_mm: u32,
    pub height_mm: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeocoderConfig {
    #[serde(default = "default_geocoder_url")]
    pub base_url: String,
    #[serde(default = "default_geocoder_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_geocoder_url() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}

fn default_geocoder_timeout_secs() -> u64 {
    30
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoder_url(),
            timeout_secs: default_geocoder_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailConfig {
    #[serde(default = "default_thumbnail_edge")]
    pub max_width: u32,
    #[serde(default = "default_thumbnail_edge")]
    pub max_height: u32,
    /// Pages tiled into the preview of a multi-page document.
    #[serde(default = "default_preview_pages")]
    pub max_pages: usize,
}

fn default_thumbnail_edge() -> u32 {
    200
}

fn default_preview_pages() -> usize {
    3
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self {
            max_width: default_thumbnail_edge(),
            max_height: default_thumbnail_edge(),
            max_pages: default_preview_pages(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub from: String,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Name of the environment variable holding the SMTP password.
    #[serde(default)]
    pub password_env: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}
