pub mod loader;
pub mod schema;

use std::path::PathBuf;

pub use loader::{load_config, load_config_from_str, validate_config};
pub use schema::{
    Config, DaemonConfig, GcConfig, GeocoderConfig, Isolation, LayoutConfig, NotificationConfig,
    PaperSize, RendererConfig, ThumbnailConfig,
};

/// Returns the default config location: `~/.mapsched/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".mapsched").join("config.json"))
}
