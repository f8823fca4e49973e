use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.output_directory.trim().is_empty() {
        return Err(invalid("output_directory must not be empty"));
    }

    if config.output_formats.is_empty() {
        return Err(invalid("output_formats must list at least one format"));
    }
    let mut formats = HashSet::new();
    for format in &config.output_formats {
        if format.is_empty() || !format.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid(format!("Invalid output format '{}'", format)));
        }
        if !formats.insert(format.as_str()) {
            return Err(invalid(format!("Duplicate output format '{}'", format)));
        }
    }

    if !(config.storage_capacity_gb > 0.0) {
        return Err(invalid("storage_capacity_gb must be positive"));
    }

    if config.daemon.poll_interval_secs == 0 {
        return Err(invalid("daemon.poll_interval_secs must be greater than zero"));
    }
    if config.daemon.job_timeout_secs == 0 {
        return Err(invalid("daemon.job_timeout_secs must be greater than zero"));
    }
    if config.daemon.worker_count == 0 {
        return Err(invalid("daemon.worker_count must be greater than zero"));
    }

    if config.gc.interval_secs == 0 {
        return Err(invalid("gc.interval_secs must be greater than zero"));
    }
    let ratio = config.gc.threshold_ratio;
    if !(ratio > 0.0 && ratio <= 1.0) {
        return Err(invalid(format!(
            "gc.threshold_ratio must be in (0, 1], got {}",
            ratio
        )));
    }

    if config.geocoder.timeout_secs == 0 {
        return Err(invalid("geocoder.timeout_secs must be greater than zero"));
    }

    if config.thumbnail.max_width == 0 || config.thumbnail.max_height == 0 {
        return Err(invalid("thumbnail dimensions must be greater than zero"));
    }

    for (name, layout) in &config.renderer.layouts {
        if layout.formats.is_empty() {
            return Err(ConfigError::InvalidLayout {
                name: name.clone(),
                reason: "Layout must declare at least one format".to_string(),
            });
        }
        for format in &layout.formats {
            if !formats.contains(format.as_str()) {
                return Err(ConfigError::InvalidLayout {
                    name: name.clone(),
                    reason: format!("Format '{}' is not listed in output_formats", format),
                });
            }
        }
        for paper in &layout.paper_sizes {
            if paper.width_mm == 0 || paper.height_mm == 0 {
                return Err(ConfigError::InvalidLayout {
                    name: name.clone(),
                    reason: format!("Paper size '{}' has a zero dimension", paper.name),
                });
            }
        }
    }

    if let Some(notifications) = &config.notifications {
        if notifications.recipients.is_empty() {
            return Err(invalid("notifications.recipients must not be empty"));
        }
    }

    Ok(())
}
