//! Validation helpers and normalisation utilities for run configuration.

use std::time::Duration;

use crate::error::{ConfigError, ConfigResult};
use crate::model::RunConfig;

/// Strip a leading dot and reject extensions that `Path::extension` could never report.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidField`] when the extension is empty or contains a
/// separator or an inner dot.
pub fn normalize_extension(field: &'static str, raw: &str) -> ConfigResult<String> {
    let trimmed = raw.trim();
    let extension = trimmed.strip_prefix('.').unwrap_or(trimmed);
    if extension.is_empty() {
        return Err(ConfigError::invalid(field, "empty", Some(raw.to_string())));
    }
    if extension.contains(['/', '\\']) {
        return Err(ConfigError::invalid(
            field,
            "contains_separator",
            Some(raw.to_string()),
        ));
    }
    if extension.contains('.') {
        return Err(ConfigError::invalid(field, "multi_part", Some(raw.to_string())));
    }
    Ok(extension.to_string())
}

pub(crate) fn validate_run_config(config: &RunConfig) -> ConfigResult<()> {
    if config.source_root.as_os_str().is_empty() {
        return Err(ConfigError::invalid("source_root", "empty", None));
    }
    if config.dest_root.as_os_str().is_empty() {
        return Err(ConfigError::invalid("dest_root", "empty", None));
    }
    if config.source_root == config.dest_root {
        return Err(ConfigError::invalid(
            "dest_root",
            "same_as_source",
            Some(config.dest_root.display().to_string()),
        ));
    }
    if config.transformer.as_os_str().is_empty() {
        return Err(ConfigError::invalid("transformer", "empty", None));
    }
    if config.capacity == 0 {
        return Err(ConfigError::invalid("capacity", "zero", Some("0".to_string())));
    }
    if config.input_extension == config.output_extension {
        return Err(ConfigError::invalid(
            "output_extension",
            "same_as_input",
            Some(config.output_extension.clone()),
        ));
    }
    if config.job_timeout == Some(Duration::ZERO) {
        return Err(ConfigError::invalid("job_timeout", "zero", Some("0s".to_string())));
    }
    Ok(())
}
