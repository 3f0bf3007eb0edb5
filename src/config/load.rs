use super::{ConfigError, Settings};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV_VAR: &str = "OPSFLOW_CONFIG";

/// Explicit path first, then `OPSFLOW_CONFIG`; `None` means built-in defaults.
pub fn resolve_settings_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    std::env::var_os(CONFIG_ENV_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, ConfigError> {
    let settings = match resolve_settings_path(explicit) {
        Some(path) => Settings::from_path(&path)?,
        None => Settings::from_yaml("{}", "<defaults>")?,
    };
    settings.validate()?;
    Ok(settings)
}
