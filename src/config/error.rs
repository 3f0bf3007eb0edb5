#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
    #[error("capability `{name}` is misconfigured: {reason}")]
    Capability { name: String, reason: String },
    #[error("capability registration failed: {0}")]
    Registry(#[from] crate::registry::RegistryError),
}
