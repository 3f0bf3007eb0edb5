pub mod error;
pub mod load;
pub mod settings;

pub use error::ConfigError;
pub use load::{load_settings, resolve_settings_path, CONFIG_ENV_VAR};
pub use settings::{
    CacheSettings, CapabilitySchemaSettings, FixtureCapabilitySettings, HttpCapabilitySettings,
    ParallelSettings, PolicySettings, Settings,
};
