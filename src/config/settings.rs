use super::ConfigError;
use crate::capabilities::{FixtureCapability, HttpCapability};
use crate::orchestration::{BackoffPolicy, ExecutionMode, ExecutionPolicy, ResponseCache};
use crate::registry::{CapabilityDescriptor, CapabilityRegistry, InputParam, OutputField};
use crate::shared::ids::CapabilityName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub fixtures: BTreeMap<String, FixtureCapabilitySettings>,
    #[serde(default)]
    pub http: BTreeMap<String, HttpCapabilitySettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySettings {
    pub max_attempts: u32,
    /// `0` disables the per-step timeout.
    pub step_timeout_ms: u64,
    pub run_deadline_ms: Option<u64>,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: u32,
    pub critical_steps: Vec<String>,
    pub parallel: Option<ParallelSettings>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            step_timeout_ms: 30_000,
            run_deadline_ms: None,
            backoff_initial_ms: 1_000,
            backoff_max_ms: 10_000,
            backoff_multiplier: 2,
            critical_steps: Vec::new(),
            parallel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ParallelSettings {
    pub max_workers: usize,
    #[serde(default = "default_per_capability")]
    pub per_capability: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSettings {
    pub enabled: bool,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: crate::orchestration::cache::DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Schema and limits shared by every configured capability.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CapabilitySchemaSettings {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: Vec<InputParam>,
    #[serde(default)]
    pub outputs: Vec<OutputField>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub cache_ttl_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FixtureCapabilitySettings {
    #[serde(flatten)]
    pub schema: CapabilitySchemaSettings,
    #[serde(default)]
    pub output: Map<String, Value>,
    #[serde(default)]
    pub echo: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HttpCapabilitySettings {
    #[serde(flatten)]
    pub schema: CapabilitySchemaSettings,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub select: Vec<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_per_capability() -> usize {
    1
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw, &path.display().to_string())
    }

    pub fn from_yaml(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !LOG_LEVELS.contains(&self.log_level.trim().to_ascii_lowercase().as_str()) {
            return Err(ConfigError::Settings(format!(
                "`log_level` must be one of {}, got `{}`",
                LOG_LEVELS.join(", "),
                self.log_level
            )));
        }

        let policy = &self.policy;
        if policy.max_attempts == 0 {
            return Err(ConfigError::Settings(
                "`policy.max_attempts` must be at least 1".to_string(),
            ));
        }
        if policy.backoff_multiplier == 0 {
            return Err(ConfigError::Settings(
                "`policy.backoff_multiplier` must be at least 1".to_string(),
            ));
        }
        if policy.backoff_initial_ms > policy.backoff_max_ms {
            return Err(ConfigError::Settings(
                "`policy.backoff_initial_ms` must not exceed `policy.backoff_max_ms`".to_string(),
            ));
        }
        if policy.run_deadline_ms == Some(0) {
            return Err(ConfigError::Settings(
                "`policy.run_deadline_ms` must be greater than 0".to_string(),
            ));
        }
        if let Some(parallel) = policy.parallel {
            if parallel.max_workers == 0 || parallel.per_capability == 0 {
                return Err(ConfigError::Settings(
                    "`policy.parallel` limits must be greater than 0".to_string(),
                ));
            }
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(ConfigError::Settings(
                "`cache.max_entries` must be greater than 0".to_string(),
            ));
        }

        let mut names = BTreeSet::new();
        let declared = self
            .fixtures
            .iter()
            .map(|(name, fixture)| (name, &fixture.schema))
            .chain(self.http.iter().map(|(name, http)| (name, &http.schema)));
        for (name, schema) in declared {
            CapabilityName::parse(name).map_err(|reason| ConfigError::Capability {
                name: name.clone(),
                reason,
            })?;
            if !names.insert(name.as_str()) {
                return Err(ConfigError::Capability {
                    name: name.clone(),
                    reason: "declared as both a fixture and an http capability".to_string(),
                });
            }
            validate_schema(name, schema)?;
        }
        for (name, http) in &self.http {
            if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                return Err(ConfigError::Capability {
                    name: name.clone(),
                    reason: format!("url `{}` must start with http:// or https://", http.url),
                });
            }
        }
        Ok(())
    }

    pub fn policy(&self) -> ExecutionPolicy {
        let policy = &self.policy;
        ExecutionPolicy {
            max_attempts: policy.max_attempts.max(1),
            step_timeout: (policy.step_timeout_ms > 0)
                .then(|| Duration::from_millis(policy.step_timeout_ms)),
            run_deadline: policy.run_deadline_ms.map(Duration::from_millis),
            backoff: BackoffPolicy {
                initial: Duration::from_millis(policy.backoff_initial_ms),
                max: Duration::from_millis(policy.backoff_max_ms),
                multiplier: policy.backoff_multiplier.max(1),
            },
            critical_steps: policy.critical_steps.iter().cloned().collect(),
            mode: match policy.parallel {
                Some(parallel) => ExecutionMode::Bounded {
                    max_workers: parallel.max_workers,
                    per_capability: parallel.per_capability,
                },
                None => ExecutionMode::Sequential,
            },
        }
    }

    pub fn response_cache(&self) -> Option<ResponseCache> {
        self.cache
            .enabled
            .then(|| ResponseCache::new(self.cache.max_entries))
    }

    /// Registers every fixture and http capability declared in the file.
    pub fn build_registry(&self) -> Result<CapabilityRegistry, ConfigError> {
        let mut registry = CapabilityRegistry::new();
        for (name, fixture) in &self.fixtures {
            let handler =
                FixtureCapability::new(fixture.output.clone()).echoing(fixture.echo.clone());
            registry.register(descriptor(name, &fixture.schema, handler)?)?;
        }
        for (name, http) in &self.http {
            let mut handler = HttpCapability::new(http.url.clone())
                .with_selected_fields(http.select.clone());
            if let Some(timeout_ms) = http.schema.timeout_ms {
                handler = handler.with_request_timeout(Duration::from_millis(timeout_ms));
            }
            for (header, value) in &http.headers {
                handler = handler.with_header(header.clone(), value.clone());
            }
            registry.register(descriptor(name, &http.schema, handler)?)?;
        }
        Ok(registry)
    }
}

fn validate_schema(name: &str, schema: &CapabilitySchemaSettings) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::Capability {
        name: name.to_string(),
        reason,
    };
    let mut inputs = BTreeSet::new();
    for param in &schema.inputs {
        if param.name.trim().is_empty() || !inputs.insert(param.name.as_str()) {
            return Err(invalid(format!(
                "input `{}` is blank or declared twice",
                param.name
            )));
        }
    }
    let mut outputs = BTreeSet::new();
    for field in &schema.outputs {
        if field.name.trim().is_empty() || !outputs.insert(field.name.as_str()) {
            return Err(invalid(format!(
                "output `{}` is blank or declared twice",
                field.name
            )));
        }
    }
    if schema.timeout_ms == Some(0) {
        return Err(invalid("`timeout_ms` must be greater than 0".to_string()));
    }
    Ok(())
}

fn descriptor(
    name: &str,
    schema: &CapabilitySchemaSettings,
    handler: impl crate::registry::CapabilityHandler + 'static,
) -> Result<CapabilityDescriptor, ConfigError> {
    let name = CapabilityName::parse(name).map_err(|reason| ConfigError::Capability {
        name: name.to_string(),
        reason,
    })?;
    let mut descriptor = CapabilityDescriptor::new(name, handler)
        .with_description(schema.description.clone());
    for param in &schema.inputs {
        descriptor = descriptor.with_input(param.clone());
    }
    for field in &schema.outputs {
        descriptor = descriptor.with_output(field.clone());
    }
    if let Some(timeout_ms) = schema.timeout_ms {
        descriptor = descriptor.with_timeout(Duration::from_millis(timeout_ms));
    }
    if let Some(ttl_ms) = schema.cache_ttl_ms {
        descriptor = descriptor.with_cache_ttl(Duration::from_millis(ttl_ms));
    }
    Ok(descriptor)
}
