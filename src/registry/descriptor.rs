use crate::shared::ids::CapabilityName;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Boolean,
    Integer,
    Number,
    Object,
    Array,
    Any,
}

impl ValueKind {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Boolean => value.is_boolean(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Number => value.is_number(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }

    /// Whether an output field of kind `produced` may feed a parameter of this kind.
    pub fn accepts(&self, produced: ValueKind) -> bool {
        match (self, produced) {
            (Self::Any, _) | (_, Self::Any) => true,
            (Self::Number, Self::Integer) => true,
            (expected, produced) => *expected == produced,
        }
    }

    pub fn describe(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Boolean => write!(f, "boolean"),
            Self::Integer => write!(f, "integer"),
            Self::Number => write!(f, "number"),
            Self::Object => write!(f, "object"),
            Self::Array => write!(f, "array"),
            Self::Any => write!(f, "any"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputParam {
    pub name: String,
    pub kind: ValueKind,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub description: String,
}

impl InputParam {
    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            description: String::new(),
        }
    }

    pub fn optional(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    pub kind: ValueKind,
    /// Handlers must return required fields; optional ones may be absent.
    #[serde(default = "default_true")]
    pub required: bool,
}

impl OutputField {
    pub fn required(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network, rate-limit or timeout class; worth retrying.
    Transient,
    /// Invalid-argument or authorization class; retrying cannot help.
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{class} capability error: {message}")]
pub struct CapabilityError {
    pub class: ErrorClass,
    pub message: String,
}

impl CapabilityError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == ErrorClass::Transient
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Permanent => write!(f, "permanent"),
        }
    }
}

/// Uniform invocation contract for an external capability.
pub trait CapabilityHandler: Send + Sync {
    fn invoke(
        &self,
        arguments: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError>;
}

impl<F> CapabilityHandler for F
where
    F: Fn(&Map<String, Value>) -> Result<Map<String, Value>, CapabilityError> + Send + Sync,
{
    fn invoke(
        &self,
        arguments: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        self(arguments)
    }
}

#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub name: CapabilityName,
    pub description: String,
    pub inputs: Vec<InputParam>,
    pub outputs: Vec<OutputField>,
    /// Overrides the policy's per-step timeout for this capability.
    pub timeout: Option<Duration>,
    /// Enables response caching for this capability when a cache is supplied.
    pub cache_ttl: Option<Duration>,
    handler: Arc<dyn CapabilityHandler>,
}

impl CapabilityDescriptor {
    pub fn new(name: CapabilityName, handler: impl CapabilityHandler + 'static) -> Self {
        Self {
            name,
            description: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            timeout: None,
            cache_ttl: None,
            handler: Arc::new(handler),
        }
    }

    pub fn from_fn<F>(name: CapabilityName, handler: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Result<Map<String, Value>, CapabilityError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(name, handler)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input(mut self, param: InputParam) -> Self {
        self.inputs.push(param);
        self
    }

    pub fn with_output(mut self, field: OutputField) -> Self {
        self.outputs.push(field);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputParam> {
        self.inputs.iter().find(|param| param.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&OutputField> {
        self.outputs.iter().find(|field| field.name == name)
    }

    pub fn handler(&self) -> Arc<dyn CapabilityHandler> {
        Arc::clone(&self.handler)
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("timeout", &self.timeout)
            .field("cache_ttl", &self.cache_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_kind_matching_treats_integers_as_numbers() {
        assert!(ValueKind::Number.matches(&json!(15)));
        assert!(ValueKind::Number.matches(&json!(15.5)));
        assert!(!ValueKind::Integer.matches(&json!(15.5)));
        assert!(ValueKind::Any.matches(&Value::Null));
        assert!(ValueKind::Number.accepts(ValueKind::Integer));
        assert!(!ValueKind::Integer.accepts(ValueKind::Number));
        assert!(ValueKind::String.accepts(ValueKind::Any));
    }

    #[test]
    fn closures_act_as_handlers() {
        let handler = |args: &Map<String, Value>| {
            let mut out = Map::new();
            out.insert("echo".to_string(), args.get("q").cloned().unwrap_or(Value::Null));
            Ok::<_, CapabilityError>(out)
        };
        let args = Map::from_iter([("q".to_string(), json!("ml"))]);
        let out = handler.invoke(&args).expect("invoke");
        assert_eq!(out.get("echo"), Some(&json!("ml")));
    }
}
