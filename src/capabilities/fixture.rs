use crate::registry::{CapabilityError, CapabilityHandler};
use serde_json::{Map, Value};

/// Returns a fixed output, optionally echoing chosen arguments back.
#[derive(Debug, Clone, Default)]
pub struct FixtureCapability {
    output: Map<String, Value>,
    echo: Vec<String>,
    failure: Option<CapabilityError>,
}

impl FixtureCapability {
    pub fn new(output: Map<String, Value>) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    /// Copies these arguments into the output when present.
    pub fn echoing(mut self, arguments: Vec<String>) -> Self {
        self.echo = arguments;
        self
    }

    /// Always fails with `error` instead of answering.
    pub fn failing(error: CapabilityError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }
}

impl CapabilityHandler for FixtureCapability {
    fn invoke(
        &self,
        arguments: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        let mut output = self.output.clone();
        for name in &self.echo {
            if let Some(value) = arguments.get(name) {
                output.insert(name.clone(), value.clone());
            }
        }
        Ok(output)
    }
}
