use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

const REFERENCE_OPEN: &str = "${";
const REFERENCE_CLOSE: &str = "}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// `${stepId.field.rest...}`: only `field` is checked against the upstream
/// output schema; `path` is walked at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReference {
    pub step_id: String,
    pub field: String,
    pub path: Vec<PathSegment>,
}

impl StepReference {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let inner = expression
            .strip_prefix(REFERENCE_OPEN)
            .and_then(|rest| rest.strip_suffix(REFERENCE_CLOSE))
            .ok_or_else(|| {
                format!("reference must have the form `${{step.field}}`, got `{expression}`")
            })?;

        let mut segments = inner.split('.');
        let step_id = segments.next().unwrap_or_default().trim();
        if step_id.is_empty() {
            return Err("reference is missing a step id".to_string());
        }
        let field = segments
            .next()
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .ok_or_else(|| format!("reference to `{step_id}` is missing an output field"))?;

        let mut path = Vec::new();
        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                return Err(format!("reference `{expression}` has an empty path segment"));
            }
            path.push(match segment.parse::<usize>() {
                Ok(index) => PathSegment::Index(index),
                Err(_) => PathSegment::Key(segment.to_string()),
            });
        }

        Ok(Self {
            step_id: step_id.to_string(),
            field: field.to_string(),
            path,
        })
    }

    /// Looks the referenced value up in an upstream step's output.
    pub fn select<'a>(&self, output: &'a Map<String, Value>) -> Option<&'a Value> {
        let mut current = output.get(&self.field)?;
        for segment in &self.path {
            current = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key)?,
                (PathSegment::Index(index), Value::Array(items)) => items.get(*index)?,
                (PathSegment::Index(index), Value::Object(map)) => map.get(&index.to_string())?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for StepReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}.{}", self.step_id, self.field)?;
        for segment in &self.path {
            match segment {
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, ".{index}")?,
            }
        }
        write!(f, "}}")
    }
}

/// Argument value after validation: literals are kept verbatim, any
/// structure that contains a reference is broken down so it can be resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Literal(Value),
    Reference(StepReference),
    List(Vec<ArgValue>),
    Object(BTreeMap<String, ArgValue>),
}

impl ArgValue {
    pub fn parse(raw: &Value) -> Result<Self, String> {
        match raw {
            Value::String(text)
                if text.starts_with(REFERENCE_OPEN) && text.ends_with(REFERENCE_CLOSE) =>
            {
                StepReference::parse(text).map(Self::Reference)
            }
            Value::String(text) if text.contains(REFERENCE_OPEN) => Err(format!(
                "embedded reference in `{text}`; references must be the whole argument value"
            )),
            Value::Array(items) => {
                let parsed = items.iter().map(Self::parse).collect::<Result<Vec<_>, _>>()?;
                if parsed.iter().all(Self::is_literal) {
                    Ok(Self::Literal(raw.clone()))
                } else {
                    Ok(Self::List(parsed))
                }
            }
            Value::Object(map) => {
                let parsed = map
                    .iter()
                    .map(|(key, value)| Self::parse(value).map(|parsed| (key.clone(), parsed)))
                    .collect::<Result<BTreeMap<_, _>, _>>()?;
                if parsed.values().all(Self::is_literal) {
                    Ok(Self::Literal(raw.clone()))
                } else {
                    Ok(Self::Object(parsed))
                }
            }
            other => Ok(Self::Literal(other.clone())),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    pub fn references(&self) -> Vec<&StepReference> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a StepReference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(reference) => found.push(reference),
            Self::List(items) => items.iter().for_each(|item| item.collect_references(found)),
            Self::Object(map) => map.values().for_each(|item| item.collect_references(found)),
        }
    }

    /// Replaces every reference with the value `lookup` returns for it.
    pub fn resolve<F, E>(&self, lookup: &F) -> Result<Value, E>
    where
        F: Fn(&StepReference) -> Result<Value, E>,
    {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Reference(reference) => lookup(reference),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Object(map) => {
                let mut resolved = Map::new();
                for (key, item) in map {
                    resolved.insert(key.clone(), item.resolve(lookup)?);
                }
                Ok(Value::Object(resolved))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn references_parse_nested_paths() {
        let reference = StepReference::parse("${s1.items.0.name}").expect("parse");
        assert_eq!(reference.step_id, "s1");
        assert_eq!(reference.field, "items");
        assert_eq!(
            reference.path,
            vec![PathSegment::Index(0), PathSegment::Key("name".to_string())]
        );
        assert_eq!(reference.to_string(), "${s1.items.0.name}");
    }

    #[test]
    fn malformed_references_are_rejected() {
        assert!(StepReference::parse("${s1}").is_err());
        assert!(StepReference::parse("${.title}").is_err());
        assert!(StepReference::parse("${s1.title..x}").is_err());
        assert!(ArgValue::parse(&json!("weather in ${s1.city}")).is_err());
    }

    #[test]
    fn structures_without_references_stay_literal() {
        let raw = json!({"tags": ["a", "b"], "limit": 5});
        assert_eq!(ArgValue::parse(&raw).expect("parse"), ArgValue::Literal(raw));
    }

    #[test]
    fn nested_references_resolve_in_place() {
        let parsed = ArgValue::parse(&json!({"city": "${s1.city}", "days": [1, "${s1.days}"]}))
            .expect("parse");
        assert_eq!(parsed.references().len(), 2);

        let output = Map::from_iter([
            ("city".to_string(), json!("Tokyo")),
            ("days".to_string(), json!(3)),
        ]);
        let resolved = parsed
            .resolve(&|reference: &StepReference| {
                reference.select(&output).cloned().ok_or(reference.to_string())
            })
            .expect("resolve");
        assert_eq!(resolved, json!({"city": "Tokyo", "days": [1, 3]}));
    }

    #[test]
    fn select_walks_arrays_and_objects() {
        let output = Map::from_iter([(
            "items".to_string(),
            json!([{"name": "alpha"}, {"name": "beta"}]),
        )]);
        let reference = StepReference::parse("${s1.items.1.name}").expect("parse");
        assert_eq!(reference.select(&output), Some(&json!("beta")));
        let missing = StepReference::parse("${s1.items.5.name}").expect("parse");
        assert_eq!(missing.select(&output), None);
    }
}
