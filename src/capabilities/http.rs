use crate::registry::{CapabilityError, CapabilityHandler, ErrorClass};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

const USER_AGENT: &str = concat!("opsflow/", env!("CARGO_PKG_VERSION"));
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// GETs a JSON endpoint. `{name}` placeholders in the URL template are filled
/// from arguments; the remaining arguments are sent as query parameters.
#[derive(Debug, Clone)]
pub struct HttpCapability {
    url_template: String,
    headers: BTreeMap<String, String>,
    select: Vec<String>,
    agent: ureq::Agent,
}

impl HttpCapability {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            headers: BTreeMap::new(),
            select: Vec::new(),
            agent: build_agent(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Keeps only these top-level fields of the response body.
    pub fn with_selected_fields(mut self, fields: Vec<String>) -> Self {
        self.select = fields;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.agent = build_agent(timeout);
        self
    }

    pub fn url_template(&self) -> &str {
        &self.url_template
    }

    pub fn request_url(&self, arguments: &Map<String, Value>) -> Result<String, CapabilityError> {
        let (mut url, used) = render_url(&self.url_template, arguments)?;
        let query = arguments
            .iter()
            .filter(|(name, value)| !used.contains(name.as_str()) && !value.is_null())
            .map(|(name, value)| {
                format!(
                    "{}={}",
                    urlencoding::encode(name),
                    urlencoding::encode(&value_text(value))
                )
            })
            .collect::<Vec<_>>();
        if !query.is_empty() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str(&query.join("&"));
        }
        Ok(url)
    }

    fn shape_output(&self, body: Value) -> Result<Map<String, Value>, CapabilityError> {
        let object = match body {
            Value::Object(object) => object,
            other => Map::from_iter([("body".to_string(), other)]),
        };
        if self.select.is_empty() {
            return Ok(object);
        }
        Ok(object
            .into_iter()
            .filter(|(name, _)| self.select.contains(name))
            .collect())
    }
}

impl CapabilityHandler for HttpCapability {
    fn invoke(
        &self,
        arguments: &Map<String, Value>,
    ) -> Result<Map<String, Value>, CapabilityError> {
        let url = self.request_url(arguments)?;
        let mut request = self
            .agent
            .get(&url)
            .set("accept", "application/json")
            .set("user-agent", USER_AGENT);
        for (name, value) in &self.headers {
            request = request.set(name, value);
        }

        let response = request.call().map_err(|err| match err {
            ureq::Error::Status(code, _) => CapabilityError {
                class: classify_status(code),
                message: format!("request to {url} failed with status {code}"),
            },
            ureq::Error::Transport(transport) => {
                CapabilityError::transient(format!("request to {url} failed: {transport}"))
            }
        })?;

        let body = response
            .into_json::<Value>()
            .map_err(|err| {
                CapabilityError::permanent(format!("response from {url} is not json: {err}"))
            })?;
        self.shape_output(body)
    }
}

/// Rate limits, request timeouts and server errors are worth retrying.
pub fn classify_status(code: u16) -> ErrorClass {
    match code {
        408 | 429 | 500..=599 => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Fills `{name}` placeholders; returns the URL and the argument names used.
pub fn render_url(
    template: &str,
    arguments: &Map<String, Value>,
) -> Result<(String, BTreeSet<String>), CapabilityError> {
    let mut rendered = String::with_capacity(template.len());
    let mut used = BTreeSet::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            CapabilityError::permanent(format!(
                "url template `{template}` has an unclosed placeholder"
            ))
        })?;
        let name = after[..close].trim();
        let value = arguments
            .get(name)
            .filter(|value| !value.is_null())
            .ok_or_else(|| {
                CapabilityError::permanent(format!("url template needs argument `{name}`"))
            })?;
        rendered.push_str(&urlencoding::encode(&value_text(value)));
        used.insert(name.to_string());
        rest = &after[close + 1..];
    }
    rendered.push_str(rest);
    Ok((rendered, used))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn build_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}
