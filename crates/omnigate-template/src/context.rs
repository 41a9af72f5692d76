//! Render context: the data tree visible to templates.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Inbound-request data exposed under `.Request`.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Forwarded client headers
    pub headers: BTreeMap<String, String>,
    /// Query parameters of the inbound call
    pub query: BTreeMap<String, String>,
    /// Raw inbound body, if any
    pub body: Value,
}

/// Upstream-response data exposed under `.Response`.
#[derive(Debug, Clone, Default)]
pub struct ResponseContext {
    /// Parsed JSON body (null when the body is not JSON)
    pub data: Value,
    /// Raw body string
    pub body: String,
}

/// Everything a template can see.
///
/// `config` carries the owning server's `config` map; `args` the validated
/// tool-call arguments. Response fields are only populated for
/// response-shaping templates.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    /// Server config map (`.Config.*`)
    pub config: BTreeMap<String, String>,
    /// Tool-call arguments (`.Args.*`)
    pub args: BTreeMap<String, Value>,
    /// Inbound request data (`.Request.*`)
    pub request: RequestContext,
    /// Upstream response data (`.Response.*`)
    pub response: ResponseContext,
}

impl RenderContext {
    /// Materialize the context as a JSON tree for path lookup.
    #[must_use]
    pub(crate) fn to_value(&self) -> Value {
        let mut root = Map::new();
        root.insert(
            "Config".to_string(),
            Value::Object(
                self.config
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        root.insert(
            "Args".to_string(),
            Value::Object(self.args.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        );

        let mut request = Map::new();
        request.insert(
            "Headers".to_string(),
            Value::Object(
                self.request
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        request.insert(
            "Query".to_string(),
            Value::Object(
                self.request
                    .query
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect(),
            ),
        );
        request.insert("Body".to_string(), self.request.body.clone());
        root.insert("Request".to_string(), Value::Object(request));

        let mut response = Map::new();
        response.insert("Data".to_string(), self.response.data.clone());
        response.insert("Body".to_string(), Value::String(self.response.body.clone()));
        root.insert("Response".to_string(), Value::Object(response));

        Value::Object(root)
    }
}
