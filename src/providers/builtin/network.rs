//! Builtin provider: perform an HTTP request.
//!
//! Returns the status code, byte count and response headers of the real
//! response. Transport failures never produce a result; they surface as
//! `MISSING_TOOL` naming "network access".

use std::collections::BTreeMap;
use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::action::ActionKind;
use crate::config::NetworkConfig;
use crate::providers::{required_str, Provider, ProviderError};

/// Maximum raw response body size (5 MB).
const MAX_RESPONSE_SIZE: usize = 5 * 1024 * 1024;

/// Maximum text body returned in the result (in characters).
const MAX_TEXT_OUTPUT: usize = 20_000;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

/// User-Agent header sent with requests.
const USER_AGENT: &str = concat!("capgate/", env!("CARGO_PKG_VERSION"));

pub(crate) const NETWORK_ACCESS: &str = "network access";

pub struct NetworkFetchProvider {
    client: reqwest::Client,
}

impl NetworkFetchProvider {
    pub fn new(config: &NetworkConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs.max(1)))
            .connect_timeout(std::time::Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client }
    }
}

/// Returns true if the content type is textual (plain, html, json, xml, etc.).
fn is_text(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/") || ct.contains("application/json") || ct.contains("application/xml")
}

/// Truncates a text body at a character boundary.
fn truncate_text(text: &str) -> (String, bool) {
    if text.chars().count() > MAX_TEXT_OUTPUT {
        (text.chars().take(MAX_TEXT_OUTPUT).collect(), true)
    } else {
        (text.to_string(), false)
    }
}

fn parse_url(raw: &str) -> Result<url::Url, ProviderError> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| ProviderError::InvalidParams(format!("invalid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => Err(ProviderError::InvalidParams(format!(
            "unsupported scheme '{scheme}' (only http/https)"
        ))),
    }
}

fn parse_method(params: &Value) -> Result<reqwest::Method, ProviderError> {
    let method = params["method"].as_str().unwrap_or("GET").to_ascii_uppercase();
    reqwest::Method::from_str(&method)
        .map_err(|_| ProviderError::InvalidParams(format!("invalid HTTP method '{method}'")))
}

fn parse_headers(params: &Value) -> Result<HeaderMap, ProviderError> {
    let mut map = HeaderMap::new();
    let Some(headers) = params["headers"].as_object() else {
        return Ok(map);
    };
    for (name, value) in headers {
        let value = value.as_str().ok_or_else(|| {
            ProviderError::InvalidParams(format!("header '{name}' must be a string"))
        })?;
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
            ProviderError::InvalidParams(format!("invalid header name '{}'", name.escape_debug()))
        })?;
        let value = HeaderValue::from_str(value).map_err(|_| {
            ProviderError::InvalidParams(format!("invalid value for header '{name}'"))
        })?;
        map.append(name, value);
    }
    Ok(map)
}

fn transport_failure(e: &reqwest::Error) -> ProviderError {
    if e.is_builder() {
        return ProviderError::InvalidParams(format!("cannot build request: {e}"));
    }
    warn!("Network fetch failed: {e}");
    ProviderError::MissingTool {
        missing: vec![NETWORK_ACCESS.to_string()],
    }
}

#[async_trait]
impl Provider for NetworkFetchProvider {
    fn kind(&self) -> ActionKind {
        ActionKind::NetworkFetch
    }

    fn description(&self) -> &str {
        "Perform an HTTP request and return the status code, byte count, \
         response headers and (for textual responses) the body."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "http:// or https:// URL" },
                "method": { "type": "string", "description": "HTTP method, default GET" },
                "headers": { "type": "object", "additionalProperties": { "type": "string" } },
                "body": { "description": "String body, or any JSON value sent as application/json" }
            },
            "required": ["url"]
        })
    }

    async fn invoke(&self, params: &Value) -> Result<Value, ProviderError> {
        let url = parse_url(required_str(params, "url")?)?;
        let method = parse_method(params)?;

        let headers = parse_headers(params)?;

        let mut request = self
            .client
            .request(method.clone(), url.clone())
            .headers(headers);
        request = match &params["body"] {
            Value::Null => request,
            Value::String(body) => request.body(body.clone()),
            other => request.json(other),
        };

        debug!("{method} {url}");
        let response = request.send().await.map_err(|e| transport_failure(&e))?;

        let status = response.status();
        if let Some(len) = response.content_length() {
            if len as usize > MAX_RESPONSE_SIZE {
                return Err(ProviderError::failed(format!(
                    "response too large ({len} bytes, limit is {MAX_RESPONSE_SIZE} bytes)"
                )));
            }
        }

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let content_type = headers.get("content-type").cloned().unwrap_or_default();

        // Chunked responses carry no length up front; stop reading at the cap.
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| transport_failure(&e))?;
            if body.len() + chunk.len() > MAX_RESPONSE_SIZE {
                return Err(ProviderError::failed(format!(
                    "response too large (over {MAX_RESPONSE_SIZE} bytes)"
                )));
            }
            body.extend_from_slice(&chunk);
        }

        let mut result = json!({
            "url": url.as_str(),
            "status": status.as_u16(),
            "bytes": body.len(),
            "headers": headers,
        });
        if is_text(&content_type) {
            let (text, truncated) = truncate_text(&String::from_utf8_lossy(&body));
            result["body"] = Value::String(text);
            result["truncated"] = Value::Bool(truncated);
        }

        Ok(result)
    }
}
