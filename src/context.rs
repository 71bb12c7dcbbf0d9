//! Request context snapshots sent to plugin servers, and the structured
//! `PhaseResult` that comes back.
//!
//! A plugin never mutates gateway state directly. Everything it asks for
//! through the PDK is recorded on a [`PhaseResult`], which the runloop applies
//! once the phase completes. A result that was never completed (timeout, lost
//! connection) is dropped whole.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// Read-only view of the in-flight request handed to a phase invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Gateway-assigned request identifier
    #[serde(default)]
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub scheme: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub raw_query: String,
    /// Header names are stored lowercased
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Upstream response, present from `header_filter` onwards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSnapshot>,
    /// Values shared between plugins for the lifetime of the request
    #[serde(default)]
    pub shared: Map<String, JsonValue>,
}

/// Upstream response as seen by late phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
}

impl RequestContext {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            scheme: "http".to_string(),
            ..Default::default()
        }
    }

    /// Append a header value (name is lowercased).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn with_response(mut self, response: ResponseSnapshot) -> Self {
        self.response = Some(response);
        self
    }

    /// First value of a request header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Value of a query argument from the raw query string.
    pub fn query_arg(&self, name: &str) -> Option<&str> {
        self.raw_query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .find_map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (key == name).then_some(value)
            })
    }
}

/// A header change requested by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HeaderMutation {
    Set { name: String, value: String },
    Add { name: String, value: String },
    Clear { name: String },
}

/// Short-circuit response produced by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResponse {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Whether the runloop keeps running later plugins and the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineControl {
    Continue,
    Terminate,
}

/// Mutations a plugin requested during one phase invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    /// Changes to the request forwarded upstream
    #[serde(default)]
    pub upstream_headers: Vec<HeaderMutation>,
    /// Changes to the response sent downstream
    #[serde(default)]
    pub response_headers: Vec<HeaderMutation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitResponse>,
    /// Updates to the request-scoped shared table
    #[serde(default)]
    pub shared: Map<String, JsonValue>,
}

impl PhaseResult {
    /// The fallback outcome: the plugin left request and response untouched.
    pub fn declined() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn control(&self) -> PipelineControl {
        if self.exit.is_some() {
            PipelineControl::Terminate
        } else {
            PipelineControl::Continue
        }
    }
}
