//! PDK Call Bridge
//!
//! While a phase invocation is outstanding the plugin server may call back
//! into the gateway ("PDK calls"): read a header, set an upstream header,
//! short-circuit the response, log. The bridge is a fixed table from method
//! name to capability function, supplied by the host at worker startup and
//! read-only afterwards.
//!
//! Capabilities run synchronously against the [`PdkContext`] of the phase
//! invocation that issued the call, never against another request's state
//! and never deferred.

pub mod builtin;

use crate::context::{PhaseResult, RequestContext};
use crate::phase::Phase;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Failure of a single PDK call. Reported back to the plugin, never fatal
/// to the phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PdkError {
    #[error("unknown PDK method: {0}")]
    UnknownMethod(String),

    #[error("{method}: {message}")]
    CapabilityError { method: String, message: String },
}

/// Error raised by a capability function itself
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct CapabilityError(pub String);

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        CapabilityError(message.into())
    }
}

/// Per-invocation state a capability reads from and writes to.
#[derive(Debug, Clone)]
pub struct PdkContext {
    pub phase: Phase,
    pub request: RequestContext,
    pub result: PhaseResult,
}

impl PdkContext {
    pub fn new(phase: Phase, request: RequestContext) -> Self {
        Self {
            phase,
            request,
            result: PhaseResult::default(),
        }
    }

    pub fn into_result(self) -> PhaseResult {
        self.result
    }
}

/// A gateway-side capability exposed to plugin servers.
pub type Capability =
    Arc<dyn Fn(&mut PdkContext, &[JsonValue]) -> Result<JsonValue, CapabilityError> + Send + Sync>;

/// Build a [`Capability`] from a closure.
pub fn capability<F>(f: F) -> Capability
where
    F: Fn(&mut PdkContext, &[JsonValue]) -> Result<JsonValue, CapabilityError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Whitelisted method table.
#[derive(Clone, Default)]
pub struct PdkBridge {
    table: Arc<HashMap<String, Capability>>,
}

impl fmt::Debug for PdkBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut methods: Vec<_> = self.table.keys().collect();
        methods.sort();
        f.debug_struct("PdkBridge").field("methods", &methods).finish()
    }
}

impl PdkBridge {
    /// Freeze the host's capability table.
    pub fn new(table: HashMap<String, Capability>) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn contains(&self, method: &str) -> bool {
        self.table.contains_key(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }

    /// Run `method` against the calling invocation's context.
    pub fn invoke(
        &self,
        ctx: &mut PdkContext,
        method: &str,
        args: &[JsonValue],
    ) -> Result<JsonValue, PdkError> {
        let capability = self
            .table
            .get(method)
            .ok_or_else(|| PdkError::UnknownMethod(method.to_string()))?;

        debug!(method, phase = %ctx.phase, args = args.len(), "PDK call");
        capability(ctx, args).map_err(|e| PdkError::CapabilityError {
            method: method.to_string(),
            message: e.0,
        })
    }
}

// =============================================================================
// ARGUMENT HELPERS
// =============================================================================

/// Positional string argument
pub fn arg_str<'a>(args: &'a [JsonValue], idx: usize) -> Result<&'a str, CapabilityError> {
    args.get(idx)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| CapabilityError::new(format!("argument {} must be a string", idx + 1)))
}

/// Optional positional string argument
pub fn arg_opt_str(args: &[JsonValue], idx: usize) -> Result<Option<&str>, CapabilityError> {
    match args.get(idx) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => Ok(Some(s)),
        Some(_) => Err(CapabilityError::new(format!(
            "argument {} must be a string",
            idx + 1
        ))),
    }
}

/// Positional HTTP status argument
pub fn arg_status(args: &[JsonValue], idx: usize) -> Result<u16, CapabilityError> {
    args.get(idx)
        .and_then(JsonValue::as_u64)
        .filter(|s| (100..=599).contains(s))
        .map(|s| s as u16)
        .ok_or_else(|| CapabilityError::new(format!("argument {} must be an HTTP status", idx + 1)))
}
