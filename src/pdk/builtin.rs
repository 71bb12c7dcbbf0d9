//! Reference capability table
//!
//! The capabilities a gateway host typically exposes to plugin servers. Hosts
//! pass [`capabilities()`] (or their own table) to [`PdkBridge::new`]; the
//! bridge uses exactly what it is given.
//!
//! [`PdkBridge::new`]: super::PdkBridge::new

use super::{arg_opt_str, arg_status, arg_str, capability, Capability, CapabilityError, PdkContext};
use crate::context::{ExitResponse, HeaderMutation};
use crate::phase::Phase;
use serde_json::{json, Value as JsonValue};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info, warn};

/// The default host table.
pub fn capabilities() -> HashMap<String, Capability> {
    let mut table: HashMap<String, Capability> = HashMap::new();
    let mut add = |name: &str, cap: Capability| {
        table.insert(name.to_string(), cap);
    };

    // Request reads
    add("request.get_method", capability(|ctx, _| Ok(json!(ctx.request.method))));
    add("request.get_scheme", capability(|ctx, _| Ok(json!(ctx.request.scheme))));
    add("request.get_host", capability(|ctx, _| Ok(json!(ctx.request.host))));
    add("request.get_path", capability(|ctx, _| Ok(json!(ctx.request.path))));
    add("request.get_raw_query", capability(|ctx, _| Ok(json!(ctx.request.raw_query))));
    add(
        "request.get_query_arg",
        capability(|ctx, args| Ok(json!(ctx.request.query_arg(arg_str(args, 0)?)))),
    );
    add(
        "request.get_header",
        capability(|ctx, args| Ok(json!(ctx.request.header(arg_str(args, 0)?)))),
    );
    add("request.get_headers", capability(|ctx, _| Ok(json!(ctx.request.headers))));
    add("request.get_raw_body", capability(|ctx, _| Ok(json!(ctx.request.body))));
    add("client.get_ip", capability(|ctx, _| Ok(json!(ctx.request.client_ip))));

    // Upstream request mutations
    add(
        "service.request.set_header",
        capability(|ctx, args| {
            let (name, value) = header_args(args)?;
            ctx.result.upstream_headers.push(HeaderMutation::Set { name, value });
            Ok(JsonValue::Null)
        }),
    );
    add(
        "service.request.add_header",
        capability(|ctx, args| {
            let (name, value) = header_args(args)?;
            ctx.result.upstream_headers.push(HeaderMutation::Add { name, value });
            Ok(JsonValue::Null)
        }),
    );
    add(
        "service.request.clear_header",
        capability(|ctx, args| {
            let name = arg_str(args, 0)?.to_ascii_lowercase();
            ctx.result.upstream_headers.push(HeaderMutation::Clear { name });
            Ok(JsonValue::Null)
        }),
    );

    // Response
    add(
        "response.get_status",
        capability(|ctx, _| Ok(json!(ctx.request.response.as_ref().map(|r| r.status)))),
    );
    add(
        "response.get_header",
        capability(|ctx, args| {
            let name = arg_str(args, 0)?.to_ascii_lowercase();
            Ok(json!(ctx
                .request
                .response
                .as_ref()
                .and_then(|r| r.headers.get(&name))
                .and_then(|v| v.first())))
        }),
    );
    add(
        "response.set_header",
        capability(|ctx, args| {
            let (name, value) = header_args(args)?;
            ctx.result.response_headers.push(HeaderMutation::Set { name, value });
            Ok(JsonValue::Null)
        }),
    );
    add(
        "response.add_header",
        capability(|ctx, args| {
            let (name, value) = header_args(args)?;
            ctx.result.response_headers.push(HeaderMutation::Add { name, value });
            Ok(JsonValue::Null)
        }),
    );
    add(
        "response.clear_header",
        capability(|ctx, args| {
            let name = arg_str(args, 0)?.to_ascii_lowercase();
            ctx.result.response_headers.push(HeaderMutation::Clear { name });
            Ok(JsonValue::Null)
        }),
    );
    add(
        "response.set_status",
        capability(|ctx, args| {
            require_before_body(ctx, "response.set_status")?;
            ctx.result.response_status = Some(arg_status(args, 0)?);
            Ok(JsonValue::Null)
        }),
    );
    add(
        "response.exit",
        capability(|ctx, args| {
            require_before_body(ctx, "response.exit")?;
            let status = arg_status(args, 0)?;
            let body = arg_opt_str(args, 1)?.map(str::to_string);
            let headers = match args.get(2) {
                None | Some(JsonValue::Null) => BTreeMap::new(),
                Some(JsonValue::Object(map)) => map
                    .iter()
                    .map(|(k, v)| {
                        let value = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                        (k.to_ascii_lowercase(), value)
                    })
                    .collect(),
                Some(_) => return Err(CapabilityError::new("argument 3 must be a header map")),
            };
            ctx.result.exit = Some(ExitResponse { status, body, headers });
            Ok(JsonValue::Null)
        }),
    );

    // Logging
    add("log.debug", log_capability(LogLevel::Debug));
    add("log.info", log_capability(LogLevel::Info));
    add("log.notice", log_capability(LogLevel::Info));
    add("log.warn", log_capability(LogLevel::Warn));
    add("log.err", log_capability(LogLevel::Error));

    // Request-scoped shared table
    add(
        "ctx.shared.get",
        capability(|ctx, args| {
            let key = arg_str(args, 0)?;
            let value = ctx
                .result
                .shared
                .get(key)
                .or_else(|| ctx.request.shared.get(key))
                .cloned()
                .unwrap_or(JsonValue::Null);
            Ok(value)
        }),
    );
    add(
        "ctx.shared.set",
        capability(|ctx, args| {
            let key = arg_str(args, 0)?.to_string();
            let value = args.get(1).cloned().unwrap_or(JsonValue::Null);
            ctx.result.shared.insert(key, value);
            Ok(JsonValue::Null)
        }),
    );

    table
}

fn header_args(args: &[JsonValue]) -> Result<(String, String), CapabilityError> {
    let name = arg_str(args, 0)?.to_ascii_lowercase();
    let value = match args.get(1) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        _ => return Err(CapabilityError::new("argument 2 must be a header value")),
    };
    Ok((name, value))
}

fn require_before_body(ctx: &PdkContext, method: &str) -> Result<(), CapabilityError> {
    match ctx.phase {
        Phase::BodyFilter | Phase::Log => Err(CapabilityError::new(format!(
            "{} is not allowed in the {} phase",
            method, ctx.phase
        ))),
        _ => Ok(()),
    }
}

#[derive(Clone, Copy)]
enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

fn log_capability(level: LogLevel) -> Capability {
    capability(move |ctx, args| {
        let message = args
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join(" ");
        let request_id = ctx.request.request_id.as_str();
        let phase = ctx.phase.as_str();
        match level {
            LogLevel::Debug => debug!(target: "plugin", request_id, phase, "{}", message),
            LogLevel::Info => info!(target: "plugin", request_id, phase, "{}", message),
            LogLevel::Warn => warn!(target: "plugin", request_id, phase, "{}", message),
            LogLevel::Error => error!(target: "plugin", request_id, phase, "{}", message),
        }
        Ok(JsonValue::Null)
    })
}
