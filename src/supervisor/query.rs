//! One-shot introspection query
//!
//! Runs `query_command` with the socket path appended, captures stdout and
//! parses the plugin descriptions it prints. Nothing else is started and
//! nothing is kept running.

use super::process::describe_exit;
use super::SupervisorError;
use crate::config::PluginServerDefinition;
use crate::info::{parse_plugin_infos, PluginInfo};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub async fn query(definition: &PluginServerDefinition) -> Result<Vec<PluginInfo>, SupervisorError> {
    let failed = |reason: String| SupervisorError::QueryFailed {
        server: definition.name.clone(),
        reason,
    };

    let (program, args) = definition
        .query_command
        .split_first()
        .ok_or_else(|| failed("query_command is empty".to_string()))?;

    let child = Command::new(program)
        .args(args)
        .arg(&definition.socket)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failed(format!("{}: {}", program, e)))?;

    let timeout = definition.restart.query_timeout();
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.map_err(|e| failed(e.to_string()))?,
        Err(_) => {
            return Err(SupervisorError::QueryTimeout {
                server: definition.name.clone(),
                timeout,
            })
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(failed(format!(
            "{} ({})",
            describe_exit(&output.status),
            stderr.trim()
        )));
    }

    let infos = parse_plugin_infos(&output.stdout).map_err(|e| SupervisorError::QueryParseError {
        server: definition.name.clone(),
        reason: e.to_string(),
    })?;
    if infos.is_empty() {
        return Err(SupervisorError::QueryParseError {
            server: definition.name.clone(),
            reason: "no plugins described".to_string(),
        });
    }

    debug!(plugin_server = %definition.name, plugins = infos.len(), "Queried plugin server");
    Ok(infos)
}
