//! Plugin metadata reported by the introspection query.

use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What a plugin server says about one of its plugins.
///
/// Both `snake_case` and the `PascalCase` spelling used by older plugin
/// servers are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    #[serde(alias = "Name")]
    pub name: String,

    #[serde(default, alias = "Version")]
    pub version: String,

    /// Ordering weight among plugins; higher runs first
    #[serde(default, alias = "Priority")]
    pub priority: i64,

    #[serde(default, alias = "Phases")]
    pub phases: Vec<Phase>,

    /// Protocol identifier the server speaks, if it advertises one
    #[serde(default, alias = "Protocol", skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Configuration schema, opaque to this crate
    #[serde(default, alias = "Schema")]
    pub schema: JsonValue,
}

impl PluginInfo {
    pub fn handles(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }
}

/// Parse introspection output: a single object, or an array for servers
/// hosting several plugins.
pub fn parse_plugin_infos(output: &[u8]) -> Result<Vec<PluginInfo>, serde_json::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Dump {
        Many(Vec<PluginInfo>),
        One(PluginInfo),
    }

    Ok(match serde_json::from_slice::<Dump>(output)? {
        Dump::Many(infos) => infos,
        Dump::One(info) => vec![info],
    })
}
