//! Instance Registry
//!
//! Remote plugin instances live inside the plugin server. Locally we only keep
//! an opaque [`InstanceId`] keyed by plugin name and a fingerprint of the
//! configuration that created it. A changed configuration hashes to a new
//! fingerprint and therefore to a new instance; nothing is ever mutated in
//! place.
//!
//! Creation is single-flight per key: concurrent requests for the same
//! (plugin, fingerprint) wait on one remote "new instance" call.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Remote instance identifier, opaque to the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic hash of a normalized configuration value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigFingerprint(String);

impl ConfigFingerprint {
    /// SHA-256 over the canonical JSON encoding (object keys sorted at
    /// every depth), so field order never changes the fingerprint.
    pub fn of(config: &JsonValue) -> Self {
        let mut canonical = String::new();
        write_canonical(config, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        ConfigFingerprint(format!("{:x}", digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough for logs
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

type InstanceKey = (String, ConfigFingerprint);

/// Map of (plugin name, configuration fingerprint) to remote instance id.
///
/// Shared by every concurrent request of one plugin server connection.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    slots: Mutex<HashMap<InstanceKey, Arc<OnceCell<InstanceId>>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, plugin_name: &str, fingerprint: &ConfigFingerprint) -> Arc<OnceCell<InstanceId>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .entry((plugin_name.to_string(), fingerprint.clone()))
            .or_default()
            .clone()
    }

    pub fn lookup(&self, plugin_name: &str, fingerprint: &ConfigFingerprint) -> Option<InstanceId> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(&(plugin_name.to_string(), fingerprint.clone()))
            .and_then(|cell| cell.get().copied())
    }

    /// Record an instance created elsewhere. An existing binding wins.
    pub fn record(&self, plugin_name: &str, fingerprint: &ConfigFingerprint, id: InstanceId) {
        let _ = self.slot(plugin_name, fingerprint).set(id);
    }

    /// Drop a binding so the next use creates a fresh instance.
    /// Returns the id that was bound, if any.
    pub fn invalidate(&self, plugin_name: &str, fingerprint: &ConfigFingerprint) -> Option<InstanceId> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .remove(&(plugin_name.to_string(), fingerprint.clone()))
            .and_then(|cell| cell.get().copied())
    }

    /// Forget every binding. Called whenever the transport is (re)connected,
    /// since remote instances do not survive their connection's process.
    pub fn clear(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.clear();
    }

    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the bound id or run `create` exactly once for this key.
    ///
    /// Callers racing on the same key all observe the id from the single
    /// `create` that ran. A failed `create` leaves the key unbound.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        plugin_name: &str,
        fingerprint: &ConfigFingerprint,
        create: F,
    ) -> Result<InstanceId, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InstanceId, E>>,
    {
        let slot = self.slot(plugin_name, fingerprint);
        slot.get_or_try_init(create).await.copied()
    }
}
