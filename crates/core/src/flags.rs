use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Flag that makes workers keep emitting the legacy flattened output shape.
pub const EMIT_LEGACY: &str = "emit_legacy";

/// Hot-reconfigurable boolean toggles broadcast to every live worker.
///
/// Ordered so broadcasts and log lines are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuntimeFlags(BTreeMap<String, bool>);

impl RuntimeFlags {
    /// An empty flag set (no defaults applied).
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.0.get(name).copied()
    }

    /// Returns `false` for flags that were never set.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.get(name).unwrap_or(false)
    }

    pub fn set(&mut self, name: impl Into<String>, value: bool) {
        self.0.insert(name.into(), value);
    }

    /// Overlay `other` on top of `self`; keys in `other` win.
    pub fn merge(&mut self, other: &RuntimeFlags) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), *v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        let mut flags = Self::empty();
        flags.set(EMIT_LEGACY, true);
        flags
    }
}

impl<K: Into<String>> FromIterator<(K, bool)> for RuntimeFlags {
    fn from_iter<I: IntoIterator<Item = (K, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_emits_legacy() {
        let flags = RuntimeFlags::default();
        assert_eq!(flags.get(EMIT_LEGACY), Some(true));
        assert!(!flags.is_enabled("webgpu"));
    }

    #[test]
    fn merge_overrides_and_extends() {
        let mut flags = RuntimeFlags::default();
        let update: RuntimeFlags = [(EMIT_LEGACY, false), ("webgpu", true)].into_iter().collect();
        flags.merge(&update);

        assert_eq!(flags.get(EMIT_LEGACY), Some(false));
        assert_eq!(flags.get("webgpu"), Some(true));
        assert_eq!(flags.iter().count(), 2);
    }

    #[test]
    fn serializes_as_plain_map() {
        let flags: RuntimeFlags = [("a", true), ("b", false)].into_iter().collect();
        let json = serde_json::to_string(&flags).unwrap();
        assert_eq!(json, r#"{"a":true,"b":false}"#);

        let back: RuntimeFlags = serde_json::from_str(&json).unwrap();
        assert_eq!(back, flags);
    }
}
