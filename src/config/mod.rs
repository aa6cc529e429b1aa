//! Layered configuration for one build.
//!
//! Layers, lowest precedence first:
//!
//! 1. Built-in defaults (only fill keys nobody set)
//! 2. The user's base config (`config.js`), plus derived path keys
//! 3. The rendered build spec of the selected target
//! 4. Keys derived from the customization profile named by `profile`
//!
//! Merging is shallow: a later layer replaces a top-level key wholesale.
//! The merged [`Config`] is read-only for the rest of the build.

pub mod jsonc;
mod store;

pub use store::{read_stripped, BuildTarget, ConfigStore, ResolvedConfig};

use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};
use tracing::warn;

pub type ConfigMap = Map<String, Value>;

/// Virtualization backend a build spec targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Hypervisor {
    #[default]
    VirtualBox,
    VSphere,
}

impl fmt::Display for Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hypervisor::VirtualBox => write!(f, "virtualbox"),
            Hypervisor::VSphere => write!(f, "vsphere"),
        }
    }
}

impl FromStr for Hypervisor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "virtualbox" => Ok(Hypervisor::VirtualBox),
            "vsphere" => Ok(Hypervisor::VSphere),
            other => Err(format!(
                "unsupported hypervisor '{other}' (expected 'virtualbox' or 'vsphere')"
            )),
        }
    }
}

/// Immutable snapshot of the merged configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config(ConfigMap);

impl Config {
    pub fn from_map(map: ConfigMap) -> Self {
        Self(map)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &ConfigMap {
        &self.0
    }

    /// Hypervisor selected by the config; unknown or absent values fall
    /// back to VirtualBox. An unknown value is logged.
    pub fn hypervisor(&self) -> Hypervisor {
        match self.get_str("hypervisor").map(str::parse::<Hypervisor>) {
            Some(Ok(hypervisor)) => hypervisor,
            Some(Err(reason)) => {
                warn!("{reason}; using {}", Hypervisor::default());
                Hypervisor::default()
            }
            None => Hypervisor::default(),
        }
    }

    /// Copy of this snapshot with `extra` layered on top.
    pub fn with_overrides<I, K>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut map = self.0.clone();
        for (key, value) in extra {
            map.insert(key.into(), value);
        }
        Self(map)
    }
}

/// Keys every config ends up with unless the user or target set them.
pub fn builtin_defaults() -> ConfigMap {
    let mut defaults = ConfigMap::new();
    defaults.insert(
        "hypervisor".into(),
        Value::String(Hypervisor::default().to_string()),
    );
    defaults.insert("windows_defender".into(), Value::String("false".into()));
    defaults.insert("windows_updates".into(), Value::String("false".into()));
    defaults.insert("choco_packages".into(), Value::String(String::new()));
    defaults
}

/// Shallow merge: each later layer overrides earlier layers key by key.
pub fn merge_layers<I>(layers: I) -> ConfigMap
where
    I: IntoIterator<Item = ConfigMap>,
{
    let mut merged = ConfigMap::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key, value);
        }
    }
    merged
}

/// Insert each default whose key is absent from `map`.
pub fn apply_defaults(map: &mut ConfigMap, defaults: ConfigMap) {
    for (key, value) in defaults {
        map.entry(key).or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn map(value: Value) -> ConfigMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn later_layers_win() {
        let merged = merge_layers([
            map(json!({"a": 1, "b": 1, "c": 1})),
            map(json!({"b": 2, "c": 2})),
            map(json!({"c": 3})),
        ]);
        assert_eq!(Value::Object(merged), json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn merge_is_shallow() {
        let merged = merge_layers([
            map(json!({"builders": [{"type": "a"}, {"type": "b"}]})),
            map(json!({"builders": [{"type": "c"}]})),
        ]);
        assert_eq!(merged["builders"], json!([{"type": "c"}]));
    }

    #[test]
    fn defaults_never_override() {
        let mut cfg = map(json!({"hypervisor": "vsphere"}));
        apply_defaults(&mut cfg, builtin_defaults());
        assert_eq!(cfg["hypervisor"], "vsphere");
        assert_eq!(cfg["windows_updates"], "false");
    }

    #[test]
    fn hypervisor_parsing() {
        assert_eq!("VSphere".parse::<Hypervisor>().unwrap(), Hypervisor::VSphere);
        assert!("hyperv".parse::<Hypervisor>().is_err());
        let cfg = Config::from_map(map(json!({"hypervisor": "bogus"})));
        assert_eq!(cfg.hypervisor(), Hypervisor::VirtualBox);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_hypervisor_is_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let cfg = Config::from_map(map(json!({"hypervisor": "hyperv"})));
        let chosen = tracing::subscriber::with_default(subscriber, || cfg.hypervisor());
        assert_eq!(chosen, Hypervisor::VirtualBox);

        let log = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(log.contains("WARN"), "{log}");
        assert!(log.contains("unsupported hypervisor 'hyperv'"), "{log}");

        let quiet = Captured::default();
        let writer = quiet.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .finish();
        let cfg = Config::from_map(map(json!({"hypervisor": "vsphere"})));
        tracing::subscriber::with_default(subscriber, || cfg.hypervisor());
        assert!(quiet.0.lock().unwrap().is_empty());
    }

    #[test]
    fn overrides_leave_original_untouched() {
        let base = Config::from_map(map(json!({"name": "a"})));
        let spun = base.with_overrides([("name", json!("b"))]);
        assert_eq!(base.get_str("name"), Some("a"));
        assert_eq!(spun.get_str("name"), Some("b"));
    }

    fn layer() -> impl Strategy<Value = ConfigMap> {
        prop::collection::btree_map("[a-e]", 0u32..100, 0..5).prop_map(|m| {
            m.into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect::<ConfigMap>()
        })
    }

    proptest! {
        #[test]
        fn merge_resolves_each_key_from_the_rightmost_layer(
            defaults in layer(),
            base in layer(),
            target in layer(),
            overlay in layer(),
        ) {
            let mut lower = base.clone();
            apply_defaults(&mut lower, defaults.clone());
            let merged = merge_layers([lower, target.clone(), overlay.clone()]);

            for key in ["a", "b", "c", "d", "e"] {
                let expected = overlay.get(key)
                    .or_else(|| target.get(key))
                    .or_else(|| base.get(key))
                    .or_else(|| defaults.get(key));
                prop_assert_eq!(merged.get(key), expected);
            }
        }
    }
}
