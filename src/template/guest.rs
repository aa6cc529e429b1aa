//! Guest OS identifiers used to pick the unattended-install answer file.

use crate::config::{Config, Hypervisor};
use crate::error::{BuildError, Result};

/// vSphere has no Windows 10 guest type, so the build specs declare the
/// Windows 8 family instead. Answer files are stored under the Windows 10
/// names.
const VSPHERE_REMAP: &[(&str, &str)] = &[("windows8", "windows10"), ("windows8-64", "windows10_64")];

/// Lowercased `builders[0].guest_os_type`, remapped for the hypervisor.
pub fn guest_os_id(config: &Config) -> Result<String> {
    let raw = config
        .get("builders")
        .and_then(|b| b.get(0))
        .and_then(|b| b.get("guest_os_type"))
        .and_then(|t| t.as_str())
        .ok_or_else(|| {
            BuildError::parse(
                "build spec",
                "missing builders[0].guest_os_type",
            )
        })?;
    Ok(remap(&raw.to_lowercase(), config.hypervisor()).to_string())
}

fn remap(os_type: &str, hypervisor: Hypervisor) -> &str {
    if hypervisor != Hypervisor::VSphere {
        return os_type;
    }
    VSPHERE_REMAP
        .iter()
        .find(|(from, _)| *from == os_type)
        .map(|(_, to)| *to)
        .unwrap_or(os_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(value: serde_json::Value) -> Config {
        Config::from_map(value.as_object().cloned().unwrap())
    }

    #[test]
    fn lowercases_guest_type() {
        let cfg = config(json!({"builders": [{"guest_os_type": "Windows7_64"}]}));
        assert_eq!(guest_os_id(&cfg).unwrap(), "windows7_64");
    }

    #[test]
    fn vsphere_remaps_windows8_family() {
        let cfg = config(json!({
            "hypervisor": "vsphere",
            "builders": [{"guest_os_type": "windows8-64"}]
        }));
        assert_eq!(guest_os_id(&cfg).unwrap(), "windows10_64");

        let cfg = config(json!({
            "hypervisor": "vsphere",
            "builders": [{"guest_os_type": "Windows8"}]
        }));
        assert_eq!(guest_os_id(&cfg).unwrap(), "windows10");
    }

    #[test]
    fn virtualbox_does_not_remap() {
        let cfg = config(json!({
            "hypervisor": "virtualbox",
            "builders": [{"guest_os_type": "Windows8"}]
        }));
        assert_eq!(guest_os_id(&cfg).unwrap(), "windows8");
    }

    #[test]
    fn missing_builders_is_a_parse_error() {
        let err = guest_os_id(&config(json!({}))).unwrap_err();
        assert!(matches!(err, BuildError::ConfigParse { .. }));
    }
}
