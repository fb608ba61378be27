//! Load config from file and environment.

use diode_core::{Address, CoreConfig, DispatchMode};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::warn;

/// Client configuration. File: ~/.config/diode/config.toml or /etc/diode/config.toml.
/// Env overrides: DIODE_DISPATCH_MODE, DIODE_PUBLISHED_PORTS, DIODE_FLEET.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Protocol settings (`[core]` table).
    #[serde(default)]
    pub core: CoreConfig,
    /// Fleet contract address, hex.
    #[serde(default)]
    pub fleet_addr: Option<String>,
}

impl Config {
    /// Parsed fleet address; None if unset or not a 20-byte hex string.
    pub fn fleet(&self) -> Option<Address> {
        self.fleet_addr.as_deref().and_then(Address::from_hex)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let c = load_file().unwrap_or_default();
    apply_env(c, |key| std::env::var(key).ok())
}

/// Apply overrides from `lookup`. Unparseable values are ignored with a warning.
pub fn apply_env(mut c: Config, lookup: impl Fn(&str) -> Option<String>) -> Config {
    if let Some(s) = lookup("DIODE_DISPATCH_MODE") {
        match s.parse::<DispatchMode>() {
            Ok(mode) => c.core.dispatch_mode = mode,
            Err(e) => warn!(error = %e, "ignoring DIODE_DISPATCH_MODE"),
        }
    }
    if let Some(s) = lookup("DIODE_PUBLISHED_PORTS") {
        let ports: Result<Vec<u64>, _> = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::parse::<u64>)
            .collect();
        match ports {
            Ok(ports) => c.core.published_ports = ports,
            Err(e) => warn!(error = %e, "ignoring DIODE_PUBLISHED_PORTS"),
        }
    }
    if let Some(s) = lookup("DIODE_FLEET") {
        if Address::from_hex(&s).is_some() {
            c.fleet_addr = Some(s);
        } else {
            warn!(value = %s, "ignoring DIODE_FLEET: not a 20-byte hex address");
        }
    }
    c
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/diode/config.toml"));
    }
    out.push(PathBuf::from("/etc/diode/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| parse(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => warn!(path = %p.display(), error = %e, "invalid config file"),
                Err(e) => warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_file_uses_defaults() {
        let c = parse("").unwrap();
        assert_eq!(c.core, CoreConfig::default());
        assert!(c.fleet().is_none());
    }

    #[test]
    fn file_sets_core_table() {
        let c = parse(
            r#"
fleet_addr = "0x6000000000000000000000000000000000000000"

[core]
dispatch_mode = "legacy_marker"
published_ports = [22, 8080]
send_chunk_size = 1024
"#,
        )
        .unwrap();
        assert_eq!(c.core.dispatch_mode, DispatchMode::LegacyMarker);
        assert_eq!(c.core.published_ports, vec![22, 8080]);
        assert_eq!(c.core.send_chunk_size, 1024);
        assert_eq!(c.fleet().unwrap().as_bytes()[0], 0x60);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
        assert!(parse("[core]\nmode = \"structural\"").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let c = apply_env(
            Config::default(),
            env(&[
                ("DIODE_DISPATCH_MODE", "legacy_marker"),
                ("DIODE_PUBLISHED_PORTS", "22, 80,443"),
                ("DIODE_FLEET", "0x0101010101010101010101010101010101010101"),
            ]),
        );
        assert_eq!(c.core.dispatch_mode, DispatchMode::LegacyMarker);
        assert_eq!(c.core.published_ports, vec![22, 80, 443]);
        assert_eq!(c.fleet(), Some(Address::new([1; 20])));
    }

    #[test]
    fn bad_env_values_ignored() {
        let c = apply_env(
            Config::default(),
            env(&[
                ("DIODE_DISPATCH_MODE", "sniff"),
                ("DIODE_PUBLISHED_PORTS", "22,http"),
                ("DIODE_FLEET", "0x1234"),
            ]),
        );
        assert_eq!(c.core, CoreConfig::default());
        assert!(c.fleet_addr.is_none());
    }
}
