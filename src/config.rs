use std::path::PathBuf;

/// Process settings, read once at start-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Commits since the last compaction before an organization's WAL is rewritten.
    pub compact_threshold: u64,
    /// Organizations opened eagerly at start-up.
    pub orgs: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            orgs: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            data_dir: lookup("LOADOUT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            metrics_port: lookup("LOADOUT_METRICS_PORT").and_then(|s| s.parse().ok()),
            compact_threshold: lookup("LOADOUT_COMPACT_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.compact_threshold),
            orgs: lookup("LOADOUT_ORGS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        assert_eq!(Config::from_lookup(lookup(&[])), Config::default());
    }

    #[test]
    fn reads_every_variable() {
        let cfg = Config::from_lookup(lookup(&[
            ("LOADOUT_DATA_DIR", "/var/lib/loadout"),
            ("LOADOUT_METRICS_PORT", "9100"),
            ("LOADOUT_COMPACT_THRESHOLD", "50"),
            ("LOADOUT_ORGS", "acme, stagecraft,,"),
        ]));
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/loadout"));
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.orgs, vec!["acme".to_string(), "stagecraft".to_string()]);
    }

    #[test]
    fn garbage_numbers_fall_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("LOADOUT_METRICS_PORT", "not-a-port"),
            ("LOADOUT_COMPACT_THRESHOLD", "-3"),
        ]));
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.compact_threshold, 1000);
    }
}
