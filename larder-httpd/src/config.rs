use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Daemon configuration, loaded from a JSON file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// The cache backend tree.
    pub cache: CacheConfig,
    /// Artifact proxy routes.
    #[serde(default)]
    pub upstreams: Vec<Route>,
    /// Git mirror settings.
    #[serde(default)]
    pub mirror: MirrorConfig,
    /// Total job-scheduler concurrency.
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CacheConfig {
    /// Registry id of the backend, e.g. `tiered`.
    pub backend: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// One artifact proxy route: requests under `/{prefix}/` map onto `url`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Route {
    pub prefix: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MirrorConfig {
    /// Directory holding the mirrored clones.
    #[serde(default = "defaults::mirror_root")]
    pub root: PathBuf,
    /// How old a mirror's last fetch may grow before a read triggers a
    /// background fetch.
    #[serde(with = "larder::serde_ext::duration", default = "defaults::fetch_interval")]
    pub fetch_interval: Duration,
    /// How long a successful ref-freshness check stays valid.
    #[serde(
        with = "larder::serde_ext::duration",
        default = "defaults::ref_check_interval"
    )]
    pub ref_check_interval: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            root: defaults::mirror_root(),
            fetch_interval: defaults::fetch_interval(),
            ref_check_interval: defaults::ref_check_interval(),
        }
    }
}

mod defaults {
    use std::path::PathBuf;
    use std::time::Duration;

    pub fn concurrency() -> usize {
        8
    }

    pub fn mirror_root() -> PathBuf {
        PathBuf::from("mirrors")
    }

    pub fn fetch_interval() -> Duration {
        Duration::from_secs(5 * 60)
    }

    pub fn ref_check_interval() -> Duration {
        Duration::from_secs(30)
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;

        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_full_config() {
        let config: Config = serde_json::from_str(
            r#"{
              "cache": {
                "backend": "tiered",
                "config": {
                  "tiers": [
                    { "backend": "memory", "config": { "limit-mb": 64 } },
                    { "backend": "disk", "config": { "root": "/var/cache/larder", "limit-mb": 4096, "max-ttl": "48h" } }
                  ]
                }
              },
              "upstreams": [
                { "prefix": "go", "url": "https://proxy.golang.org" },
                { "prefix": "github", "url": "https://github.com" }
              ],
              "mirror": { "root": "/var/mirrors", "fetch-interval": "10m", "ref-check-interval": "1m" },
              "concurrency": 16
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache.backend, "tiered");
        assert_eq!(config.upstreams.len(), 2);
        assert_eq!(config.mirror.fetch_interval, Duration::from_secs(600));
        assert_eq!(config.concurrency, 16);
    }

    #[test]
    fn test_minimal_config() {
        let config: Config =
            serde_json::from_str(r#"{ "cache": { "backend": "memory" } }"#).unwrap();

        assert!(config.upstreams.is_empty());
        assert_eq!(config.mirror.root, PathBuf::from("mirrors"));
        assert_eq!(config.mirror.ref_check_interval, Duration::from_secs(30));
        assert_eq!(config.concurrency, 8);
    }
}
