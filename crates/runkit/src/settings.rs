use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use runkit_backend::{MajorVersion, RuntimeKind};
use runkit_engine::BundledFallback;
use runkit_platform::AppPaths;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    #[serde(
        default,
        deserialize_with = "deserialize_kind_map",
        serialize_with = "serialize_kind_map"
    )]
    pub catalog_urls: BTreeMap<RuntimeKind, String>,

    #[serde(
        default,
        deserialize_with = "deserialize_kind_map",
        serialize_with = "serialize_kind_map"
    )]
    pub bundled_fallbacks: BTreeMap<RuntimeKind, BundledSetting>,

    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    #[serde(default = "default_version_probe_timeout")]
    pub version_probe_timeout_secs: u64,

    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_retry_delays")]
    pub retry_delays_secs: Vec<u64>,

    #[serde(default)]
    pub debug_logging: bool,

    #[serde(default = "default_max_log_size_bytes")]
    pub max_log_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundledSetting {
    pub major: MajorVersion,
    pub path: PathBuf,
}

impl From<&BundledSetting> for BundledFallback {
    fn from(setting: &BundledSetting) -> Self {
        Self {
            major: setting.major.clone(),
            path: setting.path.clone(),
        }
    }
}

fn default_install_timeout() -> u64 {
    600
}

fn default_version_probe_timeout() -> u64 {
    10
}

fn default_http_timeout() -> u64 {
    30
}

fn default_retry_delays() -> Vec<u64> {
    vec![0, 2, 5]
}

fn default_max_log_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn deserialize_kind_map<'de, D, V>(deserializer: D) -> Result<BTreeMap<RuntimeKind, V>, D::Error>
where
    D: serde::Deserializer<'de>,
    V: Deserialize<'de>,
{
    let raw = BTreeMap::<String, V>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(name, value)| RuntimeKind::from_name(&name).map(|kind| (kind, value)))
        .collect())
}

fn serialize_kind_map<S, V>(map: &BTreeMap<RuntimeKind, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    V: Serialize,
{
    let raw: BTreeMap<&str, &V> = map.iter().map(|(kind, value)| (kind.as_str(), value)).collect();
    raw.serialize(serializer)
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            catalog_urls: BTreeMap::new(),
            bundled_fallbacks: BTreeMap::new(),
            install_timeout_secs: default_install_timeout(),
            version_probe_timeout_secs: default_version_probe_timeout(),
            http_timeout_secs: default_http_timeout(),
            retry_delays_secs: default_retry_delays(),
            debug_logging: false,
            max_log_size_bytes: default_max_log_size_bytes(),
        }
    }
}

impl AppSettings {
    pub fn load(paths: &AppPaths) -> Self {
        Self::load_from(&paths.settings_file())
    }

    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|error| {
                log::warn!("Ignoring malformed {}: {error}", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self, paths: &AppPaths) -> Result<(), std::io::Error> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.settings_file(), content)?;
        Ok(())
    }

    /// Platform paths with the configured data directory applied. The
    /// `RUNKIT_DATA_DIR` environment variable still wins.
    pub fn apply_paths(&self, paths: AppPaths) -> AppPaths {
        match &self.data_dir {
            Some(dir) if std::env::var_os(runkit_platform::DATA_DIR_ENV).is_none() => {
                paths.with_data_dir(dir.clone())
            }
            _ => paths,
        }
    }

    pub fn bundled_for(&self, kind: RuntimeKind) -> Option<BundledFallback> {
        self.bundled_fallbacks.get(&kind).map(BundledFallback::from)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn version_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.version_probe_timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_secs
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }
}
