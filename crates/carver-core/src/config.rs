use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::CarverKind;
use carver_storage::{RetryConfig, StorageConfig};
use carver_types::error::{CarveError, Result};

/// Top-level configuration of a carver deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CarverConfig {
    /// Backend chunk payloads are written to: `db`, `local` or `s3`.
    #[serde(default = "default_carver")]
    pub carver: String,
    /// Directory archived carves are materialized into.
    #[serde(default = "default_carves_dir")]
    pub carves_dir: PathBuf,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub s3: S3Config,
    /// Static endpoint registry: node uuid to environment.
    #[serde(default)]
    pub nodes: HashMap<String, String>,
}

impl Default for CarverConfig {
    fn default() -> Self {
        Self {
            carver: default_carver(),
            carves_dir: default_carves_dir(),
            database: DatabaseConfig::default(),
            s3: S3Config::default(),
            nodes: HashMap::new(),
        }
    }
}

impl CarverConfig {
    pub fn carver_kind(&self) -> Result<CarverKind> {
        self.carver.parse()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file. Without it records live in memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    /// Connect/read/write deadline for each object request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: None,
            region: default_region(),
            endpoint: None,
            root: String::new(),
            access_key_id: None,
            secret_access_key: None,
            timeout_secs: default_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl S3Config {
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            root: self.root.clone(),
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            retry: self.retry.clone(),
        }
    }
}

fn default_carver() -> String {
    CarverKind::default().as_str().to_string()
}

fn default_carves_dir() -> PathBuf {
    PathBuf::from("/var/lib/carver/carves")
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

// --- Config resolution ---

pub const CONFIG_ENV_VAR: &str = "CARVER_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/carver/config.yaml";

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `CARVER_CONFIG` env var.
    EnvVar(PathBuf),
    /// The system-wide default location.
    System(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) | ConfigSource::EnvVar(p) | ConfigSource::System(p) => p,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} ({CONFIG_ENV_VAR})", p.display()),
            ConfigSource::System(p) => write!(f, "{} (system)", p.display()),
        }
    }
}

/// Resolve which config file to use.
///
/// Priority: CLI arg > `CARVER_CONFIG` env var > system file if it exists.
/// Returns `None` if nothing is found.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var(CONFIG_ENV_VAR) {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    let system = PathBuf::from(SYSTEM_CONFIG_PATH);
    system.exists().then_some(ConfigSource::System(system))
}

/// Load and parse a config file. The backend tag is validated here so a
/// typo fails at startup rather than on the first upload.
pub fn load_config(path: &Path) -> Result<CarverConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CarveError::Config(format!("cannot read '{}': {e}", path.display())))?;
    parse_config(&contents)
        .map_err(|e| match e {
            CarveError::Config(msg) => {
                CarveError::Config(format!("invalid config '{}': {msg}", path.display()))
            }
            other => other,
        })
}

pub fn parse_config(contents: &str) -> Result<CarverConfig> {
    let config: CarverConfig =
        serde_yaml::from_str(contents).map_err(|e| CarveError::Config(e.to_string()))?;
    config.carver_kind()?;
    Ok(config)
}

/// Returns a minimal YAML config template suitable for bootstrapping.
pub fn minimal_config_template() -> &'static str {
    r#"# carver configuration file

# Where chunk payloads go: db, local or s3.
carver: db

carves_dir: /var/lib/carver/carves

database:
  path: /var/lib/carver/carves.db

# s3:
#   bucket: carves
#   region: us-east-1
#   endpoint: https://s3.us-east-1.amazonaws.com
#   access_key_id: AKIA...
#   secret_access_key: ...
#   timeout_secs: 300

nodes:
  00000000-0000-0000-0000-000000000000: prod
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that mutate process-global state (env vars) must be serialized.
    static GLOBAL_STATE: Mutex<()> = Mutex::new(());

    #[test]
    fn test_resolve_cli_arg_wins() {
        let source = resolve_config_path(Some("/tmp/override.yaml")).unwrap();
        assert!(matches!(source, ConfigSource::CliArg(_)));
        assert_eq!(source.path(), Path::new("/tmp/override.yaml"));
    }

    #[test]
    fn test_resolve_env_var() {
        let _lock = GLOBAL_STATE.lock().unwrap();
        let _guard = EnvGuard::set(CONFIG_ENV_VAR, "/tmp/env-carver.yaml");
        let source = resolve_config_path(None).unwrap();
        assert!(matches!(source, ConfigSource::EnvVar(_)));
        assert_eq!(source.path(), Path::new("/tmp/env-carver.yaml"));
    }

    #[test]
    fn test_minimal_template_is_valid() {
        let config = parse_config(minimal_config_template()).unwrap();
        assert_eq!(config.carver_kind().unwrap(), CarverKind::Db);
        assert_eq!(config.nodes.len(), 1);
    }

    #[test]
    fn test_defaults_apply_to_empty_document() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.carver, "db");
        assert_eq!(config.carves_dir, PathBuf::from("/var/lib/carver/carves"));
        assert!(config.database.path.is_none());
        assert_eq!(config.s3.region, "us-east-1");
        assert_eq!(config.s3.timeout_secs, 300);
        assert_eq!(config.s3.retry.max_retries, 3);
    }

    #[test]
    fn test_unknown_carver_fails_fast() {
        let err = parse_config("carver: gcs\n").unwrap_err();
        assert!(matches!(err, CarveError::UnknownBackend(ref tag) if tag == "gcs"), "{err}");
    }

    #[test]
    fn test_s3_section_maps_to_storage_config() {
        let config = parse_config(
            "carver: s3\ns3:\n  bucket: carves\n  access_key_id: AK\n  secret_access_key: SK\n  timeout_secs: 12\n",
        )
        .unwrap();
        let storage = config.s3.storage_config();
        assert_eq!(storage.bucket.as_deref(), Some("carves"));
        assert_eq!(storage.timeout, Duration::from_secs(12));
        assert_eq!(storage.region, "us-east-1");
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Path::new("/nonexistent/path/carver.yaml")).unwrap_err();
        assert!(matches!(err, CarveError::Config(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("carver.yaml");
        std::fs::write(&path, "carver: local\ncarves_dir: /srv/carves\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.carver_kind().unwrap(), CarverKind::Local);
        assert_eq!(config.carves_dir, PathBuf::from("/srv/carves"));
    }

    /// RAII guard to set an env var and restore its previous value on drop.
    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, val: &str) -> Self {
            let prev = std::env::var(key).ok();
            std::env::set_var(key, val);
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(v) => std::env::set_var(self.key, v),
                None => std::env::remove_var(self.key),
            }
        }
    }
}
