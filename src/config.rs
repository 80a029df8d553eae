//! Application configuration and environment resolution.
//!
//! The dashboard talks to one of three brokers depending on the selected
//! [`Environment`]: the real factory (`live`), a local broker fed by the replay
//! engine (`replay`) or a local sandbox (`mock`). Everything that differs per
//! environment lives in an [`EnvironmentConfig`] section of the TOML file and
//! is turned into an immutable [`ConnectionDescriptor`] at switch time.
//!
//! Missing configuration is never fatal: [`AppConfig::load`] falls back to the
//! built-in defaults with a warning so the dashboard stays usable.

use color_eyre::{eyre::eyre, Result};
use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "aps-bus";
const CONFIG_FILE: &str = "config.toml";

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Broker environment the session client is pointed at.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Live,
    Replay,
    Mock,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Live, Environment::Replay, Environment::Mock];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Live => "live",
            Environment::Replay => "replay",
            Environment::Mock => "mock",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Environment {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "live" => Ok(Environment::Live),
            "replay" => Ok(Environment::Replay),
            "mock" => Ok(Environment::Mock),
            other => Err(eyre!(
                "Unknown environment '{}', expected one of live, replay, mock",
                other
            )),
        }
    }
}

/// Broker settings for one environment as they appear in the config file.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EnvironmentConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id_prefix: String,
    pub keepalive_secs: u64,
    pub tls: bool,
    pub clean_session: bool,
    pub default_qos: u8,
    pub connect_timeout_ms: u64,
    /// Register the `monitor/status` last will for this connection
    pub last_will: bool,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id_prefix: "aps-bus".to_string(),
            keepalive_secs: 60,
            tls: false,
            clean_session: true,
            default_qos: 1,
            connect_timeout_ms: 5_000,
            last_will: true,
        }
    }
}

/// One section per environment tag.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Environments {
    pub live: EnvironmentConfig,
    pub replay: EnvironmentConfig,
    pub mock: EnvironmentConfig,
}

impl Default for Environments {
    fn default() -> Self {
        Self {
            live: EnvironmentConfig {
                host: "192.168.0.100".to_string(),
                port: 1883,
                username: Some("default".to_string()),
                password: Some("default".to_string()),
                client_id_prefix: "aps-dashboard".to_string(),
                ..Default::default()
            },
            replay: EnvironmentConfig {
                host: "localhost".to_string(),
                port: 1884,
                client_id_prefix: "aps-replay".to_string(),
                ..Default::default()
            },
            mock: EnvironmentConfig {
                host: "localhost".to_string(),
                port: 1883,
                client_id_prefix: "aps-mock".to_string(),
                ..Default::default()
            },
        }
    }
}

impl Environments {
    pub fn get(&self, env: Environment) -> &EnvironmentConfig {
        match env {
            Environment::Live => &self.live,
            Environment::Replay => &self.replay,
            Environment::Mock => &self.mock,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    pub max_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RefreshConfig {
    pub debounce_ms: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { debounce_ms: 500 }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    pub queue_capacity: usize,
    /// Rolling limit for SQLite stores, unlimited when absent
    pub max_rows: Option<u64>,
    pub prune_every: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            max_rows: None,
            prune_every: 500,
        }
    }
}

/// Top level configuration file.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub default_environment: Environment,
    /// Directory holding `topics/*.toml` and `templates/*.toml`
    pub registry_dir: PathBuf,
    pub buffers: BufferConfig,
    pub refresh: RefreshConfig,
    pub recorder: RecorderConfig,
    pub environments: Environments,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_environment: Environment::Live,
            registry_dir: PathBuf::from("registry"),
            buffers: BufferConfig::default(),
            refresh: RefreshConfig::default(),
            recorder: RecorderConfig::default(),
            environments: Environments::default(),
        }
    }
}

impl AppConfig {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| {
                warn!("Could not determine config directory, using current directory");
                PathBuf::from(".")
            });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads the config from `path` or the default location.
    ///
    /// A missing file yields defaults, a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !path.exists() {
            warn!(
                "Config file {} does not exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Writes the default config when no file exists yet.
    pub fn ensure_default(path: Option<&Path>) -> Result<PathBuf> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if path.exists() {
            return Ok(path);
        }

        info!("Creating default configuration at {}", path.display());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
        std::fs::write(&path, content)
            .map_err(|e| eyre!("Failed to write config file {}: {}", path.display(), e))?;
        Ok(path)
    }

    pub fn descriptor(&self, env: Environment) -> ConnectionDescriptor {
        resolve(env, self)
    }
}

/// Immutable connection parameters handed to the session client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub environment: Environment,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keepalive: Duration,
    pub tls: bool,
    pub clean_session: bool,
    pub default_qos: QoS,
    pub connect_timeout: Duration,
    pub last_will: bool,
}

impl ConnectionDescriptor {
    /// Descriptor for a local broker, mostly useful for tools and tests.
    pub fn local(host: &str, port: u16) -> Self {
        let cfg = EnvironmentConfig {
            host: host.to_string(),
            port,
            last_will: false,
            ..Default::default()
        };
        from_section(Environment::Mock, &cfg)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.username {
            Some(user) => write!(f, "{}@{} ({})", user, self.address(), self.environment),
            None => write!(f, "{} ({})", self.address(), self.environment),
        }
    }
}

/// Maps an environment tag to a connection descriptor with a fresh client id.
pub fn resolve(env: Environment, config: &AppConfig) -> ConnectionDescriptor {
    from_section(env, config.environments.get(env))
}

fn from_section(env: Environment, section: &EnvironmentConfig) -> ConnectionDescriptor {
    let default_qos = qos_from_u8(section.default_qos).unwrap_or_else(|| {
        warn!(
            "Invalid default_qos {} for {}, falling back to 1",
            section.default_qos, env
        );
        QoS::AtLeastOnce
    });

    ConnectionDescriptor {
        environment: env,
        host: section.host.clone(),
        port: section.port,
        username: section.username.clone(),
        password: section.password.clone(),
        client_id: next_client_id(&section.client_id_prefix),
        keepalive: Duration::from_secs(section.keepalive_secs.max(5)),
        tls: section.tls,
        clean_session: section.clean_session,
        default_qos,
        connect_timeout: Duration::from_millis(section.connect_timeout_ms),
        last_will: section.last_will,
    }
}

fn next_client_id(prefix: &str) -> String {
    let n = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", prefix, std::process::id(), n)
}

pub fn qos_from_u8(value: u8) -> Option<QoS> {
    match value {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

pub fn qos_to_u8(qos: QoS) -> u8 {
    match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 1,
        QoS::ExactlyOnce => 2,
    }
}
