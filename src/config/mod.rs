use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "desktop-api.toml";
const ENV_PREFIX: &str = "DESKTOP_API_";
const MAX_TRANSPORT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Bounded wait applied to every broadcast and unicast send.
    pub timeout_ms: u64,
    pub discover_message: String,
    pub attach_message: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            discover_message: "SkypeControlAPIDiscover".to_string(),
            attach_message: "SkypeControlAPIAttach".to_string(),
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connect_wait_secs: u64,
    pub negotiate_protocol: bool,
    pub protocol_version: u32,
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_wait_secs: 30,
            negotiate_protocol: true,
            protocol_version: 8,
            event_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from(&active_config_path())
    }

    /// Runs before logging is initialised, so problems are returned rather
    /// than logged. A missing file means defaults; a malformed one is fatal.
    pub fn load_from(config_path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = match fs::read_to_string(config_path) {
            Ok(raw) => toml::from_str::<Config>(&raw).map_err(|err| {
                format!("invalid config file {}: {err}", config_path.display())
            })?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Transport settings
        if let Ok(val) = env::var(format!("{}TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(timeout) = val.parse() {
                self.transport.timeout_ms = timeout;
            }
        }
        if let Ok(val) = env::var(format!("{}DISCOVER_MESSAGE", ENV_PREFIX)) {
            self.transport.discover_message = val;
        }
        if let Ok(val) = env::var(format!("{}ATTACH_MESSAGE", ENV_PREFIX)) {
            self.transport.attach_message = val;
        }

        // Client settings
        if let Ok(val) = env::var(format!("{}CONNECT_WAIT_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.client.connect_wait_secs = secs;
            }
        }
        if let Ok(val) = env::var(format!("{}NEGOTIATE_PROTOCOL", ENV_PREFIX)) {
            self.client.negotiate_protocol = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}PROTOCOL_VERSION", ENV_PREFIX)) {
            if let Ok(version) = val.parse() {
                self.client.protocol_version = version;
            }
        }

        // Logging
        if let Ok(val) = env::var(format!("{}LOG", ENV_PREFIX)) {
            self.logging.filter = val;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.transport.timeout_ms == 0 {
            return Err("transport.timeout_ms must be non-zero".into());
        }
        if self.transport.timeout_ms > MAX_TRANSPORT_TIMEOUT_MS {
            return Err(format!(
                "transport.timeout_ms must be <= {MAX_TRANSPORT_TIMEOUT_MS}"
            )
            .into());
        }
        if self.transport.discover_message.trim().is_empty() {
            return Err("transport.discover_message must be set".into());
        }
        if self.transport.attach_message.trim().is_empty() {
            return Err("transport.attach_message must be set".into());
        }
        if self.transport.discover_message == self.transport.attach_message {
            return Err("transport.discover_message and attach_message must differ".into());
        }
        if self.client.connect_wait_secs == 0 {
            return Err("client.connect_wait_secs must be non-zero".into());
        }
        if self.client.negotiate_protocol && self.client.protocol_version == 0 {
            return Err(
                "client.protocol_version must be >= 1 when client.negotiate_protocol = true".into(),
            );
        }
        if self.client.event_buffer == 0 {
            return Err("client.event_buffer must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err(format!("{CONFIG_FILE} already exists").into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join("DesktopApi").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
