use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "chatline.toml",
    "config/chatline.toml",
    "crates/config/chatline.toml",
    "../chatline.toml",
    "../config/chatline.toml",
    "../crates/config/chatline.toml",
];

/// Upper bound on consecutive reconnection attempts of the push channel.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub push: PushConfig,
    pub typing: TypingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "ApiConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl ApiConfig {
    const fn default_request_timeout() -> u64 {
        30
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000/api".to_string(),
            request_timeout_seconds: Self::default_request_timeout(),
        }
    }
}

/// Push channel endpoint and its fixed-delay reconnection policy.
///
/// ```
/// use chatline_config::PushConfig;
///
/// let push = PushConfig::default();
/// assert_eq!(push.reconnect_attempts, 5);
/// assert_eq!(push.reconnect_delay_ms, 1000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    pub url: String,
    #[serde(default = "PushConfig::default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "PushConfig::default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on one websocket handshake attempt.
    #[serde(default = "PushConfig::default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

impl PushConfig {
    const fn default_reconnect_attempts() -> u32 {
        MAX_RECONNECT_ATTEMPTS
    }

    const fn default_reconnect_delay() -> u64 {
        1000
    }

    const fn default_connect_timeout() -> u64 {
        20_000
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/ws".to_string(),
            reconnect_attempts: Self::default_reconnect_attempts(),
            reconnect_delay_ms: Self::default_reconnect_delay(),
            connect_timeout_ms: Self::default_connect_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingConfig {
    #[serde(default = "TypingConfig::default_expiry")]
    pub expiry_ms: u64,
    #[serde(default = "TypingConfig::default_emit_interval")]
    pub emit_interval_ms: u64,
}

impl TypingConfig {
    const fn default_expiry() -> u64 {
        3000
    }

    const fn default_emit_interval() -> u64 {
        1000
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }

    pub fn emit_interval(&self) -> Duration {
        Duration::from_millis(self.emit_interval_ms)
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            expiry_ms: Self::default_expiry(),
            emit_interval_ms: Self::default_emit_interval(),
        }
    }
}

fn clamp_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Load the client configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use chatline_config::load;
///
/// std::env::remove_var("CHATLINE_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.api.base_url.is_empty());
/// ```
pub fn load() -> anyhow::Result<ClientConfig> {
    let defaults = ClientConfig::default();

    let mut builder = config::Config::builder()
        .set_default("api.base_url", defaults.api.base_url.clone())?
        .set_default(
            "api.request_timeout_seconds",
            clamp_to_i64(defaults.api.request_timeout_seconds),
        )?
        .set_default("push.url", defaults.push.url.clone())?
        .set_default(
            "push.reconnect_attempts",
            i64::from(defaults.push.reconnect_attempts),
        )?
        .set_default(
            "push.reconnect_delay_ms",
            clamp_to_i64(defaults.push.reconnect_delay_ms),
        )?
        .set_default(
            "push.connect_timeout_ms",
            clamp_to_i64(defaults.push.connect_timeout_ms),
        )?
        .set_default("typing.expiry_ms", clamp_to_i64(defaults.typing.expiry_ms))?
        .set_default(
            "typing.emit_interval_ms",
            clamp_to_i64(defaults.typing.emit_interval_ms),
        )?;

    let environment_overrides = config::Environment::with_prefix("CHATLINE").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("CHATLINE_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via CHATLINE_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let mut config = cfg
        .try_deserialize::<ClientConfig>()
        .context("invalid configuration")?;

    if config.push.reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
        warn!(
            requested = config.push.reconnect_attempts,
            "reconnect attempts capped at {MAX_RECONNECT_ATTEMPTS}"
        );
        config.push.reconnect_attempts = MAX_RECONNECT_ATTEMPTS;
    }

    if config.push.connect_timeout_ms == 0 {
        warn!("push connect timeout must be positive, using default");
        config.push.connect_timeout_ms = defaults.push.connect_timeout_ms;
    }

    if config.typing.expiry_ms == 0 {
        warn!("typing expiry must be positive, using default");
        config.typing.expiry_ms = defaults.typing.expiry_ms;
    }

    debug!(?config, "loaded client configuration");
    Ok(config)
}
