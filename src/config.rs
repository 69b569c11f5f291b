//! Environment-driven configuration for the agent and the orchestrator
//!
//! Both binaries read their settings once at startup through `from_env()`.
//! The parsing itself goes through `from_lookup()` so tests can feed a map
//! instead of mutating the process environment (which races under the
//! parallel test runner).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Default agent listen port
pub const DEFAULT_AGENT_PORT: u16 = 3000;

/// Default orchestrator listen port
pub const DEFAULT_ORCHESTRATOR_PORT: u16 = 8080;

/// Default xray configuration path on endpoint servers
pub const DEFAULT_XRAY_CONFIG_PATH: &str = "/usr/local/etc/xray/config.json";

/// Default per-(owner, server) credential quota
pub const DEFAULT_KEY_QUOTA: usize = 2;

/// Main health loop period
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Rapid (down-set only) health loop period
pub const DEFAULT_RAPID_INTERVAL: Duration = Duration::from_secs(30);

/// Liveness probe timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum time between two alerts for the same server
pub const DEFAULT_ALERT_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("required setting {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Parameters embedded in every connection URI handed out by an agent
#[derive(Debug, Clone, PartialEq)]
pub struct RealityParams {
    /// Public address clients connect to
    pub host: String,
    pub port: u16,
    /// Reality public key (`pbk`)
    pub public_key: String,
    /// Reality server name (`sni`)
    pub sni: String,
}

/// Settings of the provisioning agent running on one endpoint server
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub listen_port: u16,
    /// Shared secret the orchestrator presents as a bearer token
    pub token: String,
    pub xray_config_path: PathBuf,
    pub ledger_path: String,
    /// systemd unit restarted after every config mutation
    pub xray_unit: String,
    /// Binary queried for the version reported by `/health-check`
    pub xray_binary: String,
    /// Display name prefix for issued credentials (`<server_name>_<n>`)
    pub server_name: String,
    pub reality: RealityParams,
}

impl AgentConfig {
    /// Load agent settings from the process environment
    ///
    /// Variables (defaults in parentheses):
    /// - PORT (3000)
    /// - TOKEN (required)
    /// - XRAY_CONFIG_PATH (/usr/local/etc/xray/config.json)
    /// - KEYFLEET_LEDGER_PATH (keys.db)
    /// - KEYFLEET_XRAY_UNIT (xray), KEYFLEET_XRAY_BINARY (xray)
    /// - SERVER_NAME (MainServer)
    /// - SERVER_IP, SERVER_PORT (443), REALITY_PUBLIC_KEY, REALITY_SERVER_NAME
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        Ok(AgentConfig {
            listen_port: env.parse_or("PORT", DEFAULT_AGENT_PORT)?,
            token: env.required("TOKEN")?,
            xray_config_path: PathBuf::from(
                env.string_or("XRAY_CONFIG_PATH", DEFAULT_XRAY_CONFIG_PATH),
            ),
            ledger_path: env.string_or("KEYFLEET_LEDGER_PATH", "keys.db"),
            xray_unit: env.string_or("KEYFLEET_XRAY_UNIT", "xray"),
            xray_binary: env.string_or("KEYFLEET_XRAY_BINARY", "xray"),
            server_name: env.string_or("SERVER_NAME", "MainServer"),
            reality: RealityParams {
                host: env.string_or("SERVER_IP", ""),
                port: env.parse_or("SERVER_PORT", 443)?,
                public_key: env.string_or("REALITY_PUBLIC_KEY", ""),
                sni: env.string_or("REALITY_SERVER_NAME", ""),
            },
        })
    }
}

/// Health monitor timing
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    pub rapid_interval: Duration,
    pub probe_timeout: Duration,
    pub alert_cooldown: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: DEFAULT_CHECK_INTERVAL,
            rapid_interval: DEFAULT_RAPID_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            alert_cooldown: DEFAULT_ALERT_COOLDOWN,
        }
    }
}

/// Where outage/recovery notifications go
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotifyConfig {
    pub recipients: Vec<String>,
    pub webhook_url: Option<String>,
    pub telegram_bot_token: Option<String>,
}

/// Settings of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub listen_port: u16,
    /// Bearer token required on the orchestrator API
    pub api_token: String,
    pub database_path: String,
    pub key_quota: usize,
    /// Serialize issue requests per (owner, server) so concurrent requests
    /// cannot overshoot the quota
    pub strict_quota: bool,
    /// Requester ids allowed to revoke credentials they do not own
    pub admin_ids: Vec<String>,
    /// Optional JSON file of servers upserted into the directory at startup
    pub servers_file: Option<PathBuf>,
    pub monitor: MonitorConfig,
    pub notify: NotifyConfig,
}

impl OrchestratorConfig {
    /// Load orchestrator settings from the process environment
    ///
    /// Variables (defaults in parentheses):
    /// - KEYFLEET_ORCHESTRATOR_PORT (8080)
    /// - KEYFLEET_API_TOKEN (required)
    /// - DATABASE_PATH (data/orchestrator.db)
    /// - KEYFLEET_KEY_QUOTA (2), KEYFLEET_STRICT_QUOTA (false)
    /// - KEYFLEET_ADMIN_IDS (comma separated, empty)
    /// - KEYFLEET_SERVERS_FILE (unset)
    /// - HEALTH_CHECK_INTERVAL (300s), HEALTH_CHECK_RAPID_INTERVAL (30s)
    /// - KEYFLEET_PROBE_TIMEOUT (10s), KEYFLEET_ALERT_COOLDOWN (86400s)
    /// - KEYFLEET_NOTIFY_RECIPIENTS, KEYFLEET_NOTIFY_WEBHOOK_URL, BOT_TOKEN
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let quota: usize = env.parse_or("KEYFLEET_KEY_QUOTA", DEFAULT_KEY_QUOTA)?;
        if quota == 0 {
            return Err(ConfigError::Invalid {
                name: "KEYFLEET_KEY_QUOTA",
                value: "0".to_string(),
            });
        }

        Ok(OrchestratorConfig {
            listen_port: env.parse_or("KEYFLEET_ORCHESTRATOR_PORT", DEFAULT_ORCHESTRATOR_PORT)?,
            api_token: env.required("KEYFLEET_API_TOKEN")?,
            database_path: env.string_or("DATABASE_PATH", "data/orchestrator.db"),
            key_quota: quota,
            strict_quota: env.flag("KEYFLEET_STRICT_QUOTA"),
            admin_ids: env.list("KEYFLEET_ADMIN_IDS"),
            servers_file: env.optional("KEYFLEET_SERVERS_FILE").map(PathBuf::from),
            monitor: MonitorConfig {
                check_interval: env.seconds_or("HEALTH_CHECK_INTERVAL", DEFAULT_CHECK_INTERVAL),
                rapid_interval: env
                    .seconds_or("HEALTH_CHECK_RAPID_INTERVAL", DEFAULT_RAPID_INTERVAL),
                probe_timeout: env.seconds_or("KEYFLEET_PROBE_TIMEOUT", DEFAULT_PROBE_TIMEOUT),
                alert_cooldown: env.seconds_or("KEYFLEET_ALERT_COOLDOWN", DEFAULT_ALERT_COOLDOWN),
            },
            notify: NotifyConfig {
                recipients: env.list("KEYFLEET_NOTIFY_RECIPIENTS"),
                webhook_url: env.optional("KEYFLEET_NOTIFY_WEBHOOK_URL"),
                telegram_bot_token: env.optional("BOT_TOKEN"),
            },
        })
    }

    /// Whether `requester` may act on credentials owned by someone else
    pub fn is_admin(&self, requester: &str) -> bool {
        self.admin_ids.iter().any(|id| id == requester)
    }
}

/// Thin typed view over a variable lookup function
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// Non-empty value of `name`, trimmed
    fn optional(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.optional(name).ok_or(ConfigError::Missing(name))
    }

    fn string_or(&self, name: &str, default: &str) -> String {
        self.optional(name).unwrap_or_else(|| default.to_string())
    }

    fn parse_or<T: std::str::FromStr>(
        &self,
        name: &'static str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.optional(name) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value }),
        }
    }

    fn flag(&self, name: &str) -> bool {
        self.optional(name)
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false)
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.optional(name)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whole seconds; unparsable or < 1 falls back to the default
    fn seconds_or(&self, name: &str, default: Duration) -> Duration {
        match self.optional(name).and_then(|v| v.parse::<u64>().ok()) {
            Some(secs) if secs >= 1 => Duration::from_secs(secs),
            _ => default,
        }
    }
}
