use serde::Deserialize;
use std::path::Path;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRIP__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub drip: DripConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Settings consumed by the delivery pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct DripConfig {
    /// Sender address used when a campaign specifies none.
    #[serde(default)]
    pub from_email: Option<String>,
    /// Name of the registered email builder strategy.
    #[serde(default = "default_email_builder")]
    pub email_builder: String,
    /// Keep sending to the remaining candidates after a per-user failure.
    #[serde(default)]
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_schedule_enabled")]
    pub enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

fn default_node_id() -> String {
    "drip-01".to_string()
}
fn default_email_builder() -> String {
    "standard".to_string()
}
fn default_schedule_enabled() -> bool {
    true
}
fn default_interval_secs() -> u64 {
    86_400
}

impl Default for DripConfig {
    fn default() -> Self {
        Self {
            from_email: None,
            email_builder: default_email_builder(),
            continue_on_error: false,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: default_schedule_enabled(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            drip: DripConfig::default(),
            schedule: ScheduleConfig::default(),
        }
    }
}

impl DripConfig {
    pub fn with_from_email(mut self, address: impl Into<String>) -> Self {
        self.from_email = Some(address.into());
        self
    }
}

impl AppConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, overridden by
    /// environment variables.
    pub fn load_from(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        tracing::debug!(file = ?path, "Loading configuration");
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("DRIP")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
