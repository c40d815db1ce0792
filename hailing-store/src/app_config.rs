use hailing_core::EscalationPolicy;
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub outbox: OutboxConfig,
    #[serde(default)]
    pub subscriber: SubscriberConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub fare: FareConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub backend: StoreBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: String::new(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    Memory,
    Kafka,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    pub backend: BusBackend,
    #[serde(default)]
    pub brokers: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
}

fn default_topic() -> String { "hailing.events".into() }
fn default_group_id() -> String { "hailing-node".into() }

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            brokers: String::new(),
            topic: default_topic(),
            group_id: default_group_id(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutboxConfig {
    pub poll_interval_ms: u64,
    pub max_messages: usize,
    pub topic_prefixes: Vec<String>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            max_messages: 100,
            topic_prefixes: hailing_shared::topics::DEFAULT_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl OutboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterPolicy {
    /// Log and acknowledge
    Discard,
    /// Persist into the dead-letter table, then acknowledge
    Store,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SubscriberConfig {
    pub workers: usize,
    pub max_delivery_attempts: u32,
    pub dead_letter: DeadLetterPolicy,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            max_delivery_attempts: 5,
            dead_letter: DeadLetterPolicy::Discard,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    pub escalation_interval_ms: u64,
    pub attempts_per_tier: u32,
    pub price_increment: i64,
    pub radius_minutes: Vec<i32>,
    pub meters_per_minute: f64,
    pub offer_timeout_ms: u64,
    pub idle_attempt_limit: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let escalation = EscalationPolicy::default();
        Self {
            escalation_interval_ms: 10_000,
            attempts_per_tier: escalation.attempts_per_tier,
            price_increment: escalation.price_increment,
            radius_minutes: escalation.radius_minutes,
            meters_per_minute: escalation.meters_per_minute,
            offer_timeout_ms: 10_000,
            idle_attempt_limit: 3,
        }
    }
}

impl DispatchConfig {
    pub fn escalation_policy(&self) -> Result<EscalationPolicy, ConfigError> {
        EscalationPolicy::new(
            self.attempts_per_tier,
            self.price_increment,
            self.radius_minutes.clone(),
            self.meters_per_minute,
        )
        .map_err(|e| ConfigError::Invalid(format!("dispatch: {}", e)))
    }

    pub fn escalation_interval(&self) -> Duration {
        Duration::from_millis(self.escalation_interval_ms)
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }
}

/// Parameters of the built-in straight-line fare
#[derive(Debug, Deserialize, Clone)]
pub struct FareConfig {
    pub base_fare: i64,
    pub per_kilometer: i64,
    pub average_speed_kmh: f64,
}

impl Default for FareConfig {
    fn default() -> Self {
        Self {
            base_fare: 4800,
            per_kilometer: 1000,
            average_speed_kmh: 30.0,
        }
    }
}

/// `HAILING__<SECTION>__<KEY>`, e.g. `HAILING__DISPATCH__ESCALATION_INTERVAL_MS=5000`
fn environment() -> config::Environment {
    config::Environment::with_prefix("HAILING").separator("__")
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // not checked in
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(environment())
            .build()?;

        let config: Config = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let s = config::Config::builder()
            .add_source(config::File::from_str(contents, config::FileFormat::Toml))
            .build()?;

        let config: Config = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            return Err(ConfigError::Invalid("database.url is required for the postgres backend".into()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database.max_connections must be positive".into()));
        }
        if self.bus.backend == BusBackend::Kafka && self.bus.brokers.is_empty() {
            return Err(ConfigError::Invalid("bus.brokers is required for the kafka backend".into()));
        }
        if self.bus.topic.is_empty() {
            return Err(ConfigError::Invalid("bus.topic must not be empty".into()));
        }
        if self.outbox.poll_interval_ms == 0 || self.outbox.max_messages == 0 {
            return Err(ConfigError::Invalid("outbox.poll_interval_ms and outbox.max_messages must be positive".into()));
        }
        if self.outbox.topic_prefixes.is_empty() {
            return Err(ConfigError::Invalid("outbox.topic_prefixes must not be empty".into()));
        }
        if self.subscriber.workers == 0 {
            return Err(ConfigError::Invalid("subscriber.workers must be positive".into()));
        }
        if self.subscriber.max_delivery_attempts == 0 {
            return Err(ConfigError::Invalid("subscriber.max_delivery_attempts must be positive".into()));
        }
        if self.dispatch.escalation_interval_ms == 0 {
            return Err(ConfigError::Invalid("dispatch.escalation_interval_ms must be positive".into()));
        }
        if self.dispatch.idle_attempt_limit == 0 {
            return Err(ConfigError::Invalid("dispatch.idle_attempt_limit must be positive".into()));
        }
        self.dispatch.escalation_policy()?;
        if self.fare.base_fare < 0 || self.fare.per_kilometer < 0 || !(self.fare.average_speed_kmh > 0.0) {
            return Err(ConfigError::Invalid("fare parameters must be positive".into()));
        }
        Ok(())
    }
}
