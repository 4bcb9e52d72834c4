use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Bundled development secrets. Refused outside development so a
/// deployment cannot silently verify webhooks against a public value.
const DEV_GATEWAY_SECRET: &str = "dev_gateway_secret_do_not_use_in_production";
const DEV_WEBHOOK_SECRET: &str = "dev_carrier_webhook_secret_do_not_use_in_production";

/// Payment gateway connection settings
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySettings {
    /// Base URL of the gateway REST API
    #[serde(default = "default_gateway_base_url")]
    pub base_url: String,

    /// Merchant account identifier issued by the gateway
    #[serde(default = "default_gateway_merchant_id")]
    pub merchant_id: String,

    /// Shared secret for request and callback digests
    #[serde(default = "default_gateway_secret")]
    pub secret: String,

    /// URL the shopper's browser returns to after payment
    #[serde(default = "default_gateway_return_url")]
    pub return_url: String,

    /// URL the gateway posts server-to-server confirmations to
    #[serde(default = "default_gateway_postback_url")]
    pub postback_url: String,

    /// HTTP timeout for gateway calls (seconds)
    #[serde(default = "default_external_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            base_url: default_gateway_base_url(),
            merchant_id: default_gateway_merchant_id(),
            secret: default_gateway_secret(),
            return_url: default_gateway_return_url(),
            postback_url: default_gateway_postback_url(),
            timeout_secs: default_external_timeout_secs(),
        }
    }
}

/// Carrier API and webhook settings
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CarrierSettings {
    /// Carrier identifier recorded on shipments
    #[serde(default = "default_carrier_name")]
    pub name: String,

    /// Base URL of the carrier REST API
    #[serde(default = "default_carrier_base_url")]
    pub base_url: String,

    /// API key sent on outbound carrier calls
    #[serde(default = "default_carrier_api_key")]
    pub api_key: String,

    /// Warehouse sender name printed on waybills
    #[serde(default = "default_sender_name")]
    pub sender_name: String,

    /// Warehouse pickup address
    #[serde(default = "default_sender_address")]
    pub sender_address: String,

    /// HTTP timeout for carrier calls (seconds)
    #[serde(default = "default_external_timeout_secs")]
    pub timeout_secs: u64,

    /// HMAC secret for first-generation webhook payloads
    #[serde(default = "default_webhook_secret")]
    pub webhook_secret_v1: String,

    /// HMAC secret for second-generation webhook payloads
    #[serde(default = "default_webhook_secret")]
    pub webhook_secret_v2: String,

    /// Accepted clock skew for signed webhook timestamps (seconds)
    #[serde(default = "default_webhook_tolerance_secs")]
    pub webhook_tolerance_secs: u64,
}

impl Default for CarrierSettings {
    fn default() -> Self {
        Self {
            name: default_carrier_name(),
            base_url: default_carrier_base_url(),
            api_key: default_carrier_api_key(),
            sender_name: default_sender_name(),
            sender_address: default_sender_address(),
            timeout_secs: default_external_timeout_secs(),
            webhook_secret_v1: default_webhook_secret(),
            webhook_secret_v2: default_webhook_secret(),
            webhook_tolerance_secs: default_webhook_tolerance_secs(),
        }
    }
}

/// Customer notification sink settings
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationSettings {
    /// Webhook URL notifications are posted to. When unset,
    /// notifications are logged instead of delivered.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// HTTP timeout for notification delivery (seconds)
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_notification_timeout_secs(),
        }
    }
}

/// Reconciliation sweep settings
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconciliationSettings {
    /// Seconds between sweep firings
    #[serde(default = "default_poller_interval_secs")]
    pub poller_interval_secs: u64,

    /// Minutes a payment may sit awaiting confirmation before the
    /// sweep starts asking the gateway about it
    #[serde(default = "default_grace_minutes")]
    pub grace_minutes: i64,

    /// Only payments created within this many days are swept
    #[serde(default = "default_recency_days")]
    pub recency_days: i64,

    /// Hours after which an unconfirmed payment is written off
    #[serde(default = "default_awaiting_timeout_hours")]
    pub awaiting_timeout_hours: i64,

    /// Hours a delivered order rests before auto-completion
    #[serde(default = "default_completion_hours")]
    pub completion_hours: i64,

    /// Maximum candidates pulled per sweep
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: u64,

    /// Pause between gateway inquiries within a sweep (milliseconds)
    #[serde(default = "default_inter_request_delay_ms")]
    pub inter_request_delay_ms: u64,

    /// Restrict sweeps to a local-time window
    #[serde(default)]
    pub business_hours_only: bool,

    /// First hour (inclusive) of the sweep window
    #[serde(default = "default_business_hours_start")]
    pub business_hours_start: u32,

    /// Last hour (exclusive) of the sweep window
    #[serde(default = "default_business_hours_end")]
    pub business_hours_end: u32,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            poller_interval_secs: default_poller_interval_secs(),
            grace_minutes: default_grace_minutes(),
            recency_days: default_recency_days(),
            awaiting_timeout_hours: default_awaiting_timeout_hours(),
            completion_hours: default_completion_hours(),
            sweep_batch: default_sweep_batch(),
            inter_request_delay_ms: default_inter_request_delay_ms(),
            business_hours_only: false,
            business_hours_start: default_business_hours_start(),
            business_hours_end: default_business_hours_end(),
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(custom = "validate_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// Hours a processed-event marker is kept for duplicate detection
    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: i64,

    /// Seconds between outbox worker polls
    #[serde(default = "default_outbox_poll_secs")]
    pub outbox_poll_secs: u64,

    /// Comma-separated list of allowed CORS origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow any origin even outside development
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// Send credentials on CORS responses (only with explicit origins)
    #[serde(default)]
    pub cors_allow_credentials: bool,

    /// Payment gateway settings
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Carrier settings
    #[serde(default)]
    pub carrier: CarrierSettings,

    /// Notification sink settings
    #[serde(default)]
    pub notifications: NotificationSettings,

    /// Reconciliation sweep settings
    #[serde(default)]
    pub reconciliation: ReconciliationSettings,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything beyond the
    /// essentials. Used by tests and tooling; production goes through
    /// [`load_config`].
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: default_true_bool(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            idempotency_ttl_hours: default_idempotency_ttl_hours(),
            outbox_poll_secs: default_outbox_poll_secs(),
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            cors_allow_credentials: false,
            gateway: GatewaySettings::default(),
            carrier: CarrierSettings::default(),
            notifications: NotificationSettings::default(),
            reconciliation: ReconciliationSettings::default(),
        }
    }

    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Permissive CORS is acceptable in development, or when the
    /// operator explicitly opted in.
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.is_development() {
            if self.gateway.secret.trim() == DEV_GATEWAY_SECRET {
                let mut err = ValidationError::new("gateway_secret_default_dev");
                err.message = Some(
                    "The bundled development gateway secret must not be used outside development. Set APP__GATEWAY__SECRET to the value issued by the gateway."
                        .into(),
                );
                errors.add("gateway.secret", err);
            }

            if self.carrier.webhook_secret_v1.trim() == DEV_WEBHOOK_SECRET
                || self.carrier.webhook_secret_v2.trim() == DEV_WEBHOOK_SECRET
            {
                let mut err = ValidationError::new("carrier_webhook_secret_default_dev");
                err.message = Some(
                    "The bundled development carrier webhook secret must not be used outside development. Set APP__CARRIER__WEBHOOK_SECRET_V1 and APP__CARRIER__WEBHOOK_SECRET_V2."
                        .into(),
                );
                errors.add("carrier.webhook_secret", err);
            }
        }

        let recon = &self.reconciliation;
        if recon.business_hours_only
            && (recon.business_hours_start >= recon.business_hours_end
                || recon.business_hours_end > 24)
        {
            let mut err = ValidationError::new("business_hours_window");
            err.message = Some(
                "business_hours_start must be before business_hours_end, and the end at most 24"
                    .into(),
            );
            errors.add("reconciliation.business_hours", err);
        }

        if self.idempotency_ttl_hours <= 0 {
            let mut err = ValidationError::new("idempotency_ttl_hours");
            err.message = Some("idempotency_ttl_hours must be positive".into());
            errors.add("idempotency_ttl_hours", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true_bool() -> bool {
    true
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    256
}

fn default_idempotency_ttl_hours() -> i64 {
    720 // 30 days
}

fn default_outbox_poll_secs() -> u64 {
    2
}

fn default_gateway_base_url() -> String {
    "https://sandbox.gateway.example/api/v2".to_string()
}
fn default_gateway_merchant_id() -> String {
    "DEMO_MERCHANT".to_string()
}
fn default_gateway_secret() -> String {
    DEV_GATEWAY_SECRET.to_string()
}
fn default_gateway_return_url() -> String {
    "http://localhost:8080/api/v1/payments/return".to_string()
}
fn default_gateway_postback_url() -> String {
    "http://localhost:8080/api/v1/payments/postback".to_string()
}

fn default_external_timeout_secs() -> u64 {
    10
}

fn default_carrier_name() -> String {
    "fastline".to_string()
}
fn default_carrier_base_url() -> String {
    "https://sandbox.carrier.example/v1".to_string()
}
fn default_carrier_api_key() -> String {
    "dev_carrier_api_key".to_string()
}
fn default_sender_name() -> String {
    "Orderflow Warehouse".to_string()
}
fn default_sender_address() -> String {
    "1 Depot Road".to_string()
}
fn default_webhook_secret() -> String {
    DEV_WEBHOOK_SECRET.to_string()
}
fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_notification_timeout_secs() -> u64 {
    5
}

fn default_poller_interval_secs() -> u64 {
    300
}
fn default_grace_minutes() -> i64 {
    15
}
fn default_recency_days() -> i64 {
    30
}
fn default_awaiting_timeout_hours() -> i64 {
    72
}
fn default_completion_hours() -> i64 {
    72
}
fn default_sweep_batch() -> u64 {
    100
}
fn default_inter_request_delay_ms() -> u64 {
    250
}
fn default_business_hours_start() -> u32 {
    8
}
fn default_business_hours_end() -> u32 {
    20
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_event_channel_capacity(capacity: usize) -> Result<(), ValidationError> {
    if capacity == 0 {
        let mut err = ValidationError::new("event_channel_capacity");
        err.message = Some("event_channel_capacity must be greater than 0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("orderflow_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Docker config (config/docker.toml) if DOCKER env var is set
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://orderflow.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false));

    if env::var("DOCKER").is_ok() {
        info!("Docker environment detected");
        builder =
            builder.add_source(File::with_name(&format!("{}/docker", CONFIG_DIR)).required(false));
    }

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(environment: &str) -> AppConfig {
        AppConfig::new(
            "sqlite://orderflow.db?mode=memory".into(),
            "127.0.0.1".into(),
            8080,
            environment.into(),
        )
    }

    #[test]
    fn development_accepts_bundled_secrets() {
        let cfg = base_config("development");
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_rejects_bundled_secrets() {
        let cfg = base_config("production");
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors.errors().contains_key("gateway.secret"));
        assert!(errors.errors().contains_key("carrier.webhook_secret"));
    }

    #[test]
    fn production_passes_with_real_secrets() {
        let mut cfg = base_config("production");
        cfg.gateway.secret = "s3cr3t-from-the-gateway-portal".into();
        cfg.carrier.webhook_secret_v1 = "v1-secret".into();
        cfg.carrier.webhook_secret_v2 = "v2-secret".into();
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn business_hours_window_must_be_ordered() {
        let mut cfg = base_config("development");
        cfg.reconciliation.business_hours_only = true;
        cfg.reconciliation.business_hours_start = 20;
        cfg.reconciliation.business_hours_end = 8;
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.reconciliation.business_hours_start = 8;
        cfg.reconciliation.business_hours_end = 20;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn idempotency_ttl_must_be_positive() {
        let mut cfg = base_config("development");
        cfg.idempotency_ttl_hours = 0;
        assert!(cfg.validate_additional_constraints().is_err());
    }
}
