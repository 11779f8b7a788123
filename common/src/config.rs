// Configuration management with layered configuration (file, env)

use crate::lifecycle::LifecycleConfig;
use crate::reconcile::ReconcilerConfig;
use crate::retry::FixedDelay;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub aws: AwsConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub reconciler: ReconcilerSettings,
    pub seeder: SeederConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    /// Override endpoint, e.g. a local DynamoDB
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub group_name: String,
    pub target_arn: String,
    pub role_arn: String,
    #[serde(default)]
    pub dead_letter_arn: Option<String>,
    pub timezone: String,
    pub max_event_retries: u32,
    pub rate_limit_backoff_ms: u64,
    pub max_rate_limit_retries: u32,
    pub max_conflict_fallbacks: u32,
}

impl SchedulerConfig {
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            rate_limit: FixedDelay::new(
                Duration::from_millis(self.rate_limit_backoff_ms),
                self.max_rate_limit_retries,
            ),
            max_conflict_fallbacks: self.max_conflict_fallbacks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Dynamodb,
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub table_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,
    /// Stream carrying schedule change notifications
    pub stream_name: String,
    /// Subject the audit bridge publishes envelopes on
    pub subject: String,
    /// Durable consumer name for reconcilers
    pub consumer_name: String,
    /// Maximum age for messages in the stream (in seconds)
    pub max_age_seconds: u64,
    /// Maximum number of delivery attempts
    pub max_deliver: i64,
    /// Maximum notifications handed to the reconciler at once
    pub batch_size: usize,
    /// How long to wait for a batch to fill up
    pub batch_window_ms: u64,
    /// Ceiling on batches processed concurrently
    pub max_concurrent_batches: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerSettings {
    pub pacing_ms: u64,
}

impl ReconcilerSettings {
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            pacing: Duration::from_millis(self.pacing_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeederConfig {
    pub schedule_count: usize,
    pub name_prefix: String,
    pub first_fire_offset_minutes: i64,
    pub update_fire_offset_minutes: i64,
    pub wait_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let defaults = Config::try_from(&Settings::default())?;

        let builder = Config::builder()
            // Start with built-in defaults
            .add_source(defaults)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.aws.region.is_empty() {
            return Err("AWS region cannot be empty".to_string());
        }

        if self.scheduler.group_name.is_empty() {
            return Err("Scheduler group_name cannot be empty".to_string());
        }
        if self.scheduler.group_name.contains('#') {
            return Err("Scheduler group_name cannot contain '#'".to_string());
        }
        if crate::schedule::parse_timezone(Some(&self.scheduler.timezone)).is_err() {
            return Err(format!(
                "Scheduler timezone '{}' is not a valid IANA timezone",
                self.scheduler.timezone
            ));
        }
        if self.scheduler.max_event_retries > crate::models::MAX_EVENT_RETRIES_LIMIT {
            return Err(format!(
                "Scheduler max_event_retries must be at most {}",
                crate::models::MAX_EVENT_RETRIES_LIMIT
            ));
        }

        if self.store.table_name.is_empty() {
            return Err("Store table_name cannot be empty".to_string());
        }
        if self.store.backend == StoreBackend::Postgres && self.database.url.is_empty() {
            return Err("Database URL cannot be empty for the postgres store".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.stream_name.is_empty() {
            return Err("NATS stream_name cannot be empty".to_string());
        }
        if self.nats.batch_size == 0 {
            return Err("NATS batch_size must be greater than 0".to_string());
        }
        if self.nats.max_concurrent_batches == 0 {
            return Err("NATS max_concurrent_batches must be greater than 0".to_string());
        }

        if self.seeder.schedule_count < 2 {
            return Err("Seeder schedule_count must be at least 2".to_string());
        }

        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            aws: AwsConfig {
                region: "us-east-1".to_string(),
                endpoint_url: None,
            },
            scheduler: SchedulerConfig {
                group_name: "one-shot-schedules".to_string(),
                target_arn: "arn:aws:sqs:us-east-1:000000000000:schedule-target".to_string(),
                role_arn: "arn:aws:iam::000000000000:role/scheduler-invoke".to_string(),
                dead_letter_arn: None,
                timezone: "UTC".to_string(),
                max_event_retries: 5,
                rate_limit_backoff_ms: 5_000,
                max_rate_limit_retries: 3,
                max_conflict_fallbacks: 3,
            },
            store: StoreConfig {
                backend: StoreBackend::Dynamodb,
                table_name: "schedule-state".to_string(),
            },
            database: DatabaseConfig {
                url: "postgresql://localhost/schedule_state".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stream_name: "SCHEDULE_CHANGES".to_string(),
                subject: "schedules.changes.>".to_string(),
                consumer_name: "schedule-reconciler".to_string(),
                max_age_seconds: 86400, // 24 hours
                max_deliver: 10,
                batch_size: 100,
                batch_window_ms: 5_000,
                max_concurrent_batches: 2,
            },
            reconciler: ReconcilerSettings { pacing_ms: 100 },
            seeder: SeederConfig {
                schedule_count: 3,
                name_prefix: "demo-schedule".to_string(),
                first_fire_offset_minutes: 10,
                update_fire_offset_minutes: 20,
                wait_seconds: 5,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validation_catches_bad_timezone() {
        let mut settings = Settings::default();
        settings.scheduler.timezone = "Not/AZone".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_group_with_separator() {
        let mut settings = Settings::default();
        settings.scheduler.group_name = "a#b".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validation_catches_zero_batch_size() {
        let mut settings = Settings::default();
        settings.nats.batch_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_postgres_backend_requires_database_url() {
        let mut settings = Settings::default();
        settings.store.backend = StoreBackend::Postgres;
        settings.database.url = String::new();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "[store]\nbackend = \"memory\"\ntable_name = \"local-state\"\n\n[reconciler]\npacing_ms = 5\n",
        )
        .unwrap();

        let settings = Settings::load_from_path(dir.path()).unwrap();
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.store.table_name, "local-state");
        assert_eq!(settings.reconciler.pacing_ms, 5);
        // Untouched sections keep their defaults
        assert_eq!(settings.nats.batch_size, 100);
    }

    #[test]
    fn test_lifecycle_config_from_settings() {
        let settings = Settings::default();
        let lifecycle = settings.scheduler.lifecycle_config();
        assert_eq!(lifecycle.max_conflict_fallbacks, 3);
        assert_eq!(lifecycle.rate_limit, FixedDelay::default());
    }
}
