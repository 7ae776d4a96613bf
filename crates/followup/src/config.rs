//! Engine configuration, loaded from environment variables

use std::env;
use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

use crate::engine::DEFAULT_STAFF_ROLE;
use crate::scanner::{DispatcherConfig, ScannerConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} is required")]
    Missing { name: &'static str },

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Configuration for the follow-up worker
#[derive(Debug, Clone)]
pub struct FollowupConfig {
    /// PostgreSQL connection string; required by the worker
    pub database_url: Option<String>,

    pub database_max_connections: u32,

    /// Scan loop and consumer settings
    pub dispatcher: DispatcherConfig,

    /// Webhook that receives dispatch requests; dispatches are only recorded
    /// in memory when unset
    pub notification_webhook_url: Option<String>,

    /// Role notified by staff steps that do not name one
    pub default_staff_role: String,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: 5,
            dispatcher: DispatcherConfig::default(),
            notification_webhook_url: None,
            default_staff_role: DEFAULT_STAFF_ROLE.to_string(),
        }
    }
}

impl FollowupConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `DATABASE_MAX_CONNECTIONS`: pool size (default: 5)
    /// - `FOLLOWUP_SCAN_INTERVAL_MS`: time between scans (default: 30000)
    /// - `FOLLOWUP_SCAN_BATCH_SIZE`: instances per scan (default: 100)
    /// - `FOLLOWUP_SCAN_TENANT`: only scan this tenant (default: all)
    /// - `FOLLOWUP_MAX_CONCURRENCY`: concurrent executor runs (default: 10)
    /// - `FOLLOWUP_QUEUE_CAPACITY`: job channel capacity (default: 1000)
    /// - `NOTIFICATION_WEBHOOK_URL`: notification webhook (default: none)
    /// - `FOLLOWUP_DEFAULT_STAFF_ROLE`: default staff role (default: followup_coordinator)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        let dispatcher_defaults = DispatcherConfig::default();

        let scan_interval_ms: u64 = parse_or(
            &var,
            "FOLLOWUP_SCAN_INTERVAL_MS",
            dispatcher_defaults.scan_interval.as_millis() as u64,
        )?;
        let batch_size: u32 = parse_or(
            &var,
            "FOLLOWUP_SCAN_BATCH_SIZE",
            dispatcher_defaults.scanner.batch_size,
        )?;
        let max_concurrency: usize = parse_or(
            &var,
            "FOLLOWUP_MAX_CONCURRENCY",
            dispatcher_defaults.max_concurrency,
        )?;
        let queue_capacity: usize = parse_or(
            &var,
            "FOLLOWUP_QUEUE_CAPACITY",
            dispatcher_defaults.queue_capacity,
        )?;
        let tenant: Option<Uuid> = parse_optional(&var, "FOLLOWUP_SCAN_TENANT")?;

        let mut dispatcher = DispatcherConfig::default()
            .with_scan_interval(Duration::from_millis(scan_interval_ms))
            .with_scanner(ScannerConfig::default().with_batch_size(batch_size))
            .with_max_concurrency(max_concurrency)
            .with_queue_capacity(queue_capacity);
        if let Some(tenant) = tenant {
            dispatcher = dispatcher.with_tenant(tenant);
        }

        Ok(Self {
            database_url: var("DATABASE_URL"),
            database_max_connections: parse_or(
                &var,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            dispatcher,
            notification_webhook_url: var("NOTIFICATION_WEBHOOK_URL"),
            default_staff_role: var("FOLLOWUP_DEFAULT_STAFF_ROLE")
                .unwrap_or(defaults.default_staff_role),
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_dispatcher(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher = config;
        self
    }

    pub fn with_notification_webhook(mut self, url: impl Into<String>) -> Self {
        self.notification_webhook_url = Some(url.into());
        self
    }

    pub fn with_default_staff_role(mut self, role: impl Into<String>) -> Self {
        self.default_staff_role = role.into();
        self
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing {
                name: "DATABASE_URL",
            })
    }
}

fn parse_optional<T, F>(var: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    var(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { name, value })
        })
        .transpose()
}

fn parse_or<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_optional(var, name)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FollowupConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.database_max_connections, 5);
        assert_eq!(config.dispatcher.scan_interval, Duration::from_secs(30));
        assert_eq!(config.dispatcher.scanner.batch_size, 100);
        assert_eq!(config.default_staff_role, "followup_coordinator");
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn test_overrides() {
        let tenant = Uuid::now_v7();
        let tenant_str = tenant.to_string();
        let config = FollowupConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/steward"),
            ("FOLLOWUP_SCAN_INTERVAL_MS", "500"),
            ("FOLLOWUP_SCAN_BATCH_SIZE", "25"),
            ("FOLLOWUP_SCAN_TENANT", tenant_str.as_str()),
            ("FOLLOWUP_MAX_CONCURRENCY", "4"),
            ("NOTIFICATION_WEBHOOK_URL", "https://hooks.example.org/notify"),
            ("FOLLOWUP_DEFAULT_STAFF_ROLE", "pastor"),
        ]))
        .unwrap();

        assert_eq!(
            config.require_database_url().unwrap(),
            "postgres://localhost/steward"
        );
        assert_eq!(config.dispatcher.scan_interval, Duration::from_millis(500));
        assert_eq!(config.dispatcher.scanner.batch_size, 25);
        assert_eq!(config.dispatcher.tenant_id, Some(tenant));
        assert_eq!(config.dispatcher.max_concurrency, 4);
        assert_eq!(config.default_staff_role, "pastor");
        assert!(config.notification_webhook_url.is_some());
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let result = FollowupConfig::from_lookup(lookup(&[("FOLLOWUP_SCAN_BATCH_SIZE", "lots")]));
        assert_eq!(
            result.unwrap_err(),
            ConfigError::Invalid {
                name: "FOLLOWUP_SCAN_BATCH_SIZE",
                value: "lots".to_string()
            }
        );
    }
}
