mod trust_bundle;

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::database::pool::{IdleErrorPolicy, PoolConfig};

pub use trust_bundle::{TrustBundle, TrustBundleError, DEFAULT_CA_BUNDLE_FILE};

const DEFAULT_SESSION_SECRET: &str = "a-weak-default-secret-change-me!";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub endpoint: DatabaseEndpointConfig,
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Development,
    Staging,
    Production,
}

/// Where the database lives and which IAM principal connects to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseEndpointConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    pub region: String,
}

/// Pool tuning. Durations are whole seconds, as in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `None` searches [`TrustBundle::default_locations`].
    pub ca_bundle_path: Option<PathBuf>,
    pub max_connections: usize,
    pub connection_timeout: u64,
    pub acquire_timeout: u64,
    pub query_timeout: u64,
    pub idle_timeout: u64,
    pub idle_check_interval: u64,
    pub shutdown_grace: u64,
    pub idle_error_policy: IdleErrorPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub static_dir: PathBuf,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    pub app_password: String,
    pub session_secret: String,
    pub secure_cookies: bool,
    pub session_ttl_hours: i64,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("app_password", &"<redacted>")
            .field("session_secret", &"<redacted>")
            .field("secure_cookies", &self.secure_cookies)
            .field("session_ttl_hours", &self.session_ttl_hours)
            .finish()
    }
}

impl SecurityConfig {
    pub fn uses_default_secret(&self) -> bool {
        self.session_secret == DEFAULT_SESSION_SECRET
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    ///
    /// Blank values count as unset. Malformed values are errors rather than
    /// silently falling back to a default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let environment = match vars.get("APP_ENV").as_deref() {
            Some("production") | Some("prod") => Environment::Production,
            Some("staging") | Some("stage") => Environment::Staging,
            _ => Environment::Development,
        };

        let endpoint = DatabaseEndpointConfig {
            host: vars.required("RDS_HOSTNAME")?,
            port: vars.parse("RDS_PORT")?.unwrap_or(5432),
            user: vars.required("RDS_IAM_USER")?,
            database: vars.required("RDS_DB_NAME")?,
            region: vars.required("AWS_REGION")?,
        };

        let config = Self {
            environment,
            endpoint,
            database: DatabaseConfig::for_environment(environment),
            server: ServerConfig {
                port: 80,
                static_dir: PathBuf::from("public"),
            },
            security: SecurityConfig {
                app_password: "example".to_string(),
                session_secret: DEFAULT_SESSION_SECRET.to_string(),
                secure_cookies: environment == Environment::Production,
                session_ttl_hours: 24,
            },
        };

        config.with_env_overrides(&vars)
    }

    fn with_env_overrides(mut self, vars: &Vars<'_>) -> Result<Self, ConfigError> {
        // Database overrides
        if let Some(v) = vars.get("RDS_CA_BUNDLE_PATH") {
            self.database.ca_bundle_path = Some(PathBuf::from(v));
        }
        if let Some(v) = vars.parse("DATABASE_MAX_CONNECTIONS")? {
            if v == 0 {
                return Err(ConfigError::Invalid {
                    key: "DATABASE_MAX_CONNECTIONS",
                    value: "0".into(),
                    reason: "pool needs at least one connection".into(),
                });
            }
            self.database.max_connections = v;
        }
        if let Some(v) = vars.parse("DATABASE_CONNECTION_TIMEOUT")? {
            self.database.connection_timeout = v;
        }
        if let Some(v) = vars.parse("DATABASE_ACQUIRE_TIMEOUT")? {
            self.database.acquire_timeout = v;
        }
        if let Some(v) = vars.parse("DATABASE_QUERY_TIMEOUT")? {
            self.database.query_timeout = v;
        }
        if let Some(v) = vars.parse("DATABASE_IDLE_TIMEOUT")? {
            self.database.idle_timeout = v;
        }
        if let Some(v) = vars.parse("DATABASE_IDLE_CHECK_INTERVAL")? {
            self.database.idle_check_interval = v;
        }
        if let Some(v) = vars.parse("DATABASE_SHUTDOWN_GRACE")? {
            self.database.shutdown_grace = v;
        }
        if let Some(v) = vars.parse("DATABASE_IDLE_ERROR_POLICY")? {
            self.database.idle_error_policy = v;
        }

        // Server overrides
        if let Some(v) = vars.parse("PORT")? {
            self.server.port = v;
        }
        if let Some(v) = vars.get("STATIC_DIR") {
            self.server.static_dir = PathBuf::from(v);
        }

        // Security overrides
        if let Some(v) = vars.get("APP_PASSWORD") {
            self.security.app_password = v;
        }
        if let Some(v) = vars.get("SESSION_SECRET") {
            self.security.session_secret = v;
        }

        Ok(self)
    }
}

impl DatabaseConfig {
    fn for_environment(environment: Environment) -> Self {
        let (max_connections, connection_timeout, acquire_timeout, query_timeout) = match environment {
            Environment::Development => (10, 30, 30, 30),
            Environment::Staging => (20, 10, 10, 15),
            Environment::Production => (50, 5, 5, 10),
        };

        Self {
            ca_bundle_path: None,
            max_connections,
            connection_timeout,
            acquire_timeout,
            query_timeout,
            idle_timeout: 10,
            idle_check_interval: 5,
            shutdown_grace: 10,
            idle_error_policy: IdleErrorPolicy::Fatal,
        }
    }

    /// Translate to pool settings; a zero timeout disables that bound.
    pub fn pool_config(&self) -> PoolConfig {
        let bounded = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

        PoolConfig {
            max_connections: self.max_connections,
            connect_timeout: bounded(self.connection_timeout),
            acquire_timeout: bounded(self.acquire_timeout),
            query_timeout: bounded(self.query_timeout),
            idle_timeout: bounded(self.idle_timeout),
            idle_check_interval: Duration::from_secs(self.idle_check_interval.max(1)),
            shutdown_grace: Duration::from_secs(self.shutdown_grace),
            idle_error_policy: self.idle_error_policy,
        }
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        match value.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(e) => Err(ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 4] = [
        ("RDS_HOSTNAME", "db.example.com"),
        ("RDS_IAM_USER", "todo_app"),
        ("RDS_DB_NAME", "todos"),
        ("AWS_REGION", "ap-south-1"),
    ];

    #[test]
    fn test_default_development_config() {
        let config = config_from(&REQUIRED).unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.endpoint.port, 5432);
        assert_eq!(config.server.port, 80);
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.database.idle_error_policy, IdleErrorPolicy::Fatal);
        assert_eq!(config.database.ca_bundle_path, None);
        assert!(!config.security.secure_cookies);
        assert!(config.security.uses_default_secret());
    }

    #[test]
    fn test_production_profile() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("APP_ENV", "production"));
        let config = config_from(&vars).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.database.max_connections, 50);
        assert!(config.security.secure_cookies);
    }

    #[test]
    fn missing_endpoint_field_is_fatal() {
        for (skip, _) in REQUIRED {
            let vars: Vec<_> = REQUIRED.iter().copied().filter(|(k, _)| *k != skip).collect();
            match config_from(&vars) {
                Err(ConfigError::Missing(key)) => assert_eq!(key, skip),
                other => panic!("expected missing {}, got {:?}", skip, other),
            }
        }
    }

    #[test]
    fn blank_value_counts_as_missing() {
        let mut vars = REQUIRED.to_vec();
        vars[0] = ("RDS_HOSTNAME", "   ");
        assert!(matches!(config_from(&vars), Err(ConfigError::Missing("RDS_HOSTNAME"))));
    }

    #[test]
    fn overrides_are_applied() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("RDS_PORT", "6543"),
            ("PORT", "8080"),
            ("RDS_CA_BUNDLE_PATH", "/etc/ssl/rds.pem"),
            ("DATABASE_MAX_CONNECTIONS", "3"),
            ("DATABASE_IDLE_ERROR_POLICY", "evict"),
            ("DATABASE_QUERY_TIMEOUT", "0"),
            ("APP_PASSWORD", "hunter2"),
        ]);
        let config = config_from(&vars).unwrap();
        assert_eq!(config.endpoint.port, 6543);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.ca_bundle_path, Some(PathBuf::from("/etc/ssl/rds.pem")));
        assert_eq!(config.database.idle_error_policy, IdleErrorPolicy::Evict);
        assert_eq!(config.security.app_password, "hunter2");

        let pool = config.database.pool_config();
        assert_eq!(pool.max_connections, 3);
        assert_eq!(pool.query_timeout, None);
        assert_eq!(pool.connect_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("RDS_PORT", "not-a-port"));
        assert!(matches!(
            config_from(&vars),
            Err(ConfigError::Invalid { key: "RDS_PORT", .. })
        ));

        let mut vars = REQUIRED.to_vec();
        vars.push(("DATABASE_MAX_CONNECTIONS", "0"));
        assert!(matches!(
            config_from(&vars),
            Err(ConfigError::Invalid { key: "DATABASE_MAX_CONNECTIONS", .. })
        ));
    }

    #[test]
    fn unknown_idle_policy_is_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("DATABASE_IDLE_ERROR_POLICY", "ignore"));
        assert!(matches!(
            config_from(&vars),
            Err(ConfigError::Invalid { key: "DATABASE_IDLE_ERROR_POLICY", .. })
        ));
    }

    #[test]
    fn security_debug_hides_secrets() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("SESSION_SECRET", "super-secret-value"));
        let config = config_from(&vars).unwrap();
        assert!(!format!("{:?}", config).contains("super-secret-value"));
    }
}
