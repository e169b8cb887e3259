//! Configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: `HOMESTEAD_*` env vars > homestead.toml > legacy env names > defaults.
//!
//! The loaded [`Configuration`] is a plain value: build it once at startup and
//! pass it by reference. Nothing below the binary reads the environment.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::{ReconcileError, ReconcileResult};

/// Conventional Supabase variable names, read as fallbacks.
const LEGACY_VARS: &[(&str, &[&str])] = &[
    ("database.url", &["DATABASE_URL"]),
    ("rest.url", &["SUPABASE_URL", "VITE_SUPABASE_URL"]),
    ("rest.service_role_key", &["SUPABASE_SERVICE_ROLE_KEY"]),
    ("rest.anon_key", &["SUPABASE_ANON_KEY", "VITE_SUPABASE_ANON_KEY"]),
];

const SSL_MODES: &[&str] = &["disable", "allow", "prefer", "require", "verify-ca", "verify-full"];

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Configuration {
    pub database: DatabaseConfig,
    pub rest: RestConfig,
    pub seed: SeedConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. Takes precedence over the discrete fields.
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: String,
    /// libpq-style SSL mode, applied unless the URL carries its own.
    pub sslmode: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: 5432,
            user: None,
            password: None,
            dbname: "postgres".into(),
            sslmode: "require".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RestConfig {
    /// Project base URL, e.g. `https://<ref>.supabase.co`.
    pub url: Option<String>,
    /// Elevated key used for every write.
    pub service_role_key: Option<String>,
    /// Low-privilege key used for read-only verification when present.
    pub anon_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            url: None,
            service_role_key: None,
            anon_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SeedConfig {
    pub table: String,
    /// Number of rows fetched for the verification sample.
    pub sample_size: usize,
    /// Email granted admin rights by the `is_admin()` helper, besides the role claim.
    pub admin_email: Option<String>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            table: "properties".into(),
            sample_size: 3,
            admin_email: None,
        }
    }
}

/// Where the SQL channel connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlTarget {
    Url {
        url: String,
        sslmode: String,
    },
    Fields {
        host: String,
        port: u16,
        user: String,
        password: String,
        dbname: String,
        sslmode: String,
    },
}

impl SqlTarget {
    /// `host:port/dbname`, never including credentials.
    pub fn describe(&self) -> String {
        match self {
            Self::Url { url, .. } => match Url::parse(url) {
                Ok(parsed) => format!(
                    "{}:{}{}",
                    parsed.host_str().unwrap_or("?"),
                    parsed.port().unwrap_or(5432),
                    parsed.path()
                ),
                Err(_) => "<unparseable url>".into(),
            },
            Self::Fields {
                host, port, dbname, ..
            } => format!("{host}:{port}/{dbname}"),
        }
    }
}

/// Where the REST channel sends requests.
#[derive(Debug, Clone)]
pub struct RestTarget {
    pub base_url: Url,
    pub service_role_key: String,
    pub anon_key: Option<String>,
    pub timeout: Duration,
}

impl RestTarget {
    pub fn describe(&self) -> String {
        self.base_url.host_str().unwrap_or("?").to_owned()
    }
}

impl Configuration {
    /// Load configuration from `.env`, `homestead.toml` and the process environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();
        Self::from_env_map(std::env::vars().collect())
    }

    /// Build configuration from an explicit variable map instead of the process
    /// environment.
    pub fn from_env_map(vars: HashMap<String, String>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("database.port", 5432)?
            .set_default("database.dbname", "postgres")?
            .set_default("database.sslmode", "require")?
            .set_default("rest.timeout_secs", 30)?
            .set_default("seed.table", "properties")?
            .set_default("seed.sample_size", 3)?;

        for (key, names) in LEGACY_VARS {
            let legacy = names
                .iter()
                .filter_map(|name| vars.get(*name))
                .find(|value| !value.trim().is_empty());
            if let Some(value) = legacy {
                builder = builder.set_default(*key, value.as_str())?;
            }
        }

        let cfg = builder
            // Optional config file
            .add_source(config::File::with_name("homestead").required(false))
            // Environment variables (HOMESTEAD_DATABASE__URL, HOMESTEAD_REST__SERVICE_ROLE_KEY, etc.)
            .add_source(
                config::Environment::with_prefix("HOMESTEAD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(Some(vars.into_iter().collect())),
            )
            .build()?;

        cfg.try_deserialize()
    }

    /// True when either a database URL or a discrete host is configured.
    pub fn has_sql_credentials(&self) -> bool {
        present(&self.database.url).is_some() || present(&self.database.host).is_some()
    }

    /// Validate and return the SQL connection target.
    pub fn sql_target(&self) -> ReconcileResult<SqlTarget> {
        let db = &self.database;
        let sslmode = db.sslmode.trim().to_ascii_lowercase();
        if !SSL_MODES.contains(&sslmode.as_str()) {
            return Err(ReconcileError::configuration(format!(
                "unknown sslmode '{}' (expected one of {})",
                db.sslmode,
                SSL_MODES.join(", ")
            )));
        }

        if let Some(url) = present(&db.url) {
            let parsed = Url::parse(url).map_err(|e| {
                ReconcileError::configuration(format!("database URL is not a valid URL: {e}"))
            })?;
            if !matches!(parsed.scheme(), "postgres" | "postgresql") {
                return Err(ReconcileError::configuration(format!(
                    "database URL must use the postgres:// scheme, got '{}'",
                    parsed.scheme()
                )));
            }
            if parsed.host_str().is_none_or(str::is_empty) {
                return Err(ReconcileError::configuration("database URL has no host"));
            }
            return Ok(SqlTarget::Url {
                url: url.to_owned(),
                sslmode,
            });
        }

        let mut missing = Vec::new();
        let host = present(&db.host);
        let user = present(&db.user);
        let password = present(&db.password);
        if host.is_none() {
            missing.push("database.host (or database.url)");
        }
        if user.is_none() {
            missing.push("database.user");
        }
        if password.is_none() {
            missing.push("database.password");
        }
        match (host, user, password) {
            (Some(host), Some(user), Some(password)) => Ok(SqlTarget::Fields {
                host: host.to_owned(),
                port: db.port,
                user: user.to_owned(),
                password: password.to_owned(),
                dbname: db.dbname.clone(),
                sslmode,
            }),
            _ => Err(ReconcileError::configuration(format!(
                "missing SQL credentials: {}",
                missing.join(", ")
            ))),
        }
    }

    /// Validate and return the REST gateway target.
    pub fn rest_target(&self) -> ReconcileResult<RestTarget> {
        let rest = &self.rest;
        let (Some(url), Some(key)) = (present(&rest.url), present(&rest.service_role_key)) else {
            let mut missing = Vec::new();
            if present(&rest.url).is_none() {
                missing.push("rest.url");
            }
            if present(&rest.service_role_key).is_none() {
                missing.push("rest.service_role_key");
            }
            return Err(ReconcileError::configuration(format!(
                "missing REST credentials: {}",
                missing.join(", ")
            )));
        };

        let base_url = Url::parse(url).map_err(|e| {
            ReconcileError::configuration(format!("REST URL is not a valid URL: {e}"))
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ReconcileError::configuration(format!(
                "REST URL must be http(s), got '{}'",
                base_url.scheme()
            )));
        }
        if base_url.host_str().is_none() {
            return Err(ReconcileError::configuration("REST URL has no host"));
        }

        Ok(RestTarget {
            base_url,
            service_role_key: key.to_owned(),
            anon_key: present(&rest.anon_key).map(str::to_owned),
            timeout: Duration::from_secs(rest.timeout_secs.max(1)),
        })
    }
}

/// Treat blank strings the same as unset values.
fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
