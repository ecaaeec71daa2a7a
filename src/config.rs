use std::time::Duration;

use serde::Deserialize;

use crate::Error;

pub const IDEMPOTENCY_TTL_ENV: &str = "ADVISOR_ADMIN_IDEMPOTENCY_TTL_SECS";
pub const DATABASE_URL_ENV: &str = "ADVISOR_ADMIN_DATABASE_URL";

/// Default lifetime of an idempotency record.
pub const DEFAULT_IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Connection parameters of the postgres event store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseParams {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub pass: String,
    pub database: String,
}

impl DatabaseParams {
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            &self.user,
            &self.pass,
            &self.host,
            self.port.unwrap_or(5432),
            &self.database
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// How long an idempotency key stays bound to its first payload. `None` keeps keys forever.
    #[serde(with = "optional_secs")]
    pub idempotency_ttl: Option<Duration>,
    /// Full connection string; takes precedence over `database`.
    pub database_url: Option<String>,
    pub database: Option<DatabaseParams>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            idempotency_ttl: Some(DEFAULT_IDEMPOTENCY_TTL),
            database_url: None,
            database: None,
        }
    }
}

impl Settings {
    /// Reads the settings from the environment, falling back to the defaults for unset variables.
    ///
    /// A TTL of `0` disables expiration.
    ///
    /// # Errors
    ///
    /// Will return an `Err` if the TTL variable is not an integer.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut settings = Self::default();

        if let Some(raw) = lookup(IDEMPOTENCY_TTL_ENV) {
            let secs: u64 = raw
                .trim()
                .parse()
                .map_err(|_| Error::validation(format!("{} must be a number of seconds, got `{}`", IDEMPOTENCY_TTL_ENV, raw)))?;
            settings.idempotency_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        settings.database_url = lookup(DATABASE_URL_ENV);

        Ok(settings)
    }

    pub fn postgres_url(&self) -> Option<String> {
        self.database_url
            .clone()
            .or_else(|| self.database.as_ref().map(DatabaseParams::postgres_url))
    }

    pub(crate) fn idempotency_ttl(&self) -> Option<chrono::Duration> {
        self.idempotency_ttl
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
