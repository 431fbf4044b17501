//! Connection configuration.
//!
//! A [`Config`] names a data source and how to reach it. It can be loaded from a JSON
//! file (the file an `init` command writes) or from `DOCMODEL_*` environment variables.

use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

use crate::{
    error::{ModelError, ModelResult},
    registry::{ConnectOptions, DEFAULT_ALIAS},
};

pub const ENV_DATASOURCE: &str = "DOCMODEL_DATASOURCE";
pub const ENV_DATABASE: &str = "DOCMODEL_DATABASE";
pub const ENV_ALIAS: &str = "DOCMODEL_ALIAS";

/// Connection string schemes a [`Config`] may use.
pub const KNOWN_SCHEMES: [&str; 3] = ["mongodb://", "mongodb+srv://", "memory://"];

fn default_connect_timeout() -> u64 {
    30
}

fn default_ping_timeout() -> u64 {
    5
}

/// Connection settings for one alias.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub connection_string: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,
}

impl Config {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            database: None,
            alias: None,
            connect_timeout_secs: default_connect_timeout(),
            ping_timeout_secs: default_ping_timeout(),
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Reads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`] if the file cannot be read or is invalid,
    /// and [`ModelError::Serialization`] if it is not valid JSON.
    pub fn from_file(path: impl AsRef<Path>) -> ModelResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from `DOCMODEL_DATASOURCE`, `DOCMODEL_DATABASE` and
    /// `DOCMODEL_ALIAS`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`] if no data source is set or it is invalid.
    pub fn from_env() -> ModelResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ModelResult<Self> {
        let connection_string = lookup(ENV_DATASOURCE)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ModelError::Configuration(format!("{} is not set", ENV_DATASOURCE)))?;

        let config = Self {
            database: lookup(ENV_DATABASE).filter(|value| !value.is_empty()),
            alias: lookup(ENV_ALIAS).filter(|value| !value.is_empty()),
            ..Self::new(connection_string)
        };
        config.validate()?;
        Ok(config)
    }

    /// Writes this config as pretty JSON.
    pub fn write_file(&self, path: impl AsRef<Path>) -> ModelResult<()> {
        self.validate()?;
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), raw)?;
        Ok(())
    }

    /// Checks the connection string and that a database name can be determined.
    pub fn validate(&self) -> ModelResult<()> {
        let connection_string = self.connection_string.trim();
        if connection_string.is_empty() {
            return Err(ModelError::Configuration("connection string must not be empty".into()));
        }
        if self.scheme().is_none() {
            return Err(ModelError::Configuration(format!(
                "unsupported connection string scheme in `{}`, expected one of {}",
                connection_string,
                KNOWN_SCHEMES.join(", ")
            )));
        }
        self.database_name()?;
        Ok(())
    }

    /// Returns the scheme prefix, e.g. `"memory://"`.
    pub fn scheme(&self) -> Option<&'static str> {
        let connection_string = self.connection_string.trim();
        KNOWN_SCHEMES
            .into_iter()
            .find(|scheme| connection_string.starts_with(scheme))
    }

    /// The explicit database, or the path segment of the connection string.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`] if neither is present.
    pub fn database_name(&self) -> ModelResult<String> {
        if let Some(database) = self.database.as_deref().filter(|db| !db.is_empty()) {
            return Ok(database.to_string());
        }

        let rest = self
            .scheme()
            .and_then(|scheme| self.connection_string.trim().strip_prefix(scheme))
            .unwrap_or_default();
        let path = rest.split_once('/').map(|(_, path)| path).unwrap_or_default();
        let database = path.split(['?', '/']).next().unwrap_or_default();

        if database.is_empty() {
            return Err(ModelError::Configuration(format!(
                "no database name in `{}` and none configured",
                self.connection_string
            )));
        }
        Ok(database.to_string())
    }

    pub fn alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(DEFAULT_ALIAS)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }

    /// Registry options derived from this config.
    pub fn connect_options(&self) -> ModelResult<ConnectOptions> {
        Ok(ConnectOptions::new(self.database_name()?)
            .with_alias(self.alias())
            .with_connect_timeout(self.connect_timeout())
            .with_ping_timeout(self.ping_timeout()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashMap;

    #[rstest]
    #[case("mongodb://localhost:27017/shop", "shop")]
    #[case("mongodb+srv://user:pw@cluster.example.net/shop?retryWrites=true", "shop")]
    #[case("memory://local/testing", "testing")]
    fn test_database_from_connection_string(#[case] dsn: &str, #[case] expected: &str) {
        assert_eq!(Config::new(dsn).database_name().unwrap(), expected);
    }

    #[test]
    fn test_explicit_database_wins() {
        let config = Config::new("mongodb://localhost/shop").with_database("other");
        assert_eq!(config.database_name().unwrap(), "other");
    }

    #[rstest]
    #[case("")]
    #[case("postgres://localhost/shop")]
    #[case("mongodb://localhost:27017")]
    fn test_validate_rejects(#[case] dsn: &str) {
        assert!(matches!(Config::new(dsn).validate(), Err(ModelError::Configuration(_))));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_DATASOURCE, "memory://local"),
            (ENV_DATABASE, "app"),
            (ENV_ALIAS, "primary"),
        ]);
        let config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.database_name().unwrap(), "app");
        assert_eq!(config.alias(), "primary");
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));

        let missing = Config::from_lookup(|_| None);
        assert!(matches!(missing, Err(ModelError::Configuration(_))));
    }

    #[test]
    fn test_file_round_trip_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docmodel.json");

        Config::new("mongodb://localhost/shop")
            .with_alias("main")
            .write_file(&path)
            .unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.alias(), "main");

        let sparse = dir.path().join("sparse.json");
        std::fs::write(&sparse, r#"{"connection_string": "memory://x/db"}"#).unwrap();
        let loaded = Config::from_file(&sparse).unwrap();
        assert_eq!(loaded.ping_timeout_secs, 5);
        assert_eq!(loaded.connect_timeout_secs, 30);
        assert_eq!(loaded.alias(), DEFAULT_ALIAS);
    }
}
