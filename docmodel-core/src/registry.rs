//! Alias-keyed registry of live store connections.

use std::{collections::HashMap, sync::Arc, time::Duration};

use mea::rwlock::RwLock;

use crate::{
    backend::{Namespace, StoreBackend, StoreBackendBuilder},
    error::{ModelError, ModelResult},
};

/// Alias used when neither the call nor the schema names one.
pub const DEFAULT_ALIAS: &str = "default";

/// Default bound on establishing a connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on a liveness ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A live backend plus the database name used when a call does not override it.
#[derive(Debug, Clone)]
pub struct Connection {
    backend: Arc<dyn StoreBackend>,
    database: String,
}

impl Connection {
    pub fn new(backend: Arc<dyn StoreBackend>, database: impl Into<String>) -> Self {
        Self {
            backend,
            database: database.into(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Addresses `collection` in this connection's default database.
    pub fn namespace(&self, collection: impl Into<String>) -> Namespace {
        Namespace::new(self.database.clone(), collection)
    }
}

/// Settings for [`ConnectionRegistry::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub alias: String,
    pub database: String,
    pub connect_timeout: Duration,
    pub ping_timeout: Duration,
}

impl ConnectOptions {
    /// Options for `database` under the default alias with default timeouts.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            alias: DEFAULT_ALIAS.to_string(),
            database: database.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }
}

/// Maps aliases to live connections.
///
/// Shared through [`ModelContext`](crate::context::ModelContext); reads take a shared
/// lock, connect and disconnect take the exclusive one.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    ping_timeout: Option<Duration>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry whose [`ping`](Self::ping) uses `timeout`.
    pub fn with_ping_timeout(timeout: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            ping_timeout: Some(timeout),
        }
    }

    /// Builds a backend, checks it answers a ping and registers it under
    /// `options.alias`, replacing any previous connection with that alias.
    ///
    /// # Errors
    ///
    /// * [`ModelError::Configuration`] for an empty alias or database name
    /// * [`ModelError::Timeout`] when building or pinging exceeds its bound
    /// * whatever the builder or the ping returns
    pub async fn connect<B>(&self, builder: B, options: ConnectOptions) -> ModelResult<Connection>
    where
        B: StoreBackendBuilder,
    {
        if options.alias.trim().is_empty() {
            return Err(ModelError::Configuration("connection alias must not be empty".into()));
        }
        if options.database.trim().is_empty() {
            return Err(ModelError::Configuration(format!(
                "no database name given for connection `{}`",
                options.alias
            )));
        }

        let backend = tokio::time::timeout(options.connect_timeout, builder.build())
            .await
            .map_err(|_| {
                ModelError::Timeout(format!(
                    "connecting `{}` took longer than {:?}",
                    options.alias, options.connect_timeout
                ))
            })??;
        let backend: Arc<dyn StoreBackend> = Arc::new(backend);

        ping_within(backend.as_ref(), &options.alias, options.ping_timeout).await?;

        Ok(self.register(options.alias, backend, options.database).await)
    }

    /// Registers an already built backend without pinging it.
    pub async fn register(
        &self,
        alias: impl Into<String>,
        backend: Arc<dyn StoreBackend>,
        database: impl Into<String>,
    ) -> Connection {
        let alias = alias.into();
        let connection = Connection::new(backend, database);

        let previous = self
            .connections
            .write()
            .await
            .insert(alias.clone(), connection.clone());

        tracing::info!(alias = %alias, database = %connection.database, "connection registered");

        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous.backend, &connection.backend) {
                if let Err(err) = previous.backend.shutdown().await {
                    tracing::warn!(alias = %alias, error = %err, "failed to shut down replaced connection");
                }
            }
        }

        connection
    }

    /// Returns the connection registered under `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::Configuration`] if no such alias is registered.
    pub async fn get(&self, alias: &str) -> ModelResult<Connection> {
        self.connections
            .read()
            .await
            .get(alias)
            .cloned()
            .ok_or_else(|| ModelError::Configuration(format!("no connection registered under alias `{}`", alias)))
    }

    pub async fn contains(&self, alias: &str) -> bool {
        self.connections.read().await.contains_key(alias)
    }

    pub async fn aliases(&self) -> Vec<String> {
        let mut aliases: Vec<String> = self.connections.read().await.keys().cloned().collect();
        aliases.sort();
        aliases
    }

    /// Pings the connection under `alias` within the registry's ping bound.
    pub async fn ping(&self, alias: &str) -> ModelResult<()> {
        let connection = self.get(alias).await?;
        ping_within(
            connection.backend.as_ref(),
            alias,
            self.ping_timeout.unwrap_or(DEFAULT_PING_TIMEOUT),
        )
        .await
    }

    /// Removes and shuts down the connection under `alias`.
    ///
    /// Disconnecting an unknown alias is a no-op.
    pub async fn disconnect(&self, alias: &str) -> ModelResult<()> {
        let removed = self.connections.write().await.remove(alias);
        if let Some(connection) = removed {
            connection.backend.shutdown().await?;
            tracing::info!(alias = %alias, "connection closed");
        }
        Ok(())
    }

    /// Shuts down every connection and empties the registry.
    ///
    /// Every connection is closed even if some fail; the first failure is returned.
    pub async fn close_all(&self) -> ModelResult<()> {
        let drained: Vec<(String, Connection)> = self.connections.write().await.drain().collect();
        let mut first_error = None;

        for (alias, connection) in drained {
            match connection.backend.shutdown().await {
                Ok(()) => tracing::info!(alias = %alias, "connection closed"),
                Err(err) => {
                    tracing::error!(alias = %alias, error = %err, "failed to close connection");
                    first_error.get_or_insert(err);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

async fn ping_within(backend: &dyn StoreBackend, alias: &str, bound: Duration) -> ModelResult<()> {
    tokio::time::timeout(bound, backend.ping())
        .await
        .map_err(|_| ModelError::Timeout(format!("ping on `{}` took longer than {:?}", alias, bound)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChangeStream, IndexDefinition, ReturnDocument, StoreSession, UpdateOutcome};
    use async_trait::async_trait;
    use bson::{Bson, Document};

    #[derive(Debug)]
    struct Unreachable {
        delay: Duration,
    }

    #[async_trait]
    impl StoreBackend for Unreachable {
        async fn ping(&self) -> ModelResult<()> {
            tokio::time::sleep(self.delay).await;
            Ok(())
        }

        async fn aggregate(&self, _: &Namespace, _: Vec<Document>, _: Option<&mut dyn StoreSession>) -> ModelResult<Vec<Document>> {
            Ok(Vec::new())
        }

        async fn insert_many(&self, _: &Namespace, _: Vec<Document>, _: Option<&mut dyn StoreSession>) -> ModelResult<Vec<Bson>> {
            Ok(Vec::new())
        }

        async fn update(&self, _: &Namespace, _: Document, _: Document, _: bool, _: bool, _: Option<&mut dyn StoreSession>) -> ModelResult<UpdateOutcome> {
            Ok(UpdateOutcome::default())
        }

        async fn replace_one(&self, _: &Namespace, _: Document, _: Document, _: bool, _: Option<&mut dyn StoreSession>) -> ModelResult<UpdateOutcome> {
            Ok(UpdateOutcome::default())
        }

        async fn delete(&self, _: &Namespace, _: Document, _: bool, _: Option<&mut dyn StoreSession>) -> ModelResult<u64> {
            Ok(0)
        }

        async fn find_one_and_update(&self, _: &Namespace, _: Document, _: Document, _: ReturnDocument, _: bool, _: Option<&mut dyn StoreSession>) -> ModelResult<Option<Document>> {
            Ok(None)
        }

        async fn find_one_and_replace(&self, _: &Namespace, _: Document, _: Document, _: ReturnDocument, _: bool, _: Option<&mut dyn StoreSession>) -> ModelResult<Option<Document>> {
            Ok(None)
        }

        async fn find_one_and_delete(&self, _: &Namespace, _: Document, _: Option<&mut dyn StoreSession>) -> ModelResult<Option<Document>> {
            Ok(None)
        }

        async fn watch(&self, _: &Namespace, _: Vec<Document>) -> ModelResult<ChangeStream> {
            Err(ModelError::Watch("unsupported".into()))
        }

        async fn start_session(&self) -> ModelResult<Box<dyn StoreSession>> {
            Err(ModelError::Session("unsupported".into()))
        }

        async fn create_index(&self, _: &Namespace, _: IndexDefinition) -> ModelResult<()> {
            Ok(())
        }

        async fn drop_collection(&self, _: &Namespace) -> ModelResult<()> {
            Ok(())
        }
    }

    struct Builder(Duration);

    #[async_trait]
    impl StoreBackendBuilder for Builder {
        type Backend = Unreachable;

        async fn build(self) -> ModelResult<Unreachable> {
            Ok(Unreachable { delay: self.0 })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_times_out_on_slow_ping() {
        let registry = ConnectionRegistry::new();
        let result = registry
            .connect(Builder(Duration::from_secs(60)), ConnectOptions::new("app"))
            .await;

        assert!(matches!(result, Err(ModelError::Timeout(_))));
        assert!(!registry.contains(DEFAULT_ALIAS).await);
    }

    #[tokio::test]
    async fn test_connect_get_disconnect() {
        let registry = ConnectionRegistry::new();
        registry
            .connect(Builder(Duration::ZERO), ConnectOptions::new("app").with_alias("main"))
            .await
            .unwrap();

        let connection = registry.get("main").await.unwrap();
        assert_eq!(connection.database(), "app");
        assert_eq!(connection.namespace("users"), Namespace::new("app", "users"));
        assert!(registry.ping("main").await.is_ok());

        registry.disconnect("main").await.unwrap();
        assert!(matches!(registry.get("main").await, Err(ModelError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_database() {
        let registry = ConnectionRegistry::new();
        let result = registry
            .connect(Builder(Duration::ZERO), ConnectOptions::new(" "))
            .await;

        assert!(matches!(result, Err(ModelError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        for alias in ["a", "b"] {
            registry
                .register(alias, Arc::new(Unreachable { delay: Duration::ZERO }), "db")
                .await;
        }
        assert_eq!(registry.aliases().await, vec!["a".to_string(), "b".to_string()]);

        registry.close_all().await.unwrap();
        assert!(registry.aliases().await.is_empty());
    }
}
