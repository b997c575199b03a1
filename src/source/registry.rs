//! Process-wide registry of connection sources, keyed by logical
//! connection-factory name.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{EndpointConfig, SourcePolicy};
use crate::error::{BridgeError, Result};
use crate::provider::{ConnectionFactoryResolver, CredentialResolver, Credentials};
use crate::source::connection_source::ConnectionSource;

/// Map plus creation lock shared between the registry and its sources, so a
/// source can remove itself on final close under the same lock the registry
/// creates under.
///
/// Lock order is always registry lock first, then source state. Both
/// `get_or_create` and `ConnectionSource::close` follow it.
pub(crate) struct RegistryShared {
    pub(crate) map: DashMap<String, Arc<ConnectionSource>>,
    pub(crate) lock: Mutex<()>,
}

/// Registry of [`ConnectionSource`]s. One instance per process is the
/// intended deployment, but nothing prevents scoped registries in tests.
pub struct ConnectionSourceRegistry {
    shared: Arc<RegistryShared>,
}

impl ConnectionSourceRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                map: DashMap::new(),
                lock: Mutex::new(()),
            }),
        }
    }

    /// Look up or create the source for `name` and take a reference on it.
    ///
    /// Creation and the reference-count increment happen under one registry
    /// lock, so a concurrent first use cannot create two sources and a
    /// concurrent `close` cannot observe the count before the increment.
    pub async fn get_or_create(
        &self,
        name: &str,
        resolver: &dyn ConnectionFactoryResolver,
        credentials: Option<Credentials>,
        policy: SourcePolicy,
    ) -> Result<Arc<ConnectionSource>> {
        let _guard = self.shared.lock.lock().await;

        if let Some(existing) = self.shared.map.get(name) {
            let source = Arc::clone(existing.value());
            drop(existing);
            source.increase_references().await;
            let references = source.reference_count().await;
            debug!(source = name, references, "Reusing existing connection source");
            return Ok(source);
        }

        let factory = resolver.lookup(name).await.map_err(|e| {
            BridgeError::connection(format!(
                "could not look up connection factory [{name}]: {e}"
            ))
        })?;

        let source = Arc::new(ConnectionSource::new(
            name,
            factory,
            credentials,
            policy,
            Arc::clone(&self.shared),
        ));
        source.increase_references().await;
        self.shared.map.insert(name.to_string(), Arc::clone(&source));
        info!(source = name, "Created connection source");
        Ok(source)
    }

    /// Endpoint-level entry point: resolves the endpoint's auth alias to
    /// credentials before taking a reference on the source for its
    /// connection-factory name. An alias that does not resolve is a
    /// configuration error, fatal to this endpoint at setup time.
    pub async fn get_or_create_for_endpoint(
        &self,
        config: &EndpointConfig,
        factory_resolver: &dyn ConnectionFactoryResolver,
        credential_resolver: Option<&dyn CredentialResolver>,
        policy: SourcePolicy,
    ) -> Result<Arc<ConnectionSource>> {
        let credentials = match &config.auth_alias {
            Some(alias) => {
                let resolver = credential_resolver.ok_or_else(|| {
                    BridgeError::configuration(
                        &config.name,
                        format!("auth alias [{alias}] is set but no credential resolver is available"),
                    )
                })?;
                let credentials = resolver.resolve(alias).ok_or_else(|| {
                    BridgeError::configuration(
                        &config.name,
                        format!("auth alias [{alias}] does not resolve to credentials"),
                    )
                })?;
                Some(credentials)
            }
            None => None,
        };
        self.get_or_create(
            &config.connection_factory_name,
            factory_resolver,
            credentials,
            policy,
        )
        .await
    }

    /// Source currently registered under `name`, without taking a reference.
    pub fn get(&self, name: &str) -> Option<Arc<ConnectionSource>> {
        self.shared.map.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shared.map.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.shared.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.map.is_empty()
    }
}

impl Default for ConnectionSourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
