//! Shared setup for the integration tests: a fake broker wired into a
//! registry, and shortcuts for building endpoints against it.

use std::sync::Arc;

use mqbridge_core::testing::FakeBroker;
use mqbridge_core::{
    ConnectionSource, ConnectionSourceRegistry, EndpointConfig, MessagingFacade, SourcePolicy,
};

pub struct Harness {
    pub broker: Arc<FakeBroker>,
    pub registry: Arc<ConnectionSourceRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            broker: FakeBroker::new(),
            registry: Arc::new(ConnectionSourceRegistry::new()),
        }
    }

    pub async fn source(&self, factory_name: &str, policy: SourcePolicy) -> Arc<ConnectionSource> {
        let resolver = self.broker.factory_resolver();
        self.registry
            .get_or_create(factory_name, resolver.as_ref(), None, policy)
            .await
            .expect("source creation")
    }

    pub fn facade(
        &self,
        source: Arc<ConnectionSource>,
        config: EndpointConfig,
    ) -> Arc<MessagingFacade> {
        Arc::new(
            MessagingFacade::new(source, config, Some(self.broker.destination_resolver()))
                .expect("facade creation"),
        )
    }

    pub async fn simple_facade(
        &self,
        factory_name: &str,
        endpoint_name: &str,
        queue: &str,
        policy: SourcePolicy,
    ) -> Arc<MessagingFacade> {
        let source = self.source(factory_name, policy).await;
        let config = EndpointConfig::new(endpoint_name, factory_name, queue);
        self.facade(source, config)
    }
}
