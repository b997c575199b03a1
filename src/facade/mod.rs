//! # Messaging Facade
//!
//! Uniform send/consume surface over one endpoint: resolves and caches
//! destinations, applies the correlation-id transform, sets typed headers
//! and properties, and hides the queue/topic split and the legacy
//! wire-protocol switch from everything above it.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{
    CorrelationIdPolicy, DeliveryMode, DestinationKind, EndpointConfig, SubscriberKind,
};
use crate::error::{BridgeError, Result};
use crate::provider::{
    Consumer, DestinationHandle, DestinationResolver, OutboundMessage, Producer, PropertyValue,
};
use crate::source::{ConnectionSource, SessionHandle};

/// What an application hands the facade to send. Headers left at their
/// defaults stay provider-default on the wire.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub payload: String,
    pub message_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    /// 0..=9, -1 = not set.
    pub priority: i32,
    /// 0 = use the endpoint default.
    pub ttl_ms: u64,
    pub reply_to: Option<DestinationHandle>,
    pub properties: HashMap<String, PropertyValue>,
}

impl Default for MessageEnvelope {
    fn default() -> Self {
        Self {
            payload: String::new(),
            message_type: None,
            delivery_mode: DeliveryMode::NotSet,
            priority: -1,
            ttl_ms: 0,
            reply_to: None,
            properties: HashMap::new(),
        }
    }
}

impl MessageEnvelope {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            ..Self::default()
        }
    }
}

/// Apply the endpoint's correlation-id policy: right-truncate to the
/// configured maximum keeping the tail, then replace every character after
/// the prefix by its lowercase hex code point.
///
/// The length cap counts the characters after the prefix (the whole id when
/// unprefixed) and a capped id always comes out carrying the prefix. The
/// hex step only fires on ids that carry the prefix; anything else passes
/// through untouched.
///
/// Pure function, applied exactly once per send.
pub fn transform_correlation_id(id: &str, policy: &CorrelationIdPolicy) -> String {
    let mut cid = id.to_string();

    if let Some(max_length) = policy.max_length {
        let prefix_len = if cid.starts_with(&policy.prefix) {
            policy.prefix.len()
        } else {
            0
        };
        let tail: Vec<char> = cid[prefix_len..].chars().collect();
        if tail.len() > max_length {
            let kept: String = tail[tail.len() - max_length..].iter().collect();
            debug!(
                correlation_id = id,
                truncated = %kept,
                "Correlation id exceeds maximum length, keeping tail"
            );
            cid = format!("{}{kept}", policy.prefix);
        }
    }

    if policy.to_hex && cid.starts_with(&policy.prefix) {
        let hex: String = cid[policy.prefix.len()..]
            .chars()
            .map(|c| format!("{:x}", c as u32))
            .collect();
        cid = format!("{}{hex}", policy.prefix);
    }

    cid
}

/// Send/consume surface bound to one endpoint configuration and its
/// connection source.
pub struct MessagingFacade {
    source: Arc<ConnectionSource>,
    config: EndpointConfig,
    destination_resolver: Option<Arc<dyn DestinationResolver>>,
    destinations: DashMap<String, DestinationHandle>,
}

impl MessagingFacade {
    pub fn new(
        source: Arc<ConnectionSource>,
        config: EndpointConfig,
        destination_resolver: Option<Arc<dyn DestinationResolver>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            destination_resolver,
            destinations: DashMap::new(),
        })
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<ConnectionSource> {
        &self.source
    }

    /// Whether sessions are checked out per operation rather than held per
    /// worker.
    pub fn sessions_are_pooled(&self) -> bool {
        self.config.transacted || self.source.policy().sessions_are_pooled
    }

    pub async fn create_session(&self) -> Result<SessionHandle> {
        self.source
            .create_session(
                self.config.session_transacted,
                self.config.acknowledge_mode,
            )
            .await
    }

    pub async fn release_session(&self, session: SessionHandle) {
        self.source.release_session(session).await;
    }

    /// The endpoint's configured destination, resolved on first use and
    /// cached.
    pub async fn get_destination(&self) -> Result<DestinationHandle> {
        let name = self.config.destination_name.clone();
        self.get_destination_named(&name).await
    }

    /// Resolve a destination by name, against the cache first. Strategy is
    /// directory lookup or create-by-name per endpoint configuration;
    /// non-persistent topics are created against a session opened solely
    /// for that purpose.
    pub async fn get_destination_named(&self, name: &str) -> Result<DestinationHandle> {
        if name.is_empty() {
            return Err(BridgeError::configuration(
                &self.config.name,
                "no destination name specified",
            ));
        }
        if let Some(cached) = self.destinations.get(name) {
            return Ok(cached.clone());
        }

        let destination = if self.uses_lookup() {
            let resolver = self.destination_resolver.as_ref().ok_or_else(|| {
                BridgeError::configuration(&self.config.name, "no destination resolver available")
            })?;
            resolver.lookup(name).await?
        } else {
            let session = self.create_session().await?;
            let created = session
                .inner
                .create_destination(name, self.config.destination_kind)
                .await
                .map_err(BridgeError::from);
            self.release_session(session).await;
            created?
        };

        debug!(
            endpoint = %self.config.name,
            destination = %destination,
            "Resolved destination"
        );
        self.destinations
            .insert(name.to_string(), destination.clone());
        Ok(destination)
    }

    fn uses_lookup(&self) -> bool {
        if self.config.destination_kind.is_topic() && !self.config.persistent {
            return false;
        }
        self.config.lookup_destination && !self.source.policy().create_destination
    }

    /// Send a message, returning the provider message id, or `None` when the
    /// destination turned out invalid and `ignore_invalid_destination` is
    /// set. That flag is the only place a send failure is swallowed.
    pub async fn send(
        &self,
        session: &SessionHandle,
        destination: &DestinationHandle,
        correlation_id: Option<&str>,
        envelope: MessageEnvelope,
        ignore_invalid_destination: bool,
    ) -> Result<Option<String>> {
        let outbound = self.to_outbound(correlation_id, envelope);
        let result = async {
            let producer = self.create_producer(session, destination).await?;
            let message_id = producer.send(outbound).await.map_err(BridgeError::from)?;
            if let Err(e) = producer.close().await {
                warn!(endpoint = %self.config.name, error = %e, "Error closing producer");
            }
            Ok::<String, BridgeError>(message_id)
        }
        .await;

        match result {
            Ok(message_id) => {
                debug!(
                    endpoint = %self.config.name,
                    destination = %destination,
                    message_id = %message_id,
                    "Sent message"
                );
                Ok(Some(message_id))
            }
            Err(BridgeError::InvalidDestination { destination }) if ignore_invalid_destination => {
                warn!(
                    endpoint = %self.config.name,
                    destination = %destination,
                    "Destination does not exist, message not sent"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn to_outbound(
        &self,
        correlation_id: Option<&str>,
        envelope: MessageEnvelope,
    ) -> OutboundMessage {
        let ttl_ms = if envelope.ttl_ms > 0 {
            Some(envelope.ttl_ms)
        } else if self.config.message_ttl_ms > 0 {
            Some(self.config.message_ttl_ms)
        } else {
            None
        };
        OutboundMessage {
            payload: envelope.payload,
            correlation_id: correlation_id
                .map(|cid| transform_correlation_id(cid, &self.config.correlation)),
            message_type: envelope.message_type,
            delivery_mode: envelope.delivery_mode,
            priority: (envelope.priority >= 0).then_some(envelope.priority),
            ttl_ms,
            reply_to: envelope.reply_to,
            properties: envelope.properties,
        }
    }

    /// Create a consumer on a destination. Topic endpoints get a durable or
    /// transient subscription per configuration; the endpoint's message
    /// selector applies when no explicit selector is given.
    pub async fn create_consumer(
        &self,
        session: &SessionHandle,
        destination: &DestinationHandle,
        selector: Option<&str>,
    ) -> Result<Box<dyn Consumer>> {
        let selector = selector.or(self.config.message_selector.as_deref());
        let legacy = self.source.policy().legacy_protocol;

        let consumer = if self.config.destination_kind.is_topic() {
            let subscription = match self.config.subscriber {
                SubscriberKind::Durable => Some(self.config.name.clone()),
                SubscriberKind::Transient => None,
            };
            if legacy {
                session
                    .inner
                    .create_topic_subscriber(destination, subscription.as_deref(), selector)
                    .await
            } else if let Some(subscription_name) = subscription {
                session
                    .inner
                    .create_durable_subscriber(destination, &subscription_name, selector)
                    .await
            } else {
                session.inner.create_consumer(destination, selector).await
            }
        } else if legacy {
            session
                .inner
                .create_queue_consumer(destination, selector)
                .await
        } else {
            session.inner.create_consumer(destination, selector).await
        };

        consumer.map_err(BridgeError::from)
    }

    /// Consumer scoped to one correlation id.
    pub async fn consumer_for_correlation_id(
        &self,
        session: &SessionHandle,
        destination: &DestinationHandle,
        correlation_id: &str,
    ) -> Result<Box<dyn Consumer>> {
        let selector = correlation_selector(correlation_id);
        self.create_consumer(session, destination, Some(&selector))
            .await
    }

    async fn create_producer(
        &self,
        session: &SessionHandle,
        destination: &DestinationHandle,
    ) -> Result<Box<dyn Producer>> {
        let legacy = self.source.policy().legacy_protocol;
        let producer = if legacy && destination.kind == DestinationKind::Topic {
            session.inner.create_topic_publisher(destination).await
        } else if legacy {
            session.inner.create_queue_producer(destination).await
        } else {
            session.inner.create_producer(destination).await
        };
        producer.map_err(BridgeError::from)
    }
}

/// Selector matching one correlation id; single quotes in the id are
/// doubled per selector syntax.
pub fn correlation_selector(correlation_id: &str) -> String {
    format!("correlation_id = '{}'", correlation_id.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_transform_preserves_prefix() {
        let policy = CorrelationIdPolicy {
            to_hex: true,
            ..CorrelationIdPolicy::default()
        };
        assert_eq!(transform_correlation_id("ID:abc", &policy), "ID:616263");
    }

    #[test]
    fn test_hex_transform_skips_unprefixed_ids() {
        let policy = CorrelationIdPolicy {
            to_hex: true,
            ..CorrelationIdPolicy::default()
        };
        assert_eq!(transform_correlation_id("abc", &policy), "abc");
    }

    #[test]
    fn test_max_length_keeps_prefix_and_tail() {
        let policy = CorrelationIdPolicy {
            max_length: Some(5),
            ..CorrelationIdPolicy::default()
        };
        assert_eq!(transform_correlation_id("ID:1234567", &policy), "ID:34567");
    }

    #[test]
    fn test_max_length_prefixes_unprefixed_ids() {
        let policy = CorrelationIdPolicy {
            max_length: Some(5),
            ..CorrelationIdPolicy::default()
        };
        assert_eq!(transform_correlation_id("1234567", &policy), "ID:34567");
    }

    #[test]
    fn test_max_length_short_id_untouched() {
        let policy = CorrelationIdPolicy {
            max_length: Some(5),
            ..CorrelationIdPolicy::default()
        };
        assert_eq!(transform_correlation_id("ID:123", &policy), "ID:123");
    }

    #[test]
    fn test_truncation_then_hex_compose() {
        let policy = CorrelationIdPolicy {
            to_hex: true,
            max_length: Some(2),
            ..CorrelationIdPolicy::default()
        };
        // truncates to ID:bc, then hex of "bc"
        assert_eq!(transform_correlation_id("ID:abc", &policy), "ID:6263");
    }

    #[test]
    fn test_no_policy_is_identity() {
        let policy = CorrelationIdPolicy::default();
        assert_eq!(transform_correlation_id("ID:abc-123", &policy), "ID:abc-123");
    }

    #[test]
    fn test_correlation_selector_escapes_quotes() {
        assert_eq!(
            correlation_selector("ID:abc"),
            "correlation_id = 'ID:abc'"
        );
        assert_eq!(
            correlation_selector("o'brien"),
            "correlation_id = 'o''brien'"
        );
    }
}
