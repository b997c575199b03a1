//! # Provider Contracts
//!
//! Traits the broker provider implements: connection factory, connection,
//! session, consumer, producer and the raw message surface, plus the
//! directory/credential resolvers the adapter looks things up through.
//! Everything above this module works against these trait objects only, so
//! an in-memory fake and a real wire client are interchangeable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{AcknowledgeMode, DestinationKind, DeliveryMode};

/// Errors raised by provider implementations. These never cross the facade
/// boundary raw; [`BridgeError`](crate::error::BridgeError) wraps them.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Invalid destination: {destination}")]
    InvalidDestination { destination: String },

    #[error("Resource already closed: {resource}")]
    Closed { resource: String },

    #[error("Provider operation {operation} failed: {message}")]
    Operation { operation: String, message: String },
}

impl ProviderError {
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            message: message.into(),
        }
    }

    pub fn invalid_destination(destination: impl Into<String>) -> Self {
        Self::InvalidDestination {
            destination: destination.into(),
        }
    }

    pub fn closed(resource: impl Into<String>) -> Self {
        Self::Closed {
            resource: resource.into(),
        }
    }

    pub fn operation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Credentials resolved from an auth alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Typed message property value. Bool/Int/Text map to the provider's native
/// typed properties; `Double` and anything else go through the generic
/// object property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
}

impl PropertyValue {
    pub fn as_text(&self) -> String {
        match self {
            PropertyValue::Bool(b) => b.to_string(),
            PropertyValue::Int(i) => i.to_string(),
            PropertyValue::Double(d) => d.to_string(),
            PropertyValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::Text(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// Opaque handle to a resolved destination. Equality is by id, so two
/// temporary destinations with generated names never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationHandle {
    pub name: String,
    pub kind: DestinationKind,
    pub temporary: bool,
    pub id: Uuid,
}

impl DestinationHandle {
    pub fn named(name: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            temporary: false,
            id: Uuid::new_v4(),
        }
    }

    pub fn temporary(name: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            name: name.into(),
            kind,
            temporary: true,
            id: Uuid::new_v4(),
        }
    }
}

impl fmt::Display for DestinationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.kind, self.name)
    }
}

/// A message handed to the provider for sending. Headers the application
/// left unset stay at the provider default.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub payload: String,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub priority: Option<i32>,
    pub ttl_ms: Option<u64>,
    pub reply_to: Option<DestinationHandle>,
    pub properties: HashMap<String, PropertyValue>,
}

/// Point-in-time statistics of a provider-managed connection pool, exposed
/// by factories that implement pooling. Purely diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub max_size: usize,
    pub active: usize,
    pub idle: usize,
}

/// Source of physical connections for one logical connection-factory name.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Logical name, the identity key into the source registry.
    fn name(&self) -> &str;

    async fn create_connection(
        &self,
        credentials: Option<&Credentials>,
    ) -> ProviderResult<Arc<dyn Connection>>;

    /// Diagnostic description of the physical endpoint behind this factory.
    fn physical_name(&self) -> String {
        self.name().to_string()
    }

    /// Pool statistics, when this factory manages a pool.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

#[async_trait]
pub trait Connection: Send + Sync {
    /// Start message delivery on this connection.
    async fn start(&self) -> ProviderResult<()>;

    async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AcknowledgeMode,
    ) -> ProviderResult<Arc<dyn Session>>;

    async fn close(&self) -> ProviderResult<()>;
}

/// Single-threaded unit of work against a connection.
///
/// The legacy queue/topic-scoped creation methods default to the unified
/// ones; providers that still speak the scoped wire protocol override them.
#[async_trait]
pub trait Session: Send + Sync {
    /// Create (or bind to) a destination by name on the broker side.
    async fn create_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> ProviderResult<DestinationHandle>;

    /// Create a broker-generated temporary destination, scoped to the
    /// connection this session belongs to.
    async fn create_temporary_destination(
        &self,
        kind: DestinationKind,
    ) -> ProviderResult<DestinationHandle>;

    async fn delete_temporary_destination(
        &self,
        destination: &DestinationHandle,
    ) -> ProviderResult<()>;

    async fn create_consumer(
        &self,
        destination: &DestinationHandle,
        selector: Option<&str>,
    ) -> ProviderResult<Box<dyn Consumer>>;

    /// Named durable topic subscription; survives consumer disconnect.
    async fn create_durable_subscriber(
        &self,
        destination: &DestinationHandle,
        subscription_name: &str,
        selector: Option<&str>,
    ) -> ProviderResult<Box<dyn Consumer>>;

    async fn create_producer(
        &self,
        destination: &DestinationHandle,
    ) -> ProviderResult<Box<dyn Producer>>;

    async fn create_queue_consumer(
        &self,
        destination: &DestinationHandle,
        selector: Option<&str>,
    ) -> ProviderResult<Box<dyn Consumer>> {
        self.create_consumer(destination, selector).await
    }

    async fn create_topic_subscriber(
        &self,
        destination: &DestinationHandle,
        subscription_name: Option<&str>,
        selector: Option<&str>,
    ) -> ProviderResult<Box<dyn Consumer>> {
        match subscription_name {
            Some(name) => {
                self.create_durable_subscriber(destination, name, selector)
                    .await
            }
            None => self.create_consumer(destination, selector).await,
        }
    }

    async fn create_queue_producer(
        &self,
        destination: &DestinationHandle,
    ) -> ProviderResult<Box<dyn Producer>> {
        self.create_producer(destination).await
    }

    async fn create_topic_publisher(
        &self,
        destination: &DestinationHandle,
    ) -> ProviderResult<Box<dyn Producer>> {
        self.create_producer(destination).await
    }

    /// Commit this locally transacted session.
    async fn commit(&self) -> ProviderResult<()>;

    /// Roll back this locally transacted session.
    async fn rollback(&self) -> ProviderResult<()>;

    async fn close(&self) -> ProviderResult<()>;
}

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Blocking receive; returns `None` when the timeout elapses with no
    /// message.
    async fn receive(&self, timeout_ms: u64) -> ProviderResult<Option<Box<dyn ProviderMessage>>>;

    async fn close(&self) -> ProviderResult<()>;
}

#[async_trait]
pub trait Producer: Send + Sync {
    /// Send the message; returns the provider-generated message id.
    async fn send(&self, message: OutboundMessage) -> ProviderResult<String>;

    async fn close(&self) -> ProviderResult<()>;
}

/// A message as received from the broker.
#[async_trait]
pub trait ProviderMessage: Send + Sync {
    fn message_id(&self) -> Option<String>;
    fn correlation_id(&self) -> Option<String>;
    fn reply_to(&self) -> Option<DestinationHandle>;

    /// Absolute expiration time in epoch milliseconds, 0 = never expires.
    fn expiration_ms(&self) -> u64;

    /// Broker-assigned send timestamp in epoch milliseconds.
    fn timestamp_ms(&self) -> u64;

    fn message_type(&self) -> Option<String>;

    /// How many times the broker has delivered this message, when the
    /// provider exposes it.
    fn delivery_count(&self) -> Option<u32>;

    fn property(&self, name: &str) -> Option<PropertyValue>;
    fn property_names(&self) -> Vec<String>;
    fn payload(&self) -> String;

    /// Client acknowledgement; settles this message and everything received
    /// before it on the same session.
    async fn acknowledge(&self) -> ProviderResult<()>;
}

/// Directory lookup of connection factories by logical name.
#[async_trait]
pub trait ConnectionFactoryResolver: Send + Sync {
    async fn lookup(&self, name: &str) -> ProviderResult<Arc<dyn ConnectionFactory>>;
}

/// Directory lookup of destinations by logical name.
#[async_trait]
pub trait DestinationResolver: Send + Sync {
    async fn lookup(&self, name: &str) -> ProviderResult<DestinationHandle>;
}

/// Maps an auth alias to credentials.
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, alias: &str) -> Option<Credentials>;
}
