//! # In-Memory Broker Fakes
//!
//! A deterministic broker double implementing the provider contracts, with
//! counters for everything the adapter is supposed to do exactly once:
//! connections opened and closed, sessions, commits, rollbacks,
//! acknowledgements, temporary-destination deletions. Used by the unit
//! tests in this crate and the integration tests under `tests/`.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::{AcknowledgeMode, DestinationKind, DeliveryMode};
use crate::error::Result;
use crate::listener::ListenerConnector;
use crate::provider::{
    Connection, ConnectionFactory, ConnectionFactoryResolver, Consumer, CredentialResolver,
    Credentials, DestinationHandle, DestinationResolver, OutboundMessage, Producer,
    PropertyValue, ProviderError, ProviderMessage, ProviderResult, Session,
};

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A message at rest in a fake queue.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub reply_to: Option<DestinationHandle>,
    pub payload: String,
    pub message_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub priority: Option<i32>,
    pub expiration_ms: u64,
    pub timestamp_ms: u64,
    pub delivery_count: u32,
    pub properties: HashMap<String, PropertyValue>,
}

impl StoredMessage {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            message_id: format!("ID:fake-{}", Uuid::new_v4().simple()),
            correlation_id: None,
            reply_to: None,
            payload: payload.into(),
            message_type: None,
            delivery_mode: DeliveryMode::NotSet,
            priority: None,
            expiration_ms: 0,
            timestamp_ms: now_ms(),
            delivery_count: 1,
            properties: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: DestinationHandle) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    pub fn with_expiration_ms(mut self, expiration_ms: u64) -> Self {
        self.expiration_ms = expiration_ms;
        self
    }
}

struct QueueState {
    messages: Mutex<VecDeque<StoredMessage>>,
}

/// Shared state of the fake broker.
pub struct FakeBroker {
    queues: DashMap<String, Arc<QueueState>>,
    invalid_destinations: DashSet<String>,
    acknowledged: DashSet<String>,
    last_credentials: Mutex<Option<Credentials>>,
    pub connections_opened: AtomicUsize,
    pub connections_closed: AtomicUsize,
    pub sessions_opened: AtomicUsize,
    pub sessions_closed: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub acknowledgements: AtomicUsize,
    pub temporaries_deleted: AtomicUsize,
    message_seq: AtomicU64,
}

impl FakeBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: DashMap::new(),
            invalid_destinations: DashSet::new(),
            acknowledged: DashSet::new(),
            last_credentials: Mutex::new(None),
            connections_opened: AtomicUsize::new(0),
            connections_closed: AtomicUsize::new(0),
            sessions_opened: AtomicUsize::new(0),
            sessions_closed: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            acknowledgements: AtomicUsize::new(0),
            temporaries_deleted: AtomicUsize::new(0),
            message_seq: AtomicU64::new(0),
        })
    }

    /// Mark a destination name as nonexistent; sends to it fail with an
    /// invalid-destination error.
    pub fn mark_invalid(&self, name: &str) {
        self.invalid_destinations.insert(name.to_string());
    }

    /// Whether a message id was client-acknowledged.
    pub fn was_acknowledged(&self, message_id: &str) -> bool {
        self.acknowledged.contains(message_id)
    }

    /// Credentials of the most recently created connection.
    pub fn last_credentials(&self) -> Option<Credentials> {
        self.last_credentials.lock().clone()
    }

    pub fn open_connections(&self) -> usize {
        self.connections_opened.load(Ordering::SeqCst)
            - self.connections_closed.load(Ordering::SeqCst)
    }

    pub fn queue_depth(&self, name: &str) -> usize {
        self.queues
            .get(name)
            .map(|q| q.messages.lock().len())
            .unwrap_or(0)
    }

    /// Put a message straight into a queue, as if some peer sent it.
    pub fn enqueue(&self, queue: &str, message: StoredMessage) -> String {
        let id = message.message_id.clone();
        let state = self.queue(queue);
        state.messages.lock().push_back(message);
        id
    }

    /// Peek the first message of a queue.
    pub fn first_message(&self, queue: &str) -> Option<StoredMessage> {
        self.queues
            .get(queue)
            .and_then(|q| q.messages.lock().front().cloned())
    }

    pub fn factory(self: &Arc<Self>, name: &str) -> Arc<FakeConnectionFactory> {
        Arc::new(FakeConnectionFactory {
            name: name.to_string(),
            broker: Arc::clone(self),
        })
    }

    pub fn factory_resolver(self: &Arc<Self>) -> Arc<FakeFactoryResolver> {
        Arc::new(FakeFactoryResolver {
            broker: Arc::clone(self),
        })
    }

    pub fn destination_resolver(self: &Arc<Self>) -> Arc<FakeDestinationResolver> {
        Arc::new(FakeDestinationResolver {
            broker: Arc::clone(self),
        })
    }

    fn queue(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    messages: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    fn next_message_id(&self) -> String {
        format!("ID:fake-{}", self.message_seq.fetch_add(1, Ordering::SeqCst))
    }
}

pub struct FakeConnectionFactory {
    name: String,
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_connection(
        &self,
        credentials: Option<&Credentials>,
    ) -> ProviderResult<Arc<dyn Connection>> {
        *self.broker.last_credentials.lock() = credentials.cloned();
        self.broker.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            broker: Arc::clone(&self.broker),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    fn physical_name(&self) -> String {
        format!("fake://{}", self.name)
    }
}

pub struct FakeFactoryResolver {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl ConnectionFactoryResolver for FakeFactoryResolver {
    async fn lookup(&self, name: &str) -> ProviderResult<Arc<dyn ConnectionFactory>> {
        Ok(self.broker.factory(name))
    }
}

pub struct FakeDestinationResolver {
    broker: Arc<FakeBroker>,
}

#[async_trait]
impl DestinationResolver for FakeDestinationResolver {
    async fn lookup(&self, name: &str) -> ProviderResult<DestinationHandle> {
        self.broker.queue(name);
        Ok(DestinationHandle::named(name, DestinationKind::Queue))
    }
}

/// Credential resolver backed by a fixed alias map.
pub struct FakeCredentialResolver {
    aliases: HashMap<String, Credentials>,
}

impl FakeCredentialResolver {
    pub fn new() -> Self {
        Self {
            aliases: HashMap::new(),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>, credentials: Credentials) -> Self {
        self.aliases.insert(alias.into(), credentials);
        self
    }
}

impl Default for FakeCredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver for FakeCredentialResolver {
    fn resolve(&self, alias: &str) -> Option<Credentials> {
        self.aliases.get(alias).cloned()
    }
}

pub struct FakeConnection {
    broker: Arc<FakeBroker>,
    started: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn start(&self) -> ProviderResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::closed("connection"));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_session(
        &self,
        transacted: bool,
        _ack_mode: AcknowledgeMode,
    ) -> ProviderResult<Arc<dyn Session>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProviderError::closed("connection"));
        }
        self.broker.sessions_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            broker: Arc::clone(&self.broker),
            transacted,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> ProviderResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.connections_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

pub struct FakeSession {
    broker: Arc<FakeBroker>,
    transacted: bool,
    closed: AtomicBool,
}

#[async_trait]
impl Session for FakeSession {
    async fn create_destination(
        &self,
        name: &str,
        kind: DestinationKind,
    ) -> ProviderResult<DestinationHandle> {
        self.broker.queue(name);
        Ok(DestinationHandle::named(name, kind))
    }

    async fn create_temporary_destination(
        &self,
        kind: DestinationKind,
    ) -> ProviderResult<DestinationHandle> {
        let name = format!("tmp-{}", Uuid::new_v4().simple());
        self.broker.queue(&name);
        Ok(DestinationHandle::temporary(name, kind))
    }

    async fn delete_temporary_destination(
        &self,
        destination: &DestinationHandle,
    ) -> ProviderResult<()> {
        if self.broker.queues.remove(&destination.name).is_none() {
            return Err(ProviderError::invalid_destination(&destination.name));
        }
        self.broker
            .temporaries_deleted
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_consumer(
        &self,
        destination: &DestinationHandle,
        selector: Option<&str>,
    ) -> ProviderResult<Box<dyn Consumer>> {
        let selector = selector.map(Selector::parse).transpose()?;
        Ok(Box::new(FakeConsumer {
            broker: Arc::clone(&self.broker),
            queue: self.broker.queue(&destination.name),
            selector,
        }))
    }

    async fn create_durable_subscriber(
        &self,
        destination: &DestinationHandle,
        _subscription_name: &str,
        selector: Option<&str>,
    ) -> ProviderResult<Box<dyn Consumer>> {
        self.create_consumer(destination, selector).await
    }

    async fn create_producer(
        &self,
        destination: &DestinationHandle,
    ) -> ProviderResult<Box<dyn Producer>> {
        Ok(Box::new(FakeProducer {
            broker: Arc::clone(&self.broker),
            destination: destination.clone(),
        }))
    }

    async fn commit(&self) -> ProviderResult<()> {
        if !self.transacted {
            return Err(ProviderError::operation("commit", "session not transacted"));
        }
        self.broker.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> ProviderResult<()> {
        if !self.transacted {
            return Err(ProviderError::operation("rollback", "session not transacted"));
        }
        self.broker.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> ProviderResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.broker.sessions_closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// The `key = 'value'` subset of selector syntax the fakes understand.
struct Selector {
    key: String,
    value: String,
}

impl Selector {
    fn parse(raw: &str) -> ProviderResult<Self> {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| ProviderError::operation("selector", format!("cannot parse [{raw}]")))?;
        let value = value.trim();
        let value = value
            .strip_prefix('\'')
            .and_then(|v| v.strip_suffix('\''))
            .ok_or_else(|| {
                ProviderError::operation("selector", format!("unquoted value in [{raw}]"))
            })?;
        Ok(Self {
            key: key.trim().to_string(),
            value: value.replace("''", "'"),
        })
    }

    fn matches(&self, message: &StoredMessage) -> bool {
        if self.key == "correlation_id" {
            return message.correlation_id.as_deref() == Some(self.value.as_str());
        }
        message
            .properties
            .get(&self.key)
            .map(|v| v.as_text() == self.value)
            .unwrap_or(false)
    }
}

pub struct FakeConsumer {
    broker: Arc<FakeBroker>,
    queue: Arc<QueueState>,
    selector: Option<Selector>,
}

impl FakeConsumer {
    fn try_pop(&self) -> Option<StoredMessage> {
        let mut messages = self.queue.messages.lock();
        let index = messages.iter().position(|m| {
            self.selector
                .as_ref()
                .map(|s| s.matches(m))
                .unwrap_or(true)
        })?;
        messages.remove(index)
    }
}

#[async_trait]
impl Consumer for FakeConsumer {
    async fn receive(&self, timeout_ms: u64) -> ProviderResult<Option<Box<dyn ProviderMessage>>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(message) = self.try_pop() {
                return Ok(Some(Box::new(FakeMessage {
                    broker: Arc::clone(&self.broker),
                    stored: message,
                }) as Box<dyn ProviderMessage>));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn close(&self) -> ProviderResult<()> {
        Ok(())
    }
}

pub struct FakeProducer {
    broker: Arc<FakeBroker>,
    destination: DestinationHandle,
}

#[async_trait]
impl Producer for FakeProducer {
    async fn send(&self, message: OutboundMessage) -> ProviderResult<String> {
        if self.broker.invalid_destinations.contains(&self.destination.name) {
            return Err(ProviderError::invalid_destination(&self.destination.name));
        }
        let message_id = self.broker.next_message_id();
        let stored = StoredMessage {
            message_id: message_id.clone(),
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
            payload: message.payload,
            message_type: message.message_type,
            delivery_mode: message.delivery_mode,
            priority: message.priority,
            expiration_ms: message.ttl_ms.map(|ttl| now_ms() + ttl).unwrap_or(0),
            timestamp_ms: now_ms(),
            delivery_count: 1,
            properties: message.properties,
        };
        self.broker.enqueue(&self.destination.name, stored);
        Ok(message_id)
    }

    async fn close(&self) -> ProviderResult<()> {
        Ok(())
    }
}

pub struct FakeMessage {
    broker: Arc<FakeBroker>,
    stored: StoredMessage,
}

#[async_trait]
impl ProviderMessage for FakeMessage {
    fn message_id(&self) -> Option<String> {
        Some(self.stored.message_id.clone())
    }

    fn correlation_id(&self) -> Option<String> {
        self.stored.correlation_id.clone()
    }

    fn reply_to(&self) -> Option<DestinationHandle> {
        self.stored.reply_to.clone()
    }

    fn expiration_ms(&self) -> u64 {
        self.stored.expiration_ms
    }

    fn timestamp_ms(&self) -> u64 {
        self.stored.timestamp_ms
    }

    fn message_type(&self) -> Option<String> {
        self.stored.message_type.clone()
    }

    fn delivery_count(&self) -> Option<u32> {
        Some(self.stored.delivery_count)
    }

    fn property(&self, name: &str) -> Option<PropertyValue> {
        self.stored.properties.get(name).cloned()
    }

    fn property_names(&self) -> Vec<String> {
        self.stored.properties.keys().cloned().collect()
    }

    fn payload(&self) -> String {
        self.stored.payload.clone()
    }

    async fn acknowledge(&self) -> ProviderResult<()> {
        self.broker
            .acknowledged
            .insert(self.stored.message_id.clone());
        self.broker.acknowledgements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Connector double that counts its start/stop cycles.
pub struct CountingConnector {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl CountingConnector {
    pub fn new() -> Self {
        Self {
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Default for CountingConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ListenerConnector for CountingConnector {
    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
