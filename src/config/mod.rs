//! # Endpoint and Source Configuration
//!
//! Typed configuration for logical endpoints (facades, listeners, senders)
//! and connection sources. Values mirror what an application pipeline
//! configures per endpoint; invalid values are rejected at setup time with
//! a [`BridgeError::Configuration`](crate::error::BridgeError) so a broken
//! endpoint never reaches its receive loop.

pub mod settings;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BridgeError, Result};

pub use settings::AdapterSettings;

/// Default receive timeout for pull listeners, in milliseconds.
pub const DEFAULT_PULL_RECEIVE_TIMEOUT_MS: u64 = 20_000;

/// Generic default receive timeout, in milliseconds.
pub const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 1_000;

/// Default reply timeout for synchronous senders, in milliseconds.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5_000;

/// Default correlation-id prefix checked by the hex transform.
pub const DEFAULT_CORRELATION_ID_PREFIX: &str = "ID:";

/// Whether an endpoint addresses a queue or a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DestinationKind {
    #[default]
    Queue,
    Topic,
}

impl DestinationKind {
    pub fn is_topic(self) -> bool {
        matches!(self, DestinationKind::Topic)
    }
}

impl FromStr for DestinationKind {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUE" => Ok(DestinationKind::Queue),
            "TOPIC" => Ok(DestinationKind::Topic),
            other => Err(BridgeError::configuration(
                "destination",
                format!("invalid destination kind [{other}], must be QUEUE or TOPIC"),
            )),
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestinationKind::Queue => write!(f, "QUEUE"),
            DestinationKind::Topic => write!(f, "TOPIC"),
        }
    }
}

/// Policy for when a consumed message counts as delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AcknowledgeMode {
    NotSet,
    #[default]
    Auto,
    Client,
    DupsOk,
}

impl AcknowledgeMode {
    pub fn is_client(self) -> bool {
        matches!(self, AcknowledgeMode::Client)
    }
}

impl FromStr for AcknowledgeMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "auto_acknowledge" => Ok(AcknowledgeMode::Auto),
            "client" | "client_acknowledge" => Ok(AcknowledgeMode::Client),
            "dups" | "dups_ok_acknowledge" => Ok(AcknowledgeMode::DupsOk),
            other => Err(BridgeError::configuration(
                "acknowledge-mode",
                format!("invalid acknowledge mode [{other}], must be auto, client or dups"),
            )),
        }
    }
}

impl fmt::Display for AcknowledgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcknowledgeMode::NotSet => write!(f, "none"),
            AcknowledgeMode::Auto => write!(f, "Auto"),
            AcknowledgeMode::Client => write!(f, "Client"),
            AcknowledgeMode::DupsOk => write!(f, "Dups"),
        }
    }
}

/// Delivery mode for outbound messages. `NotSet` leaves the provider default
/// in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeliveryMode {
    #[default]
    NotSet,
    Persistent,
    NonPersistent,
}

impl DeliveryMode {
    pub fn is_set(self) -> bool {
        !matches!(self, DeliveryMode::NotSet)
    }
}

impl FromStr for DeliveryMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PERSISTENT" => Ok(DeliveryMode::Persistent),
            "NON_PERSISTENT" => Ok(DeliveryMode::NonPersistent),
            other => Err(BridgeError::configuration(
                "delivery-mode",
                format!("unknown delivery mode [{other}]"),
            )),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::NotSet => write!(f, "not set by application"),
            DeliveryMode::Persistent => write!(f, "PERSISTENT"),
            DeliveryMode::NonPersistent => write!(f, "NON_PERSISTENT"),
        }
    }
}

/// Strategy for deriving the correlation key a synchronous sender waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReplyLinkMethod {
    /// Wait on the provider-generated id of the sent message.
    #[default]
    MessageId,
    /// Wait on the pipeline correlation id that was sent.
    CorrelationId,
    /// Wait on the correlation id read back off the message after the send.
    CorrelationIdFromMessage,
}

/// Topic subscriptions are either durable (named, survive disconnect) or
/// transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SubscriberKind {
    #[default]
    Durable,
    Transient,
}

/// Exit state of pipeline processing, used to decide commit/rollback and
/// client acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ExitState {
    #[default]
    Success,
    Error,
}

/// Correlation-id transformation applied once at send time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIdPolicy {
    /// Replace every character after the prefix by its hexadecimal code point.
    pub to_hex: bool,
    /// Prefix preserved by both the hex transform and the truncation.
    pub prefix: String,
    /// Maximum length of the id after the prefix; longer ids are
    /// right-truncated, keeping the tail.
    pub max_length: Option<usize>,
}

impl Default for CorrelationIdPolicy {
    fn default() -> Self {
        Self {
            to_hex: false,
            prefix: DEFAULT_CORRELATION_ID_PREFIX.to_string(),
            max_length: None,
        }
    }
}

/// Per-endpoint configuration shared by facades, listeners and senders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Name of the endpoint, used in log prefixes.
    pub name: String,
    /// Logical connection-factory name, the identity key into the source
    /// registry.
    pub connection_factory_name: String,
    /// Alias resolved to credentials through the credential collaborator.
    pub auth_alias: Option<String>,
    /// Logical name of the queue or topic.
    pub destination_name: String,
    pub destination_kind: DestinationKind,
    pub acknowledge_mode: AcknowledgeMode,
    /// Distributed (XA-style) transaction participation.
    pub transacted: bool,
    /// Legacy locally-transacted sessions, committed/rolled back by the
    /// listener itself.
    pub session_transacted: bool,
    /// Provider-side message selector applied when no correlation id is
    /// required.
    pub message_selector: Option<String>,
    pub subscriber: SubscriberKind,
    /// Persistent topic endpoints resolve through the directory lookup;
    /// non-persistent topics are created against a dedicated session.
    pub persistent: bool,
    /// Resolve the destination through the directory lookup (true) or create
    /// it by name against the source (false).
    pub lookup_destination: bool,
    /// Default time-to-live for sent messages, 0 = unlimited.
    pub message_ttl_ms: u64,
    pub correlation: CorrelationIdPolicy,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, connection_factory_name: impl Into<String>, destination_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_factory_name: connection_factory_name.into(),
            auth_alias: None,
            destination_name: destination_name.into(),
            destination_kind: DestinationKind::Queue,
            acknowledge_mode: AcknowledgeMode::Auto,
            transacted: false,
            session_transacted: false,
            message_selector: None,
            subscriber: SubscriberKind::Durable,
            persistent: false,
            lookup_destination: true,
            message_ttl_ms: 0,
            correlation: CorrelationIdPolicy::default(),
        }
    }

    /// Setup-time validation; failures are fatal to this endpoint only.
    pub fn validate(&self) -> Result<()> {
        if self.connection_factory_name.is_empty() {
            return Err(BridgeError::configuration(
                &self.name,
                "no connection factory name specified",
            ));
        }
        if self.destination_name.is_empty() {
            return Err(BridgeError::configuration(
                &self.name,
                "destination name must be specified",
            ));
        }
        Ok(())
    }
}

/// Pooling and lifecycle policy of a connection source. Mirrors the
/// process-wide adapter settings; one policy is shared by all endpoints
/// naming the same connection factory.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcePolicy {
    /// Create and tear down a fresh physical connection per session instead
    /// of sharing one lazily created connection.
    pub connections_are_pooled: bool,
    /// Sessions are checked out per operation rather than held per worker.
    pub sessions_are_pooled: bool,
    /// Share one dynamic reply destination per source. Ignored (treated as
    /// false) when connections are pooled.
    pub use_single_dynamic_reply_queue: bool,
    /// Tear down shared resources when the reference count reaches zero.
    pub cleanup_on_close: bool,
    /// Create destinations by name instead of looking them up.
    pub create_destination: bool,
    /// Keep using the legacy queue/topic-scoped wire protocol.
    pub legacy_protocol: bool,
}

impl Default for SourcePolicy {
    fn default() -> Self {
        Self {
            connections_are_pooled: false,
            sessions_are_pooled: false,
            use_single_dynamic_reply_queue: true,
            cleanup_on_close: true,
            create_destination: false,
            legacy_protocol: false,
        }
    }
}

impl SourcePolicy {
    /// Whether one dynamic reply destination is shared per source.
    ///
    /// Invariant: never true when connections are pooled, because a temporary
    /// destination's lifetime is bound to the connection that created it.
    pub fn use_single_dynamic_reply_queue(&self) -> bool {
        if self.connections_are_pooled {
            return false;
        }
        self.use_single_dynamic_reply_queue
    }
}

/// Listener-specific settings layered on top of an [`EndpointConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerSettings {
    /// Blocking receive timeout in milliseconds.
    pub receive_timeout_ms: u64,
    /// Poll-guard check interval; `None` defaults to 10x the receive timeout.
    /// Only used by push listeners.
    pub poll_guard_interval_ms: Option<u64>,
    /// Send replies to the inbound message's reply-to header.
    pub use_reply_to: bool,
    /// Statically configured reply destination, used when the inbound message
    /// carries no reply-to or `use_reply_to` is off.
    pub reply_destination_name: Option<String>,
    /// Use the original message id, not the pipeline correlation id, as the
    /// reply correlation id.
    pub force_message_id_as_correlation_id: bool,
    /// Exit state on which a locally transacted session commits.
    pub commit_on: ExitState,
    /// Type tag of reply messages.
    pub reply_message_type: Option<String>,
    pub reply_delivery_mode: DeliveryMode,
    /// Reply priority 0..=9, -1 = not set.
    pub reply_priority: i32,
    /// Time-to-live of reply messages; 0 derives it from the inbound
    /// message's expiration.
    pub reply_ttl_ms: u64,
    /// Context keys copied onto reply messages as properties.
    pub reply_properties: Vec<String>,
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self {
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
            poll_guard_interval_ms: None,
            use_reply_to: true,
            reply_destination_name: None,
            force_message_id_as_correlation_id: false,
            commit_on: ExitState::Success,
            reply_message_type: None,
            reply_delivery_mode: DeliveryMode::NonPersistent,
            reply_priority: -1,
            reply_ttl_ms: 0,
            reply_properties: Vec::new(),
        }
    }
}

impl ListenerSettings {
    /// Settings for a pull listener, which uses the longer receive timeout.
    pub fn pulling() -> Self {
        Self {
            receive_timeout_ms: DEFAULT_PULL_RECEIVE_TIMEOUT_MS,
            ..Self::default()
        }
    }

    /// Effective poll-guard interval: configured, or 10x the receive timeout.
    pub fn effective_poll_guard_interval_ms(&self) -> u64 {
        self.poll_guard_interval_ms
            .unwrap_or(self.receive_timeout_ms * 10)
    }

    /// Validate the poll-guard interval against the receive timeout. A guard
    /// interval at or below the timeout cannot distinguish a stall from a
    /// normal empty poll; this is a warning, not fatal.
    pub fn poll_guard_interval_is_sane(&self) -> bool {
        self.effective_poll_guard_interval_ms() > self.receive_timeout_ms
    }
}

/// Sender-specific settings layered on top of an [`EndpointConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderSettings {
    /// Request/reply mode: wait for a correlated reply after the send.
    pub synchronous: bool,
    /// Maximum wait for a reply, in milliseconds.
    pub reply_timeout_ms: u64,
    pub link_method: ReplyLinkMethod,
    /// Named reply destination; when absent a synchronous sender uses a
    /// dynamic temporary destination from the connection source.
    pub reply_destination_name: Option<String>,
    /// Type tag for sent messages.
    pub message_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    /// Priority 0..=9, -1 = not set.
    pub priority: i32,
    /// Allow-list of reply message properties copied into the pipeline
    /// context.
    pub response_properties: Vec<String>,
}

impl Default for SenderSettings {
    fn default() -> Self {
        Self {
            synchronous: false,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            link_method: ReplyLinkMethod::MessageId,
            reply_destination_name: None,
            message_type: None,
            delivery_mode: DeliveryMode::NotSet,
            priority: -1,
            response_properties: Vec::new(),
        }
    }
}
