//! # mqbridge-core
//!
//! Broker messaging adapter core: reference-counted connection sources, a
//! queue/topic facade with correlation-id handling, pull and push listener
//! engines with a poll guard, and a request/reply sender.
//!
//! The crate never talks to a broker itself; it drives the provider
//! contracts in [`provider`], which a wire client (or the in-memory fakes
//! in [`testing`]) implements.
//!
//! ## Architecture
//!
//! - [`source`] — one shared [`ConnectionSource`](source::ConnectionSource)
//!   per logical connection-factory name, handed out by the
//!   [`ConnectionSourceRegistry`](source::ConnectionSourceRegistry) and torn
//!   down when the last endpoint holding it closes.
//! - [`facade`] — destination resolution and caching, typed headers and
//!   properties, the correlation-id transform, and the queue/topic split.
//! - [`listener`] — pull workers polling with blocking receives, or a push
//!   connector watched by a poll guard; shared reply routing and the
//!   commit/rollback/acknowledge decision.
//! - [`sender`] — fire-and-forget or synchronous request/reply with
//!   configurable reply correlation.

pub mod config;
pub mod error;
pub mod facade;
pub mod listener;
pub mod logging;
pub mod provider;
pub mod sender;
pub mod source;
pub mod testing;

pub use config::{
    AcknowledgeMode, AdapterSettings, CorrelationIdPolicy, DeliveryMode, DestinationKind,
    EndpointConfig, ExitState, ListenerSettings, ReplyLinkMethod, SenderSettings, SourcePolicy,
    SubscriberKind,
};
pub use error::{BridgeError, Result};
pub use facade::{transform_correlation_id, MessageEnvelope, MessagingFacade};
pub use listener::{
    ListenerConnector, PipelineContext, PullingListener, PushingListener, RunState, RunStateFlag,
};
pub use provider::{Credentials, DestinationHandle, PropertyValue};
pub use sender::{RequestReplySender, SendOutcome};
pub use source::{ConnectionSource, ConnectionSourceRegistry, SessionHandle};
