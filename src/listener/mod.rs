//! # Listener Engine
//!
//! Inbound message processing shared by the pull and push flavors: context
//! extraction, reply routing, and the transaction/acknowledge decision made
//! after the application pipeline ran.
//!
//! Worker lifecycle: OPENING, then a WAITING_FOR_MESSAGE / PROCESSING loop
//! ending every turn in an acknowledge, commit or rollback, then CLOSING.
//! Unrecoverable errors skip straight to CLOSING.

pub mod pull;
pub mod push;
pub mod run_state;

pub use pull::PullingListener;
pub use push::{ListenerConnector, PushingListener};
pub use run_state::{RunState, RunStateFlag};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ExitState, ListenerSettings};
use crate::error::{BridgeError, Result};
use crate::facade::{MessageEnvelope, MessagingFacade};
use crate::provider::{Consumer, DestinationHandle, PropertyValue, ProviderMessage};
use crate::source::SessionHandle;

/// Milliseconds since the epoch.
pub(crate) fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Per-message state threaded from receipt through the pipeline to the
/// post-processing step.
#[derive(Debug, Default, Clone)]
pub struct PipelineContext {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<DestinationHandle>,
    /// Absolute expiration of the inbound message, 0 = never.
    pub expiration_ms: u64,
    pub delivery_count: Option<u32>,
    pub properties: HashMap<String, PropertyValue>,
}

/// Long-lived resources of one listener worker. Populated when sessions are
/// held per worker; stays empty when they are checked out per receive.
#[derive(Default)]
pub struct ListenerThreadContext {
    pub session: Option<SessionHandle>,
    pub consumer: Option<Box<dyn Consumer>>,
}

/// Post-processing shared by pull and push listeners.
pub struct ListenerCore {
    facade: Arc<MessagingFacade>,
    settings: ListenerSettings,
}

impl ListenerCore {
    pub fn new(facade: Arc<MessagingFacade>, settings: ListenerSettings) -> Self {
        Self { facade, settings }
    }

    pub fn facade(&self) -> &Arc<MessagingFacade> {
        &self.facade
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.settings
    }

    /// Whether a failed message will be seen again: distributed or local
    /// transactions roll it back, client acknowledgement withholds the ack.
    pub fn is_redelivery_capable(&self) -> bool {
        let config = self.facade.config();
        config.transacted
            || config.session_transacted
            || config.acknowledge_mode.is_client()
    }

    /// Extract the pipeline context from an inbound message.
    pub fn populate_context(&self, message: &dyn ProviderMessage) -> PipelineContext {
        let mut properties = HashMap::new();
        for name in message.property_names() {
            if let Some(value) = message.property(&name) {
                properties.insert(name, value);
            }
        }
        PipelineContext {
            message_id: message.message_id(),
            correlation_id: message.correlation_id(),
            reply_to: message.reply_to(),
            expiration_ms: message.expiration_ms(),
            delivery_count: message.delivery_count(),
            properties,
        }
    }

    /// Correlation id to stamp on the reply: the pipeline correlation id,
    /// or the original message id when so configured.
    pub fn reply_correlation_id(&self, context: &PipelineContext) -> Option<String> {
        if self.settings.force_message_id_as_correlation_id {
            context.message_id.clone()
        } else {
            context
                .correlation_id
                .clone()
                .or_else(|| context.message_id.clone())
        }
    }

    /// Where the reply goes: the inbound reply-to header when honored, else
    /// the statically configured reply destination, else nowhere.
    pub async fn reply_destination(
        &self,
        context: &PipelineContext,
    ) -> Result<Option<DestinationHandle>> {
        if self.settings.use_reply_to {
            if let Some(reply_to) = &context.reply_to {
                return Ok(Some(reply_to.clone()));
            }
        }
        if let Some(name) = &self.settings.reply_destination_name {
            return Ok(Some(self.facade.get_destination_named(name).await?));
        }
        Ok(None)
    }

    /// Time-to-live for the reply: configured value, else derived from the
    /// request's remaining lifetime. A request that already expired gets a
    /// 1 second grace TTL and a warning.
    pub fn reply_ttl_ms(&self, context: &PipelineContext, now_ms: u64) -> u64 {
        self.reply_ttl(context, now_ms).0
    }

    /// The reply TTL plus whether the request had already expired. Only the
    /// expired case tolerates a reply destination that vanished in the
    /// meantime.
    fn reply_ttl(&self, context: &PipelineContext, now_ms: u64) -> (u64, bool) {
        if self.settings.reply_ttl_ms > 0 {
            return (self.settings.reply_ttl_ms, false);
        }
        if context.expiration_ms == 0 {
            return (0, false);
        }
        if context.expiration_ms <= now_ms {
            warn!(
                listener = %self.facade.config().name,
                message_id = ?context.message_id,
                "Request message already expired, sending reply with 1s time-to-live"
            );
            return (1_000, true);
        }
        (context.expiration_ms - now_ms, false)
    }

    /// Close the processing of one message: optionally send the reply, then
    /// settle the inbound message by committing, rolling back or
    /// acknowledging, depending on how the endpoint is configured and how
    /// the pipeline exited.
    pub async fn after_message_processed(
        &self,
        session: &SessionHandle,
        message: &dyn ProviderMessage,
        context: &PipelineContext,
        exit: ExitState,
        reply: Option<MessageEnvelope>,
    ) -> Result<()> {
        if let Some(reply) = reply {
            self.send_reply(session, context, reply).await?;
        }
        self.settle(session, message, exit).await
    }

    async fn send_reply(
        &self,
        session: &SessionHandle,
        context: &PipelineContext,
        mut reply: MessageEnvelope,
    ) -> Result<()> {
        let destination = match self.reply_destination(context).await? {
            Some(destination) => destination,
            None => {
                debug!(
                    listener = %self.facade.config().name,
                    "No reply destination, discarding reply"
                );
                return Ok(());
            }
        };

        if reply.message_type.is_none() {
            reply.message_type = self.settings.reply_message_type.clone();
        }
        if !reply.delivery_mode.is_set() {
            reply.delivery_mode = self.settings.reply_delivery_mode;
        }
        if reply.priority < 0 {
            reply.priority = self.settings.reply_priority;
        }
        let mut ignore_invalid_destination = false;
        if reply.ttl_ms == 0 {
            let (ttl_ms, request_expired) = self.reply_ttl(context, now_ms());
            reply.ttl_ms = ttl_ms;
            ignore_invalid_destination = request_expired;
        }
        for key in &self.settings.reply_properties {
            if let Some(value) = context.properties.get(key) {
                reply.properties.insert(key.clone(), value.clone());
            }
        }

        let correlation_id = self.reply_correlation_id(context);
        self.facade
            .send(
                session,
                &destination,
                correlation_id.as_deref(),
                reply,
                ignore_invalid_destination,
            )
            .await?;
        Ok(())
    }

    /// Settle the inbound message. Distributed transactions are the
    /// transaction manager's to finish. Locally transacted sessions commit
    /// when the pipeline outcome matches the configured commit-on state and
    /// roll back otherwise. Untransacted client-ack sessions acknowledge
    /// only non-error outcomes, leaving failed messages for redelivery.
    async fn settle(
        &self,
        session: &SessionHandle,
        message: &dyn ProviderMessage,
        exit: ExitState,
    ) -> Result<()> {
        let config = self.facade.config();
        if config.transacted {
            return Ok(());
        }
        if session.transacted {
            if exit == self.settings.commit_on {
                session.inner.commit().await.map_err(|e| {
                    BridgeError::listener(format!("error committing session: {e}"))
                })?;
                debug!(listener = %config.name, "Committed session");
            } else {
                session.inner.rollback().await.map_err(|e| {
                    BridgeError::listener(format!("error rolling back session: {e}"))
                })?;
                debug!(listener = %config.name, ?exit, "Rolled back session");
            }
            return Ok(());
        }
        if session.ack_mode.is_client() && exit != ExitState::Error {
            message.acknowledge().await.map_err(|e| {
                BridgeError::listener(format!("error acknowledging message: {e}"))
            })?;
        }
        Ok(())
    }
}
