//! # Request/Reply Sender
//!
//! Outbound sends through the facade, with an optional synchronous mode
//! that waits on a correlated reply over a static or dynamic reply
//! destination.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{ReplyLinkMethod, SenderSettings};
use crate::error::{BridgeError, Result};
use crate::facade::{transform_correlation_id, MessageEnvelope, MessagingFacade};
use crate::listener::PipelineContext;
use crate::source::SessionHandle;

/// Outcome of one send.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Fire-and-forget: the provider message id, or `None` when the message
    /// was dropped on an ignored invalid destination.
    Sent { message_id: Option<String> },
    /// Synchronous: the payload of the correlated reply.
    Reply { payload: String },
}

pub struct RequestReplySender {
    facade: Arc<MessagingFacade>,
    settings: SenderSettings,
}

impl RequestReplySender {
    pub fn new(facade: Arc<MessagingFacade>, settings: SenderSettings) -> Result<Self> {
        facade.config().validate()?;
        Ok(Self { facade, settings })
    }

    pub fn settings(&self) -> &SenderSettings {
        &self.settings
    }

    /// Send `envelope` to the configured destination. In synchronous mode
    /// this blocks until the correlated reply arrives or the reply timeout
    /// expires; expiry is a [`BridgeError::Timeout`], distinct from send
    /// failures.
    pub async fn send(
        &self,
        mut envelope: MessageEnvelope,
        context: &mut PipelineContext,
    ) -> Result<SendOutcome> {
        if envelope.message_type.is_none() {
            envelope.message_type = self.settings.message_type.clone();
        }
        if !envelope.delivery_mode.is_set() {
            envelope.delivery_mode = self.settings.delivery_mode;
        }
        if envelope.priority < 0 {
            envelope.priority = self.settings.priority;
        }

        let session = self.facade.create_session().await?;
        let result = self.send_with_session(&session, envelope, context).await;
        self.facade.release_session(session).await;
        result
    }

    async fn send_with_session(
        &self,
        session: &SessionHandle,
        mut envelope: MessageEnvelope,
        context: &mut PipelineContext,
    ) -> Result<SendOutcome> {
        let destination = self.facade.get_destination().await?;
        let correlation_id = context.correlation_id.clone();

        if !self.settings.synchronous {
            let message_id = self
                .facade
                .send(
                    session,
                    &destination,
                    correlation_id.as_deref(),
                    envelope,
                    false,
                )
                .await?;
            context.message_id = message_id.clone();
            return Ok(SendOutcome::Sent { message_id });
        }

        // Synchronous: route the reply either to the statically configured
        // destination or to a dynamic one obtained from the source.
        let (reply_destination, dynamic) = match &self.settings.reply_destination_name {
            Some(name) => (self.facade.get_destination_named(name).await?, false),
            None => (
                self.facade
                    .source()
                    .get_dynamic_reply_destination(session)
                    .await?,
                true,
            ),
        };
        envelope.reply_to = Some(reply_destination.clone());

        let outcome = self
            .send_and_wait(session, &destination, correlation_id.as_deref(), envelope, &reply_destination, context)
            .await;

        if dynamic {
            self.facade
                .source()
                .release_dynamic_reply_destination(session, &reply_destination)
                .await;
        }
        outcome
    }

    async fn send_and_wait(
        &self,
        session: &SessionHandle,
        destination: &crate::provider::DestinationHandle,
        correlation_id: Option<&str>,
        envelope: MessageEnvelope,
        reply_destination: &crate::provider::DestinationHandle,
        context: &mut PipelineContext,
    ) -> Result<SendOutcome> {
        let message_id = self
            .facade
            .send(session, destination, correlation_id, envelope, false)
            .await?
            .ok_or_else(|| {
                BridgeError::sender(format!(
                    "synchronous send on [{}] yielded no message id",
                    self.facade.config().name
                ))
            })?;
        context.message_id = Some(message_id.clone());

        let link_value = self.link_value(&message_id, correlation_id)?;
        debug!(
            sender = %self.facade.config().name,
            link_value = %link_value,
            reply_destination = %reply_destination,
            "Waiting for reply"
        );

        let consumer = self
            .facade
            .consumer_for_correlation_id(session, reply_destination, &link_value)
            .await?;
        let received = consumer
            .receive(self.settings.reply_timeout_ms)
            .await
            .map_err(BridgeError::from);
        if let Err(e) = consumer.close().await {
            warn!(sender = %self.facade.config().name, error = %e, "Error closing reply consumer");
        }

        let reply = received?.ok_or_else(|| {
            BridgeError::timeout("reply-wait", self.settings.reply_timeout_ms)
        })?;

        for key in &self.settings.response_properties {
            if let Some(value) = reply.property(key) {
                context.properties.insert(key.clone(), value);
            }
        }
        Ok(SendOutcome::Reply {
            payload: reply.payload(),
        })
    }

    /// The correlation value the reply consumer selects on. The hex/length
    /// transform runs at send time, so linking by correlation id applies
    /// the same transform here; the value on the wire is what replies echo
    /// back.
    fn link_value(&self, message_id: &str, correlation_id: Option<&str>) -> Result<String> {
        match self.settings.link_method {
            ReplyLinkMethod::MessageId => Ok(message_id.to_string()),
            ReplyLinkMethod::CorrelationId | ReplyLinkMethod::CorrelationIdFromMessage => {
                let cid = correlation_id.ok_or_else(|| {
                    BridgeError::sender(format!(
                        "sender [{}] links replies by correlation id but none was supplied",
                        self.facade.config().name
                    ))
                })?;
                Ok(transform_correlation_id(
                    cid,
                    &self.facade.config().correlation,
                ))
            }
        }
    }
}
