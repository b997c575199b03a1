//! Pull listener: workers drive blocking receives themselves.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{ExitState, ListenerSettings};
use crate::error::{BridgeError, Result};
use crate::facade::{MessageEnvelope, MessagingFacade};
use crate::listener::run_state::{RunState, RunStateFlag};
use crate::listener::{ListenerCore, ListenerThreadContext, PipelineContext};
use crate::provider::ProviderMessage;

/// Polling listener. Each worker owns a [`ListenerThreadContext`]; when
/// sessions are held per worker the session and consumer live there across
/// receives, when they are pooled they are checked out per message and
/// returned in [`after_message_processed`](Self::after_message_processed).
pub struct PullingListener {
    core: ListenerCore,
    run_state: Arc<RunStateFlag>,
}

impl PullingListener {
    pub fn new(facade: Arc<MessagingFacade>, settings: ListenerSettings) -> Self {
        Self {
            core: ListenerCore::new(facade, settings),
            run_state: Arc::new(RunStateFlag::new()),
        }
    }

    pub fn core(&self) -> &ListenerCore {
        &self.core
    }

    pub fn run_state(&self) -> &Arc<RunStateFlag> {
        &self.run_state
    }

    /// Validate configuration, warm the destination cache and mark the
    /// listener started.
    pub async fn open(&self) -> Result<()> {
        self.run_state.set(RunState::Starting);
        let facade = self.core.facade();
        facade.config().validate()?;
        if let Err(e) = facade.get_destination().await {
            self.run_state.set(RunState::Stopped);
            return Err(e);
        }
        self.run_state.set(RunState::Started);
        info!(listener = %facade.config().name, "Listener opened");
        Ok(())
    }

    pub async fn close(&self) {
        self.run_state.set(RunState::Stopping);
        self.run_state.set(RunState::Stopped);
        info!(listener = %self.core.facade().config().name, "Listener closed");
    }

    pub async fn open_thread(&self) -> Result<ListenerThreadContext> {
        Ok(ListenerThreadContext::default())
    }

    /// Release whatever the worker still holds. Close errors are logged,
    /// never propagated.
    pub async fn close_thread(&self, mut context: ListenerThreadContext) {
        if let Some(consumer) = context.consumer.take() {
            if let Err(e) = consumer.close().await {
                warn!(
                    listener = %self.core.facade().config().name,
                    error = %e,
                    "Error closing consumer"
                );
            }
        }
        if let Some(session) = context.session.take() {
            self.core.facade().release_session(session).await;
        }
    }

    /// Blocking receive, up to the configured timeout per attempt.
    ///
    /// Without a correlation id the uncorrelated consumer is retried while
    /// the listener is started and the session is untransacted, so an empty
    /// queue does not bounce the worker. With a correlation id a dedicated
    /// consumer is used once; no message within the window is a timeout
    /// failure, not an empty result.
    pub async fn receive(
        &self,
        context: &mut ListenerThreadContext,
        correlation_id: Option<&str>,
    ) -> Result<Option<Box<dyn ProviderMessage>>> {
        let facade = self.core.facade();
        let timeout_ms = self.core.settings().receive_timeout_ms;

        if context.session.is_none() {
            context.session = Some(facade.create_session().await?);
        }
        let session = context
            .session
            .clone()
            .ok_or_else(|| BridgeError::internal("listener thread context lost its session"))?;
        let destination = facade.get_destination().await?;

        if let Some(correlation_id) = correlation_id {
            let consumer = facade
                .consumer_for_correlation_id(&session, &destination, correlation_id)
                .await?;
            let received = consumer.receive(timeout_ms).await.map_err(BridgeError::from);
            if let Err(e) = consumer.close().await {
                warn!(
                    listener = %facade.config().name,
                    error = %e,
                    "Error closing correlated consumer"
                );
            }
            return match received? {
                Some(message) => Ok(Some(message)),
                None => Err(BridgeError::timeout("correlated-receive", timeout_ms)),
            };
        }

        if context.consumer.is_none() {
            context.consumer = Some(facade.create_consumer(&session, &destination, None).await?);
        }
        let consumer = context
            .consumer
            .as_ref()
            .ok_or_else(|| BridgeError::internal("listener thread context lost its consumer"))?;

        loop {
            if let Some(message) = consumer.receive(timeout_ms).await.map_err(BridgeError::from)? {
                return Ok(Some(message));
            }
            let can_go_on = self.run_state.is_started()
                && !session.transacted
                && !facade.config().transacted;
            if !can_go_on {
                return Ok(None);
            }
            debug!(
                listener = %facade.config().name,
                "No message within timeout, polling again"
            );
        }
    }

    /// Postbox-style one-shot retrieval by message selector.
    pub async fn retrieve_by_selector(
        &self,
        selector: &str,
    ) -> Result<Option<Box<dyn ProviderMessage>>> {
        let facade = self.core.facade();
        let session = facade.create_session().await?;
        let result = async {
            let destination = facade.get_destination().await?;
            let consumer = facade
                .create_consumer(&session, &destination, Some(selector))
                .await?;
            let received = consumer
                .receive(self.core.settings().receive_timeout_ms)
                .await
                .map_err(BridgeError::from);
            if let Err(e) = consumer.close().await {
                warn!(listener = %facade.config().name, error = %e, "Error closing consumer");
            }
            received
        }
        .await;
        facade.release_session(session).await;
        result
    }

    /// Finish one message: send the reply when there is one, settle the
    /// inbound message, and in pooled mode return the worker's session.
    pub async fn after_message_processed(
        &self,
        context: &mut ListenerThreadContext,
        message: &dyn ProviderMessage,
        pipeline: &PipelineContext,
        exit: ExitState,
        reply: Option<MessageEnvelope>,
    ) -> Result<()> {
        let facade = self.core.facade();
        let session = context
            .session
            .as_ref()
            .ok_or_else(|| BridgeError::internal("listener thread context lost its session"))?;

        let result = self
            .core
            .after_message_processed(session, message, pipeline, exit, reply)
            .await;

        if facade.sessions_are_pooled() {
            if let Some(consumer) = context.consumer.take() {
                if let Err(e) = consumer.close().await {
                    warn!(
                        listener = %facade.config().name,
                        error = %e,
                        "Error closing consumer"
                    );
                }
            }
            if let Some(session) = context.session.take() {
                facade.release_session(session).await;
            }
        }
        result
    }
}
