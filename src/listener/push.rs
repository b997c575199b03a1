//! Push listener: an external connector drives message delivery, and a poll
//! guard watches that the connector keeps polling.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ExitState, ListenerSettings};
use crate::error::Result;
use crate::facade::{MessageEnvelope, MessagingFacade};
use crate::listener::run_state::{RunState, RunStateFlag};
use crate::listener::{now_ms, ListenerCore, PipelineContext};
use crate::provider::ProviderMessage;
use crate::source::SessionHandle;

/// The subscription machinery a push listener delegates to: something that
/// polls the broker on its own threads and hands messages in.
#[async_trait]
pub trait ListenerConnector: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Decrements the processing-threads counter when the worker is done with a
/// message, panic or not.
pub struct ProcessingGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ProcessingGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Listener whose receive loop lives in an external connector.
///
/// The connector reports every finished poll through
/// [`record_poll_finished`](Self::record_poll_finished); a background guard
/// task checks at the configured interval that a poll finished recently.
/// When none did and no message is mid-processing, the connector is assumed
/// stuck and is bounced with one stop+start cycle.
pub struct PushingListener {
    core: ListenerCore,
    connector: Arc<dyn ListenerConnector>,
    run_state: Arc<RunStateFlag>,
    last_poll_finished_ms: Arc<AtomicU64>,
    threads_processing: Arc<AtomicUsize>,
    shutdown: Arc<Notify>,
    guard_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PushingListener {
    pub fn new(
        facade: Arc<MessagingFacade>,
        settings: ListenerSettings,
        connector: Arc<dyn ListenerConnector>,
    ) -> Self {
        Self {
            core: ListenerCore::new(facade, settings),
            connector,
            run_state: Arc::new(RunStateFlag::new()),
            last_poll_finished_ms: Arc::new(AtomicU64::new(0)),
            threads_processing: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::new(Notify::new()),
            guard_task: parking_lot::Mutex::new(None),
        }
    }

    pub fn core(&self) -> &ListenerCore {
        &self.core
    }

    pub fn run_state(&self) -> &Arc<RunStateFlag> {
        &self.run_state
    }

    pub fn threads_processing(&self) -> usize {
        self.threads_processing.load(Ordering::SeqCst)
    }

    /// Start the connector and the poll-guard task.
    pub async fn open(self: &Arc<Self>) -> Result<()> {
        let settings = self.core.settings();
        if !settings.poll_guard_interval_is_sane() {
            warn!(
                listener = %self.core.facade().config().name,
                poll_guard_interval_ms = settings.effective_poll_guard_interval_ms(),
                receive_timeout_ms = settings.receive_timeout_ms,
                "Poll guard interval does not exceed the receive timeout, stalls cannot be told from empty polls"
            );
        }

        self.run_state.set(RunState::Starting);
        self.core.facade().config().validate()?;
        if let Err(e) = self.connector.start().await {
            self.run_state.set(RunState::Stopped);
            return Err(e);
        }
        self.last_poll_finished_ms.store(now_ms(), Ordering::SeqCst);
        self.run_state.set(RunState::Started);

        let guard = Arc::clone(self);
        let interval = settings.effective_poll_guard_interval_ms();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = guard.shutdown.notified() => break,
                    _ = tokio::time::sleep(Duration::from_millis(interval)) => {
                        if let Err(e) = guard.check_poll_guard().await {
                            error!(
                                listener = %guard.core.facade().config().name,
                                error = %e,
                                "Poll guard failed to restart connector"
                            );
                        }
                    }
                }
            }
        });
        *self.guard_task.lock() = Some(handle);

        info!(listener = %self.core.facade().config().name, "Push listener opened");
        Ok(())
    }

    /// Stop the guard task and the connector.
    pub async fn close(&self) -> Result<()> {
        self.run_state.set(RunState::Stopping);
        // notify_one leaves a permit behind, so the guard task sees the
        // shutdown even if it was not parked on the notify yet.
        self.shutdown.notify_one();
        let handle = self.guard_task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(
                    listener = %self.core.facade().config().name,
                    error = %e,
                    "Poll guard task ended abnormally"
                );
            }
        }
        let stopped = self.connector.stop().await;
        self.run_state.set(RunState::Stopped);
        info!(listener = %self.core.facade().config().name, "Push listener closed");
        stopped
    }

    /// Called by the connector after every poll, fruitful or empty.
    pub fn record_poll_finished(&self) {
        self.last_poll_finished_ms.store(now_ms(), Ordering::SeqCst);
    }

    /// Called by the connector when it hands a message to a worker; hold the
    /// guard for as long as the message is being processed.
    pub fn begin_processing(&self) -> ProcessingGuard {
        self.threads_processing.fetch_add(1, Ordering::SeqCst);
        ProcessingGuard {
            counter: Arc::clone(&self.threads_processing),
        }
    }

    /// One poll-guard check. Recovery is a single stop+start of the
    /// connector; the poll clock is reset afterwards so one stall triggers
    /// one cycle, not a storm.
    ///
    /// Returns whether a recovery cycle ran.
    pub async fn check_poll_guard(&self) -> Result<bool> {
        if !self.run_state.is_started() {
            return Ok(false);
        }
        let interval = self.core.settings().effective_poll_guard_interval_ms();
        let last = self.last_poll_finished_ms.load(Ordering::SeqCst);
        if now_ms().saturating_sub(last) <= interval {
            return Ok(false);
        }
        if self.threads_processing.load(Ordering::SeqCst) > 0 {
            // Slow processing, not a stalled poll loop.
            return Ok(false);
        }

        warn!(
            listener = %self.core.facade().config().name,
            last_poll_finished_ms = last,
            poll_guard_interval_ms = interval,
            "No poll finished within the guard interval, restarting connector"
        );
        self.connector.stop().await?;
        self.connector.start().await?;
        self.last_poll_finished_ms.store(now_ms(), Ordering::SeqCst);
        info!(
            listener = %self.core.facade().config().name,
            "Connector restarted by poll guard"
        );
        Ok(true)
    }

    /// Finish one delivered message on the connector-provided session.
    pub async fn after_message_processed(
        &self,
        session: &SessionHandle,
        message: &dyn ProviderMessage,
        pipeline: &PipelineContext,
        exit: ExitState,
        reply: Option<MessageEnvelope>,
    ) -> Result<()> {
        self.core
            .after_message_processed(session, message, pipeline, exit, reply)
            .await
    }

    pub fn populate_context(&self, message: &dyn ProviderMessage) -> PipelineContext {
        self.core.populate_context(message)
    }
}
