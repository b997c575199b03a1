//! A reference-counted source of sessions over one logical connection
//! factory.
//!
//! Two pooling modes:
//! - unpooled (default): one shared, lazily created connection carries every
//!   session; the connection and the shared dynamic reply destination are
//!   torn down when the last reference closes.
//! - pooled: each session gets its own connection, opened on checkout and
//!   closed on release. Temporary destinations are connection-scoped, so the
//!   shared-reply-destination optimization is disabled in this mode.

use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AcknowledgeMode, DestinationKind, SourcePolicy};
use crate::error::{BridgeError, Result};
use crate::provider::{
    Connection, ConnectionFactory, Credentials, DestinationHandle, PoolStats, Session,
};
use crate::source::registry::RegistryShared;

/// A checked-out session. Must be given back through
/// [`ConnectionSource::release_session`] exactly once.
#[derive(Clone)]
pub struct SessionHandle {
    pub id: Uuid,
    pub inner: Arc<dyn Session>,
    pub transacted: bool,
    pub ack_mode: AcknowledgeMode,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("transacted", &self.transacted)
            .field("ack_mode", &self.ack_mode)
            .finish()
    }
}

/// State mutated only under the source lock.
struct SourceState {
    reference_count: i64,
    shared_connection: Option<Arc<dyn Connection>>,
    shared_reply_destination: Option<DestinationHandle>,
    torn_down: bool,
}

pub struct ConnectionSource {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    credentials: Option<Credentials>,
    policy: SourcePolicy,
    registry: Arc<RegistryShared>,
    state: Mutex<SourceState>,
    /// Pooled mode: which connection was opened for which session, so
    /// release can close the pair.
    session_connections: DashMap<Uuid, Arc<dyn Connection>>,
    open_connections: AtomicUsize,
    open_sessions: AtomicUsize,
}

impl ConnectionSource {
    pub(crate) fn new(
        name: &str,
        factory: Arc<dyn ConnectionFactory>,
        credentials: Option<Credentials>,
        policy: SourcePolicy,
        registry: Arc<RegistryShared>,
    ) -> Self {
        Self {
            name: name.to_string(),
            factory,
            credentials,
            policy,
            registry,
            state: Mutex::new(SourceState {
                reference_count: 0,
                shared_connection: None,
                shared_reply_destination: None,
                torn_down: false,
            }),
            session_connections: DashMap::new(),
            open_connections: AtomicUsize::new(0),
            open_sessions: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &SourcePolicy {
        &self.policy
    }

    /// Diagnostic description of the physical endpoint behind this source.
    pub fn physical_name(&self) -> String {
        self.factory.physical_name()
    }

    /// Pool statistics when the factory manages a pool.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.factory.pool_stats()
    }

    pub fn open_connection_count(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    pub fn open_session_count(&self) -> usize {
        self.open_sessions.load(Ordering::SeqCst)
    }

    /// Take one more reference on this source.
    pub async fn increase_references(&self) {
        let mut state = self.state.lock().await;
        state.reference_count += 1;
        debug!(
            source = %self.name,
            references = state.reference_count,
            "Increased references"
        );
    }

    pub async fn reference_count(&self) -> i64 {
        self.state.lock().await.reference_count
    }

    /// Drop one reference. When the count reaches zero the source removes
    /// itself from the registry and tears down shared resources; returns
    /// true only for the call that performed the teardown.
    ///
    /// Takes the registry lock before the source state, same order as
    /// `get_or_create`, so close can never deadlock against a concurrent
    /// lookup and can never race a re-registration of the same name.
    pub async fn close(&self) -> Result<bool> {
        let _registry_guard = self.registry.lock.lock().await;
        let mut state = self.state.lock().await;
        state.reference_count -= 1;
        debug!(
            source = %self.name,
            references = state.reference_count,
            "Decreased references"
        );
        if state.reference_count > 0 || state.torn_down {
            return Ok(false);
        }
        state.torn_down = true;
        self.registry.map.remove(&self.name);

        if !self.policy.cleanup_on_close {
            info!(source = %self.name, "Closed connection source, cleanup disabled by policy");
            return Ok(true);
        }

        // The shared reply destination is deleted through a short-lived
        // session on the shared connection, before that connection goes.
        if let Some(reply) = state.shared_reply_destination.take() {
            if let Some(connection) = state.shared_connection.as_ref() {
                self.delete_reply_destination(connection.as_ref(), &reply)
                    .await;
            }
        }

        if let Some(connection) = state.shared_connection.take() {
            match connection.close().await {
                Ok(()) => {
                    self.open_connections.fetch_sub(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(source = %self.name, error = %e, "Error closing shared connection");
                }
            }
        }

        let sessions = self.open_sessions.load(Ordering::SeqCst);
        if sessions > 0 {
            warn!(
                source = %self.name,
                open_sessions = sessions,
                "Sessions still open after final close"
            );
        }
        let connections = self.open_connections.load(Ordering::SeqCst);
        if connections > 0 {
            warn!(
                source = %self.name,
                open_connections = connections,
                "Connections still open after final close"
            );
        }

        info!(source = %self.name, "Closed connection source");
        Ok(true)
    }

    async fn delete_reply_destination(
        &self,
        connection: &dyn Connection,
        reply: &DestinationHandle,
    ) {
        match connection.create_session(false, AcknowledgeMode::Auto).await {
            Ok(session) => {
                if let Err(e) = session.delete_temporary_destination(reply).await {
                    warn!(
                        source = %self.name,
                        destination = %reply,
                        error = %e,
                        "Error deleting shared reply destination"
                    );
                }
                if let Err(e) = session.close().await {
                    warn!(source = %self.name, error = %e, "Error closing cleanup session");
                }
            }
            Err(e) => {
                warn!(
                    source = %self.name,
                    error = %e,
                    "Could not open cleanup session for shared reply destination"
                );
            }
        }
    }

    /// Check out a session.
    ///
    /// Pooled mode opens a dedicated started connection for the session and
    /// remembers the pairing for release. Unpooled mode rides the shared
    /// connection, created lazily on first use.
    pub async fn create_session(
        &self,
        transacted: bool,
        ack_mode: AcknowledgeMode,
    ) -> Result<SessionHandle> {
        let connection = if self.policy.connections_are_pooled {
            self.open_connection().await?
        } else {
            self.shared_connection().await?
        };

        let session = connection
            .create_session(transacted, ack_mode)
            .await
            .map_err(|e| {
                BridgeError::connection(format!(
                    "could not create session on [{}]: {e}",
                    self.name
                ))
            })?;

        let handle = SessionHandle {
            id: Uuid::new_v4(),
            inner: session,
            transacted,
            ack_mode,
        };
        if self.policy.connections_are_pooled {
            self.session_connections.insert(handle.id, connection);
        }
        self.open_sessions.fetch_add(1, Ordering::SeqCst);
        debug!(source = %self.name, session_id = %handle.id, "Created session");
        Ok(handle)
    }

    /// Give a session back. Close errors are logged and suppressed; in
    /// pooled mode the paired connection goes down with the session.
    pub async fn release_session(&self, session: SessionHandle) {
        if let Err(e) = session.inner.close().await {
            warn!(
                source = %self.name,
                session_id = %session.id,
                error = %e,
                "Error closing session"
            );
        }
        self.open_sessions.fetch_sub(1, Ordering::SeqCst);

        if let Some((_, connection)) = self.session_connections.remove(&session.id) {
            match connection.close().await {
                Ok(()) => {
                    self.open_connections.fetch_sub(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(
                        source = %self.name,
                        session_id = %session.id,
                        error = %e,
                        "Error closing pooled connection"
                    );
                }
            }
        }
    }

    /// Get a dynamic reply destination for request/reply sends.
    ///
    /// When reply sharing is in effect one temporary destination is created
    /// lazily and handed to every caller; otherwise each call creates a
    /// fresh one that the caller must return through
    /// [`release_dynamic_reply_destination`](Self::release_dynamic_reply_destination).
    pub async fn get_dynamic_reply_destination(
        &self,
        session: &SessionHandle,
    ) -> Result<DestinationHandle> {
        if self.policy.use_single_dynamic_reply_queue() {
            let mut state = self.state.lock().await;
            if let Some(existing) = &state.shared_reply_destination {
                return Ok(existing.clone());
            }
            let destination = session
                .inner
                .create_temporary_destination(DestinationKind::Queue)
                .await?;
            info!(
                source = %self.name,
                destination = %destination,
                "Created shared dynamic reply destination"
            );
            state.shared_reply_destination = Some(destination.clone());
            Ok(destination)
        } else {
            let destination = session
                .inner
                .create_temporary_destination(DestinationKind::Queue)
                .await?;
            debug!(
                source = %self.name,
                destination = %destination,
                "Created per-call dynamic reply destination"
            );
            Ok(destination)
        }
    }

    /// Release a dynamic reply destination obtained from this source. Shared
    /// destinations stay alive until final close; per-call ones are deleted
    /// here.
    pub async fn release_dynamic_reply_destination(
        &self,
        session: &SessionHandle,
        destination: &DestinationHandle,
    ) {
        if self.policy.use_single_dynamic_reply_queue() {
            return;
        }
        if let Err(e) = session
            .inner
            .delete_temporary_destination(destination)
            .await
        {
            warn!(
                source = %self.name,
                destination = %destination,
                error = %e,
                "Error deleting dynamic reply destination"
            );
        }
    }

    /// The shared connection, created and started on first use. Double
    /// checked so steady-state callers take the lock only briefly.
    async fn shared_connection(&self) -> Result<Arc<dyn Connection>> {
        {
            let state = self.state.lock().await;
            if state.torn_down {
                return Err(BridgeError::connection(format!(
                    "connection source [{}] is closed",
                    self.name
                )));
            }
            if let Some(connection) = &state.shared_connection {
                return Ok(Arc::clone(connection));
            }
        }

        let mut state = self.state.lock().await;
        if let Some(connection) = &state.shared_connection {
            return Ok(Arc::clone(connection));
        }
        let connection = self.open_connection().await?;
        info!(source = %self.name, "Opened shared connection");
        state.shared_connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn open_connection(&self) -> Result<Arc<dyn Connection>> {
        let connection = self
            .factory
            .create_connection(self.credentials.as_ref())
            .await
            .map_err(|e| {
                BridgeError::connection(format!(
                    "could not create connection for [{}]: {e}",
                    self.name
                ))
            })?;
        connection.start().await.map_err(|e| {
            BridgeError::connection(format!(
                "could not start connection for [{}]: {e}",
                self.name
            ))
        })?;
        self.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }
}

impl std::fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSource")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("open_connections", &self.open_connection_count())
            .field("open_sessions", &self.open_session_count())
            .finish()
    }
}
