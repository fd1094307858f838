// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Tenant-scoped event-stream session manager.
//
// At most one tenant is bound to the stream at a time.  The tenant is bound
// when its first handshake succeeds and stays bound until `disconnect`; while
// bound, every transport failure schedules one reconnect after a fixed delay.
// `bound_tenant` is 0 when nothing is bound.  The running handshake, if any,
// is identified by id in `SessionData` and only its owner may finish it.  A
// binding carries its own cancellation token, so `disconnect` also abandons a
// reconnect handshake in flight for that binding.  `reconnect_pending` keeps
// at most one reconnect timer alive.
//
// Each live connection is owned by one reader task, which forwards job
// frames to the gateway and reports the first terminal event back here.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use labelbridge_core::config::StreamConfig;
use labelbridge_core::error::{BridgeError, Result};
use labelbridge_core::types::{SessionState, StreamStatus, TenantId};
use labelbridge_print::JobGateway;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::transport::{StreamConnection, StreamTransport, TransportEvent};

/// Inputs to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectRequested,
    Connected,
    FrameReceived,
    /// `tenant_bound` decides between reconnecting and giving up.
    TransportError { tenant_bound: bool },
    DisconnectRequested,
}

/// Pure transition function of the session state machine.
pub fn transition(state: SessionState, event: SessionEvent) -> SessionState {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (_, E::DisconnectRequested) => S::Disconnected,
        (_, E::TransportError { tenant_bound: true }) => S::Connecting,
        (_, E::TransportError { tenant_bound: false }) => S::Disconnected,
        (S::Disconnected, E::ConnectRequested) => S::Connecting,
        (S::Connecting, E::Connected) => S::Connected,
        (state, _) => state,
    }
}

struct ActiveSession {
    id: u64,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct SessionData {
    state: SessionState,
    /// Id of the handshake in progress.
    handshake: Option<u64>,
    /// Tenant whose first handshake is in progress.
    pending_tenant: Option<TenantId>,
    /// Cancelled when the bound tenant is unbound.
    binding: Option<CancellationToken>,
    last_message_time: Option<DateTime<Utc>>,
    last_connect_time: Option<DateTime<Utc>>,
    active: Option<ActiveSession>,
}

struct Inner {
    config: StreamConfig,
    transport: Arc<dyn StreamTransport>,
    gateway: JobGateway,
    bound_tenant: AtomicI64,
    reconnect_pending: AtomicBool,
    reconnect_attempts: AtomicU32,
    next_session_id: AtomicU64,
    data: Mutex<SessionData>,
    shutdown: CancellationToken,
}

/// Cloneable handle to the process-wide stream session.
#[derive(Clone)]
pub struct StreamSessionManager {
    inner: Arc<Inner>,
}

impl StreamSessionManager {
    pub fn new(
        config: StreamConfig,
        transport: Arc<dyn StreamTransport>,
        gateway: JobGateway,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                gateway,
                bound_tenant: AtomicI64::new(0),
                reconnect_pending: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                next_session_id: AtomicU64::new(1),
                data: Mutex::new(SessionData::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bind `tenant` to the stream and open its subscription.
    ///
    /// Returns once the handshake has succeeded or failed.  Calling this for
    /// the tenant that is already bound (or already connecting) does nothing.
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant))]
    pub async fn connect(&self, tenant: TenantId) -> Result<()> {
        let inner = &self.inner;
        if !inner.config.is_configured() {
            return Err(BridgeError::StreamNotConfigured);
        }
        if !tenant.is_valid() {
            return Err(BridgeError::InvalidTenant(tenant));
        }

        let handshake = {
            let mut data = inner.data();
            if let Some(bound) = inner.bound() {
                if bound != tenant {
                    return Err(BridgeError::TenantConflict {
                        bound,
                        requested: tenant,
                    });
                }
                debug!("tenant already bound");
                return Ok(());
            }
            if data.handshake.is_some() {
                if let Some(pending) = data.pending_tenant {
                    if pending != tenant {
                        return Err(BridgeError::TenantConflict {
                            bound: pending,
                            requested: tenant,
                        });
                    }
                    debug!("handshake already in progress");
                    return Ok(());
                }
            }
            let id = inner.next_session_id.fetch_add(1, Ordering::SeqCst);
            data.handshake = Some(id);
            data.pending_tenant = Some(tenant);
            data.state = transition(data.state, SessionEvent::ConnectRequested);
            id
        };

        match inner.establish(tenant).await {
            Ok(connection) => {
                let rejected = {
                    let mut data = inner.data();
                    let owned = inner.finish_handshake(&mut data, handshake);
                    if !owned || inner.shutdown.is_cancelled() {
                        if owned {
                            data.state = SessionState::Disconnected;
                        }
                        Some(connection)
                    } else {
                        inner.bound_tenant.store(tenant.0, Ordering::SeqCst);
                        data.binding = Some(inner.shutdown.child_token());
                        inner.on_connected(&mut data, tenant, connection);
                        None
                    }
                };
                if let Some(connection) = rejected {
                    close_quietly(connection).await;
                    return Err(BridgeError::ConnectionFailed("agent is shutting down".into()));
                }
                info!(topic = %inner.config.topic_for(tenant), "event stream connected");
                Ok(())
            }
            Err(e) => {
                let owned = {
                    let mut data = inner.data();
                    inner.finish_handshake(&mut data, handshake)
                };
                if owned {
                    inner.on_handshake_failed();
                }
                warn!(error = %e, "event stream connection failed");
                Err(e)
            }
        }
    }

    /// Unbind `tenant` and close its session.
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant))]
    pub async fn disconnect(&self, tenant: TenantId) -> Result<()> {
        let inner = &self.inner;
        if !tenant.is_valid() {
            return Err(BridgeError::InvalidTenant(tenant));
        }

        // Unbinding under the session lock turns any pending reconnect into a
        // no-op and abandons one already handshaking.
        let active = {
            let mut data = inner.data();
            if inner
                .bound_tenant
                .compare_exchange(tenant.0, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(BridgeError::TenantMismatch {
                    bound: inner.bound(),
                    requested: tenant,
                });
            }
            if let Some(binding) = data.binding.take() {
                binding.cancel();
            }
            if data.pending_tenant.is_none() {
                data.handshake = None;
            }
            data.state = transition(data.state, SessionEvent::DisconnectRequested);
            data.last_message_time = None;
            data.last_connect_time = None;
            data.active.take()
        };
        inner.reconnect_attempts.store(0, Ordering::SeqCst);

        if let Some(active) = active {
            inner.stop_session(active).await;
        }
        info!("event stream disconnected");
        Ok(())
    }

    /// Snapshot of the session.  `connected` is true only while `tenant` is
    /// the bound tenant and its session is live.
    pub fn get_status(&self, tenant: TenantId) -> StreamStatus {
        let mut status = self.status();
        status.connected = status.connected && status.bound_tenant == Some(tenant);
        status
    }

    /// Snapshot of the session regardless of tenant.
    pub fn status(&self) -> StreamStatus {
        let inner = &self.inner;
        let data = inner.data();
        StreamStatus {
            connected: data.state == SessionState::Connected && data.active.is_some(),
            state: data.state,
            bound_tenant: inner.bound(),
            last_message_time: data.last_message_time,
            last_connect_time: data.last_connect_time,
            server_url: inner.config.server_url.clone(),
            reconnect_attempts: inner.reconnect_attempts.load(Ordering::SeqCst),
        }
    }

    pub fn bound_tenant(&self) -> Option<TenantId> {
        self.inner.bound()
    }

    /// Report a failure of the current transport session from outside the
    /// reader, e.g. a missed keep-alive.  Tears the session down and, if a
    /// tenant is bound, schedules a reconnect.
    pub fn report_transport_error(&self, reason: &str) {
        self.inner.on_transport_error(None, reason);
    }

    /// Disconnect the bound tenant and cancel any pending reconnect.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        if let Some(tenant) = inner.bound() {
            if let Err(e) = self.disconnect(tenant).await {
                warn!(error = %e, "stream disconnect during shutdown failed");
            }
        }
        info!("event stream session manager shut down");
    }
}

impl Inner {
    fn data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bound(&self) -> Option<TenantId> {
        match self.bound_tenant.load(Ordering::SeqCst) {
            0 => None,
            id => Some(TenantId(id)),
        }
    }

    /// Release the handshake slot if `id` still owns it.
    fn finish_handshake(&self, data: &mut SessionData, id: u64) -> bool {
        if data.handshake != Some(id) {
            return false;
        }
        data.handshake = None;
        data.pending_tenant = None;
        true
    }

    /// Handshake and subscribe, bounded by the handshake timeout.
    async fn establish(&self, tenant: TenantId) -> Result<Box<dyn StreamConnection>> {
        let url = &self.config.server_url;
        let topic = self.config.topic_for(tenant);

        let handshake = async {
            let mut connection = self.transport.connect(url).await?;
            if let Err(e) = connection.subscribe(&topic).await {
                close_quietly(connection).await;
                return Err(e);
            }
            Ok(connection)
        };

        match tokio::time::timeout(self.config.handshake_timeout(), handshake).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e @ BridgeError::ConnectionFailed(_))) => Err(e),
            Ok(Err(e)) => Err(BridgeError::ConnectionFailed(e.to_string())),
            Err(_) => Err(BridgeError::ConnectionFailed(format!(
                "handshake with {url} timed out after {:?}",
                self.config.handshake_timeout()
            ))),
        }
    }

    fn on_connected(
        self: &Arc<Self>,
        data: &mut SessionData,
        tenant: TenantId,
        connection: Box<dyn StreamConnection>,
    ) {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let cancel = self.shutdown.child_token();
        let reader = tokio::spawn(read_session(
            Arc::clone(self),
            id,
            connection,
            cancel.clone(),
        ));

        if let Some(stale) = data.active.replace(ActiveSession { id, cancel, reader }) {
            stale.cancel.cancel();
        }
        data.last_connect_time = Some(Utc::now());
        data.state = transition(data.state, SessionEvent::Connected);
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        debug!(tenant_id = %tenant, session = id, "session bound");
    }

    fn on_handshake_failed(self: &Arc<Self>) {
        let tenant_bound = self.bound().is_some();
        {
            let mut data = self.data();
            data.state = transition(data.state, SessionEvent::TransportError { tenant_bound });
        }
        if tenant_bound {
            self.schedule_reconnect();
        }
    }

    fn on_frame(&self, body: &[u8]) {
        self.gateway.submit_stream_frame(body);
        let mut data = self.data();
        data.last_message_time = Some(Utc::now());
        data.state = transition(data.state, SessionEvent::FrameReceived);
    }

    /// `session` is the reporting reader's id; `None` means whatever session
    /// is current.  Reports from a session that has already been replaced
    /// are ignored.
    fn on_transport_error(self: &Arc<Self>, session: Option<u64>, reason: &str) {
        let tenant_bound = self.bound().is_some();
        {
            let mut data = self.data();
            let current = data.active.as_ref().map(|a| a.id);
            if session.is_some() && session != current {
                debug!(?session, "ignoring error from a replaced session");
                return;
            }
            if let Some(active) = data.active.take() {
                active.cancel.cancel();
            }
            data.state = transition(data.state, SessionEvent::TransportError { tenant_bound });
        }

        warn!(reason, tenant_bound, "event stream transport error");
        if tenant_bound {
            self.schedule_reconnect();
        }
    }

    /// Arm the reconnect timer unless one is already armed.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("reconnect already pending");
            return;
        }
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.config.reconnect_interval();
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    inner.reconnect_pending.store(false, Ordering::SeqCst);
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            inner.reconnect_pending.store(false, Ordering::SeqCst);
            inner.reconnect().await;
        });
    }

    async fn reconnect(self: &Arc<Self>) {
        let (tenant, handshake, binding) = {
            let mut data = self.data();
            let (Some(tenant), Some(binding)) = (self.bound(), data.binding.clone()) else {
                debug!("no tenant bound, reconnect dropped");
                return;
            };
            if data.active.is_some() || data.handshake.is_some() {
                debug!("session live or handshake running, reconnect dropped");
                return;
            }
            let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
            data.handshake = Some(id);
            (tenant, id, binding)
        };

        let outcome = tokio::select! {
            _ = binding.cancelled() => {
                debug!(tenant_id = %tenant, "reconnect abandoned, tenant unbound");
                return;
            }
            outcome = self.establish(tenant) => outcome,
        };

        match outcome {
            Ok(connection) => {
                let stale = {
                    let mut data = self.data();
                    let owned = self.finish_handshake(&mut data, handshake);
                    if !owned || binding.is_cancelled() || self.bound() != Some(tenant) {
                        Some(connection)
                    } else {
                        self.on_connected(&mut data, tenant, connection);
                        None
                    }
                };
                match stale {
                    Some(connection) => {
                        close_quietly(connection).await;
                        debug!(tenant_id = %tenant, "tenant unbound during reconnect");
                    }
                    None => info!(tenant_id = %tenant, "event stream reconnected"),
                }
            }
            Err(e) => {
                let owned = {
                    let mut data = self.data();
                    self.finish_handshake(&mut data, handshake)
                };
                warn!(tenant_id = %tenant, error = %e, "reconnect failed");
                if owned {
                    self.on_handshake_failed();
                }
            }
        }
    }

    async fn stop_session(&self, active: ActiveSession) {
        active.cancel.cancel();
        match tokio::time::timeout(self.config.handshake_timeout(), active.reader).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "stream reader ended abnormally"),
            Err(_) => warn!("stream reader did not stop in time"),
        }
    }
}

async fn close_quietly(mut connection: Box<dyn StreamConnection>) {
    if let Err(e) = connection.disconnect().await {
        debug!(error = %e, "closing stream connection failed");
    }
}

/// Reader task for one live connection.
async fn read_session(
    inner: Arc<Inner>,
    id: u64,
    mut connection: Box<dyn StreamConnection>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            event = connection.next_event() => Some(event),
        };
        let Some(event) = event else {
            close_quietly(connection).await;
            debug!(session = id, "stream reader stopped");
            return;
        };

        match event {
            TransportEvent::Frame(body) => inner.on_frame(&body),
            TransportEvent::Error(reason) => {
                inner.on_transport_error(Some(id), &reason);
                return;
            }
            TransportEvent::Closed => {
                inner.on_transport_error(Some(id), "connection closed by peer");
                return;
            }
        }
    }
}
