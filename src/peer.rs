//! A managed, reconnecting session with one mirror.
//!
//! A [`PeerConnection`] owns the lifecycle of the session with a single
//! mirror:
//!
//! - **Single-flight connect**: concurrent callers of
//!   [`PeerConnection::connect`] share one dial loop, which retries with
//!   jittered [`Backoff`] while the connection is still needed.
//! - **Tracked cores**: every [`AddCoreRequest`] registered with
//!   [`PeerConnection::track`] is announced exactly once per session epoch,
//!   so a reconnect re-announces everything.
//! - **Explicit requests**: add, delete and mailbox requests are retried a
//!   bounded number of times across reconnects.
//! - **Lifecycle**: suspend, resume, bump and destroy cancel whatever the
//!   connection is currently waiting on.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, Wake, DEFAULT_BACKOFF};
use crate::core::{short_hex, Key};
use crate::protocol::{AddCoreRequest, DeleteCoreRequest, MailboxRequest, Method, MirrorAddr};
use crate::transport::{MirrorSession, MirrorTransport, Replicator, RequestError};

/// Default number of attempts for an explicit request.
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 5;

/// Per-connection tunables, usually derived from [`crate::PeeringConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerOptions {
    /// Base delays between failed dials.
    pub backoff: Vec<Duration>,
    /// How often an explicit request is tried before giving up.
    pub request_attempts: usize,
    /// Start in the suspended state.
    pub suspended: bool,
    /// Keep the session open for replication but never announce tracked
    /// cores.
    pub passive: bool,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            backoff: DEFAULT_BACKOFF.to_vec(),
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
            suspended: false,
            passive: false,
        }
    }
}

/// Snapshot of a connection's state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerStatus {
    pub connected: bool,
    pub suspended: bool,
    pub destroyed: bool,
    /// Number of sessions established so far.
    pub epoch: u64,
    pub tracked: usize,
}

type ConnectFuture = Shared<BoxFuture<'static, bool>>;

/// A core announced on behalf of one or more resources.
struct Tracked {
    /// Record per holding resource. The newest one is announced.
    holders: Vec<(Key, AddCoreRequest)>,
    /// Epoch in which the announced record was last sent.
    flushed: Option<u64>,
    /// Consecutive rejected or failed announcements.
    failures: usize,
}

impl Tracked {
    fn record(&self) -> Option<&AddCoreRequest> {
        self.holders.last().map(|(_, record)| record)
    }
}

struct PeerState<S> {
    session: Option<Arc<S>>,
    suspended: bool,
    destroyed: bool,
    epoch: u64,
    tracked: HashMap<Key, Tracked>,
    connecting: Option<(u64, ConnectFuture)>,
    next_connect_id: u64,
    backoff: Arc<Backoff>,
    /// Paces re-announcement of rejected records.
    retry: Arc<Backoff>,
    retry_scheduled: bool,
    cancel: CancellationToken,
    /// Bytes uploaded by sessions that have already ended.
    uploaded_before: u64,
}

impl<S: MirrorSession> PeerState<S> {
    /// Detach the current session, folding its upload count into the total.
    fn take_session(&mut self) -> Option<Arc<S>> {
        let session = self.session.take()?;
        self.uploaded_before += session.bytes_uploaded();
        Some(session)
    }
}

/// Decrements the in-flight request count when dropped.
struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Session manager for a single mirror.
pub struct PeerConnection<T: MirrorTransport> {
    mirror: MirrorAddr,
    transport: Arc<T>,
    replicator: Option<Arc<dyn Replicator<T::Session>>>,
    options: PeerOptions,
    state: Mutex<PeerState<T::Session>>,
    inflight: AtomicUsize,
    /// Bumped after every dial outcome and whenever a dial loop gives up.
    attempts: watch::Sender<u64>,
}

impl<T: MirrorTransport> fmt::Debug for PeerConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("mirror", &short_hex(&self.mirror.key))
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<T: MirrorTransport> PeerConnection<T> {
    /// Create an idle connection to `mirror`. Nothing is dialed until a core
    /// is tracked or a request is made.
    pub fn new(
        mirror: MirrorAddr,
        transport: Arc<T>,
        replicator: Option<Arc<dyn Replicator<T::Session>>>,
        options: PeerOptions,
    ) -> Arc<Self> {
        let state = PeerState {
            session: None,
            suspended: options.suspended,
            destroyed: false,
            epoch: 0,
            tracked: HashMap::new(),
            connecting: None,
            next_connect_id: 0,
            backoff: Arc::new(Backoff::new(options.backoff.clone())),
            retry: Arc::new(Backoff::new(options.backoff.clone())),
            retry_scheduled: false,
            cancel: CancellationToken::new(),
            uploaded_before: 0,
        };
        let (attempts, _) = watch::channel(0);
        Arc::new(Self {
            mirror,
            transport,
            replicator,
            options,
            state: Mutex::new(state),
            inflight: AtomicUsize::new(0),
            attempts,
        })
    }

    /// Address of the mirror this connection serves.
    pub fn mirror(&self) -> &MirrorAddr {
        &self.mirror
    }

    /// Number of explicit requests currently in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::SeqCst)
    }

    /// A connection is active while something needs it and nothing has
    /// stopped it.
    fn is_active(&self, state: &PeerState<T::Session>) -> bool {
        !state.destroyed
            && !state.suspended
            && !self.transport.is_closed()
            && (!state.tracked.is_empty() || self.inflight.load(Ordering::SeqCst) > 0)
    }

    /// Snapshot of the connection state.
    pub async fn status(&self) -> PeerStatus {
        let state = self.state.lock().await;
        PeerStatus {
            connected: state.session.is_some(),
            suspended: state.suspended,
            destroyed: state.destroyed,
            epoch: state.epoch,
            tracked: state.tracked.len(),
        }
    }

    /// Whether `key` is currently tracked on this connection.
    pub async fn is_tracking(&self, key: &Key) -> bool {
        self.state.lock().await.tracked.contains_key(key)
    }

    /// Total bytes uploaded to this mirror across all sessions.
    pub async fn uploaded(&self) -> u64 {
        let state = self.state.lock().await;
        state.uploaded_before
            + state
                .session
                .as_ref()
                .map_or(0, |session| session.bytes_uploaded())
    }

    // ========================================================================
    // Connecting
    // ========================================================================

    /// Connect, or join the dial loop already in progress.
    ///
    /// Returns `true` once a session is open and `false` if the loop gave up
    /// because the connection was suspended, destroyed, or no longer needed.
    pub async fn connect(self: &Arc<Self>) -> bool {
        let pending = {
            let mut state = self.state.lock().await;
            if state.session.is_some() {
                return true;
            }
            if !self.is_active(&state) {
                return false;
            }
            match &state.connecting {
                Some((_, pending)) => pending.clone(),
                None => {
                    let id = state.next_connect_id;
                    state.next_connect_id += 1;
                    let this = self.clone();
                    let cancel = state.cancel.clone();
                    let backoff = state.backoff.clone();
                    let handle = tokio::spawn(async move {
                        this.connect_loop(id, cancel, backoff).await
                    });
                    let owner = Arc::downgrade(self);
                    let pending = async move {
                        match handle.await {
                            Ok(connected) => connected,
                            Err(err) => {
                                // The loop never got to clear its own slot.
                                if let Some(this) = owner.upgrade() {
                                    warn!(
                                        mirror = %short_hex(&this.mirror.key),
                                        "connect loop failed: {err}"
                                    );
                                    let mut state = this.state.lock().await;
                                    if matches!(state.connecting, Some((current, _)) if current == id) {
                                        state.connecting = None;
                                    }
                                }
                                false
                            }
                        }
                    }
                    .boxed()
                    .shared();
                    state.connecting = Some((id, pending.clone()));
                    pending
                }
            }
        };
        pending.await
    }

    /// Resolve once the next dial attempt has finished, whatever its outcome.
    ///
    /// Returns immediately when already connected or not active.
    pub async fn attempt(self: &Arc<Self>) {
        let mut progress = self.attempts.subscribe();
        let seen = *progress.borrow_and_update();
        let progressed = async move {
            let _ = progress.wait_for(|n| *n > seen).await;
        };
        tokio::select! {
            _ = self.connect() => {}
            _ = progressed => {}
        }
    }

    fn spawn_connect(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            this.connect().await;
        });
    }

    async fn connect_loop(
        self: Arc<Self>,
        id: u64,
        cancel: CancellationToken,
        backoff: Arc<Backoff>,
    ) -> bool {
        let connected = loop {
            if !self.is_active(&*self.state.lock().await) {
                break false;
            }

            let dialed = tokio::select! {
                biased;
                _ = cancel.cancelled() => break false,
                res = self.transport.connect(&self.mirror) => res,
            };

            match dialed {
                Ok(session) => {
                    let installed = self.install(session).await;
                    if installed {
                        self.flush().await;
                    }
                    break installed;
                }
                Err(err) => {
                    debug!(
                        mirror = %short_hex(&self.mirror.key),
                        attempt = backoff.attempts() + 1,
                        "connect failed: {err:#}"
                    );
                    self.attempts.send_modify(|n| *n += 1);
                    if backoff.run().await == Wake::Destroyed {
                        break false;
                    }
                }
            }
        };

        {
            let mut state = self.state.lock().await;
            if matches!(state.connecting, Some((current, _)) if current == id) {
                state.connecting = None;
            }
        }
        self.attempts.send_modify(|n| *n += 1);
        connected
    }

    /// Adopt a freshly dialed session, unless the connection stopped being
    /// needed while the dial was in flight.
    async fn install(self: &Arc<Self>, session: T::Session) -> bool {
        let session = Arc::new(session);
        let epoch = {
            let mut state = self.state.lock().await;
            if !self.is_active(&state) {
                drop(state);
                session.close();
                return false;
            }
            state.epoch += 1;
            state.session = Some(session.clone());
            state.backoff.reset();
            state.epoch
        };
        info!(mirror = %short_hex(&self.mirror.key), epoch, "connected to mirror");

        if let Some(replicator) = &self.replicator {
            replicator.replicate(&self.mirror, &session);
        }

        let this = self.clone();
        tokio::spawn(async move {
            session.closed().await;
            this.on_session_closed(&session).await;
        });
        true
    }

    async fn on_session_closed(self: &Arc<Self>, session: &Arc<T::Session>) {
        let reconnect = {
            let mut state = self.state.lock().await;
            match &state.session {
                Some(current) if Arc::ptr_eq(current, session) => {}
                _ => return,
            }
            state.take_session();
            self.is_active(&state)
        };
        debug!(mirror = %short_hex(&self.mirror.key), reconnect, "mirror session closed");
        if reconnect {
            self.spawn_connect();
        }
    }

    /// Close `session` if it is still the current one.
    async fn drop_session(&self, session: &Arc<T::Session>) {
        let dropped = {
            let mut state = self.state.lock().await;
            match &state.session {
                Some(current) if Arc::ptr_eq(current, session) => state.take_session(),
                _ => None,
            }
        };
        if let Some(session) = dropped {
            session.close();
        }
    }

    // ========================================================================
    // Tracked cores
    // ========================================================================

    /// Register `record` for announcement on every session, held by the core
    /// itself.
    ///
    /// Replacing an existing record with a different one re-announces it.
    pub async fn track(self: &Arc<Self>, record: AddCoreRequest) {
        self.track_for(record.key, record).await;
    }

    /// Register `record` on behalf of the resource `owner`.
    ///
    /// Several resources may hold the same core. The record stays tracked
    /// until every holder has let go, and the most recently added record is
    /// the one announced.
    pub async fn track_for(self: &Arc<Self>, owner: Key, record: AddCoreRequest) {
        let connected = {
            let mut state = self.state.lock().await;
            let tracked = state.tracked.entry(record.key).or_insert_with(|| Tracked {
                holders: Vec::new(),
                flushed: None,
                failures: 0,
            });
            if tracked.holders.last() == Some(&(owner, record.clone())) {
                return;
            }
            let before = tracked.record().cloned();
            tracked.holders.retain(|(holder, _)| *holder != owner);
            tracked.holders.push((owner, record));
            if tracked.record() == before.as_ref() {
                return;
            }
            tracked.flushed = None;
            tracked.failures = 0;
            state.session.is_some()
        };
        if connected {
            self.flush().await;
        } else {
            self.spawn_connect();
        }
    }

    /// Stop announcing `key` on behalf of the core itself. Returns whether it
    /// held the record.
    pub async fn untrack(self: &Arc<Self>, key: &Key) -> bool {
        self.untrack_for(key, key).await
    }

    /// Drop `owner`'s hold on `key`. Returns whether `owner` held it.
    ///
    /// When another resource still holds the core and its record differs,
    /// that record is announced in place of the dropped one.
    pub async fn untrack_for(self: &Arc<Self>, owner: &Key, key: &Key) -> bool {
        let reannounce = {
            let mut state = self.state.lock().await;
            let Some(tracked) = state.tracked.get_mut(key) else {
                return false;
            };
            let before = tracked.record().cloned();
            let held = tracked.holders.len();
            tracked.holders.retain(|(holder, _)| holder != owner);
            if tracked.holders.len() == held {
                return false;
            }
            if tracked.holders.is_empty() {
                state.tracked.remove(key);
                return true;
            }
            if tracked.record() == before.as_ref() {
                return true;
            }
            tracked.flushed = None;
            tracked.failures = 0;
            state.session.is_some()
        };
        if reannounce {
            self.flush().await;
        }
        true
    }

    /// Announce every tracked record not yet sent in the current epoch.
    ///
    /// A transport failure drops the session, so the records go out again
    /// once it is redialed. Rejected records are retried on the same session
    /// after a backoff delay, up to the request attempt budget.
    async fn flush(self: &Arc<Self>) {
        if self.options.passive {
            return;
        }
        let (session, epoch, pending) = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.clone() else {
                return;
            };
            let epoch = state.epoch;
            let pending: Vec<AddCoreRequest> = state
                .tracked
                .values_mut()
                .filter(|tracked| tracked.flushed != Some(epoch))
                .filter_map(|tracked| {
                    tracked.flushed = Some(epoch);
                    tracked.record().cloned()
                })
                .collect();
            (session, epoch, pending)
        };
        if pending.is_empty() {
            return;
        }

        let batch = pending.len() > 1;
        let requests = join_all(
            pending
                .iter()
                .map(|record| session.request(Method::AddCore, record.encode())),
        );
        tokio::pin!(requests);

        // Start every request inside the cork window, then wait for answers.
        if batch {
            session.cork();
        }
        let early = futures::poll!(requests.as_mut());
        if batch {
            session.uncork();
        }
        let results = match early {
            Poll::Ready(results) => results,
            Poll::Pending => requests.await,
        };

        let mut announced = Vec::new();
        let mut rejected = Vec::new();
        let mut broken = false;
        for (record, result) in pending.iter().zip(results) {
            match result {
                Ok(_) => announced.push(record.key),
                Err(err) => {
                    warn!(
                        mirror = %short_hex(&self.mirror.key),
                        core = %short_hex(&record.key),
                        "announce failed: {err:#}"
                    );
                    broken |= matches!(err, RequestError::Transport(_));
                    rejected.push(record.key);
                }
            }
        }

        let retry = {
            let mut state = self.state.lock().await;
            for key in &announced {
                if let Some(tracked) = state.tracked.get_mut(key) {
                    tracked.failures = 0;
                }
            }
            let mut retry = false;
            for key in &rejected {
                if let Some(tracked) = state.tracked.get_mut(key) {
                    if tracked.flushed == Some(epoch) {
                        tracked.flushed = None;
                    }
                    tracked.failures += 1;
                    if tracked.failures < self.options.request_attempts {
                        retry = true;
                    } else {
                        debug!(
                            mirror = %short_hex(&self.mirror.key),
                            core = %short_hex(key),
                            "giving up on announce until the next session"
                        );
                    }
                }
            }
            if rejected.is_empty() {
                state.retry.reset();
            }
            if retry && !broken && !state.retry_scheduled && state.session.is_some() {
                state.retry_scheduled = true;
                Some((state.retry.clone(), state.cancel.clone()))
            } else {
                None
            }
        };

        if broken {
            self.drop_session(&session).await;
            self.spawn_connect();
        } else if let Some((backoff, cancel)) = retry {
            self.schedule_reflush(backoff, cancel);
        }
    }

    fn schedule_reflush(self: &Arc<Self>, backoff: Arc<Backoff>, cancel: CancellationToken) {
        let this = self.clone();
        tokio::spawn(async move {
            let wake = tokio::select! {
                _ = cancel.cancelled() => Wake::Destroyed,
                wake = backoff.run() => wake,
            };
            this.state.lock().await.retry_scheduled = false;
            if wake != Wake::Destroyed {
                this.flush().await;
            }
        });
    }

    // ========================================================================
    // Explicit requests
    // ========================================================================

    /// Wait for a usable session, connecting if needed.
    async fn session(self: &Arc<Self>) -> Result<Arc<T::Session>> {
        loop {
            {
                let state = self.state.lock().await;
                if state.destroyed {
                    bail!("peer connection destroyed");
                }
                if let Some(session) = &state.session {
                    return Ok(session.clone());
                }
                if state.suspended {
                    bail!("peer connection suspended");
                }
            }
            if !self.connect().await {
                if let Some(session) = &self.state.lock().await.session {
                    return Ok(session.clone());
                }
                bail!(
                    "mirror {} is not reachable",
                    short_hex(&self.mirror.key)
                );
            }
        }
    }

    /// Send one request, retrying failures up to the configured attempt
    /// budget.
    ///
    /// A transport failure drops the session so the next attempt waits for a
    /// fresh one; a rejection retries on the same session.
    pub async fn request(self: &Arc<Self>, method: Method, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        let _guard = InflightGuard(&self.inflight);

        let attempts = self.options.request_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let session = self.session().await?;
            match session.request(method, payload.clone()).await {
                Ok(response) => return Ok(response),
                Err(RequestError::Remote(reason)) => {
                    debug!(
                        mirror = %short_hex(&self.mirror.key),
                        %method,
                        attempt,
                        "mirror rejected request: {reason}"
                    );
                    last_err = Some(anyhow!("mirror rejected {method}: {reason}"));
                }
                Err(RequestError::Transport(err)) => {
                    debug!(
                        mirror = %short_hex(&self.mirror.key),
                        %method,
                        attempt,
                        "request failed: {err:#}"
                    );
                    self.drop_session(&session).await;
                    last_err = Some(err);
                }
            }
        }
        let err = last_err.unwrap_or_else(|| anyhow!("no attempt was made"));
        Err(err.context(format!(
            "{method} to mirror {} failed after {attempts} attempts",
            short_hex(&self.mirror.key)
        )))
    }

    /// Ask the mirror to replicate `record`, without tracking it.
    pub async fn add_core(self: &Arc<Self>, record: &AddCoreRequest) -> Result<()> {
        self.request(Method::AddCore, record.encode()).await?;
        Ok(())
    }

    /// Ask the mirror to drop `key`.
    pub async fn delete_core(self: &Arc<Self>, key: Key) -> Result<()> {
        let payload = DeleteCoreRequest { key }.encode();
        self.request(Method::DeleteCore, payload).await?;
        Ok(())
    }

    /// Deliver a message to a mailbox held by the mirror.
    pub async fn post_to_mailbox(self: &Arc<Self>, request: &MailboxRequest) -> Result<()> {
        self.request(Method::PostToMailbox, request.encode()).await?;
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Close the session and stop reconnecting until [`resume`](Self::resume).
    pub async fn suspend(&self) {
        let (session, pending) = {
            let mut state = self.state.lock().await;
            if state.suspended || state.destroyed {
                return;
            }
            state.suspended = true;
            state.backoff.destroy();
            state.cancel.cancel();
            (state.take_session(), state.connecting.take())
        };
        debug!(mirror = %short_hex(&self.mirror.key), "suspending peer connection");
        if let Some(session) = session {
            session.close();
        }
        if let Some((_, pending)) = pending {
            pending.await;
        }
    }

    /// Leave the suspended state and reconnect if still needed.
    pub async fn resume(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if !state.suspended || state.destroyed {
                return;
            }
            state.suspended = false;
            state.backoff = Arc::new(Backoff::new(self.options.backoff.clone()));
            state.retry = Arc::new(Backoff::new(self.options.backoff.clone()));
            state.cancel = CancellationToken::new();
        }
        debug!(mirror = %short_hex(&self.mirror.key), "resuming peer connection");
        self.spawn_connect();
    }

    /// React to a network change.
    ///
    /// Resets the backoff so a waiting dial loop retries now. With `force`
    /// the current session is dropped and redialed, otherwise it is only
    /// poked with a keep-alive.
    pub async fn bump(self: &Arc<Self>, force: bool) {
        let (dropped, current) = {
            let mut state = self.state.lock().await;
            if state.destroyed || state.suspended {
                return;
            }
            state.backoff.reset();
            if force {
                (state.take_session(), None)
            } else {
                (None, state.session.clone())
            }
        };
        if force {
            if let Some(session) = dropped {
                session.close();
            }
            self.spawn_connect();
        } else if let Some(session) = current {
            session.keep_alive();
        }
    }

    /// Close the session for good. Idempotent.
    pub async fn destroy(&self) {
        let (session, pending) = {
            let mut state = self.state.lock().await;
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.backoff.destroy();
            state.cancel.cancel();
            (state.take_session(), state.connecting.take())
        };
        debug!(mirror = %short_hex(&self.mirror.key), "destroying peer connection");
        if let Some(session) = session {
            session.close();
        }
        if let Some((_, pending)) = pending {
            pending.await;
        }
    }
}
