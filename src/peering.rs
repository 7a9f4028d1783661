//! The orchestrator: maps cores and autobases onto their closest mirrors.
//!
//! [`MirrorPeering`] is the public entry point. For every resource it picks
//! the closest mirrors by XOR distance, takes a [`PeerLease`] on each, and
//! tracks the resource's announcement records on those connections until
//! the resource closes. Leases are released when the resource goes away,
//! after which the [`Registry`] collects idle connections.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PeeringConfig;
use crate::core::{closest, closest_one, short_hex, Key};
use crate::peer::PeerConnection;
use crate::protocol::{AddCoreRequest, MailboxRequest, MirrorAddr};
use crate::registry::{PeerLease, Registry};
use crate::resource::{Autobase, AutobaseEvent, Core};
use crate::transport::{MirrorTransport, Replicator};

/// Options for [`MirrorPeering::add_core`].
#[derive(Clone, Debug, Default)]
pub struct AddCoreOptions {
    /// Logical group the core belongs to.
    pub referrer: Option<Key>,
    pub priority: u64,
    /// Ask the mirrors to announce the core on the DHT.
    pub announce: bool,
    /// Number of mirrors to use instead of the configured `pick`.
    pub pick: Option<usize>,
    /// Candidates to use instead of the configured core mirrors.
    pub mirrors: Option<Vec<MirrorAddr>>,
}

/// Options for [`MirrorPeering::add_autobase`].
#[derive(Clone, Debug, Default)]
pub struct AddAutobaseOptions {
    /// Track every writer, not only static ones.
    pub all: bool,
    pub pick: Option<usize>,
    /// Candidates to use instead of the configured autobase mirrors.
    pub mirrors: Option<Vec<MirrorAddr>>,
}

/// Options for [`MirrorPeering::delete_core`].
#[derive(Clone, Debug, Default)]
pub struct DeleteCoreOptions {
    pub pick: Option<usize>,
    pub mirrors: Option<Vec<MirrorAddr>>,
}

/// A change in local network connectivity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkChange {
    /// Drop and redial live sessions instead of only poking them.
    pub force: bool,
}

/// Records and leases held on behalf of one core or autobase.
struct Tracking<T: MirrorTransport> {
    leases: Vec<PeerLease<T>>,
    records: HashMap<Key, AddCoreRequest>,
}

impl<T: MirrorTransport> Default for Tracking<T> {
    fn default() -> Self {
        Self {
            leases: Vec::new(),
            records: HashMap::new(),
        }
    }
}

impl<T: MirrorTransport> Tracking<T> {
    fn peers(&self) -> Vec<Arc<PeerConnection<T>>> {
        self.leases.iter().map(|lease| lease.peer().clone()).collect()
    }
}

struct Inner<T: MirrorTransport> {
    config: PeeringConfig,
    registry: Registry<T>,
    tracking: Mutex<HashMap<Key, Tracking<T>>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Builder for [`MirrorPeering`].
pub struct PeeringBuilder<T: MirrorTransport> {
    transport: T,
    config: PeeringConfig,
    replicator: Option<Arc<dyn Replicator<T::Session>>>,
    network: Option<broadcast::Receiver<NetworkChange>>,
    suspended: bool,
}

impl<T: MirrorTransport> PeeringBuilder<T> {
    /// Start a builder with the default config.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: PeeringConfig::default(),
            replicator: None,
            network: None,
            suspended: false,
        }
    }

    /// Use `config` instead of the defaults.
    pub fn config(mut self, config: PeeringConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach local replication to every new session.
    pub fn replicator(mut self, replicator: Arc<dyn Replicator<T::Session>>) -> Self {
        self.replicator = Some(replicator);
        self
    }

    /// Bump all connections whenever the host reports a network change.
    pub fn network_changes(mut self, changes: broadcast::Receiver<NetworkChange>) -> Self {
        self.network = Some(changes);
        self
    }

    /// Start in the suspended state.
    pub fn suspended(mut self, suspended: bool) -> Self {
        self.suspended = suspended;
        self
    }

    /// Build the orchestrator. Must be called inside a tokio runtime when a
    /// network change feed was attached.
    pub fn build(self) -> MirrorPeering<T> {
        let mut options = self.config.peer_options();
        options.suspended = self.suspended;
        let registry = Registry::new(
            Arc::new(self.transport),
            self.replicator,
            options,
            self.config.gc_policy(),
        );
        let peering = MirrorPeering {
            inner: Arc::new(Inner {
                config: self.config,
                registry,
                tracking: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        };
        if let Some(changes) = self.network {
            peering.watch_network(changes);
        }
        peering
    }
}

/// Keeps cores and autobases replicated on their closest mirrors.
pub struct MirrorPeering<T: MirrorTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: MirrorTransport> Clone for MirrorPeering<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: MirrorTransport> fmt::Debug for MirrorPeering<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorPeering")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<T: MirrorTransport> MirrorPeering<T> {
    /// Build a peering instance over `transport`.
    pub fn builder(transport: T) -> PeeringBuilder<T> {
        PeeringBuilder::new(transport)
    }

    /// The active configuration.
    pub fn config(&self) -> &PeeringConfig {
        &self.inner.config
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Keys of mirrors with a live peer connection.
    pub async fn peer_keys(&self) -> Vec<Key> {
        self.inner.registry.keys().await
    }

    /// Whether the core or autobase with `key` is currently mirrored.
    pub async fn is_tracking(&self, key: &Key) -> bool {
        self.inner.tracking.lock().await.contains_key(key)
    }

    /// The shared connection registry.
    pub fn registry(&self) -> &Registry<T> {
        &self.inner.registry
    }

    // ========================================================================
    // Cores
    // ========================================================================

    /// Mirror `core` on the mirrors closest to `target` (default: its key).
    ///
    /// Returns once every selected mirror has had at least one connection
    /// attempt. Closing the core stops the mirroring.
    pub async fn add_core(
        &self,
        core: Arc<dyn Core>,
        target: Option<Key>,
        options: AddCoreOptions,
    ) -> Result<()> {
        core.ready().await.context("core failed to open")?;
        if core.is_closing() || self.is_closed() {
            return Ok(());
        }

        let key = core.key();
        let target = target.unwrap_or(key);
        let candidates = options
            .mirrors
            .as_ref()
            .unwrap_or(&self.inner.config.core_mirrors);
        let pick = options.pick.unwrap_or(self.inner.config.pick);
        let selected = pick_mirrors(&target, candidates, pick);
        if selected.is_empty() {
            debug!(core = %short_hex(&key), "no mirrors to add core to");
            return Ok(());
        }
        if !self.begin_tracking(key).await {
            return Ok(());
        }

        let record = AddCoreRequest {
            key,
            referrer: options.referrer,
            priority: options.priority,
            announce: options.announce,
            ..AddCoreRequest::default()
        };
        let peers = self.attach(key, &selected, vec![record]).await?;
        debug!(core = %short_hex(&key), mirrors = peers.len(), "mirroring core");

        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.inner.shutdown.cancelled() => {}
                _ = core.closed() => this.stop_tracking(&key).await,
            }
        });

        join_all(peers.iter().map(|peer| peer.attempt())).await;
        Ok(())
    }

    /// Fire-and-forget [`add_core`](Self::add_core); failures are logged.
    pub fn add_core_background(
        &self,
        core: Arc<dyn Core>,
        target: Option<Key>,
        options: AddCoreOptions,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let key = core.key();
            if let Err(err) = this.add_core(core, target, options).await {
                warn!(core = %short_hex(&key), "add core failed: {err:#}");
            }
        });
    }

    /// Ask the mirrors closest to `target` (default: `key`) to drop a core.
    ///
    /// Every selected mirror is asked even if some fail; the first failure
    /// is returned.
    pub async fn delete_core(
        &self,
        key: Key,
        target: Option<Key>,
        options: DeleteCoreOptions,
    ) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let target = target.unwrap_or(key);
        let candidates = options
            .mirrors
            .as_ref()
            .unwrap_or(&self.inner.config.core_mirrors);
        let pick = options.pick.unwrap_or(self.inner.config.pick);
        let selected = pick_mirrors(&target, candidates, pick);

        let mut leases = Vec::with_capacity(selected.len());
        for mirror in &selected {
            match self.inner.registry.acquire(mirror).await {
                Ok(lease) => leases.push(lease),
                Err(err) => {
                    self.release_all(leases).await;
                    return Err(err);
                }
            }
        }

        let results = join_all(leases.iter().map(|lease| lease.peer().delete_core(key))).await;
        self.release_all(leases).await;

        let mut first = None;
        for err in results.into_iter().filter_map(Result::err) {
            warn!(core = %short_hex(&key), "delete core failed: {err:#}");
            first.get_or_insert(err);
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Like [`delete_core`](Self::delete_core), logging failures instead of returning them.
    pub fn delete_core_background(&self, key: Key, target: Option<Key>, options: DeleteCoreOptions) {
        let this = self.clone();
        tokio::spawn(async move {
            let _ = this.delete_core(key, target, options).await;
        });
    }

    // ========================================================================
    // Autobases
    // ========================================================================

    /// Mirror an autobase's local writer and writer cores on the mirrors
    /// closest to `target` (default: the autobase key).
    ///
    /// New writers are added as they appear; a storage migration re-syncs
    /// the tracked set. Closing the autobase stops the mirroring.
    pub async fn add_autobase(
        &self,
        base: Arc<dyn Autobase>,
        target: Option<Key>,
        options: AddAutobaseOptions,
    ) -> Result<()> {
        base.ready().await.context("autobase failed to open")?;
        if base.is_closing() || self.is_closed() {
            return Ok(());
        }

        let key = base.key();
        let target = target.unwrap_or(key);
        let candidates = options
            .mirrors
            .as_ref()
            .unwrap_or(&self.inner.config.autobase_mirrors);
        let pick = options.pick.unwrap_or(self.inner.config.pick);
        let selected = pick_mirrors(&target, candidates, pick);
        if selected.is_empty() {
            debug!(autobase = %short_hex(&key), "no mirrors to add autobase to");
            return Ok(());
        }
        if !self.begin_tracking(key).await {
            return Ok(());
        }

        // Subscribe before reading the writer set so no writer slips between.
        let mut events = base.subscribe();
        let records = self.autobase_records(&*base, options.all);
        let peers = self.attach(key, &selected, records).await?;
        info!(
            autobase = %short_hex(&key),
            mirrors = peers.len(),
            "mirroring autobase"
        );

        let this = self.clone();
        let all = options.all;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.inner.shutdown.cancelled() => return,
                    _ = base.closed() => break,
                    event = events.recv() => match event {
                        Ok(AutobaseEvent::Writer(core)) => {
                            if all || core.is_static() {
                                let record = writer_record(core.key(), key);
                                this.add_records(&key, vec![record]).await;
                            }
                        }
                        Ok(AutobaseEvent::Migrate) => this.resync_autobase(&*base, all).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(autobase = %short_hex(&key), skipped, "writer events lagged");
                            this.resync_autobase(&*base, all).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tokio::select! {
                                _ = this.inner.shutdown.cancelled() => return,
                                _ = base.closed() => break,
                            }
                        }
                    },
                }
            }
            this.stop_tracking(&key).await;
        });

        join_all(peers.iter().map(|peer| peer.attempt())).await;
        Ok(())
    }

    /// Like [`add_autobase`](Self::add_autobase), logging failures instead of returning them.
    pub fn add_autobase_background(
        &self,
        base: Arc<dyn Autobase>,
        target: Option<Key>,
        options: AddAutobaseOptions,
    ) {
        let this = self.clone();
        tokio::spawn(async move {
            let key = base.key();
            if let Err(err) = this.add_autobase(base, target, options).await {
                warn!(autobase = %short_hex(&key), "add autobase failed: {err:#}");
            }
        });
    }

    /// Records for the local writer and a bounded sample of eligible writers.
    fn autobase_records(&self, base: &dyn Autobase, all: bool) -> Vec<AddCoreRequest> {
        let referrer = base.key();
        let mut records = Vec::new();

        let local = base.local_writer().map(|core| core.key());
        if let Some(local) = local {
            let mut record = writer_record(local, referrer);
            if let Some(descriptor) = base.descriptor() {
                record.deprecated_autobase = Some(descriptor.key);
                record.deprecated_autobase_block_key = descriptor.block_encryption_key;
            }
            records.push(record);
        }

        let mut seen = HashSet::new();
        let mut writers: Vec<Key> = base
            .writers()
            .into_iter()
            .filter(|core| all || core.is_static())
            .map(|core| core.key())
            .filter(|writer| Some(*writer) != local && seen.insert(*writer))
            .collect();
        let max = self.inner.config.max_autobase_writers;
        if writers.len() > max {
            let (sample, _) = writers.partial_shuffle(&mut rand::thread_rng(), max);
            writers = sample.to_vec();
        }
        records.extend(writers.into_iter().map(|writer| writer_record(writer, referrer)));
        records
    }

    /// Bring the tracked records of an autobase in line with its current
    /// writer set.
    async fn resync_autobase(&self, base: &dyn Autobase, all: bool) {
        let key = base.key();
        let records = self.autobase_records(base, all);
        let mut eligible: HashSet<Key> = base
            .writers()
            .into_iter()
            .filter(|core| all || core.is_static())
            .map(|core| core.key())
            .collect();
        eligible.extend(records.iter().map(|record| record.key));

        let (peers, stale) = {
            let mut tracking = self.inner.tracking.lock().await;
            let Some(entry) = tracking.get_mut(&key) else {
                return;
            };
            let stale: Vec<Key> = entry
                .records
                .keys()
                .filter(|core| !eligible.contains(*core))
                .copied()
                .collect();
            for core in &stale {
                entry.records.remove(core);
            }
            (entry.peers(), stale)
        };
        debug!(autobase = %short_hex(&key), dropped = stale.len(), "resyncing autobase writers");
        for peer in &peers {
            for core in &stale {
                peer.untrack_for(&key, core).await;
            }
        }
        self.add_records(&key, records).await;
    }

    /// Track new or changed records on every peer serving `resource`.
    async fn add_records(&self, resource: &Key, records: Vec<AddCoreRequest>) {
        let (peers, changed) = {
            let mut tracking = self.inner.tracking.lock().await;
            let Some(entry) = tracking.get_mut(resource) else {
                return;
            };
            let mut changed = Vec::new();
            for record in records {
                if entry.records.get(&record.key) != Some(&record) {
                    entry.records.insert(record.key, record.clone());
                    changed.push(record);
                }
            }
            (entry.peers(), changed)
        };
        for peer in &peers {
            for record in &changed {
                peer.track_for(*resource, record.clone()).await;
            }
        }
    }

    // ========================================================================
    // Mailbox
    // ========================================================================

    /// Deliver `message` to `mailbox` on the autobase mirror closest to
    /// `target`.
    ///
    /// Returns `false` without sending when no mirror is configured.
    pub async fn post_to_mailbox(
        &self,
        target: Key,
        mailbox: Vec<u8>,
        message: Vec<u8>,
    ) -> Result<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        let Some(mirror) = closest_one(&target, &self.inner.config.autobase_mirrors).cloned() else {
            debug!(target = %short_hex(&target), "no mirror for mailbox post");
            return Ok(false);
        };
        let lease = self.inner.registry.acquire(&mirror).await?;
        let request = MailboxRequest { mailbox, message };
        let result = lease.peer().post_to_mailbox(&request).await;
        self.inner.registry.release(lease).await;
        result.map(|()| true)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Nudge every connection after a network change.
    pub async fn bump(&self, force: bool) {
        let peers = self.inner.registry.peers().await;
        join_all(peers.iter().map(|peer| peer.bump(force))).await;
    }

    /// Close all sessions and pause collection until [`resume`](Self::resume).
    pub async fn suspend(&self) {
        info!("suspending mirror peering");
        self.inner.registry.suspend().await;
    }

    /// Resume every connection after [`suspend`](Self::suspend).
    pub async fn resume(&self) {
        info!("resuming mirror peering");
        self.inner.registry.resume().await;
    }

    /// Stop mirroring everything and destroy every connection. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("closing mirror peering");
        self.inner.shutdown.cancel();
        self.inner.tracking.lock().await.clear();
        self.inner.registry.close().await;
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn watch_network(&self, mut changes: broadcast::Receiver<NetworkChange>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let change = tokio::select! {
                    _ = this.inner.shutdown.cancelled() => return,
                    change = changes.recv() => change,
                };
                match change {
                    Ok(change) => this.bump(change.force).await,
                    Err(broadcast::error::RecvError::Lagged(_)) => this.bump(false).await,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Reserve `key` for tracking. Returns `false` if it is already tracked.
    async fn begin_tracking(&self, key: Key) -> bool {
        let mut tracking = self.inner.tracking.lock().await;
        if tracking.contains_key(&key) {
            return false;
        }
        tracking.insert(key, Tracking::default());
        true
    }

    /// Lease every selected mirror for `resource` and track `records` on it.
    async fn attach(
        &self,
        resource: Key,
        selected: &[MirrorAddr],
        records: Vec<AddCoreRequest>,
    ) -> Result<Vec<Arc<PeerConnection<T>>>> {
        let mut leases = Vec::with_capacity(selected.len());
        for mirror in selected {
            match self.inner.registry.acquire(mirror).await {
                Ok(lease) => leases.push(lease),
                Err(err) => {
                    self.inner.tracking.lock().await.remove(&resource);
                    self.release_all(leases).await;
                    return Err(err);
                }
            }
        }

        let peers: Vec<_> = leases.iter().map(|lease| lease.peer().clone()).collect();
        {
            let mut tracking = self.inner.tracking.lock().await;
            match tracking.get_mut(&resource) {
                Some(entry) => {
                    entry.leases = leases;
                    entry
                        .records
                        .extend(records.iter().map(|record| (record.key, record.clone())));
                }
                None => {
                    // Closed while the leases were being taken.
                    drop(tracking);
                    self.release_all(leases).await;
                    return Ok(Vec::new());
                }
            }
        }

        for peer in &peers {
            for record in &records {
                peer.track_for(resource, record.clone()).await;
            }
        }
        Ok(peers)
    }

    /// Untrack everything held for `resource` and release its leases.
    async fn stop_tracking(&self, resource: &Key) {
        let Some(entry) = self.inner.tracking.lock().await.remove(resource) else {
            return;
        };
        debug!(resource = %short_hex(resource), "stopped mirroring");
        for lease in &entry.leases {
            for core in entry.records.keys() {
                lease.peer().untrack_for(resource, core).await;
            }
        }
        self.release_all(entry.leases).await;
    }

    async fn release_all(&self, leases: Vec<PeerLease<T>>) {
        for lease in leases {
            self.inner.registry.release(lease).await;
        }
    }
}

fn pick_mirrors(target: &Key, candidates: &[MirrorAddr], pick: usize) -> Vec<MirrorAddr> {
    closest(target, candidates, pick)
        .into_iter()
        .cloned()
        .collect()
}

fn writer_record(key: Key, referrer: Key) -> AddCoreRequest {
    AddCoreRequest {
        referrer: Some(referrer),
        ..AddCoreRequest::new(key)
    }
}
