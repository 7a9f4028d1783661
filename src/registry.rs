//! Shared, reference-counted peer connections with idle collection.
//!
//! Every resource mapped onto a mirror holds a [`PeerLease`] for it. When
//! the last lease is released the connection is not closed right away: a
//! sweeper checks it every [`GcPolicy::interval`] and only destroys it after
//! [`GcPolicy::strikes`] sweeps without upload progress, so in-flight
//! replication gets a chance to finish.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::core::{short_hex, Key};
use crate::peer::{PeerConnection, PeerOptions};
use crate::protocol::MirrorAddr;
use crate::transport::{MirrorTransport, Replicator};

/// How idle connections are collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcPolicy {
    /// Time between sweeps.
    pub interval: Duration,
    /// Consecutive idle sweeps before a connection is destroyed.
    pub strikes: u32,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            strikes: 5,
        }
    }
}

/// One reference to a shared [`PeerConnection`].
///
/// Leases are not `Clone`; hand one back with [`Registry::release`] exactly
/// once.
pub struct PeerLease<T: MirrorTransport> {
    mirror: Key,
    peer: Arc<PeerConnection<T>>,
}

impl<T: MirrorTransport> PeerLease<T> {
    /// Key of the leased mirror.
    pub fn mirror(&self) -> &Key {
        &self.mirror
    }

    /// The shared connection behind the lease.
    pub fn peer(&self) -> &Arc<PeerConnection<T>> {
        &self.peer
    }
}

impl<T: MirrorTransport> fmt::Debug for PeerLease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLease")
            .field("mirror", &short_hex(&self.mirror))
            .finish()
    }
}

struct Entry<T: MirrorTransport> {
    peer: Arc<PeerConnection<T>>,
    refs: usize,
    strikes: u32,
    last_uploaded: u64,
}

struct RegistryState<T: MirrorTransport> {
    entries: HashMap<Key, Entry<T>>,
    /// Unreferenced entries awaiting collection.
    pending: HashSet<Key>,
    suspended: bool,
    closed: bool,
    sweeper: Option<JoinHandle<()>>,
}

struct RegistryInner<T: MirrorTransport> {
    transport: Arc<T>,
    replicator: Option<Arc<dyn Replicator<T::Session>>>,
    options: PeerOptions,
    policy: GcPolicy,
    state: Mutex<RegistryState<T>>,
}

enum Sweep {
    Forget,
    /// An explicit request is still running on the connection.
    Busy,
    Progress,
    Strike,
    Collect,
}

/// Map from mirror key to its shared connection.
pub struct Registry<T: MirrorTransport> {
    inner: Arc<RegistryInner<T>>,
}

impl<T: MirrorTransport> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: MirrorTransport> Registry<T> {
    /// Create an empty registry. The sweeper starts with the first release.
    pub fn new(
        transport: Arc<T>,
        replicator: Option<Arc<dyn Replicator<T::Session>>>,
        options: PeerOptions,
        policy: GcPolicy,
    ) -> Self {
        let state = RegistryState {
            entries: HashMap::new(),
            pending: HashSet::new(),
            suspended: options.suspended,
            closed: false,
            sweeper: None,
        };
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                replicator,
                options,
                policy,
                state: Mutex::new(state),
            }),
        }
    }

    /// Take a reference on the connection to `mirror`, creating it if needed.
    ///
    /// Reacquiring a connection that is waiting for collection cancels the
    /// collection.
    pub async fn acquire(&self, mirror: &MirrorAddr) -> Result<PeerLease<T>> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            bail!("registry is closed");
        }
        let suspended = state.suspended;
        let entry = state.entries.entry(mirror.key).or_insert_with(|| {
            debug!(mirror = %short_hex(&mirror.key), "opening peer connection");
            let options = PeerOptions {
                suspended,
                ..self.inner.options.clone()
            };
            Entry {
                peer: PeerConnection::new(
                    mirror.clone(),
                    self.inner.transport.clone(),
                    self.inner.replicator.clone(),
                    options,
                ),
                refs: 0,
                strikes: 0,
                last_uploaded: 0,
            }
        });
        entry.refs += 1;
        entry.strikes = 0;
        let peer = entry.peer.clone();
        state.pending.remove(&mirror.key);
        Ok(PeerLease {
            mirror: mirror.key,
            peer,
        })
    }

    /// Hand back a lease. The last release schedules the connection for
    /// collection.
    pub async fn release(&self, lease: PeerLease<T>) {
        let mut state = self.inner.state.lock().await;
        {
            let Some(entry) = state.entries.get_mut(&lease.mirror) else {
                return;
            };
            if !Arc::ptr_eq(&entry.peer, &lease.peer) || entry.refs == 0 {
                return;
            }
            entry.refs -= 1;
            if entry.refs > 0 {
                return;
            }
            entry.strikes = 0;
            entry.last_uploaded = entry.peer.uploaded().await;
        }
        state.pending.insert(lease.mirror);
        self.start_sweeper(&mut state);
    }

    fn start_sweeper(&self, state: &mut RegistryState<T>) {
        if state.suspended || state.closed || state.sweeper.is_some() || state.pending.is_empty() {
            return;
        }
        let registry = Arc::downgrade(&self.inner);
        let interval = self.inner.policy.interval;
        state.sweeper = Some(tokio::spawn(sweep_loop(registry, interval)));
    }

    /// Connections currently held, referenced or not.
    pub async fn peers(&self) -> Vec<Arc<PeerConnection<T>>> {
        let state = self.inner.state.lock().await;
        state.entries.values().map(|e| e.peer.clone()).collect()
    }

    /// Keys of every registered mirror.
    pub async fn keys(&self) -> Vec<Key> {
        let state = self.inner.state.lock().await;
        state.entries.keys().copied().collect()
    }

    /// Whether a connection to `mirror` is registered.
    pub async fn contains(&self, mirror: &Key) -> bool {
        self.inner.state.lock().await.entries.contains_key(mirror)
    }

    /// Reference count for `mirror`, `None` if no connection exists.
    pub async fn refs(&self, mirror: &Key) -> Option<usize> {
        let state = self.inner.state.lock().await;
        state.entries.get(mirror).map(|e| e.refs)
    }

    /// Unreferenced connections waiting to be collected.
    pub async fn pending_gc(&self) -> Vec<Key> {
        let state = self.inner.state.lock().await;
        state.pending.iter().copied().collect()
    }

    /// Suspend every connection and pause collection.
    pub async fn suspend(&self) {
        let peers = {
            let mut state = self.inner.state.lock().await;
            if state.suspended || state.closed {
                return;
            }
            state.suspended = true;
            if let Some(sweeper) = state.sweeper.take() {
                sweeper.abort();
            }
            state
                .entries
                .values()
                .map(|e| e.peer.clone())
                .collect::<Vec<_>>()
        };
        join_all(peers.iter().map(|peer| peer.suspend())).await;
    }

    /// Resume every connection and restart collection of idle ones.
    pub async fn resume(&self) {
        let peers = {
            let mut state = self.inner.state.lock().await;
            if !state.suspended || state.closed {
                return;
            }
            state.suspended = false;
            self.start_sweeper(&mut state);
            state
                .entries
                .values()
                .map(|e| e.peer.clone())
                .collect::<Vec<_>>()
        };
        join_all(peers.iter().map(|peer| peer.resume())).await;
    }

    /// Destroy every connection, referenced or not. Further acquires fail.
    pub async fn close(&self) {
        let peers = {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }
            state.closed = true;
            if let Some(sweeper) = state.sweeper.take() {
                sweeper.abort();
            }
            state.pending.clear();
            state
                .entries
                .drain()
                .map(|(_, e)| e.peer)
                .collect::<Vec<_>>()
        };
        join_all(peers.iter().map(|peer| peer.destroy())).await;
    }
}

async fn sweep_loop<T: MirrorTransport>(registry: Weak<RegistryInner<T>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = registry.upgrade() else {
            return;
        };
        if !inner.sweep().await {
            return;
        }
    }
}

impl<T: MirrorTransport> RegistryInner<T> {
    /// One collection pass. Returns whether another pass is needed.
    async fn sweep(&self) -> bool {
        let mut doomed = Vec::new();
        let again = {
            let mut state = self.state.lock().await;
            if state.suspended || state.closed {
                state.sweeper = None;
                return false;
            }

            let pending: Vec<Key> = state.pending.iter().copied().collect();
            for key in pending {
                let verdict = match state.entries.get_mut(&key) {
                    None => Sweep::Forget,
                    Some(entry) if entry.refs > 0 => Sweep::Forget,
                    Some(entry) if entry.peer.inflight() > 0 => Sweep::Busy,
                    Some(entry) => {
                        let uploaded = entry.peer.uploaded().await;
                        if uploaded != entry.last_uploaded {
                            entry.last_uploaded = uploaded;
                            entry.strikes = entry.strikes.saturating_sub(1);
                            Sweep::Progress
                        } else {
                            entry.strikes += 1;
                            if entry.strikes >= self.policy.strikes {
                                Sweep::Collect
                            } else {
                                Sweep::Strike
                            }
                        }
                    }
                };
                match verdict {
                    Sweep::Forget => {
                        state.pending.remove(&key);
                    }
                    Sweep::Collect => {
                        state.pending.remove(&key);
                        if let Some(entry) = state.entries.remove(&key) {
                            doomed.push(entry.peer);
                        }
                    }
                    Sweep::Busy | Sweep::Progress | Sweep::Strike => {}
                }
            }

            let again = !state.pending.is_empty();
            if !again {
                state.sweeper = None;
            }
            again
        };

        // Aborting the sweeper must not leave a collected peer half torn down.
        for peer in doomed {
            debug!(mirror = %short_hex(&peer.mirror().key), "collecting idle peer connection");
            tokio::spawn(async move { peer.destroy().await });
        }
        again
    }
}
