#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::{sleep, Duration};

use iroh_mirror_peering::{
    AddCoreRequest, Autobase, AutobaseDescriptor, AutobaseEvent, Core, DeleteCoreRequest, Key,
    MailboxRequest, Method, MirrorAddr, MirrorSession, MirrorTransport, Replicator, RequestError,
};

/// A key whose first byte is `prefix` and the rest zero.
pub fn make_key(prefix: u8) -> Key {
    let mut key = [0u8; 32];
    key[0] = prefix;
    key
}

pub fn mirror(prefix: u8) -> MirrorAddr {
    MirrorAddr::from_key(make_key(prefix))
}

/// Let every spawned task run until it blocks on something.
pub async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

// ----------------------------------------------------------------------------
// Transport
// ----------------------------------------------------------------------------

pub struct SessionState {
    pub mirror: Key,
    closed: watch::Sender<bool>,
    uploaded: AtomicU64,
    corks: AtomicUsize,
    uncorks: AtomicUsize,
    keep_alives: AtomicUsize,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn add_upload(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn corks(&self) -> usize {
        self.corks.load(Ordering::SeqCst)
    }

    pub fn uncorks(&self) -> usize {
        self.uncorks.load(Ordering::SeqCst)
    }

    pub fn keep_alives(&self) -> usize {
        self.keep_alives.load(Ordering::SeqCst)
    }

    /// Close the session as if the mirror hung up.
    pub fn hang_up(&self) {
        self.closed.send_replace(true);
    }
}

#[derive(Clone, Default)]
pub struct TestTransport {
    failures: Arc<Mutex<HashSet<Key>>>,
    rejections: Arc<Mutex<HashSet<Key>>>,
    request_failures: Arc<Mutex<HashMap<Key, usize>>>,
    latencies: Arc<Mutex<HashMap<Key, Duration>>>,
    dials: Arc<Mutex<HashMap<Key, usize>>>,
    attempts: Arc<Mutex<HashMap<Key, usize>>>,
    requests: Arc<Mutex<Vec<(Key, Method, Vec<u8>)>>>,
    sessions: Arc<Mutex<HashMap<Key, Vec<Arc<SessionState>>>>>,
    shut_down: Arc<AtomicBool>,
}

impl TestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_failure(&self, mirror: Key, fail: bool) {
        let mut failures = self.failures.lock().await;
        if fail {
            failures.insert(mirror);
        } else {
            failures.remove(&mirror);
        }
    }

    pub async fn set_rejecting(&self, mirror: Key, reject: bool) {
        let mut rejections = self.rejections.lock().await;
        if reject {
            rejections.insert(mirror);
        } else {
            rejections.remove(&mirror);
        }
    }

    /// Fail the next `count` requests to `mirror` at the transport level.
    pub async fn fail_requests(&self, mirror: Key, count: usize) {
        self.request_failures.lock().await.insert(mirror, count);
    }

    pub async fn set_latency(&self, mirror: Key, latency: Duration) {
        self.latencies.lock().await.insert(mirror, latency);
    }

    pub fn shut_down(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }

    pub async fn dial_count(&self, mirror: &Key) -> usize {
        self.dials.lock().await.get(mirror).copied().unwrap_or(0)
    }

    /// Requests sent to `mirror`, answered or not.
    pub async fn request_attempts(&self, mirror: &Key) -> usize {
        self.attempts.lock().await.get(mirror).copied().unwrap_or(0)
    }

    pub async fn requests(&self) -> Vec<(Key, Method, Vec<u8>)> {
        self.requests.lock().await.clone()
    }

    async fn payloads(&self, mirror: &Key, method: Method) -> Vec<Vec<u8>> {
        let requests = self.requests.lock().await;
        requests
            .iter()
            .filter(|(to, m, _)| to == mirror && *m == method)
            .map(|(_, _, payload)| payload.clone())
            .collect()
    }

    /// Accepted add-core requests sent to `mirror`, in order.
    pub async fn announced(&self, mirror: &Key) -> Vec<AddCoreRequest> {
        self.payloads(mirror, Method::AddCore)
            .await
            .iter()
            .map(|payload| AddCoreRequest::decode(payload).expect("valid add-core payload"))
            .collect()
    }

    pub async fn announced_keys(&self, mirror: &Key) -> HashSet<Key> {
        self.announced(mirror).await.iter().map(|r| r.key).collect()
    }

    pub async fn deleted(&self, mirror: &Key) -> Vec<Key> {
        self.payloads(mirror, Method::DeleteCore)
            .await
            .iter()
            .map(|payload| DeleteCoreRequest::decode(payload).expect("valid delete payload").key)
            .collect()
    }

    pub async fn mailbox_posts(&self, mirror: &Key) -> Vec<MailboxRequest> {
        self.payloads(mirror, Method::PostToMailbox)
            .await
            .iter()
            .map(|payload| MailboxRequest::decode(payload).expect("valid mailbox payload"))
            .collect()
    }

    pub async fn latest_session(&self, mirror: &Key) -> Option<Arc<SessionState>> {
        let sessions = self.sessions.lock().await;
        sessions.get(mirror).and_then(|all| all.last().cloned())
    }

    pub async fn open_sessions(&self, mirror: &Key) -> usize {
        let sessions = self.sessions.lock().await;
        sessions
            .get(mirror)
            .map_or(0, |all| all.iter().filter(|s| !s.is_closed()).count())
    }

    /// Close every open session with `mirror` from the mirror's side.
    pub async fn drop_remote(&self, mirror: &Key) {
        let sessions = self.sessions.lock().await;
        for session in sessions.get(mirror).into_iter().flatten() {
            session.hang_up();
        }
    }
}

#[async_trait]
impl MirrorTransport for TestTransport {
    type Session = TestSession;

    async fn connect(&self, mirror: &MirrorAddr) -> Result<TestSession> {
        *self.dials.lock().await.entry(mirror.key).or_default() += 1;

        let latency = self.latencies.lock().await.get(&mirror.key).copied();
        if let Some(delay) = latency {
            sleep(delay).await;
        }
        if self.failures.lock().await.contains(&mirror.key) {
            return Err(anyhow!("injected dial failure"));
        }

        let (closed, _) = watch::channel(false);
        let state = Arc::new(SessionState {
            mirror: mirror.key,
            closed,
            uploaded: AtomicU64::new(0),
            corks: AtomicUsize::new(0),
            uncorks: AtomicUsize::new(0),
            keep_alives: AtomicUsize::new(0),
        });
        self.sessions
            .lock()
            .await
            .entry(mirror.key)
            .or_default()
            .push(state.clone());
        Ok(TestSession {
            state,
            transport: self.clone(),
        })
    }

    fn is_closed(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

pub struct TestSession {
    state: Arc<SessionState>,
    transport: TestTransport,
}

impl TestSession {
    pub fn mirror(&self) -> Key {
        self.state.mirror
    }
}

#[async_trait]
impl MirrorSession for TestSession {
    async fn request(&self, method: Method, payload: Vec<u8>) -> Result<Vec<u8>, RequestError> {
        let mirror = self.state.mirror;
        *self
            .transport
            .attempts
            .lock()
            .await
            .entry(mirror)
            .or_default() += 1;

        if self.state.is_closed() {
            return Err(anyhow!("session closed").into());
        }
        {
            let mut failures = self.transport.request_failures.lock().await;
            if let Some(left) = failures.get_mut(&mirror) {
                if *left > 0 {
                    *left -= 1;
                    return Err(anyhow!("injected request failure").into());
                }
            }
        }
        if self.transport.rejections.lock().await.contains(&mirror) {
            return Err(RequestError::Remote("rejected by test mirror".into()));
        }

        self.transport
            .requests
            .lock()
            .await
            .push((mirror, method, payload));
        Ok(Vec::new())
    }

    fn cork(&self) {
        self.state.corks.fetch_add(1, Ordering::SeqCst);
    }

    fn uncork(&self) {
        self.state.uncorks.fetch_add(1, Ordering::SeqCst);
    }

    fn keep_alive(&self) {
        self.state.keep_alives.fetch_add(1, Ordering::SeqCst);
    }

    fn bytes_uploaded(&self) -> u64 {
        self.state.uploaded.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.state.hang_up();
    }

    async fn closed(&self) {
        let mut closed = self.state.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Remembers which mirrors replication was attached to.
#[derive(Default)]
pub struct RecordingReplicator {
    calls: std::sync::Mutex<Vec<Key>>,
}

impl RecordingReplicator {
    pub fn calls(&self) -> Vec<Key> {
        self.calls.lock().unwrap().clone()
    }
}

impl Replicator<TestSession> for RecordingReplicator {
    fn replicate(&self, mirror: &MirrorAddr, session: &Arc<TestSession>) {
        assert_eq!(session.mirror(), mirror.key);
        self.calls.lock().unwrap().push(mirror.key);
    }
}

// ----------------------------------------------------------------------------
// Resources
// ----------------------------------------------------------------------------

pub struct TestCore {
    key: Key,
    is_static: bool,
    closing: watch::Sender<bool>,
}

impl TestCore {
    pub fn new(key: Key) -> Arc<Self> {
        Self::build(key, false)
    }

    pub fn new_static(key: Key) -> Arc<Self> {
        Self::build(key, true)
    }

    fn build(key: Key, is_static: bool) -> Arc<Self> {
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            key,
            is_static,
            closing,
        })
    }

    pub fn close(&self) {
        self.closing.send_replace(true);
    }
}

#[async_trait]
impl Core for TestCore {
    fn key(&self) -> Key {
        self.key
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    async fn closed(&self) {
        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|closing| *closing).await;
    }

    fn is_static(&self) -> bool {
        self.is_static
    }
}

pub struct TestAutobase {
    key: Key,
    local: Option<Arc<TestCore>>,
    writers: std::sync::Mutex<Vec<Arc<TestCore>>>,
    descriptor: std::sync::Mutex<Option<AutobaseDescriptor>>,
    events: broadcast::Sender<AutobaseEvent>,
    closing: watch::Sender<bool>,
}

impl TestAutobase {
    pub fn new(key: Key, local: Option<Key>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        let (closing, _) = watch::channel(false);
        Arc::new(Self {
            key,
            local: local.map(TestCore::new),
            writers: std::sync::Mutex::new(Vec::new()),
            descriptor: std::sync::Mutex::new(None),
            events,
            closing,
        })
    }

    /// Add a writer without publishing an event, as if it was loaded from
    /// storage.
    pub fn preload_writer(&self, writer: Arc<TestCore>) {
        self.writers.lock().unwrap().push(writer);
    }

    pub fn add_writer(&self, writer: Arc<TestCore>) {
        self.writers.lock().unwrap().push(writer.clone());
        let _ = self.events.send(AutobaseEvent::Writer(writer));
    }

    pub fn remove_writer(&self, key: &Key) {
        self.writers.lock().unwrap().retain(|w| w.key != *key);
    }

    pub fn set_descriptor(&self, descriptor: AutobaseDescriptor) {
        *self.descriptor.lock().unwrap() = Some(descriptor);
    }

    pub fn migrate(&self) {
        let _ = self.events.send(AutobaseEvent::Migrate);
    }

    pub fn close(&self) {
        self.closing.send_replace(true);
    }
}

#[async_trait]
impl Autobase for TestAutobase {
    fn key(&self) -> Key {
        self.key
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    async fn closed(&self) {
        let mut closing = self.closing.subscribe();
        let _ = closing.wait_for(|closing| *closing).await;
    }

    fn local_writer(&self) -> Option<Arc<dyn Core>> {
        self.local.clone().map(|core| core as Arc<dyn Core>)
    }

    fn writers(&self) -> Vec<Arc<dyn Core>> {
        let mut writers: Vec<Arc<dyn Core>> = Vec::new();
        if let Some(local) = &self.local {
            writers.push(local.clone());
        }
        for writer in self.writers.lock().unwrap().iter() {
            writers.push(writer.clone());
        }
        writers
    }

    fn subscribe(&self) -> broadcast::Receiver<AutobaseEvent> {
        self.events.subscribe()
    }

    fn descriptor(&self) -> Option<AutobaseDescriptor> {
        *self.descriptor.lock().unwrap()
    }
}
