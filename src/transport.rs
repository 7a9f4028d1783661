//! Transport abstraction for talking to mirrors.
//!
//! The peering logic never touches sockets directly. It dials mirrors
//! through a [`MirrorTransport`] and issues requests on the resulting
//! [`MirrorSession`], which lets tests drive everything with an in-memory
//! implementation while production uses [`crate::net::IrohTransport`].

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::{Method, MirrorAddr};

/// Failure of a single request on an established session.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The mirror answered, but refused the request.
    #[error("mirror rejected request: {0}")]
    Remote(String),
    /// The session failed before an answer arrived.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// One live session with a mirror.
#[async_trait]
pub trait MirrorSession: Send + Sync + 'static {
    /// Send one request and wait for the mirror's answer.
    async fn request(&self, method: Method, payload: Vec<u8>) -> Result<Vec<u8>, RequestError>;

    /// Hint that a burst of requests follows and writes may be coalesced.
    ///
    /// Requests started while corked must still complete once
    /// [`uncork`](Self::uncork) is called.
    fn cork(&self) {}

    fn uncork(&self) {}

    /// Poke the session so idle timers on either side are refreshed.
    fn keep_alive(&self) {}

    /// Bytes sent to the mirror over this session so far.
    fn bytes_uploaded(&self) -> u64;

    /// Tear the session down immediately.
    fn close(&self);

    /// Resolve once the session is closed, by either side.
    async fn closed(&self);
}

/// Dial primitive used by [`crate::peer::PeerConnection`].
#[async_trait]
pub trait MirrorTransport: Send + Sync + 'static {
    type Session: MirrorSession;

    /// Establish a session with `mirror`, including any handshake.
    async fn connect(&self, mirror: &MirrorAddr) -> Result<Self::Session>;

    /// Whether the underlying endpoint has shut down for good.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Attaches local storage replication to freshly opened sessions.
pub trait Replicator<S>: Send + Sync + 'static {
    fn replicate(&self, mirror: &MirrorAddr, session: &Arc<S>);
}
