//! Mirror transport over iroh QUIC connections.
//!
//! This module provides [`IrohTransport`], the [`MirrorTransport`]
//! implementation used in production. A mirror's public key doubles as its
//! iroh endpoint id, and any IPv4 hints in its [`MirrorAddr`] are passed on
//! as direct addresses.
//!
//! # Protocol
//!
//! Connections negotiate the [`MIRROR_ALPN`] identifier. Every request runs
//! on its own bi-directional stream: the client writes one request frame and
//! finishes its side, the mirror answers with one response frame. See
//! [`crate::protocol`] for the frame contents.

use std::net::SocketAddr;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use iroh::endpoint::Connection;
use iroh::{Endpoint, EndpointAddr, PublicKey};
use tracing::debug;

use crate::framing::{read_frame, write_frame};
use crate::protocol::{encode_request, Method, MirrorAddr, Response};
use crate::transport::{MirrorSession, MirrorTransport, RequestError};

/// ALPN protocol identifier for mirror connections.
pub const MIRROR_ALPN: &[u8] = b"iroh-mirror-peering/1";

/// Dials mirrors through an iroh [`Endpoint`].
#[derive(Debug, Clone)]
pub struct IrohTransport {
    endpoint: Endpoint,
}

impl IrohTransport {
    /// Dial mirrors through `endpoint`.
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// The underlying iroh endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Turn a mirror record into a dialable address.
    fn endpoint_addr(&self, mirror: &MirrorAddr) -> Result<EndpointAddr> {
        let id = PublicKey::from_bytes(&mirror.key)?;
        let addr = mirror
            .hints()
            .iter()
            .fold(EndpointAddr::new(id), |addr, hint| {
                addr.with_ip_addr(SocketAddr::V4(*hint))
            });
        Ok(addr)
    }
}

#[async_trait]
impl MirrorTransport for IrohTransport {
    type Session = IrohSession;

    async fn connect(&self, mirror: &MirrorAddr) -> Result<IrohSession> {
        let addr = self.endpoint_addr(mirror)?;
        let conn = self.endpoint.connect(addr, MIRROR_ALPN).await?;
        Ok(IrohSession { conn })
    }

    fn is_closed(&self) -> bool {
        self.endpoint.is_closed()
    }
}

/// One QUIC connection to a mirror.
#[derive(Debug, Clone)]
pub struct IrohSession {
    conn: Connection,
}

impl IrohSession {
    /// The underlying connection, e.g. for attaching replication streams.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[async_trait]
impl MirrorSession for IrohSession {
    async fn request(&self, method: Method, payload: Vec<u8>) -> Result<Vec<u8>, RequestError> {
        let (mut send, mut recv) = self.conn.open_bi().await.map_err(anyhow::Error::from)?;
        write_frame(&mut send, &encode_request(method, &payload)).await?;
        send.finish().map_err(anyhow::Error::from)?;

        let frame = read_frame(&mut recv)
            .await?
            .ok_or_else(|| anyhow!("mirror closed the stream without answering {method}"))?;
        match Response::decode(&frame).map_err(anyhow::Error::from)? {
            Response::Ok(body) => Ok(body),
            Response::Error(reason) => Err(RequestError::Remote(reason)),
        }
    }

    fn keep_alive(&self) {
        if let Err(err) = self.conn.send_datagram(Bytes::new()) {
            debug!("keep-alive datagram not sent: {err}");
        }
    }

    fn bytes_uploaded(&self) -> u64 {
        self.conn.stats().udp_tx.bytes
    }

    fn close(&self) {
        self.conn.close(0u32.into(), b"closing");
    }

    async fn closed(&self) {
        let reason = self.conn.closed().await;
        debug!("mirror connection closed: {reason}");
    }
}
