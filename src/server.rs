//! The mirror side of the protocol.
//!
//! Hosts that act as mirrors implement [`MirrorService`] and register a
//! [`MirrorProtocolHandler`] for [`crate::net::MIRROR_ALPN`] on their iroh
//! router. Each incoming stream carries exactly one request and gets exactly
//! one response; failures of the service are reported to the client as
//! error responses instead of tearing down the connection.

use std::fmt;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use crate::framing::{read_frame, write_frame};
use crate::protocol::{
    decode_request, AddCoreRequest, DeleteCoreRequest, MailboxRequest, MirrorRequest, Response,
};

/// Storage operations a mirror exposes to its clients.
#[async_trait]
pub trait MirrorService: Send + Sync + 'static {
    async fn add_core(&self, request: AddCoreRequest) -> Result<()>;
    async fn delete_core(&self, request: DeleteCoreRequest) -> Result<()>;
    async fn post_to_mailbox(&self, request: MailboxRequest) -> Result<()>;
}

/// Decode one request frame, run it against `service`, and build the reply.
pub async fn dispatch<S: MirrorService + ?Sized>(service: &S, frame: &[u8]) -> Response {
    let request = match decode_request(frame)
        .and_then(|(method, payload)| MirrorRequest::decode(method, &payload))
    {
        Ok(request) => request,
        Err(err) => return Response::Error(format!("malformed request: {err}")),
    };

    let method = request.method();
    let result = match request {
        MirrorRequest::AddCore(req) => service.add_core(req).await,
        MirrorRequest::DeleteCore(req) => service.delete_core(req).await,
        MirrorRequest::PostToMailbox(req) => service.post_to_mailbox(req).await,
    };
    match result {
        Ok(()) => Response::Ok(Vec::new()),
        Err(err) => {
            debug!(%method, "request failed: {err:#}");
            Response::Error(format!("{err:#}"))
        }
    }
}

/// Serve a single request/response exchange on one stream pair.
pub async fn serve_stream<S, R, W>(service: &S, recv: &mut R, send: &mut W) -> Result<()>
where
    S: MirrorService + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let Some(frame) = read_frame(recv).await? else {
        return Ok(());
    };
    let response = dispatch(service, &frame).await;
    write_frame(send, &response.encode()).await?;
    Ok(())
}

/// Accept streams on `conn` until the client goes away.
pub async fn handle_connection<S: MirrorService>(service: Arc<S>, conn: Connection) -> Result<()> {
    loop {
        let (mut send, mut recv) = match conn.accept_bi().await {
            Ok(streams) => streams,
            Err(err) => {
                debug!("mirror client disconnected: {err}");
                return Ok(());
            }
        };
        let service = service.clone();
        tokio::spawn(async move {
            let served = async {
                serve_stream(&*service, &mut recv, &mut send).await?;
                send.finish()?;
                anyhow::Ok(())
            };
            if let Err(err) = served.await {
                debug!("mirror stream failed: {err:#}");
            }
        });
    }
}

/// The router entry point for inbound `MIRROR_ALPN` connections.
pub struct MirrorProtocolHandler<S: MirrorService> {
    service: Arc<S>,
}

impl<S: MirrorService> MirrorProtocolHandler<S> {
    /// Serve mirror requests with `service`.
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }
}

impl<S: MirrorService> Clone for MirrorProtocolHandler<S> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
        }
    }
}

impl<S: MirrorService> fmt::Debug for MirrorProtocolHandler<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorProtocolHandler").finish()
    }
}

impl<S: MirrorService> ProtocolHandler for MirrorProtocolHandler<S> {
    fn accept(
        &self,
        connection: Connection,
    ) -> impl std::future::Future<Output = Result<(), AcceptError>> + Send {
        let service = self.service.clone();
        async move {
            handle_connection(service, connection)
                .await
                .map_err(|err| AcceptError::from_err(io::Error::new(io::ErrorKind::Other, err)))
        }
    }
}
