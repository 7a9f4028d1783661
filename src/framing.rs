//! Length-prefixed frames: a little-endian `u32` length followed by the body.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side will accept (1 MiB).
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Write `data` as one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> Result<()> {
    if data.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit of {MAX_FRAME_LEN}", data.len());
    }
    let len = data.len() as u32;
    stream.write_u32_le(len).await?;
    stream.write_all(data).await?;
    Ok(())
}

/// Read one frame; `Ok(None)` when the stream ended cleanly before a header.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match stream.read_u32_le().await {
        Ok(v) => v as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        bail!("peer announced {len} byte frame, limit is {MAX_FRAME_LEN}");
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
