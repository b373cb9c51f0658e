//! Length-prefixed frames over a raw link. Reads take exactly one frame so a
//! link can be handed on (to a splice or a secure channel) mid-stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use x11q_core::wire::{self, LEN_SIZE, MAX_FRAME_LEN};
use x11q_core::FrameDecodeError;

use crate::net::LinkError;

/// Cap on plain frames: openings, handshakes and rendezvous traffic, all read
/// before the peer has proven anything.
pub const PLAIN_FRAME_MAX: usize = 64 * 1024;

pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<(), LinkError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let bytes = wire::encode_frame(msg)?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

/// One frame body, length prefix consumed.
pub async fn read_body<R>(r: &mut R) -> Result<Vec<u8>, LinkError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_body_within(r, MAX_FRAME_LEN as usize).await
}

async fn read_body_within<R>(r: &mut R, max: usize) -> Result<Vec<u8>, LinkError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; LEN_SIZE];
    r.read_exact(&mut header).await?;
    let len = wire::frame_len(header)?;
    if len > max {
        return Err(FrameDecodeError::TooLarge.into());
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

pub async fn read_frame<R, T>(r: &mut R) -> Result<T, LinkError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let body = read_body_within(r, PLAIN_FRAME_MAX).await?;
    Ok(wire::decode_body(&body)?)
}
