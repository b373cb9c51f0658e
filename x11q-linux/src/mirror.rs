//! Mirror mode: a single data stream piped to a byte source and sink (stdin
//! and stdout in the binary), so an external capture or viewer process can be
//! attached on either end.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::connection::{AuthenticatedConnection, DataStream};

/// Sharing side: wait for the viewer's stream, then pipe.
pub async fn share<R, W>(conn: AuthenticatedConnection, input: R, output: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match conn.accept_stream().await {
        Some(stream) => pipe(stream, input, output).await,
        None => Ok(()),
    }
}

/// Viewing side: open the stream, then pipe.
pub async fn view<R, W>(conn: AuthenticatedConnection, input: R, output: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let stream = conn.open_stream().await.map_err(io::Error::other)?;
    pipe(stream, input, output).await
}

/// Copy `input` to the peer and the peer to `output`. Ends once the peer
/// stops sending; our own end of input only half-closes the stream.
pub async fn pipe<R, W>(stream: DataStream, mut input: R, mut output: W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (mut from_peer, mut to_peer) = tokio::io::split(stream);
    let up = async {
        tokio::io::copy(&mut input, &mut to_peer).await?;
        to_peer.shutdown().await
    };
    let down = async {
        tokio::io::copy(&mut from_peer, &mut output).await?;
        output.flush().await
    };
    tokio::pin!(up, down);
    tokio::select! {
        r = &mut down => r,
        r = &mut up => {
            r?;
            down.await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::connected_pair;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn frames_flow_from_sharer_to_viewer() {
        let (dialer, listener) = connected_pair();
        let viewer = AuthenticatedConnection::new(dialer);
        let sharer = AuthenticatedConnection::new(listener);

        let sharing = tokio::spawn(async move {
            share(sharer.clone(), &b"frame-0001"[..], tokio::io::sink()).await?;
            // Keep the connection up until the viewer is done.
            sharer.closed().await;
            Ok::<_, io::Error>(())
        });
        let (screen, mut seen) = tokio::io::duplex(1024);
        // The viewer has nothing to send back.
        let viewing = tokio::spawn(view(viewer, tokio::io::empty(), screen));

        let mut buf = [0u8; 10];
        seen.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame-0001");
        assert!(viewing.await.unwrap().is_ok());
        assert!(sharing.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn viewer_finishes_when_sharer_stops() {
        let (dialer, listener) = connected_pair();
        let viewer = AuthenticatedConnection::new(dialer);
        let sharer = AuthenticatedConnection::new(listener);

        let sharing = tokio::spawn(async move {
            let stream = sharer.accept_stream().await.unwrap();
            let (_, mut to_peer) = tokio::io::split(stream);
            to_peer.write_all(b"bye").await.unwrap();
            to_peer.shutdown().await.unwrap();
            // Keep the connection up until the viewer is done.
            sharer.closed().await;
        });
        let mut out = Vec::new();
        view(viewer.clone(), tokio::io::empty(), &mut out).await.unwrap();
        assert_eq!(out, b"bye");
        viewer.close().await;
        sharing.await.unwrap();
    }
}
