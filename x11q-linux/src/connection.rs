//! Secured, multiplexed connection.
//!
//! After the handshake every frame on the link is sealed with the channel
//! keys. One control stream carries authentication messages; data streams
//! only exist behind [`AuthenticatedConnection`], which the session builds
//! once the peer is authenticated. Until then any data frame from the peer is
//! a protocol violation.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::{mpsc, watch};
use x11q_core::protocol::{ControlMessage, Frame};
use x11q_core::wire;
use x11q_core::{ChannelKeys, ChannelRole, ConnectionId, NodeId, PathKind};
use zeroize::Zeroizing;

use crate::cancel::CancelToken;
use crate::framed;
use crate::net::BoxedLink;

/// Per-stream buffering between the connection and the stream's user.
pub const STREAM_WINDOW: usize = 64 * 1024;
const CHUNK: usize = 16 * 1024;
const CONTROL_DEPTH: usize = 16;
const MIGRATE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// This side closed gracefully.
    Local,
    /// The peer said goodbye.
    PeerClosed,
    /// Bad seal, undecodable frame, or a frame not allowed yet.
    ProtocolViolation,
    /// The link broke.
    LinkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed ({0:?})")]
    Closed(CloseReason),
}

enum Outbound {
    Frame(Frame),
    Migrate(WriteHalf<BoxedLink>),
}

type StreamMap = Mutex<HashMap<u32, mpsc::Sender<Vec<u8>>>>;

struct Shared {
    streams: StreamMap,
    authenticated: AtomicBool,
    closed: watch::Sender<Option<CloseReason>>,
}

impl Shared {
    fn mark_closed(&self, reason: CloseReason) {
        self.closed.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn streams(&self) -> std::sync::MutexGuard<'_, HashMap<u32, mpsc::Sender<Vec<u8>>>> {
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Inner {
    keys: ChannelKeys,
    outbound: mpsc::Sender<Outbound>,
    control: tokio::sync::Mutex<mpsc::Receiver<ControlMessage>>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<DataStream>>,
    migrate: mpsc::Sender<ReadHalf<BoxedLink>>,
    migrated: AtomicBool,
    next_stream: AtomicU32,
    path: watch::Sender<PathKind>,
    shared: Arc<Shared>,
    shutdown: CancelToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.mark_closed(CloseReason::Local);
        self.shutdown.cancel();
    }
}

/// A secured connection to one peer. Cheap to clone; the link is torn down
/// when the last clone goes away or [`Connection::close`] is called.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Take over `link`, already past the handshake that produced `keys`.
    pub(crate) fn spawn(link: BoxedLink, keys: ChannelKeys, path: PathKind) -> Self {
        let (read, write) = tokio::io::split(link);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_DEPTH);
        let (incoming_tx, incoming_rx) = mpsc::channel(16);
        let (migrate_tx, migrate_rx) = mpsc::channel(1);
        let (closed, _) = watch::channel(None);
        let (path, _) = watch::channel(path);
        let shared = Arc::new(Shared {
            streams: Mutex::new(HashMap::new()),
            authenticated: AtomicBool::new(false),
            closed,
        });
        let shutdown = CancelToken::new();
        let first_stream = match keys.role() {
            ChannelRole::Dialer => 1,
            ChannelRole::Listener => 2,
        };

        tokio::spawn(writer_task(
            write,
            Zeroizing::new(*keys.send_key()),
            outbound_rx,
            shared.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(
            Reader {
                read,
                key: Zeroizing::new(*keys.recv_key()),
                nonce: 0,
                peer_parity: 1 - first_stream % 2,
                control: control_tx,
                incoming: incoming_tx,
                migrate: migrate_rx,
                outbound: outbound_tx.clone(),
                shared: shared.clone(),
                shutdown: shutdown.clone(),
            }
            .run(),
        );

        Connection {
            inner: Arc::new(Inner {
                keys,
                outbound: outbound_tx,
                control: tokio::sync::Mutex::new(control_rx),
                incoming: tokio::sync::Mutex::new(incoming_rx),
                migrate: migrate_tx,
                migrated: AtomicBool::new(false),
                next_stream: AtomicU32::new(first_stream),
                path,
                shared,
                shutdown,
            }),
        }
    }

    pub fn peer(&self) -> NodeId {
        self.inner.keys.peer()
    }

    pub fn role(&self) -> ChannelRole {
        self.inner.keys.role()
    }

    pub fn path(&self) -> PathKind {
        *self.inner.path.borrow()
    }

    pub fn watch_path(&self) -> watch::Receiver<PathKind> {
        self.inner.path.subscribe()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.inner.keys.connection_id()
    }

    pub(crate) fn binding(&self) -> [u8; 32] {
        self.inner.keys.binding()
    }

    pub(crate) fn resume_tag(&self) -> [u8; 32] {
        self.inner.keys.resume_tag()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.inner.shared.closed.borrow()
    }

    /// Resolves when the connection is torn down, for whatever reason.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.inner.shared.closed.subscribe();
        let reason = match rx.wait_for(|r| r.is_some()).await {
            Ok(reason) => (*reason).unwrap_or(CloseReason::Local),
            Err(_) => CloseReason::Local,
        };
        reason
    }

    fn error(&self) -> ConnectionError {
        ConnectionError::Closed(self.close_reason().unwrap_or(CloseReason::LinkLost))
    }

    pub(crate) async fn send_control(&self, msg: ControlMessage) -> Result<(), ConnectionError> {
        self.inner
            .outbound
            .send(Outbound::Frame(Frame::Control(msg)))
            .await
            .map_err(|_| self.error())
    }

    pub(crate) async fn recv_control(&self) -> Result<ControlMessage, ConnectionError> {
        // Buffered messages drain before the closed channel reports None.
        let mut control = self.inner.control.lock().await;
        control.recv().await.ok_or_else(|| self.error())
    }

    pub(crate) fn mark_authenticated(&self) {
        self.inner
            .shared
            .authenticated
            .store(true, Ordering::SeqCst);
    }

    /// Graceful close: tell the peer, then tear down.
    pub async fn close(&self) {
        if self
            .inner
            .outbound
            .send(Outbound::Frame(Frame::GoAway))
            .await
            .is_err()
        {
            self.inner.shutdown.cancel();
        }
        self.closed().await;
    }

    /// Move onto `link`, which already carried an accepted resume exchange.
    /// Only one migration per connection.
    pub(crate) async fn migrate(&self, link: BoxedLink, path: PathKind) -> Result<(), ConnectionError> {
        if self.inner.migrated.swap(true, Ordering::SeqCst) {
            return Err(self.error());
        }
        let (read, write) = tokio::io::split(link);
        self.inner
            .migrate
            .send(read)
            .await
            .map_err(|_| self.error())?;
        self.inner
            .outbound
            .send(Outbound::Migrate(write))
            .await
            .map_err(|_| self.error())?;
        self.inner.path.send_replace(path);
        tracing::info!(peer = %self.peer().short(), %path, "connection migrated");
        Ok(())
    }

    fn resume_matches(&self, tag: &[u8; 32]) -> bool {
        !self.inner.migrated.load(Ordering::SeqCst)
            && self.close_reason().is_none()
            && self.inner.keys.verify_resume(tag)
    }

    async fn open_stream(&self) -> Result<DataStream, ConnectionError> {
        let id = self.inner.next_stream.fetch_add(2, Ordering::SeqCst);
        let stream = new_stream(
            id,
            self.inner.shared.clone(),
            self.inner.outbound.clone(),
            self.inner.shutdown.clone(),
        );
        self.inner
            .outbound
            .send(Outbound::Frame(Frame::Open { stream: id }))
            .await
            .map_err(|_| self.error())?;
        Ok(stream)
    }

    async fn accept_stream(&self) -> Option<DataStream> {
        self.inner.incoming.lock().await.recv().await
    }
}

/// Connection whose peer passed authentication. The only way to reach data
/// streams.
#[derive(Clone)]
pub struct AuthenticatedConnection {
    conn: Connection,
}

impl AuthenticatedConnection {
    /// Marks the connection authenticated; the session calls this before it
    /// tells the peer so.
    pub(crate) fn new(conn: Connection) -> Self {
        conn.mark_authenticated();
        Self { conn }
    }

    pub fn peer(&self) -> NodeId {
        self.conn.peer()
    }

    pub fn path(&self) -> PathKind {
        self.conn.path()
    }

    pub fn watch_path(&self) -> watch::Receiver<PathKind> {
        self.conn.watch_path()
    }

    pub async fn open_stream(&self) -> Result<DataStream, ConnectionError> {
        self.conn.open_stream().await
    }

    /// Next stream opened by the peer; `None` once the connection is down.
    pub async fn accept_stream(&self) -> Option<DataStream> {
        self.conn.accept_stream().await
    }

    pub async fn closed(&self) -> CloseReason {
        self.conn.closed().await
    }

    pub async fn close(&self) {
        self.conn.close().await
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// One bidirectional data stream. Dropping it closes both directions.
pub struct DataStream {
    id: u32,
    io: DuplexStream,
}

impl DataStream {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for DataStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for DataStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Register stream `id` and start its two pumps.
fn new_stream(
    id: u32,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancelToken,
) -> DataStream {
    let (user, conn_end) = tokio::io::duplex(STREAM_WINDOW);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
    shared.streams().insert(id, tx);
    let (mut from_user, mut to_user) = tokio::io::split(conn_end);

    let stop = shutdown.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; CHUNK];
        loop {
            let n = tokio::select! {
                _ = stop.cancelled() => return,
                r = from_user.read(&mut buf) => r,
            };
            match n {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let frame = Frame::Data {
                        stream: id,
                        payload: buf[..n].to_vec(),
                    };
                    if outbound.send(Outbound::Frame(frame)).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = outbound
            .send(Outbound::Frame(Frame::Close { stream: id }))
            .await;
    });

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                p = rx.recv() => p,
            };
            match next {
                Some(payload) => {
                    if to_user.write_all(&payload).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        let _ = to_user.shutdown().await;
    });

    DataStream { id, io: user }
}

async fn writer_task(
    mut write: WriteHalf<BoxedLink>,
    key: Zeroizing<[u8; 32]>,
    mut rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
    shutdown: CancelToken,
) {
    let mut nonce: u64 = 0;
    loop {
        // Frames queued before a shutdown still go out.
        let item = tokio::select! {
            biased;
            item = rx.recv() => item,
            _ = shutdown.cancelled() => rx.try_recv().ok(),
        };
        let Some(item) = item else { break };
        let (frame, next_link) = match item {
            Outbound::Frame(frame) => (frame, None),
            Outbound::Migrate(link) => (Frame::Migrate, Some(link)),
        };
        let goodbye = matches!(frame, Frame::GoAway);
        let sent = match wire::seal_frame(&key, nonce, &frame) {
            Ok(bytes) => {
                nonce += 1;
                write.write_all(&bytes).await.is_ok() && write.flush().await.is_ok()
            }
            Err(e) => {
                tracing::warn!(error = %e, "dropping unsealable frame");
                true
            }
        };
        if !sent {
            shared.mark_closed(CloseReason::LinkLost);
            break;
        }
        if goodbye {
            let _ = write.shutdown().await;
            shared.mark_closed(CloseReason::Local);
            break;
        }
        if let Some(link) = next_link {
            let _ = write.shutdown().await;
            write = link;
        }
    }
    shutdown.cancel();
}

struct Reader {
    read: ReadHalf<BoxedLink>,
    key: Zeroizing<[u8; 32]>,
    nonce: u64,
    peer_parity: u32,
    control: mpsc::Sender<ControlMessage>,
    incoming: mpsc::Sender<DataStream>,
    migrate: mpsc::Receiver<ReadHalf<BoxedLink>>,
    outbound: mpsc::Sender<Outbound>,
    shared: Arc<Shared>,
    shutdown: CancelToken,
}

impl Reader {
    async fn run(mut self) {
        let reason = loop {
            let body = tokio::select! {
                _ = self.shutdown.cancelled() => break CloseReason::Local,
                b = framed::read_body(&mut self.read) => b,
            };
            let frame: Frame = match body {
                Ok(body) => match wire::open_body(&self.key, self.nonce, &body) {
                    Ok(frame) => frame,
                    Err(_) => break CloseReason::ProtocolViolation,
                },
                Err(_) => break CloseReason::LinkLost,
            };
            self.nonce += 1;
            if let Err(reason) = self.dispatch(frame).await {
                break reason;
            }
        };
        if reason != CloseReason::Local {
            tracing::debug!(?reason, "connection reader stopped");
        }
        self.shared.mark_closed(reason);
        self.shared.streams().clear();
        self.shutdown.cancel();
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), CloseReason> {
        let authenticated = self.shared.authenticated.load(Ordering::SeqCst);
        match frame {
            Frame::Control(msg) => {
                // Nothing reads control once the session is up; drop extras.
                if self.control.try_send(msg).is_err() && !authenticated {
                    return Err(CloseReason::ProtocolViolation);
                }
            }
            Frame::Open { stream } => {
                if !authenticated
                    || stream % 2 != self.peer_parity
                    || self.shared.streams().contains_key(&stream)
                {
                    return Err(CloseReason::ProtocolViolation);
                }
                let ds = new_stream(
                    stream,
                    self.shared.clone(),
                    self.outbound.clone(),
                    self.shutdown.clone(),
                );
                if self.incoming.send(ds).await.is_err() {
                    return Err(CloseReason::Local);
                }
            }
            Frame::Data { stream, payload } => {
                if !authenticated {
                    return Err(CloseReason::ProtocolViolation);
                }
                let tx = self.shared.streams().get(&stream).cloned();
                if let Some(tx) = tx {
                    // Slow consumers hold up the whole connection here.
                    if tx.send(payload).await.is_err() {
                        self.shared.streams().remove(&stream);
                    }
                }
            }
            Frame::Close { stream } => {
                self.shared.streams().remove(&stream);
            }
            Frame::Migrate => {
                match tokio::time::timeout(MIGRATE_WAIT, self.migrate.recv()).await {
                    Ok(Some(read)) => self.read = read,
                    _ => return Err(CloseReason::LinkLost),
                }
            }
            Frame::GoAway => return Err(CloseReason::PeerClosed),
        }
        Ok(())
    }
}

/// Live connections that may be resumed on a new link, by connection id.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    live: Arc<Mutex<HashMap<ConnectionId, Weak<Inner>>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, conn: &Connection) {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        live.retain(|_, w| w.strong_count() > 0);
        live.insert(conn.connection_id(), Arc::downgrade(&conn.inner));
    }

    /// The connection a resume request names, if its tag checks out.
    pub(crate) fn claim(&self, id: &ConnectionId, tag: &[u8; 32]) -> Option<Connection> {
        let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
        let inner = live.get(id)?.upgrade();
        let Some(inner) = inner else {
            live.remove(id);
            return None;
        };
        let conn = Connection { inner };
        if conn.resume_matches(tag) {
            live.remove(id);
            Some(conn)
        } else {
            None
        }
    }
}
