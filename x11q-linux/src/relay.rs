//! Rendezvous node: registrations, hole-punch coordination, and the bridge
//! relay. It only ever sees node ids, observed addresses, and the encrypted
//! bytes it splices.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use x11q_core::protocol::{registration_proof_bytes, NodeReply, NodeRequest, Notice, Ticket};
use x11q_core::NodeId;

use crate::cancel::CancelToken;
use crate::framed::{read_frame, write_frame};
use crate::net::{BoxedLink, LinkError, Listener, Network};

/// How long a punch or bridge ticket waits for the target to answer.
pub const TICKET_TTL: Duration = Duration::from_secs(10);

struct Registered {
    notices: mpsc::Sender<Notice>,
    epoch: u64,
}

enum Pending {
    Punch {
        dialer: SocketAddr,
        reply: oneshot::Sender<SocketAddr>,
    },
    Bridge {
        reply: oneshot::Sender<BoxedLink>,
    },
}

#[derive(Default)]
struct State {
    nodes: HashMap<NodeId, Registered>,
    pending: HashMap<Ticket, Pending>,
    next_epoch: u64,
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<State>>);

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// File a ticket for `target` and push the notice down its registration.
    fn notify(
        &self,
        target: &NodeId,
        pending: Pending,
        notice: impl FnOnce(Ticket) -> Notice,
    ) -> Option<Ticket> {
        let mut state = self.lock();
        let notices = state.nodes.get(target)?.notices.clone();
        let ticket = Ticket(rand::random());
        state.pending.insert(ticket, pending);
        if notices.try_send(notice(ticket)).is_err() {
            state.pending.remove(&ticket);
            return None;
        }
        Some(ticket)
    }

    fn take(&self, ticket: &Ticket) -> Option<Pending> {
        self.lock().pending.remove(ticket)
    }
}

pub struct RendezvousServer {
    listener: Box<dyn Listener>,
    shared: Shared,
}

impl RendezvousServer {
    pub async fn bind(network: &dyn Network, addr: SocketAddr) -> io::Result<Self> {
        Ok(Self {
            listener: network.bind(addr).await?,
            shared: Shared::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until cancelled.
    pub async fn run(self, cancel: CancelToken) {
        tracing::info!(addr = ?self.listener.local_addr().ok(), "rendezvous node listening");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                a = self.listener.accept() => a,
            };
            match accepted {
                Ok((link, remote)) => {
                    let shared = self.shared.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            r = handle(shared, link, remote) => {
                                if let Err(e) = r {
                                    tracing::debug!(%remote, error = %e, "rendezvous link ended");
                                }
                            }
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle(shared: Shared, mut link: BoxedLink, remote: SocketAddr) -> Result<(), LinkError> {
    let first = tokio::time::timeout(TICKET_TTL, read_frame::<_, NodeRequest>(&mut link))
        .await
        .map_err(|_| LinkError::Timeout)??;
    match first {
        NodeRequest::Register { node_id } => register(shared, link, remote, node_id).await,
        NodeRequest::Punch { target } => coordinate_punch(shared, link, remote, target).await,
        NodeRequest::PunchAccept { ticket } => match shared.take(&ticket) {
            Some(Pending::Punch { dialer, reply }) => {
                let _ = reply.send(remote);
                write_frame(&mut link, &NodeReply::PunchGo { peer: dialer }).await
            }
            _ => write_frame(&mut link, &NodeReply::Unavailable).await,
        },
        NodeRequest::Bridge { target } => bridge(shared, link, target).await,
        NodeRequest::BridgeAccept { ticket } => match shared.take(&ticket) {
            Some(Pending::Bridge { reply }) => {
                let _ = reply.send(link);
                Ok(())
            }
            _ => write_frame(&mut link, &NodeReply::Unavailable).await,
        },
        NodeRequest::Prove { .. } => Err(LinkError::Unexpected),
    }
}

async fn register(
    shared: Shared,
    mut link: BoxedLink,
    remote: SocketAddr,
    node_id: NodeId,
) -> Result<(), LinkError> {
    let nonce: [u8; 32] = rand::random();
    write_frame(&mut link, &NodeReply::Challenge { nonce }).await?;
    let proof = tokio::time::timeout(TICKET_TTL, read_frame::<_, NodeRequest>(&mut link))
        .await
        .map_err(|_| LinkError::Timeout)??;
    let signature = match proof {
        NodeRequest::Prove { signature } => signature,
        _ => return Err(LinkError::Unexpected),
    };
    if node_id
        .verify(&registration_proof_bytes(&nonce), &signature)
        .is_err()
    {
        write_frame(&mut link, &NodeReply::Unavailable).await?;
        return Err(LinkError::Unexpected);
    }

    let (tx, mut notices) = mpsc::channel(16);
    let epoch = {
        let mut state = shared.lock();
        state.next_epoch += 1;
        let epoch = state.next_epoch;
        state.nodes.insert(node_id, Registered { notices: tx, epoch });
        epoch
    };
    tracing::info!(node = %node_id.short(), %remote, "node registered");

    let outcome = push_notices(link, remote, &mut notices).await;

    let mut state = shared.lock();
    if state.nodes.get(&node_id).map(|r| r.epoch) == Some(epoch) {
        state.nodes.remove(&node_id);
        tracing::info!(node = %node_id.short(), "node unregistered");
    }
    outcome
}

/// Forward notices down a registration link until it closes.
async fn push_notices(
    mut link: BoxedLink,
    remote: SocketAddr,
    notices: &mut mpsc::Receiver<Notice>,
) -> Result<(), LinkError> {
    write_frame(&mut link, &NodeReply::Registered { observed: remote }).await?;
    let (mut read, mut write) = tokio::io::split(link);
    let mut byte = [0u8; 1];
    loop {
        tokio::select! {
            n = notices.recv() => match n {
                Some(notice) => write_frame(&mut write, &NodeReply::Notice(notice)).await?,
                None => return Ok(()),
            },
            r = read.read(&mut byte) => return match r? {
                0 => Ok(()),
                _ => Err(LinkError::Unexpected),
            },
        }
    }
}

async fn coordinate_punch(
    shared: Shared,
    mut link: BoxedLink,
    remote: SocketAddr,
    target: NodeId,
) -> Result<(), LinkError> {
    let (reply, answer) = oneshot::channel();
    let pending = Pending::Punch {
        dialer: remote,
        reply,
    };
    let Some(ticket) = shared.notify(&target, pending, |ticket| Notice::Punch { ticket }) else {
        return write_frame(&mut link, &NodeReply::Unavailable).await;
    };
    match tokio::time::timeout(TICKET_TTL, answer).await {
        Ok(Ok(peer)) => {
            tracing::debug!(node = %target.short(), dialer = %remote, %peer, "punch coordinated");
            write_frame(&mut link, &NodeReply::PunchGo { peer }).await
        }
        _ => {
            shared.take(&ticket);
            write_frame(&mut link, &NodeReply::Unavailable).await
        }
    }
}

async fn bridge(shared: Shared, mut link: BoxedLink, target: NodeId) -> Result<(), LinkError> {
    let (reply, answer) = oneshot::channel();
    let Some(ticket) = shared.notify(&target, Pending::Bridge { reply }, |ticket| {
        Notice::Bridge { ticket }
    }) else {
        return write_frame(&mut link, &NodeReply::Unavailable).await;
    };
    let mut other = match tokio::time::timeout(TICKET_TTL, answer).await {
        Ok(Ok(other)) => other,
        _ => {
            shared.take(&ticket);
            return write_frame(&mut link, &NodeReply::Unavailable).await;
        }
    };
    write_frame(&mut other, &NodeReply::Bridged).await?;
    write_frame(&mut link, &NodeReply::Bridged).await?;
    tracing::debug!(node = %target.short(), "bridge up");
    let (up, down) = tokio::io::copy_bidirectional(&mut link, &mut other).await?;
    tracing::debug!(node = %target.short(), up, down, "bridge closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TcpNetwork;
    use crate::rendezvous::{bridge_via, punch_via, Registration};
    use tokio::io::AsyncWriteExt;
    use x11q_core::NodeIdentity;

    async fn start() -> (SocketAddr, CancelToken) {
        let server = RendezvousServer::bind(&TcpNetwork, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancelToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (addr, cancel)
    }

    #[tokio::test]
    async fn registration_learns_observed_address() {
        let (addr, cancel) = start().await;
        let (tx, _rx) = mpsc::channel(4);
        let reg = Registration::spawn(
            Arc::new(TcpNetwork),
            Arc::new(NodeIdentity::generate()),
            addr,
            tx,
            Duration::from_secs(5),
            cancel.clone(),
        );
        let observed = reg.registered().await.unwrap();
        assert!(observed.ip().is_loopback());
        assert_eq!(reg.observed(), Some(observed));
        cancel.cancel();
    }

    #[tokio::test]
    async fn bridge_splices_dialer_to_registered_node() {
        let (addr, cancel) = start().await;
        let identity = Arc::new(NodeIdentity::generate());
        let (tx, mut inbound) = mpsc::channel(4);
        let reg = Registration::spawn(
            Arc::new(TcpNetwork),
            identity.clone(),
            addr,
            tx,
            Duration::from_secs(5),
            cancel.clone(),
        );
        reg.registered().await.unwrap();

        let mut dialer = bridge_via(&TcpNetwork, addr, identity.id()).await.unwrap();
        let mut target = inbound.recv().await.unwrap();
        assert_eq!(target.path, x11q_core::PathKind::Relay);

        dialer.write_all(b"opaque").await.unwrap();
        let mut buf = [0u8; 6];
        target.link.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"opaque");
        target.link.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        dialer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
        cancel.cancel();
    }

    #[tokio::test]
    async fn unknown_target_is_unavailable() {
        let (addr, cancel) = start().await;
        let nobody = NodeIdentity::generate().id();
        assert!(matches!(
            bridge_via(&TcpNetwork, addr, nobody).await,
            Err(LinkError::Unavailable)
        ));
        assert!(matches!(
            punch_via(&TcpNetwork, addr, nobody).await,
            Err(LinkError::Unavailable)
        ));
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn silent_registrant_is_dropped_after_ticket_ttl() {
        let (ours, mut theirs) = tokio::io::duplex(1024);
        let remote: SocketAddr = "192.0.2.9:40000".parse().unwrap();
        let node_id = NodeIdentity::generate().id();
        let started = tokio::time::Instant::now();
        let registering = tokio::spawn(register(
            Shared::default(),
            Box::new(ours),
            remote,
            node_id,
        ));
        assert!(matches!(
            read_frame::<_, NodeReply>(&mut theirs).await.unwrap(),
            NodeReply::Challenge { .. }
        ));
        assert!(matches!(
            registering.await.unwrap(),
            Err(LinkError::Timeout)
        ));
        assert_eq!(started.elapsed(), TICKET_TTL);
    }

    #[tokio::test]
    async fn registration_requires_key_possession() {
        let (addr, cancel) = start().await;
        let victim = NodeIdentity::generate().id();
        let impostor = NodeIdentity::generate();
        let (mut link, _) = TcpNetwork.connect(addr).await.unwrap();
        write_frame(&mut link, &NodeRequest::Register { node_id: victim })
            .await
            .unwrap();
        let NodeReply::Challenge { nonce } = read_frame(&mut link).await.unwrap() else {
            panic!("expected challenge");
        };
        let signature = impostor.sign(&registration_proof_bytes(&nonce));
        write_frame(&mut link, &NodeRequest::Prove { signature })
            .await
            .unwrap();
        assert!(matches!(
            read_frame::<_, NodeReply>(&mut link).await.unwrap(),
            NodeReply::Unavailable
        ));
        assert!(matches!(
            bridge_via(&TcpNetwork, addr, victim).await,
            Err(LinkError::Unavailable)
        ));
        cancel.cancel();
    }
}
