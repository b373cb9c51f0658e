//! Every way a peer can reach a listening node: an optional direct listener
//! plus a registration at each rendezvous node. Raw links are sorted by their
//! opening frame. `Hello` becomes an [`Attempt`] for the session to secure;
//! `Resume` is routed to the live connection it names.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use x11q_core::handshake::Hello;
use x11q_core::protocol::{Opening, ResumeReply};
use x11q_core::{ConnectionId, PathKind, RoutingHint};

use crate::cancel::CancelToken;
use crate::connection::MigrationRegistry;
use crate::framed::write_frame;
use crate::net::{BoxedLink, Listener};
use crate::rendezvous::{InboundLink, Registration};
use crate::secure::read_opening;
use crate::session::Node;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A peer that said `Hello` on some path.
pub struct Attempt {
    pub link: BoxedLink,
    pub hello: Hello,
    pub path: PathKind,
}

/// Owns the listener and registrations; dropping it stops them.
pub struct InboundSet {
    hints: Vec<RoutingHint>,
    listen_addr: Option<SocketAddr>,
    attempts: mpsc::Receiver<Attempt>,
    _registrations: Vec<Registration>,
    cancel: CancelToken,
}

impl InboundSet {
    /// Bind `listen` (if any) and register with the node's rendezvous nodes.
    /// Waits up to the handshake timeout for registrations so the routing
    /// hints can carry reflexive addresses.
    pub async fn start(node: &Node, listen: Option<SocketAddr>) -> io::Result<Self> {
        let cancel = CancelToken::new();
        let settings = node.settings();
        let (links_tx, links_rx) = mpsc::channel(16);

        let mut listen_addr = None;
        if let Some(addr) = listen {
            let listener = node.network().bind(addr).await?;
            let local = listener.local_addr()?;
            tracing::info!(addr = %local, "listening for direct connections");
            listen_addr = Some(local);
            tokio::spawn(accept_loop(listener, links_tx.clone(), cancel.clone()));
        }

        let registrations: Vec<Registration> = node
            .rendezvous()
            .iter()
            .map(|&rv| {
                Registration::spawn(
                    node.network().clone(),
                    node.identity().clone(),
                    rv,
                    links_tx.clone(),
                    settings.hole_punch_timeout,
                    cancel.clone(),
                )
            })
            .collect();
        drop(links_tx);

        let deadline = tokio::time::Instant::now() + settings.handshake_timeout;
        let mut observed = Vec::new();
        for reg in &registrations {
            match tokio::time::timeout_at(deadline, reg.registered()).await {
                Ok(Some(addr)) => observed.push(addr),
                _ => tracing::warn!(node = %reg.node(), "rendezvous node not reachable yet"),
            }
        }

        let mut hints = Vec::new();
        if let Some(local) = listen_addr {
            hints.extend(
                node.network()
                    .advertise(local, &observed)
                    .into_iter()
                    .map(RoutingHint::Direct),
            );
        }
        hints.extend(node.rendezvous().iter().copied().map(RoutingHint::Rendezvous));

        let (attempts_tx, attempts) = mpsc::channel(8);
        tokio::spawn(sort_links(
            links_rx,
            attempts_tx,
            node.registry().clone(),
            settings.handshake_timeout,
            cancel.clone(),
        ));

        Ok(Self {
            hints,
            listen_addr,
            attempts,
            _registrations: registrations,
            cancel,
        })
    }

    /// What to publish so peers can find this node.
    pub fn hints(&self) -> &[RoutingHint] {
        &self.hints
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    pub async fn next(&mut self) -> Option<Attempt> {
        self.attempts.recv().await
    }
}

impl Drop for InboundSet {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: Box<dyn Listener>,
    links: mpsc::Sender<InboundLink>,
    cancel: CancelToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            a = listener.accept() => a,
        };
        match accepted {
            Ok((link, remote)) => {
                tracing::debug!(%remote, "direct link accepted");
                let inbound = InboundLink {
                    link,
                    path: PathKind::Direct,
                };
                if links.send(inbound).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn sort_links(
    mut links: mpsc::Receiver<InboundLink>,
    attempts: mpsc::Sender<Attempt>,
    registry: MigrationRegistry,
    within: Duration,
    cancel: CancelToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => return,
            l = links.recv() => match l {
                Some(l) => l,
                None => return,
            },
        };
        let attempts = attempts.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            let InboundLink { mut link, path } = inbound;
            let opening = match tokio::time::timeout(within, read_opening(&mut link)).await {
                Ok(Ok(opening)) => opening,
                Ok(Err(e)) => {
                    tracing::debug!(%path, error = %e, "unreadable opening");
                    return;
                }
                Err(_) => {
                    tracing::debug!(%path, "no opening before timeout");
                    return;
                }
            };
            match opening {
                Opening::Hello(hello) => {
                    let _ = attempts.send(Attempt { link, hello, path }).await;
                }
                Opening::Resume { connection_id, tag } => {
                    resume(link, path, &registry, connection_id, &tag).await
                }
            }
        });
    }
}

async fn resume(
    mut link: BoxedLink,
    path: PathKind,
    registry: &MigrationRegistry,
    id: ConnectionId,
    tag: &[u8; 32],
) {
    let Some(conn) = registry.claim(&id, tag) else {
        tracing::debug!(connection = ?id, "resume refused");
        let _ = write_frame(&mut link, &ResumeReply::Refused).await;
        return;
    };
    if let Err(e) = write_frame(&mut link, &ResumeReply::Accepted).await {
        tracing::debug!(connection = ?id, error = %e, "resume reply failed");
        return;
    }
    if let Err(e) = conn.migrate(link, path).await {
        tracing::debug!(connection = ?id, error = %e, "migration failed");
    }
}
