//! Client side of a rendezvous node: keeping a registration alive so peers can
//! reach this node, and asking a node to punch or bridge toward a peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use x11q_core::protocol::{registration_proof_bytes, NodeReply, NodeRequest, Notice, Ticket};
use x11q_core::{NodeId, NodeIdentity, PathKind};

use crate::cancel::CancelToken;
use crate::framed::{read_frame, write_frame};
use crate::net::{BoxedLink, LinkError, Network};

const RETRY_MIN: Duration = Duration::from_secs(1);
const RETRY_MAX: Duration = Duration::from_secs(30);

/// A raw link someone opened toward this node, not yet past the handshake.
pub struct InboundLink {
    pub link: BoxedLink,
    pub path: PathKind,
}

/// Ask `node` to coordinate a hole punch toward `target`, then punch.
pub async fn punch_via(
    network: &dyn Network,
    node: SocketAddr,
    target: NodeId,
) -> Result<BoxedLink, LinkError> {
    let (mut link, local) = network.connect(node).await?;
    write_frame(&mut link, &NodeRequest::Punch { target }).await?;
    match read_frame(&mut link).await? {
        NodeReply::PunchGo { peer } => {
            tracing::debug!(%node, %peer, "punching");
            network.punch(local, peer).await.map_err(LinkError::from)
        }
        NodeReply::Unavailable => Err(LinkError::Unavailable),
        _ => Err(LinkError::Unexpected),
    }
}

/// Ask `node` to bridge a fresh link to `target`. The returned link carries
/// only what the two ends send each other.
pub async fn bridge_via(
    network: &dyn Network,
    node: SocketAddr,
    target: NodeId,
) -> Result<BoxedLink, LinkError> {
    let (mut link, _) = network.connect(node).await?;
    write_frame(&mut link, &NodeRequest::Bridge { target }).await?;
    match read_frame(&mut link).await? {
        NodeReply::Bridged => Ok(link),
        NodeReply::Unavailable => Err(LinkError::Unavailable),
        _ => Err(LinkError::Unexpected),
    }
}

#[derive(Clone)]
struct Ctx {
    network: Arc<dyn Network>,
    identity: Arc<NodeIdentity>,
    node: SocketAddr,
    inbound: mpsc::Sender<InboundLink>,
    punch_timeout: Duration,
    cancel: CancelToken,
}

/// Keeps this node registered at one rendezvous node and turns the node's
/// notices into [`InboundLink`]s. Stops when `cancel` fires.
pub struct Registration {
    node: SocketAddr,
    observed: watch::Receiver<Option<SocketAddr>>,
}

impl Registration {
    pub fn spawn(
        network: Arc<dyn Network>,
        identity: Arc<NodeIdentity>,
        node: SocketAddr,
        inbound: mpsc::Sender<InboundLink>,
        punch_timeout: Duration,
        cancel: CancelToken,
    ) -> Self {
        let (tx, observed) = watch::channel(None);
        let ctx = Ctx {
            network,
            identity,
            node,
            inbound,
            punch_timeout,
            cancel,
        };
        tokio::spawn(keep_registered(ctx, tx));
        Self { node, observed }
    }

    pub fn node(&self) -> SocketAddr {
        self.node
    }

    /// Our address as the node last saw it.
    pub fn observed(&self) -> Option<SocketAddr> {
        *self.observed.borrow()
    }

    /// Waits for the first successful registration. `None` if the task ended.
    pub async fn registered(&self) -> Option<SocketAddr> {
        let mut rx = self.observed.clone();
        let addr = rx.wait_for(|o| o.is_some()).await.ok()?;
        *addr
    }
}

async fn keep_registered(ctx: Ctx, observed: watch::Sender<Option<SocketAddr>>) {
    let mut backoff = RETRY_MIN;
    loop {
        let result = tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            r = serve_registration(&ctx, &observed, &mut backoff) => r,
        };
        if let Err(e) = result {
            tracing::warn!(node = %ctx.node, error = %e, retry_in = ?backoff, "rendezvous registration lost");
        }
        tokio::select! {
            _ = ctx.cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(RETRY_MAX);
    }
}

async fn serve_registration(
    ctx: &Ctx,
    observed: &watch::Sender<Option<SocketAddr>>,
    backoff: &mut Duration,
) -> Result<(), LinkError> {
    let (mut link, _) = ctx.network.connect(ctx.node).await?;
    write_frame(
        &mut link,
        &NodeRequest::Register {
            node_id: ctx.identity.id(),
        },
    )
    .await?;
    let nonce = match read_frame(&mut link).await? {
        NodeReply::Challenge { nonce } => nonce,
        _ => return Err(LinkError::Unexpected),
    };
    let signature = ctx.identity.sign(&registration_proof_bytes(&nonce));
    write_frame(&mut link, &NodeRequest::Prove { signature }).await?;
    let addr = match read_frame(&mut link).await? {
        NodeReply::Registered { observed } => observed,
        NodeReply::Unavailable => return Err(LinkError::Unavailable),
        _ => return Err(LinkError::Unexpected),
    };
    observed.send_replace(Some(addr));
    *backoff = RETRY_MIN;
    tracing::info!(node = %ctx.node, observed = %addr, "registered at rendezvous node");

    loop {
        match read_frame(&mut link).await? {
            NodeReply::Notice(notice) => {
                tokio::spawn(answer(ctx.clone(), notice));
            }
            _ => return Err(LinkError::Unexpected),
        }
    }
}

async fn answer(ctx: Ctx, notice: Notice) {
    let attempt = async {
        match notice {
            Notice::Punch { ticket } => accept_punch(&ctx, ticket).await.map(|link| InboundLink {
                link,
                path: PathKind::HolePunch,
            }),
            Notice::Bridge { ticket } => accept_bridge(&ctx, ticket).await.map(|link| InboundLink {
                link,
                path: PathKind::Relay,
            }),
        }
    };
    let result = tokio::select! {
        _ = ctx.cancel.cancelled() => return,
        r = tokio::time::timeout(ctx.punch_timeout, attempt) => r.unwrap_or(Err(LinkError::Timeout)),
    };
    match result {
        Ok(inbound) => {
            tracing::debug!(node = %ctx.node, path = %inbound.path, "inbound link via rendezvous");
            let _ = ctx.inbound.send(inbound).await;
        }
        Err(e) => tracing::debug!(node = %ctx.node, error = %e, "rendezvous notice dropped"),
    }
}

async fn accept_punch(ctx: &Ctx, ticket: Ticket) -> Result<BoxedLink, LinkError> {
    let (mut link, local) = ctx.network.connect(ctx.node).await?;
    write_frame(&mut link, &NodeRequest::PunchAccept { ticket }).await?;
    match read_frame(&mut link).await? {
        NodeReply::PunchGo { peer } => Ok(ctx.network.punch(local, peer).await?),
        NodeReply::Unavailable => Err(LinkError::Unavailable),
        _ => Err(LinkError::Unexpected),
    }
}

async fn accept_bridge(ctx: &Ctx, ticket: Ticket) -> Result<BoxedLink, LinkError> {
    let (mut link, _) = ctx.network.connect(ctx.node).await?;
    write_frame(&mut link, &NodeRequest::BridgeAccept { ticket }).await?;
    match read_frame(&mut link).await? {
        NodeReply::Bridged => Ok(link),
        NodeReply::Unavailable => Err(LinkError::Unavailable),
        _ => Err(LinkError::Unexpected),
    }
}
