//! Transport establishment: an ordered list of independently timed strategies
//! (direct dial, coordinated hole punch, relay) that all end in the same
//! secured [`Connection`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use x11q_core::protocol::{Opening, RejectReason, ResumeReply};
use x11q_core::{NodeId, NodeIdentity, PathKind, RoutingHint};

use crate::connection::Connection;
use crate::framed::{read_frame, write_frame};
use crate::net::{BoxedLink, LinkError, Network};
use crate::rendezvous::{bridge_via, punch_via};
use crate::secure::{self, Offer, SecureError};

/// Who to reach and where to look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub node_id: NodeId,
    /// Address the operator typed (`NODE_ID@ADDR`), tried first.
    pub addr_hint: Option<SocketAddr>,
    pub hints: Vec<RoutingHint>,
}

impl Target {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            addr_hint: None,
            hints: Vec::new(),
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr_hint = Some(addr);
        self
    }

    pub fn with_hints(mut self, hints: Vec<RoutingHint>) -> Self {
        self.hints = hints;
        self
    }

    fn direct_addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.addr_hint.into_iter().chain(self.hints.iter().filter_map(|h| match h {
            RoutingHint::Direct(a) if Some(*a) != self.addr_hint => Some(*a),
            _ => None,
        }))
    }

    fn rendezvous_nodes(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.hints.iter().filter_map(|h| match h {
            RoutingHint::Rendezvous(a) => Some(*a),
            _ => None,
        })
    }
}

/// One way of getting a raw link to the target.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> PathKind;

    /// Budget for [`Strategy::attempt`]; the establisher enforces it.
    fn timeout(&self) -> Duration;

    async fn attempt(&self, target: &Target) -> Result<BoxedLink, LinkError>;
}

/// Dial the address hint and every direct routing hint at once; the first
/// link up wins and the other dials are dropped.
pub struct DirectDial {
    network: Arc<dyn Network>,
    timeout: Duration,
}

impl DirectDial {
    pub fn new(network: Arc<dyn Network>, timeout: Duration) -> Self {
        Self { network, timeout }
    }
}

#[async_trait]
impl Strategy for DirectDial {
    fn kind(&self) -> PathKind {
        PathKind::Direct
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, target: &Target) -> Result<BoxedLink, LinkError> {
        let mut dials = JoinSet::new();
        for addr in target.direct_addrs() {
            let network = self.network.clone();
            dials.spawn(async move { (addr, network.connect(addr).await) });
        }
        let mut last = LinkError::Unavailable;
        while let Some(joined) = dials.join_next().await {
            match joined {
                Ok((_, Ok((link, _)))) => return Ok(link),
                Ok((addr, Err(e))) => {
                    tracing::debug!(%addr, error = %e, "direct dial failed");
                    last = e.into();
                }
                Err(e) => tracing::debug!(error = %e, "direct dial task ended"),
            }
        }
        Err(last)
    }
}

/// Punch through NATs with help from the target's rendezvous nodes.
pub struct HolePunch {
    network: Arc<dyn Network>,
    timeout: Duration,
}

impl HolePunch {
    pub fn new(network: Arc<dyn Network>, timeout: Duration) -> Self {
        Self { network, timeout }
    }
}

#[async_trait]
impl Strategy for HolePunch {
    fn kind(&self) -> PathKind {
        PathKind::HolePunch
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, target: &Target) -> Result<BoxedLink, LinkError> {
        let mut last = LinkError::Unavailable;
        for node in target.rendezvous_nodes() {
            match punch_via(self.network.as_ref(), node, target.node_id).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    tracing::debug!(%node, error = %e, "hole punch failed");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

/// Bridge through one of the target's rendezvous nodes.
pub struct Relay {
    network: Arc<dyn Network>,
    timeout: Duration,
}

impl Relay {
    pub fn new(network: Arc<dyn Network>, timeout: Duration) -> Self {
        Self { network, timeout }
    }
}

#[async_trait]
impl Strategy for Relay {
    fn kind(&self) -> PathKind {
        PathKind::Relay
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, target: &Target) -> Result<BoxedLink, LinkError> {
        let mut last = LinkError::Unavailable;
        for node in target.rendezvous_nodes() {
            match bridge_via(self.network.as_ref(), node, target.node_id).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    tracing::debug!(%node, error = %e, "relay failed");
                    last = e;
                }
            }
        }
        Err(last)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EstablishError {
    /// Every strategy failed or timed out.
    #[error("no path to peer")]
    Exhausted,
    /// The peer answered but does not offer what we asked for.
    #[error("peer refused: {0:?}")]
    Refused(RejectReason),
}

/// Runs the strategies in order, each under its own timeout, then the secure
/// handshake under `handshake_timeout`.
pub struct Establisher {
    identity: Arc<NodeIdentity>,
    strategies: Vec<Arc<dyn Strategy>>,
    handshake_timeout: Duration,
}

impl Establisher {
    pub fn new(
        identity: Arc<NodeIdentity>,
        strategies: Vec<Arc<dyn Strategy>>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            strategies,
            handshake_timeout,
        }
    }

    pub async fn establish(&self, target: &Target, offer: Offer) -> Result<Connection, EstablishError> {
        for strategy in &self.strategies {
            let kind = strategy.kind();
            let link = match tokio::time::timeout(strategy.timeout(), strategy.attempt(target)).await {
                Ok(Ok(link)) => link,
                Ok(Err(e)) => {
                    tracing::debug!(path = %kind, error = %e, "strategy failed");
                    continue;
                }
                Err(_) => {
                    tracing::debug!(path = %kind, "strategy timed out");
                    continue;
                }
            };
            let handshake = secure::dial(link, &self.identity, offer, Some(target.node_id), kind);
            match tokio::time::timeout(self.handshake_timeout, handshake).await {
                Ok(Ok(conn)) => {
                    tracing::info!(peer = %target.node_id.short(), path = %kind, "connected");
                    return Ok(conn);
                }
                Ok(Err(SecureError::Mismatch(reason))) => return Err(EstablishError::Refused(reason)),
                Ok(Err(e)) => tracing::debug!(path = %kind, error = %e, "handshake failed"),
                Err(_) => tracing::debug!(path = %kind, "handshake timed out"),
            }
        }
        Err(EstablishError::Exhausted)
    }

    /// Move `conn` onto a better path if `strategy` finds one.
    pub async fn upgrade(
        &self,
        conn: &Connection,
        target: &Target,
        strategy: &dyn Strategy,
    ) -> Result<PathKind, LinkError> {
        let kind = strategy.kind();
        let mut link = tokio::time::timeout(strategy.timeout(), strategy.attempt(target))
            .await
            .map_err(|_| LinkError::Timeout)??;
        let resume = Opening::Resume {
            connection_id: conn.connection_id(),
            tag: conn.resume_tag(),
        };
        let reply = tokio::time::timeout(self.handshake_timeout, async {
            write_frame(&mut link, &resume).await?;
            read_frame::<_, ResumeReply>(&mut link).await
        })
        .await
        .map_err(|_| LinkError::Timeout)??;
        match reply {
            ResumeReply::Accepted => {
                conn.migrate(link, kind)
                    .await
                    .map_err(|_| LinkError::Unavailable)?;
                Ok(kind)
            }
            ResumeReply::Refused => Err(LinkError::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TcpNetwork;
    use x11q_core::{AuthMode, Service};

    const OFFER: Offer = Offer {
        service: Service::X11,
        auth: AuthMode::Identity,
    };

    struct Never;

    #[async_trait]
    impl Strategy for Never {
        fn kind(&self) -> PathKind {
            PathKind::HolePunch
        }

        fn timeout(&self) -> Duration {
            Duration::from_secs(8)
        }

        async fn attempt(&self, _: &Target) -> Result<BoxedLink, LinkError> {
            std::future::pending().await
        }
    }

    #[test]
    fn direct_addrs_put_the_typed_hint_first() {
        let id = x11q_core::NodeIdentity::generate().id();
        let typed: SocketAddr = "192.0.2.1:7100".parse().unwrap();
        let other: SocketAddr = "192.0.2.2:7100".parse().unwrap();
        let node: SocketAddr = "198.51.100.1:7300".parse().unwrap();
        let target = Target::new(id).with_addr(typed).with_hints(vec![
            RoutingHint::Direct(typed),
            RoutingHint::Rendezvous(node),
            RoutingHint::Direct(other),
        ]);
        assert_eq!(target.direct_addrs().collect::<Vec<_>>(), vec![typed, other]);
        assert_eq!(target.rendezvous_nodes().collect::<Vec<_>>(), vec![node]);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_strategy_is_cut_off_and_reported() {
        let identity = Arc::new(NodeIdentity::generate());
        let establisher = Establisher::new(identity, vec![Arc::new(Never)], Duration::from_secs(10));
        let target = Target::new(NodeIdentity::generate().id());
        let started = tokio::time::Instant::now();
        assert!(matches!(
            establisher.establish(&target, OFFER).await,
            Err(EstablishError::Exhausted)
        ));
        assert_eq!(started.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn falls_through_to_a_working_address() {
        let net: Arc<dyn Network> = Arc::new(TcpNetwork);
        let listener_identity = NodeIdentity::generate();
        let listener_id = listener_identity.id();
        let listener = net.bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut link, _) = listener.accept().await.unwrap();
            let Opening::Hello(hello) = secure::read_opening(&mut link).await.unwrap() else {
                panic!("expected hello");
            };
            secure::accept(link, hello, &listener_identity, OFFER, PathKind::Direct)
                .await
                .unwrap()
        });

        let identity = Arc::new(NodeIdentity::generate());
        let strategies: Vec<Arc<dyn Strategy>> =
            vec![Arc::new(DirectDial::new(net.clone(), Duration::from_secs(3)))];
        let establisher = Establisher::new(identity.clone(), strategies, Duration::from_secs(10));
        // Nothing listens on the typed address.
        let dead: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let target = Target::new(listener_id)
            .with_addr(dead)
            .with_hints(vec![RoutingHint::Direct(addr)]);

        let conn = establisher.establish(&target, OFFER).await.unwrap();
        assert_eq!(conn.peer(), listener_id);
        assert_eq!(conn.path(), PathKind::Direct);
        assert_eq!(server.await.unwrap().peer(), identity.id());
    }
}
