//! In-process network with NAT behaviour. Hosts share one [`SimNetwork`];
//! each host gets its own [`SimHost`] view, which is what a node is built on.
//!
//! Only hosts with [`Nat::Open`] accept unsolicited links. A NATed host is
//! reachable by simultaneous open alone, and only when both sides' mapped
//! endpoints line up: endpoint-independent mappings ([`Nat::Cone`]) keep the
//! endpoint a rendezvous node observed, per-destination mappings
//! ([`Nat::Symmetric`]) do not. Traffic toward an address nobody answers is
//! dropped silently, so callers see a hang rather than a refusal.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use x11q_linux::{BoxedLink, Listener, Network};

const LINK_BUFFER: usize = 64 * 1024;
const FIRST_EPHEMERAL: u16 = 40_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nat {
    /// Public address, no translation.
    Open,
    /// Endpoint-independent mapping behind `public`.
    Cone { public: IpAddr },
    /// A fresh mapping behind `public` for every destination.
    Symmetric { public: IpAddr },
}

type Inbound = mpsc::Sender<(BoxedLink, SocketAddr)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MapKey {
    local: SocketAddr,
    destination: Option<SocketAddr>,
}

struct PendingPunch {
    from: SocketAddr,
    to: SocketAddr,
    reply: oneshot::Sender<BoxedLink>,
}

struct World {
    listeners: HashMap<SocketAddr, Inbound>,
    mappings: HashMap<MapKey, u16>,
    punches: Vec<PendingPunch>,
    next_port: u16,
}

impl World {
    fn ephemeral(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(FIRST_EPHEMERAL);
        port
    }
}

#[derive(Clone)]
pub struct SimNetwork {
    world: Arc<Mutex<World>>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self {
            world: Arc::new(Mutex::new(World {
                listeners: HashMap::new(),
                mappings: HashMap::new(),
                punches: Vec::new(),
                next_port: FIRST_EPHEMERAL,
            })),
        }
    }

    /// A host at `ip` (its private address when NATed).
    pub fn host(&self, ip: IpAddr, nat: Nat) -> SimHost {
        SimHost {
            world: self.world.clone(),
            ip,
            nat,
        }
    }
}

fn lock(world: &Mutex<World>) -> MutexGuard<'_, World> {
    world.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SimHost {
    world: Arc<Mutex<World>>,
    ip: IpAddr,
    nat: Nat,
}

impl SimHost {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn nat(&self) -> Nat {
        self.nat
    }

    /// The public endpoint packets from `local` toward `destination` carry.
    fn mapped(&self, world: &mut World, local: SocketAddr, destination: SocketAddr) -> SocketAddr {
        let (public, key) = match self.nat {
            Nat::Open => return local,
            Nat::Cone { public } => (
                public,
                MapKey {
                    local,
                    destination: None,
                },
            ),
            Nat::Symmetric { public } => (
                public,
                MapKey {
                    local,
                    destination: Some(destination),
                },
            ),
        };
        let port = match world.mappings.get(&key) {
            Some(port) => *port,
            None => {
                let port = world.ephemeral();
                world.mappings.insert(key, port);
                port
            }
        };
        SocketAddr::new(public, port)
    }
}

struct SimListener {
    world: Arc<Mutex<World>>,
    local: SocketAddr,
    inbound: tokio::sync::Mutex<mpsc::Receiver<(BoxedLink, SocketAddr)>>,
}

#[async_trait]
impl Listener for SimListener {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    async fn accept(&self) -> io::Result<(BoxedLink, SocketAddr)> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Drop for SimListener {
    fn drop(&mut self) {
        lock(&self.world).listeners.remove(&self.local);
    }
}

#[async_trait]
impl Network for SimHost {
    async fn bind(&self, addr: SocketAddr) -> io::Result<Box<dyn Listener>> {
        let (tx, rx) = mpsc::channel(16);
        let mut world = lock(&self.world);
        let port = match addr.port() {
            0 => world.ephemeral(),
            port => port,
        };
        let local = SocketAddr::new(self.ip, port);
        if world.listeners.contains_key(&local) {
            return Err(io::ErrorKind::AddrInUse.into());
        }
        // Behind a NAT nothing unsolicited gets in; the listener just never
        // sees a link.
        if self.nat == Nat::Open {
            world.listeners.insert(local, tx);
        }
        tracing::trace!(%local, "sim bind");
        Ok(Box::new(SimListener {
            world: self.world.clone(),
            local,
            inbound: tokio::sync::Mutex::new(rx),
        }))
    }

    async fn connect(&self, remote: SocketAddr) -> io::Result<(BoxedLink, SocketAddr)> {
        let (local, from, inbound) = {
            let mut world = lock(&self.world);
            let local = SocketAddr::new(self.ip, world.ephemeral());
            let from = self.mapped(&mut world, local, remote);
            (local, from, world.listeners.get(&remote).cloned())
        };
        let Some(inbound) = inbound else {
            tracing::trace!(%remote, "sim connect dropped");
            return std::future::pending().await;
        };
        let (ours, theirs) = tokio::io::duplex(LINK_BUFFER);
        if inbound.send((Box::new(theirs), from)).await.is_err() {
            return std::future::pending().await;
        }
        Ok((Box::new(ours), local))
    }

    async fn punch(&self, local: SocketAddr, remote: SocketAddr) -> io::Result<BoxedLink> {
        let waiting = {
            let mut world = lock(&self.world);
            let from = self.mapped(&mut world, local, remote);
            world.punches.retain(|p| !p.reply.is_closed());
            let matched = world
                .punches
                .iter()
                .position(|p| p.from == remote && p.to == from);
            match matched {
                Some(i) => {
                    let peer = world.punches.swap_remove(i);
                    let (ours, theirs) = tokio::io::duplex(LINK_BUFFER);
                    if peer.reply.send(Box::new(theirs)).is_ok() {
                        tracing::trace!(%from, %remote, "sim punch met");
                        return Ok(Box::new(ours));
                    }
                    // The other side gave up in between; wait like a first
                    // arrival.
                    let (reply, waiting) = oneshot::channel();
                    world.punches.push(PendingPunch {
                        from,
                        to: remote,
                        reply,
                    });
                    waiting
                }
                None => {
                    let (reply, waiting) = oneshot::channel();
                    world.punches.push(PendingPunch {
                        from,
                        to: remote,
                        reply,
                    });
                    waiting
                }
            }
        };
        match waiting.await {
            Ok(link) => Ok(link),
            Err(_) => std::future::pending().await,
        }
    }
}
