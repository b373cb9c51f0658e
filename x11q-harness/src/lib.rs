//! Scenario harness: whole sessions over a simulated NAT network, with a
//! shared in-memory directory and one rendezvous node on a public address.
//! Run under a paused tokio clock so every timeout is exact.

pub mod faults;
pub mod sim;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use x11q_core::NodeIdentity;
use x11q_linux::{CancelToken, Directory, MemoryDirectory, Network, Node, RendezvousServer};

pub use faults::{Failing, Hanging};
pub use sim::{Nat, SimHost, SimNetwork};

pub const RENDEZVOUS_ADDR: &str = "203.0.113.3:7300";

pub struct Scenario {
    pub net: SimNetwork,
    pub directory: MemoryDirectory,
    rendezvous: SocketAddr,
    cancel: CancelToken,
}

impl Scenario {
    pub async fn start() -> std::io::Result<Self> {
        let net = SimNetwork::new();
        let rendezvous: SocketAddr = RENDEZVOUS_ADDR
            .parse()
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
        let host = net.host(rendezvous.ip(), Nat::Open);
        let server = RendezvousServer::bind(&host, rendezvous).await?;
        let cancel = CancelToken::new();
        tokio::spawn(server.run(cancel.clone()));
        Ok(Self {
            net,
            directory: MemoryDirectory::new(),
            rendezvous,
            cancel,
        })
    }

    pub fn rendezvous(&self) -> SocketAddr {
        self.rendezvous
    }

    /// A fresh node on `ip`, wired to the shared directory and the
    /// rendezvous node.
    pub fn node(&self, ip: &str, nat: Nat) -> Node {
        self.node_on(self.network(ip, nat))
    }

    pub fn node_on(&self, network: Arc<dyn Network>) -> Node {
        Node::new(NodeIdentity::generate(), network)
            .with_directory(Arc::new(self.directory.clone()) as Arc<dyn Directory>)
            .with_rendezvous(vec![self.rendezvous])
    }

    pub fn network(&self, ip: &str, nat: Nat) -> Arc<dyn Network> {
        Arc::new(self.net.host(parse_ip(ip), nat))
    }
}

impl Drop for Scenario {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn parse_ip(ip: &str) -> IpAddr {
    ip.parse().unwrap_or_else(|_| panic!("bad scenario address {ip}"))
}

pub fn cone(public: &str) -> Nat {
    Nat::Cone {
        public: parse_ip(public),
    }
}

pub fn symmetric(public: &str) -> Nat {
    Nat::Symmetric {
        public: parse_ip(public),
    }
}

/// Log to the test writer; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
