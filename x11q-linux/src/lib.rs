//! x11q for Linux: every socket, timer and task around the core. The `x11q`
//! binary is a thin CLI over [`session`].

pub mod auth;
pub mod cancel;
pub mod config;
pub mod connection;
pub mod directory;
pub mod dirserver;
pub mod establish;
pub mod forward;
mod framed;
pub mod inbound;
pub mod keystore;
pub mod mirror;
pub mod net;
pub mod relay;
pub mod rendezvous;
pub mod secure;
pub mod session;

pub use cancel::CancelToken;
pub use connection::{AuthenticatedConnection, CloseReason, DataStream};
pub use directory::{Directory, DirectoryClient, HttpDirectory, LookupPolicy, MemoryDirectory};
pub use establish::{Strategy, Target};
pub use inbound::InboundSet;
pub use net::{BoxedLink, Link, LinkError, Listener, Network, TcpNetwork};
pub use relay::RendezvousServer;
pub use session::{Node, ReadySession, Serving, Session, SessionError, Settings};
