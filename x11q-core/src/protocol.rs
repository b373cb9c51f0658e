//! x11q wire protocol: message types and version.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::handshake::{ConnectionId, Hello, HelloAck};
use crate::identity::{NodeId, SignatureBytes};
use crate::pake::ConfirmTag;

/// Current protocol version. Carried in every handshake hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// What the data streams of a connection carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    X11,
    Mirror,
}

/// How the peer will be authenticated once the channel is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    /// The transport credential (node id) is the trust anchor.
    Identity,
    /// Word-code PAKE over the control stream.
    Pake,
}

/// Route a connection took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathKind {
    Direct,
    HolePunch,
    Relay,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PathKind::Direct => "direct",
            PathKind::HolePunch => "hole-punch",
            PathKind::Relay => "relay",
        })
    }
}

/// First plaintext frame on every raw link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Opening {
    /// New connection; the secure handshake follows.
    Hello(Hello),
    /// Move an existing connection onto this link.
    Resume {
        connection_id: ConnectionId,
        #[serde(with = "crate::identity::bytes_32")]
        tag: [u8; 32],
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HelloReply {
    Ack(HelloAck),
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Version,
    Service,
    AuthMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeReply {
    Accepted,
    Refused,
}

/// Encrypted frames exchanged once the secure channel is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Control(ControlMessage),
    Open { stream: u32 },
    Data { stream: u32, payload: Vec<u8> },
    Close { stream: u32 },
    /// Last frame on the old path; the sender continues on the resumed link.
    Migrate,
    /// Graceful shutdown.
    GoAway,
}

/// Control stream: authentication only, never data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    Pake(Vec<u8>),
    Confirm(ConfirmTag),
    /// Identity mode: the listener accepted this dialer.
    Proceed,
    /// The serving session is already paired.
    Busy,
    Abort(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    AuthFailed,
    ProtocolViolation,
    Unsupported,
}

/// Opaque token naming one pending punch or bridge at a rendezvous node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ticket(pub [u8; 16]);

/// Client to rendezvous node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeRequest {
    Register { node_id: NodeId },
    Prove { signature: SignatureBytes },
    Punch { target: NodeId },
    PunchAccept { ticket: Ticket },
    Bridge { target: NodeId },
    BridgeAccept { ticket: Ticket },
}

/// Rendezvous node to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeReply {
    Challenge {
        #[serde(with = "crate::identity::bytes_32")]
        nonce: [u8; 32],
    },
    Registered { observed: SocketAddr },
    Notice(Notice),
    /// Start punching toward `peer` from the local port of this link.
    PunchGo { peer: SocketAddr },
    /// From here on the link is spliced to the peer.
    Bridged,
    Unavailable,
}

/// Pushed down a registration link when someone wants to reach the node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum Notice {
    Punch { ticket: Ticket },
    Bridge { ticket: Ticket },
}

/// Bytes a registering node signs to prove it owns its node id.
pub fn registration_proof_bytes(nonce: &[u8; 32]) -> Vec<u8> {
    let mut out = b"x11q/rendezvous/register/v1".to_vec();
    out.extend_from_slice(nonce);
    out
}
