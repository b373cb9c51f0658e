//! x11q session core.
//! Host-driven: no I/O; the daemon moves bytes and feeds results back in.

pub mod clock;
pub mod code;
pub mod directory;
pub mod handshake;
pub mod identity;
mod kdf;
pub mod pake;
pub mod protocol;
pub mod session;
pub mod wire;

pub use clock::{Clock, ManualClock};
pub use code::{derive_lookup_key, derive_password, CodeError, CodePassword, LookupKey, WordCode};
pub use directory::{
    withdraw_proof_bytes, DirectoryRecord, RecordStore, RoutingHint, DEFAULT_MAX_RECORDS,
    MAX_RECORD_TTL,
};
pub use handshake::{ChannelKeys, ChannelRole, ConnectionId, HandshakeError};
pub use identity::{NodeId, NodeIdentity, SignatureBytes};
pub use pake::{ConfirmTag, PakeError, PakeResult, PakeRole, PakeSession, SessionKey};
pub use protocol::{AuthMode, PathKind, Service, PROTOCOL_VERSION};
pub use session::{FailReason, SessionEvent, SessionMachine, SessionState};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
