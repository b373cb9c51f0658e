//! Secure-channel handshake: signed ephemeral X25519 between two node identities.
//!
//! Dialer sends `Hello`, listener answers `HelloAck` signed over the transcript,
//! dialer closes with `Finish` signed over the same transcript. Both ends then
//! hold per-direction wire keys, a channel-binding value for PAKE confirmation,
//! and a resume key plus connection id for moving the connection between paths.

use std::fmt;

use hkdf::Hkdf;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

use crate::identity::{NodeId, NodeIdentity, SignatureBytes};
use crate::kdf;
use crate::protocol::{AuthMode, Service, PROTOCOL_VERSION};

const TRANSCRIPT_LABEL: &[u8] = b"x11q/handshake/v1";
const DIALER_SIG_LABEL: &[u8] = b"x11q/handshake/dialer";
const LISTENER_SIG_LABEL: &[u8] = b"x11q/handshake/listener";
const RESUME_LABEL: &[u8] = b"x11q/resume/v1";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub [u8; 16]);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", hex::encode(&self.0[..4]))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub version: u8,
    pub service: Service,
    pub auth: AuthMode,
    pub node_id: NodeId,
    #[serde(with = "crate::identity::bytes_32")]
    pub ephemeral: [u8; 32],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub version: u8,
    pub node_id: NodeId,
    #[serde(with = "crate::identity::bytes_32")]
    pub ephemeral: [u8; 32],
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finish {
    pub signature: SignatureBytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Dialer,
    Listener,
}

/// Key material for one secured connection. Zeroized on drop.
pub struct ChannelKeys {
    role: ChannelRole,
    peer: NodeId,
    send: Zeroizing<[u8; 32]>,
    recv: Zeroizing<[u8; 32]>,
    binding: [u8; 32],
    resume: Zeroizing<[u8; 32]>,
    connection_id: ConnectionId,
}

impl ChannelKeys {
    fn derive(role: ChannelRole, peer: NodeId, shared: &[u8; 32], transcript: &[u8; 32]) -> Self {
        let hk = Hkdf::<Sha256>::new(Some(&transcript[..]), shared);
        let d2l = Zeroizing::new(kdf::expand_32(&hk, &[b"dialer to listener"]));
        let l2d = Zeroizing::new(kdf::expand_32(&hk, &[b"listener to dialer"]));
        let (send, recv) = match role {
            ChannelRole::Dialer => (d2l, l2d),
            ChannelRole::Listener => (l2d, d2l),
        };
        let mut id = [0u8; 16];
        kdf::expand(&hk, &[b"connection id"], &mut id);
        Self {
            role,
            peer,
            send,
            recv,
            binding: kdf::expand_32(&hk, &[b"channel binding"]),
            resume: Zeroizing::new(kdf::expand_32(&hk, &[b"resume"])),
            connection_id: ConnectionId(id),
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// Node id the peer proved possession of.
    pub fn peer(&self) -> NodeId {
        self.peer
    }

    pub fn send_key(&self) -> &[u8; 32] {
        &self.send
    }

    pub fn recv_key(&self) -> &[u8; 32] {
        &self.recv
    }

    /// Value both ends share only if they sit on the same secured channel.
    pub fn binding(&self) -> [u8; 32] {
        self.binding
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn resume_tag(&self) -> [u8; 32] {
        kdf::mac(&self.resume, &[RESUME_LABEL, &self.connection_id.0])
    }

    pub fn verify_resume(&self, tag: &[u8; 32]) -> bool {
        kdf::verify_mac(&self.resume, &[RESUME_LABEL, &self.connection_id.0], tag)
    }
}

impl fmt::Debug for ChannelKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelKeys")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("connection_id", &self.connection_id)
            .finish_non_exhaustive()
    }
}

/// Dialer half, between sending `Hello` and receiving `HelloAck`.
pub struct DialerHandshake {
    ephemeral: EphemeralSecret,
    hello: Hello,
    expected: Option<NodeId>,
}

/// Begin a handshake toward a listener. With `expected` set, any other
/// responding identity fails the handshake.
pub fn dial(
    identity: &NodeIdentity,
    service: Service,
    auth: AuthMode,
    expected: Option<NodeId>,
) -> DialerHandshake {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let hello = Hello {
        version: PROTOCOL_VERSION,
        service,
        auth,
        node_id: identity.id(),
        ephemeral: X25519PublicKey::from(&ephemeral).to_bytes(),
    };
    DialerHandshake {
        ephemeral,
        hello,
        expected,
    }
}

impl DialerHandshake {
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    pub fn complete(
        self,
        identity: &NodeIdentity,
        ack: &HelloAck,
    ) -> Result<(Finish, ChannelKeys), HandshakeError> {
        if ack.version != PROTOCOL_VERSION {
            return Err(HandshakeError::Version(ack.version));
        }
        if let Some(expected) = self.expected {
            if expected != ack.node_id {
                return Err(HandshakeError::WrongPeer);
            }
        }
        let transcript = transcript_hash(&self.hello, &ack.node_id, &ack.ephemeral);
        ack.node_id
            .verify(&signed_bytes(LISTENER_SIG_LABEL, &transcript), &ack.signature)
            .map_err(|_| HandshakeError::BadSignature)?;
        let shared = self
            .ephemeral
            .diffie_hellman(&X25519PublicKey::from(ack.ephemeral));
        if !shared.was_contributory() {
            return Err(HandshakeError::NonContributory);
        }
        let finish = Finish {
            signature: identity.sign(&signed_bytes(DIALER_SIG_LABEL, &transcript)),
        };
        let keys = ChannelKeys::derive(
            ChannelRole::Dialer,
            ack.node_id,
            shared.as_bytes(),
            &transcript,
        );
        Ok((finish, keys))
    }
}

/// Listener half, between sending `HelloAck` and receiving `Finish`.
pub struct ListenerHandshake {
    hello: Hello,
    transcript: [u8; 32],
    keys: ChannelKeys,
}

/// Answer a dialer's `Hello`.
pub fn accept(
    identity: &NodeIdentity,
    hello: &Hello,
) -> Result<(ListenerHandshake, HelloAck), HandshakeError> {
    if hello.version != PROTOCOL_VERSION {
        return Err(HandshakeError::Version(hello.version));
    }
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let own_ephemeral = X25519PublicKey::from(&ephemeral).to_bytes();
    let own_id = identity.id();
    let transcript = transcript_hash(hello, &own_id, &own_ephemeral);
    let shared = ephemeral.diffie_hellman(&X25519PublicKey::from(hello.ephemeral));
    if !shared.was_contributory() {
        return Err(HandshakeError::NonContributory);
    }
    let keys = ChannelKeys::derive(
        ChannelRole::Listener,
        hello.node_id,
        shared.as_bytes(),
        &transcript,
    );
    let ack = HelloAck {
        version: PROTOCOL_VERSION,
        node_id: own_id,
        ephemeral: own_ephemeral,
        signature: identity.sign(&signed_bytes(LISTENER_SIG_LABEL, &transcript)),
    };
    Ok((
        ListenerHandshake {
            hello: hello.clone(),
            transcript,
            keys,
        },
        ack,
    ))
}

impl ListenerHandshake {
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    pub fn complete(self, finish: &Finish) -> Result<ChannelKeys, HandshakeError> {
        self.hello
            .node_id
            .verify(
                &signed_bytes(DIALER_SIG_LABEL, &self.transcript),
                &finish.signature,
            )
            .map_err(|_| HandshakeError::BadSignature)?;
        Ok(self.keys)
    }
}

fn service_tag(service: Service) -> u8 {
    match service {
        Service::X11 => 1,
        Service::Mirror => 2,
    }
}

fn auth_tag(auth: AuthMode) -> u8 {
    match auth {
        AuthMode::Identity => 1,
        AuthMode::Pake => 2,
    }
}

fn transcript_hash(hello: &Hello, listener: &NodeId, listener_ephemeral: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_LABEL);
    hasher.update([
        hello.version,
        service_tag(hello.service),
        auth_tag(hello.auth),
    ]);
    hasher.update(hello.node_id.as_bytes());
    hasher.update(hello.ephemeral);
    hasher.update(listener.as_bytes());
    hasher.update(listener_ephemeral);
    hasher.finalize().into()
}

fn signed_bytes(label: &[u8], transcript: &[u8; 32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(label.len() + 32);
    out.extend_from_slice(label);
    out.extend_from_slice(transcript);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("peer is not the expected node")]
    WrongPeer,
    #[error("handshake signature does not verify")]
    BadSignature,
    #[error("peer sent a low-order ephemeral key")]
    NonContributory,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(
        expected: Option<NodeId>,
        listener: &NodeIdentity,
    ) -> Result<(ChannelKeys, ChannelKeys), HandshakeError> {
        let dialer = NodeIdentity::generate();
        let hs = dial(&dialer, Service::X11, AuthMode::Pake, expected);
        let (pending, ack) = accept(listener, hs.hello())?;
        let (finish, dialer_keys) = hs.complete(&dialer, &ack)?;
        let listener_keys = pending.complete(&finish)?;
        assert_eq!(listener_keys.peer(), dialer.id());
        Ok((dialer_keys, listener_keys))
    }

    #[test]
    fn both_sides_agree_on_keys() {
        let listener = NodeIdentity::generate();
        let (d, l) = pair(Some(listener.id()), &listener).unwrap();
        assert_eq!(d.peer(), listener.id());
        assert_eq!(d.send_key(), l.recv_key());
        assert_eq!(d.recv_key(), l.send_key());
        assert_ne!(d.send_key(), d.recv_key());
        assert_eq!(d.binding(), l.binding());
        assert_eq!(d.connection_id(), l.connection_id());
        assert!(l.verify_resume(&d.resume_tag()));
    }

    #[test]
    fn fresh_connections_differ() {
        let listener = NodeIdentity::generate();
        let (a, _) = pair(None, &listener).unwrap();
        let (b, _) = pair(None, &listener).unwrap();
        assert_ne!(a.binding(), b.binding());
        assert_ne!(a.connection_id(), b.connection_id());
        assert!(!b.verify_resume(&a.resume_tag()));
    }

    #[test]
    fn wrong_listener_identity_is_rejected() {
        let listener = NodeIdentity::generate();
        let someone_else = NodeIdentity::generate().id();
        assert_eq!(
            pair(Some(someone_else), &listener).unwrap_err(),
            HandshakeError::WrongPeer
        );
    }

    #[test]
    fn forged_ack_signature_is_rejected() {
        let dialer = NodeIdentity::generate();
        let listener = NodeIdentity::generate();
        let impostor = NodeIdentity::generate();
        let hs = dial(&dialer, Service::X11, AuthMode::Identity, Some(listener.id()));
        let (_, mut ack) = accept(&impostor, hs.hello()).unwrap();
        ack.node_id = listener.id();
        assert_eq!(
            hs.complete(&dialer, &ack).unwrap_err(),
            HandshakeError::BadSignature
        );
    }

    #[test]
    fn forged_finish_is_rejected() {
        let dialer = NodeIdentity::generate();
        let listener = NodeIdentity::generate();
        let mut hs = dial(&dialer, Service::X11, AuthMode::Identity, None);
        hs.hello.node_id = NodeIdentity::generate().id();
        let (pending, ack) = accept(&listener, hs.hello()).unwrap();
        let (finish, _) = hs.complete(&dialer, &ack).unwrap();
        assert_eq!(
            pending.complete(&finish).unwrap_err(),
            HandshakeError::BadSignature
        );
    }

    #[test]
    fn low_order_ephemeral_is_rejected() {
        let dialer = NodeIdentity::generate();
        let listener = NodeIdentity::generate();
        let mut hs = dial(&dialer, Service::X11, AuthMode::Identity, None);
        hs.hello.ephemeral = [0u8; 32];
        assert_eq!(
            accept(&listener, hs.hello()).err(),
            Some(HandshakeError::NonContributory)
        );
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dialer = NodeIdentity::generate();
        let listener = NodeIdentity::generate();
        let mut hs = dial(&dialer, Service::X11, AuthMode::Identity, None);
        hs.hello.version = PROTOCOL_VERSION + 1;
        assert_eq!(
            accept(&listener, hs.hello()).err(),
            Some(HandshakeError::Version(PROTOCOL_VERSION + 1))
        );
    }

    #[test]
    fn service_is_bound_into_transcript() {
        let dialer = NodeIdentity::generate();
        let listener = NodeIdentity::generate();
        let hs = dial(&dialer, Service::X11, AuthMode::Identity, None);
        let mut tampered = hs.hello().clone();
        tampered.service = Service::Mirror;
        let (_, ack) = accept(&listener, &tampered).unwrap();
        assert_eq!(
            hs.complete(&dialer, &ack).unwrap_err(),
            HandshakeError::BadSignature
        );
    }
}
