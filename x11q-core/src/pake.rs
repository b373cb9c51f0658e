//! SPAKE2 (Ed25519 group) plus an HMAC key-confirmation round.
//!
//! One `PakeSession` covers exactly one attempt over one connection. The
//! exchange is two SPAKE2 messages followed by one confirmation tag from each
//! side. SPAKE2 itself never fails on a wrong password; it just produces
//! different keys, so the confirmation tags are what turn a mismatch into
//! `AuthFailed`. Tags also bind the secure-channel value of the connection
//! they ran over, so a transcript cannot be replayed onto another channel.

use std::fmt;

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spake2::{Ed25519Group, Identity, Password, Spake2};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::code::CodePassword;
use crate::kdf;

const ID_JOINER: &[u8] = b"x11q-client";
const ID_SERVER: &[u8] = b"x11q-server";
const TRANSCRIPT_LABEL: &[u8] = b"x11q/pake/transcript/v1";

/// Which end of the exchange this is. The serving side holds the code first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeRole {
    Joiner,
    Server,
}

impl PakeRole {
    fn confirm_label(self) -> &'static [u8] {
        match self {
            PakeRole::Joiner => b"x11q/pake/confirm/joiner",
            PakeRole::Server => b"x11q/pake/confirm/server",
        }
    }

    fn peer(self) -> PakeRole {
        match self {
            PakeRole::Joiner => PakeRole::Server,
            PakeRole::Server => PakeRole::Joiner,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PakeResult {
    Pending,
    Success,
    Failed,
}

/// Key-confirmation tag sent to the peer after both SPAKE2 messages.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmTag(#[serde(with = "crate::identity::bytes_32")] [u8; 32]);

impl ConfirmTag {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ConfirmTag(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ConfirmTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfirmTag(..)")
    }
}

/// Key agreed by a successful exchange. Zeroized on drop; compared in constant time.
#[derive(Clone)]
pub struct SessionKey(Zeroizing<[u8; 32]>);

impl SessionKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_slice().ct_eq(other.0.as_slice()).into()
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

struct Confirmation {
    peer_key: Zeroizing<[u8; 32]>,
    transcript: [u8; 32],
    session: SessionKey,
}

pub struct PakeSession {
    role: PakeRole,
    spake: Option<Spake2<Ed25519Group>>,
    outbound: Vec<u8>,
    binding: [u8; 32],
    confirmation: Option<Confirmation>,
    result: PakeResult,
}

impl PakeSession {
    /// Start an attempt with fresh randomness. `binding` is the channel-binding
    /// value of the secure connection the exchange runs over.
    pub fn start(role: PakeRole, password: &CodePassword, binding: [u8; 32]) -> Self {
        let password = Password::new(password.as_bytes());
        let (id_a, id_b) = (Identity::new(ID_JOINER), Identity::new(ID_SERVER));
        let (spake, outbound) = match role {
            PakeRole::Joiner => Spake2::<Ed25519Group>::start_a(&password, &id_a, &id_b),
            PakeRole::Server => Spake2::<Ed25519Group>::start_b(&password, &id_a, &id_b),
        };
        Self {
            role,
            spake: Some(spake),
            outbound,
            binding,
            confirmation: None,
            result: PakeResult::Pending,
        }
    }

    pub fn role(&self) -> PakeRole {
        self.role
    }

    /// This side's SPAKE2 message.
    pub fn message(&self) -> &[u8] {
        &self.outbound
    }

    pub fn result(&self) -> PakeResult {
        self.result
    }

    /// Absorb the peer's SPAKE2 message and return this side's confirmation tag.
    pub fn receive(&mut self, peer_message: &[u8]) -> Result<ConfirmTag, PakeError> {
        let Some(spake) = self.spake.take() else {
            return Err(self.fail(PakeError::OutOfOrder));
        };
        let shared = match spake.finish(peer_message) {
            Ok(key) => Zeroizing::new(key),
            Err(_) => return Err(self.fail(PakeError::Malformed)),
        };

        let (joiner_msg, server_msg) = match self.role {
            PakeRole::Joiner => (self.outbound.as_slice(), peer_message),
            PakeRole::Server => (peer_message, self.outbound.as_slice()),
        };
        let transcript = transcript_hash(joiner_msg, server_msg, &self.binding);

        let hk = Hkdf::<Sha256>::new(Some(&transcript[..]), &shared);
        let own_key = Zeroizing::new(kdf::expand_32(&hk, &[self.role.confirm_label()]));
        let peer_key = Zeroizing::new(kdf::expand_32(&hk, &[self.role.peer().confirm_label()]));
        let mut session = Zeroizing::new([0u8; 32]);
        kdf::expand(&hk, &[b"x11q/pake/session-key"], &mut session[..]);

        let tag = kdf::mac(&own_key, &[self.role.confirm_label(), &transcript]);
        self.confirmation = Some(Confirmation {
            peer_key,
            transcript,
            session: SessionKey(session),
        });
        Ok(ConfirmTag(tag))
    }

    /// Check the peer's tag. Success hands out the session key; a mismatch
    /// ends the attempt for good.
    pub fn verify(&mut self, peer_tag: &ConfirmTag) -> Result<SessionKey, PakeError> {
        let Some(confirmation) = self.confirmation.take() else {
            return Err(self.fail(PakeError::OutOfOrder));
        };
        let label = self.role.peer().confirm_label();
        if kdf::verify_mac(
            &confirmation.peer_key,
            &[label, &confirmation.transcript],
            &peer_tag.0,
        ) {
            self.result = PakeResult::Success;
            Ok(confirmation.session)
        } else {
            Err(self.fail(PakeError::AuthFailed))
        }
    }

    fn fail(&mut self, err: PakeError) -> PakeError {
        self.result = PakeResult::Failed;
        self.spake = None;
        self.confirmation = None;
        err
    }
}

fn transcript_hash(joiner_msg: &[u8], server_msg: &[u8], binding: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_LABEL);
    for part in [joiner_msg, server_msg] {
        hasher.update((part.len() as u32).to_le_bytes());
        hasher.update(part);
    }
    hasher.update(binding);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PakeError {
    #[error("key confirmation failed")]
    AuthFailed,
    #[error("malformed PAKE message")]
    Malformed,
    #[error("PAKE step out of order")]
    OutOfOrder,
}
