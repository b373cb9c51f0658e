//! Node identity and crypto: long-term signing keys, node IDs, wire encryption.

use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{Aead, KeyInit};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Node ID: the 32-byte Ed25519 verifying key of a node. Shown as 64 hex chars.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct NodeId(#[serde(with = "bytes_32")] [u8; 32]);

pub(crate) mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

mod bytes_64 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

impl NodeId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex chars, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Verify `signature` over `msg` against this node's key.
    pub fn verify(&self, msg: &[u8], signature: &SignatureBytes) -> Result<(), IdentityError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| IdentityError::BadKey)?;
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        key.verify_strict(msg, &sig)
            .map_err(|_| IdentityError::BadSignature)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut out).map_err(|_| IdentityError::BadNodeId)?;
        VerifyingKey::from_bytes(&out).map_err(|_| IdentityError::BadNodeId)?;
        Ok(NodeId(out))
    }
}

/// Detached Ed25519 signature (64 bytes).
#[derive(Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "bytes_64")] [u8; 64]);

impl SignatureBytes {
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        SignatureBytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignatureBytes({}..)", hex::encode(&self.0[..4]))
    }
}

/// Long-term node keypair. The secret half never leaves the key store.
pub struct NodeIdentity {
    signing: SigningKey,
    id: NodeId,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        Self::from_signing(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild from the 32-byte secret seed held by the key store.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing(SigningKey::from_bytes(secret))
    }

    fn from_signing(signing: SigningKey) -> Self {
        let id = NodeId(signing.verifying_key().to_bytes());
        Self { signing, id }
    }

    /// Secret seed for persisting. Callers must not log or display it.
    pub fn secret_bytes(&self) -> zeroize::Zeroizing<[u8; 32]> {
        zeroize::Zeroizing::new(self.signing.to_bytes())
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn sign(&self, msg: &[u8]) -> SignatureBytes {
        SignatureBytes(self.signing.sign(msg).to_bytes())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("malformed node id")]
    BadNodeId,
    #[error("node id is not a valid public key")]
    BadKey,
    #[error("signature does not verify")]
    BadSignature,
}

/// Wire encryption: ChaCha20-Poly1305. Nonce: 96-bit counter per direction; never reuse.
pub fn encrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    plaintext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    cipher
        .encrypt(&wire_nonce(nonce), plaintext)
        .map_err(|_| WireCryptoError::Encrypt)
}

/// Wire decryption.
pub fn decrypt_wire(
    key: &[u8; 32],
    nonce: u64,
    ciphertext: &[u8],
) -> Result<Vec<u8>, WireCryptoError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| WireCryptoError::Key)?;
    cipher
        .decrypt(&wire_nonce(nonce), ciphertext)
        .map_err(|_| WireCryptoError::Decrypt)
}

fn wire_nonce(counter: u64) -> chacha20poly1305::Nonce {
    let mut nonce_bytes = [0u8; 12];
    nonce_bytes[4..12].copy_from_slice(&counter.to_le_bytes());
    chacha20poly1305::Nonce::clone_from_slice(&nonce_bytes)
}

#[derive(Debug, thiserror::Error)]
pub enum WireCryptoError {
    #[error("invalid key")]
    Key,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_hex_roundtrip() {
        let identity = NodeIdentity::generate();
        let text = identity.id().to_string();
        assert_eq!(text.len(), 64);
        assert_eq!(text.parse::<NodeId>().unwrap(), identity.id());
    }

    #[test]
    fn node_id_rejects_garbage() {
        assert!("not-hex".parse::<NodeId>().is_err());
        assert!("abcd".parse::<NodeId>().is_err());
    }

    #[test]
    fn secret_bytes_restore_same_identity() {
        let identity = NodeIdentity::generate();
        let restored = NodeIdentity::from_secret_bytes(&identity.secret_bytes());
        assert_eq!(identity.id(), restored.id());
    }

    #[test]
    fn sign_and_verify() {
        let identity = NodeIdentity::generate();
        let sig = identity.sign(b"hello x11q");
        identity.id().verify(b"hello x11q", &sig).unwrap();
        assert!(identity.id().verify(b"hello x11r", &sig).is_err());
        let other = NodeIdentity::generate();
        assert!(other.id().verify(b"hello x11q", &sig).is_err());
    }

    #[test]
    fn debug_hides_secret() {
        let identity = NodeIdentity::generate();
        let shown = format!("{:?}", identity);
        let secret = hex::encode(*identity.secret_bytes());
        assert!(!shown.contains(&secret));
        assert!(!shown.contains(&secret[..8]));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let plain = b"hello x11q";
        let cipher = encrypt_wire(&key, 0, plain).unwrap();
        let dec = decrypt_wire(&key, 0, &cipher).unwrap();
        assert_eq!(dec.as_slice(), plain);
        assert!(decrypt_wire(&key, 1, &cipher).is_err());
    }
}
