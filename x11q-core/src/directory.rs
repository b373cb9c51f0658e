//! Rendezvous directory records and the expiring store behind in-memory and
//! HTTP directory backends.
//!
//! The directory is public and writable by anyone. A record only names a
//! candidate node; it is never an authentication claim.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::code::LookupKey;
use crate::identity::NodeId;

/// Longest a record may live without being refreshed.
pub const MAX_RECORD_TTL: Duration = Duration::from_secs(120);

/// Live records a store holds before it turns new keys away.
pub const DEFAULT_MAX_RECORDS: usize = 65_536;

/// Where a published node may be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutingHint {
    /// Dial this address directly.
    Direct(SocketAddr),
    /// The node is registered at this rendezvous node (punch and relay).
    Rendezvous(SocketAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub key: LookupKey,
    pub node_id: NodeId,
    pub hints: Vec<RoutingHint>,
    pub ttl_secs: u64,
}

impl DirectoryRecord {
    pub fn new(key: LookupKey, node_id: NodeId, hints: Vec<RoutingHint>, ttl: Duration) -> Self {
        Self {
            key,
            node_id,
            hints,
            ttl_secs: ttl.min(MAX_RECORD_TTL).as_secs(),
        }
    }

    /// Effective lifetime, never above [`MAX_RECORD_TTL`].
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs).min(MAX_RECORD_TTL)
    }
}

/// Bytes the owner signs to take its record under `key` down. The node id
/// alone is public, so it proves nothing.
pub fn withdraw_proof_bytes(key: &LookupKey, owner: &NodeId) -> Vec<u8> {
    let mut out = b"x11q/directory/withdraw/v1".to_vec();
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(owner.as_bytes());
    out
}

struct Entry {
    record: DirectoryRecord,
    visible_at: Instant,
    expires_at: Instant,
}

/// Key-value store with server-enforced expiry. `visibility_delay` models an
/// eventually consistent backend where a fresh write is not yet readable.
pub struct RecordStore<C> {
    clock: C,
    entries: HashMap<LookupKey, Entry>,
    visibility_delay: Duration,
    max_records: usize,
}

impl<C: Clock> RecordStore<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            entries: HashMap::new(),
            visibility_delay: Duration::ZERO,
            max_records: DEFAULT_MAX_RECORDS,
        }
    }

    pub fn with_max_records(mut self, max: usize) -> Self {
        self.max_records = max;
        self
    }

    pub fn with_visibility_delay(mut self, delay: Duration) -> Self {
        self.visibility_delay = delay;
        self
    }

    /// Insert or refresh. Refreshing an identical record keeps its visibility;
    /// anything else replaces it (last writer wins). A new key is refused
    /// once the store is full of live records.
    pub fn publish(&mut self, record: DirectoryRecord) -> Result<(), RecordError> {
        if record.ttl_secs == 0 {
            return Err(RecordError::ZeroTtl);
        }
        self.purge_expired();
        if !self.entries.contains_key(&record.key) && self.entries.len() >= self.max_records {
            return Err(RecordError::Full);
        }
        let now = self.clock.now();
        let expires_at = now + record.ttl();
        let visible_at = match self.entries.get(&record.key) {
            Some(e) if e.record.node_id == record.node_id
                && e.record.hints == record.hints
                && e.expires_at > now =>
            {
                e.visible_at
            }
            _ => now + self.visibility_delay,
        };
        self.entries.insert(
            record.key,
            Entry {
                record,
                visible_at,
                expires_at,
            },
        );
        Ok(())
    }

    pub fn lookup(&mut self, key: &LookupKey) -> Option<DirectoryRecord> {
        let now = self.clock.now();
        self.purge_expired();
        self.entries
            .get(key)
            .filter(|e| e.visible_at <= now)
            .map(|e| e.record.clone())
    }

    /// Remove the record under `key` if `owner` published it.
    pub fn withdraw(&mut self, key: &LookupKey, owner: &NodeId) -> bool {
        match self.entries.get(key) {
            Some(e) if e.record.node_id == *owner => {
                self.entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn purge_expired(&mut self) {
        let now = self.clock.now();
        self.entries.retain(|_, e| e.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record ttl must be positive")]
    ZeroTtl,
    #[error("directory is full")]
    Full,
}
