//! Rendezvous directory client and backends.
//!
//! The directory is public and writable by anyone; a lookup only yields a
//! candidate node, which the secure handshake and PAKE then have to prove.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use x11q_core::directory::RecordError;
use x11q_core::{
    withdraw_proof_bytes, Clock, DirectoryRecord, LookupKey, NodeId, NodeIdentity, RecordStore,
    RoutingHint, SignatureBytes,
};

use crate::cancel::CancelToken;

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("directory answered {0}")]
    Status(u16),
    #[error("bad record: {0}")]
    Record(#[from] RecordError),
    #[error("malformed record body")]
    Malformed,
    #[error("withdraw not signed by the record owner")]
    Forged,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Insert or refresh.
    async fn publish(&self, record: &DirectoryRecord) -> Result<(), DirectoryError>;

    async fn lookup(&self, key: &LookupKey) -> Result<Option<DirectoryRecord>, DirectoryError>;

    /// Remove `key` if `owner` published it. `signature` is the owner's
    /// signature over [`withdraw_proof_bytes`].
    async fn withdraw(
        &self,
        key: &LookupKey,
        owner: &NodeId,
        signature: &SignatureBytes,
    ) -> Result<(), DirectoryError>;
}

/// Monotonic time that follows tokio's clock, so paused-time tests drive
/// record expiry too.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// In-process directory, shared by cloning.
#[derive(Clone)]
pub struct MemoryDirectory {
    store: Arc<Mutex<RecordStore<Arc<dyn Clock>>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(TokioClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::from_store(RecordStore::new(clock))
    }

    /// Fresh writes stay invisible for `delay`, like a lagging replica.
    pub fn eventually_consistent(delay: Duration) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(TokioClock);
        Self::from_store(RecordStore::new(clock).with_visibility_delay(delay))
    }

    fn from_store(store: RecordStore<Arc<dyn Clock>>) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
        }
    }

    fn store(&self) -> std::sync::MutexGuard<'_, RecordStore<Arc<dyn Clock>>> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn publish(&self, record: &DirectoryRecord) -> Result<(), DirectoryError> {
        Ok(self.store().publish(record.clone())?)
    }

    async fn lookup(&self, key: &LookupKey) -> Result<Option<DirectoryRecord>, DirectoryError> {
        Ok(self.store().lookup(key))
    }

    async fn withdraw(
        &self,
        key: &LookupKey,
        owner: &NodeId,
        signature: &SignatureBytes,
    ) -> Result<(), DirectoryError> {
        owner
            .verify(&withdraw_proof_bytes(key, owner), signature)
            .map_err(|_| DirectoryError::Forged)?;
        self.store().withdraw(key, owner);
        Ok(())
    }
}

/// JSON body of `PUT` and `GET /v1/records/{key}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordBody {
    pub node_id: String,
    pub hints: Vec<RoutingHint>,
    pub ttl_secs: u64,
}

impl RecordBody {
    pub fn from_record(record: &DirectoryRecord) -> Self {
        Self {
            node_id: record.node_id.to_string(),
            hints: record.hints.clone(),
            ttl_secs: record.ttl_secs,
        }
    }

    pub fn into_record(self, key: LookupKey) -> Result<DirectoryRecord, DirectoryError> {
        let node_id: NodeId = self.node_id.parse().map_err(|_| DirectoryError::Malformed)?;
        Ok(DirectoryRecord::new(
            key,
            node_id,
            self.hints,
            Duration::from_secs(self.ttl_secs),
        ))
    }
}

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Client of the directory HTTP service.
pub struct HttpDirectory {
    base: String,
    http: reqwest::Client,
}

impl HttpDirectory {
    pub fn new(base: impl Into<String>) -> Result<Self, DirectoryError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, key: &LookupKey) -> String {
        format!("{}/v1/records/{}", self.base, key)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn publish(&self, record: &DirectoryRecord) -> Result<(), DirectoryError> {
        let resp = self
            .http
            .put(self.url(&record.key))
            .json(&RecordBody::from_record(record))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(DirectoryError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn lookup(&self, key: &LookupKey) -> Result<Option<DirectoryRecord>, DirectoryError> {
        let resp = self.http.get(self.url(key)).send().await?;
        match resp.status().as_u16() {
            404 => Ok(None),
            200 => {
                let body: RecordBody = resp.json().await.map_err(|_| DirectoryError::Malformed)?;
                Ok(Some(body.into_record(*key)?))
            }
            other => Err(DirectoryError::Status(other)),
        }
    }

    async fn withdraw(
        &self,
        key: &LookupKey,
        owner: &NodeId,
        signature: &SignatureBytes,
    ) -> Result<(), DirectoryError> {
        let url = format!(
            "{}?owner={}&sig={}",
            self.url(key),
            owner,
            hex::encode(signature.as_bytes())
        );
        let resp = self.http.delete(url).send().await?;
        match resp.status().as_u16() {
            200..=299 | 404 => Ok(()),
            other => Err(DirectoryError::Status(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
    /// The directory answered, but nobody published under the key.
    #[error("no record under this key")]
    NotFound,
    /// The directory never answered within the deadline.
    #[error("directory did not answer in time")]
    Timeout,
}

#[derive(Debug, Clone, Copy)]
pub struct LookupPolicy {
    pub deadline: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LookupPolicy {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(4),
        }
    }
}

/// Retrying front end over a [`Directory`] backend.
#[derive(Clone)]
pub struct DirectoryClient {
    backend: Arc<dyn Directory>,
    policy: LookupPolicy,
}

impl DirectoryClient {
    pub fn new(backend: Arc<dyn Directory>) -> Self {
        Self::with_policy(backend, LookupPolicy::default())
    }

    pub fn with_policy(backend: Arc<dyn Directory>, policy: LookupPolicy) -> Self {
        Self { backend, policy }
    }

    pub async fn publish(&self, record: &DirectoryRecord) -> Result<(), DirectoryError> {
        self.backend.publish(record).await
    }

    /// Take down `owner`'s record under `key`, signed with its node key.
    pub async fn withdraw(&self, key: &LookupKey, owner: &NodeIdentity) -> Result<(), DirectoryError> {
        let id = owner.id();
        let signature = owner.sign(&withdraw_proof_bytes(key, &id));
        self.backend.withdraw(key, &id, &signature).await
    }

    /// Query until a record shows up or the deadline passes. A fresh record
    /// may not be visible yet, so a miss is retried like an error.
    pub async fn lookup(&self, key: &LookupKey) -> Result<DirectoryRecord, LookupError> {
        let deadline = tokio::time::Instant::now() + self.policy.deadline;
        let mut backoff = self.policy.initial_backoff;
        let mut answered = false;
        loop {
            match tokio::time::timeout_at(deadline, self.backend.lookup(key)).await {
                Ok(Ok(Some(record))) => return Ok(record),
                Ok(Ok(None)) => answered = true,
                Ok(Err(e)) => tracing::debug!(error = %e, "directory lookup failed"),
                Err(_) => break,
            }
            let now = tokio::time::Instant::now();
            if now + backoff >= deadline {
                tokio::time::sleep_until(deadline).await;
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.policy.max_backoff);
        }
        if answered {
            Err(LookupError::NotFound)
        } else {
            Err(LookupError::Timeout)
        }
    }
}

/// Refreshes one record until stopped. Dropping it stops it too.
pub struct Republisher {
    stop: CancelToken,
}

impl Republisher {
    pub fn spawn(client: DirectoryClient, record: DirectoryRecord, every: Duration) -> Self {
        let stop = CancelToken::new();
        let cancel = stop.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                if let Err(e) = client.publish(&record).await {
                    tracing::warn!(error = %e, "republish failed");
                }
            }
        });
        Self { stop }
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for Republisher {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
