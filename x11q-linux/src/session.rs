//! Session controller: drives one [`SessionMachine`] through discovery,
//! transport establishment and authentication to a ready connection, then
//! hands the connection to a byte-relay collaborator.
//!
//! A [`Node`] holds what sessions share (identity, network, directory,
//! rendezvous nodes, settings). Each [`Session`] owns its machine, its
//! cryptographic state and its cancellation token; nothing mutable is shared
//! between sessions.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;
use x11q_core::protocol::ControlMessage;
use x11q_core::{
    derive_lookup_key, derive_password, AuthMode, CodeError, CodePassword, DirectoryRecord,
    FailReason, NodeId, NodeIdentity, PathKind, Service, SessionEvent, SessionKey,
    SessionMachine, SessionState, WordCode, MAX_RECORD_TTL,
};

use crate::auth;
use crate::cancel::CancelToken;
use crate::connection::{AuthenticatedConnection, CloseReason, Connection, MigrationRegistry};
use crate::directory::{Directory, DirectoryClient, LookupError, LookupPolicy, Republisher};
use crate::establish::{DirectDial, EstablishError, Establisher, HolePunch, Relay, Strategy, Target};
use crate::inbound::{Attempt, InboundSet};
use crate::net::Network;
use crate::secure::{self, Offer, SecureError};

const CLOSE_GRACE: Duration = Duration::from_secs(2);
const WITHDRAW_GRACE: Duration = Duration::from_secs(5);
const UPGRADE_RETRY_MIN: Duration = Duration::from_secs(2);
const UPGRADE_RETRY_MAX: Duration = Duration::from_secs(60);
const MAX_PENDING_HANDSHAKES: usize = 16;

/// Timeouts and policies. Defaults match the documented config defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub direct_timeout: Duration,
    pub hole_punch_timeout: Duration,
    pub relay_timeout: Duration,
    pub handshake_timeout: Duration,
    pub auth_timeout: Duration,
    pub lookup: LookupPolicy,
    pub record_ttl: Duration,
    pub republish_every: Duration,
    pub max_failed_attempts: u32,
    pub path_upgrade: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            direct_timeout: Duration::from_secs(3),
            hole_punch_timeout: Duration::from_secs(8),
            relay_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(15),
            lookup: LookupPolicy::default(),
            record_ttl: MAX_RECORD_TTL,
            republish_every: Duration::from_secs(30),
            max_failed_attempts: x11q_core::session::DEFAULT_MAX_FAILED_ATTEMPTS,
            path_upgrade: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("{0}")]
    Failed(FailReason),
    #[error("cancelled")]
    Cancelled,
}

impl SessionError {
    pub fn fail_reason(&self) -> Option<FailReason> {
        match self {
            SessionError::Failed(r) => Some(*r),
            SessionError::Cancelled => None,
        }
    }
}

/// What every session of this process shares.
#[derive(Clone)]
pub struct Node {
    identity: Arc<NodeIdentity>,
    network: Arc<dyn Network>,
    directory: Option<Arc<dyn Directory>>,
    rendezvous: Vec<SocketAddr>,
    settings: Settings,
    strategies: Option<Vec<Arc<dyn Strategy>>>,
    registry: MigrationRegistry,
}

impl Node {
    pub fn new(identity: NodeIdentity, network: Arc<dyn Network>) -> Self {
        Self {
            identity: Arc::new(identity),
            network,
            directory: None,
            rendezvous: Vec::new(),
            settings: Settings::default(),
            strategies: None,
            registry: MigrationRegistry::new(),
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn Directory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_rendezvous(mut self, nodes: Vec<SocketAddr>) -> Self {
        self.rendezvous = nodes;
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the default direct, hole-punch, relay order.
    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn Strategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    pub fn id(&self) -> NodeId {
        self.identity.id()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn identity(&self) -> &Arc<NodeIdentity> {
        &self.identity
    }

    pub(crate) fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub(crate) fn rendezvous(&self) -> &[SocketAddr] {
        &self.rendezvous
    }

    pub(crate) fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Start listening on `listen` and at every rendezvous node.
    pub async fn inbound(&self, listen: Option<SocketAddr>) -> io::Result<InboundSet> {
        InboundSet::start(self, listen).await
    }

    pub fn session(&self, service: Service) -> Session {
        let (state, _) = watch::channel(SessionState::Idle);
        Session {
            node: self.clone(),
            service,
            ctl: Controller {
                id: Uuid::new_v4(),
                machine: SessionMachine::with_max_failed_attempts(
                    self.settings.max_failed_attempts,
                ),
                state,
                cancel: CancelToken::new(),
            },
        }
    }

    fn directory(&self) -> Option<DirectoryClient> {
        self.directory
            .as_ref()
            .map(|d| DirectoryClient::with_policy(d.clone(), self.settings.lookup))
    }

    fn establisher(&self) -> Establisher {
        let s = &self.settings;
        let strategies = match &self.strategies {
            Some(custom) => custom.clone(),
            None => vec![
                Arc::new(DirectDial::new(self.network.clone(), s.direct_timeout)) as Arc<dyn Strategy>,
                Arc::new(HolePunch::new(self.network.clone(), s.hole_punch_timeout)),
                Arc::new(Relay::new(self.network.clone(), s.relay_timeout)),
            ],
        };
        Establisher::new(self.identity.clone(), strategies, s.handshake_timeout)
    }
}

/// Sole owner of a session's state machine.
struct Controller {
    id: Uuid,
    machine: SessionMachine,
    state: watch::Sender<SessionState>,
    cancel: CancelToken,
}

impl Controller {
    fn step(&mut self, event: SessionEvent) -> SessionState {
        match self.machine.step(event) {
            Ok(state) => {
                tracing::info!(session = %self.id, ?state, "session state");
                self.state.send_replace(state);
                state
            }
            Err(e) => {
                tracing::debug!(session = %self.id, error = %e, "transition ignored");
                self.machine.state()
            }
        }
    }

    fn fail(&mut self, reason: FailReason) -> SessionError {
        tracing::warn!(session = %self.id, %reason, "session failed");
        self.step(SessionEvent::Fail(reason));
        SessionError::Failed(reason)
    }

    fn cancelled(&mut self) -> SessionError {
        self.step(SessionEvent::Cancel);
        SessionError::Cancelled
    }

    fn span(&self, role: &'static str) -> tracing::Span {
        tracing::info_span!("session", id = %self.id, role)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// `None` if `cancel` fired first.
async fn until<F: Future>(cancel: &CancelToken, f: F) -> Option<F::Output> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        out = f => Some(out),
    }
}

/// A fresh session. Every operation consumes it: a finished session is never
/// restarted.
pub struct Session {
    node: Node,
    service: Service,
    ctl: Controller,
}

impl Session {
    pub fn id(&self) -> Uuid {
        self.ctl.id
    }

    pub fn state(&self) -> SessionState {
        self.ctl.machine.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.ctl.state.subscribe()
    }

    /// Fires cancellation for this session and everything it spawned.
    pub fn canceller(&self) -> CancelToken {
        self.ctl.cancel.clone()
    }

    /// Look `code` up in the directory, connect to whoever published it and
    /// prove knowledge of the code.
    pub async fn join(mut self, code: &str) -> Result<ReadySession, SessionError> {
        let span = self.ctl.span("join");
        async move {
            let code = match WordCode::parse(code) {
                Ok(code) => code,
                Err(CodeError::InvalidFormat) => return Err(self.ctl.fail(FailReason::InvalidFormat)),
                Err(CodeError::UnknownWord { .. }) => {
                    return Err(self.ctl.fail(FailReason::UnknownWord))
                }
            };
            self.ctl.step(SessionEvent::Discover);
            let Some(directory) = self.node.directory() else {
                tracing::warn!("no directory configured");
                return Err(self.ctl.fail(FailReason::RendezvousTimeout));
            };
            let cancel = self.ctl.cancel.clone();
            let found = until(&cancel, directory.lookup(&derive_lookup_key(&code))).await;
            let record = match found {
                None => return Err(self.ctl.cancelled()),
                Some(Ok(record)) => record,
                Some(Err(LookupError::NotFound)) => {
                    return Err(self.ctl.fail(FailReason::RendezvousNotFound))
                }
                Some(Err(LookupError::Timeout)) => {
                    return Err(self.ctl.fail(FailReason::RendezvousTimeout))
                }
            };
            tracing::info!(peer = %record.node_id.short(), "code resolved");
            self.ctl.step(SessionEvent::Resolved);
            let target = Target::new(record.node_id).with_hints(record.hints);
            self.authenticate_to(&code, target).await
        }
        .instrument(span)
        .await
    }

    /// Word-code join against an already known target, skipping the lookup.
    pub async fn join_target(
        mut self,
        code: &WordCode,
        target: Target,
    ) -> Result<ReadySession, SessionError> {
        let span = self.ctl.span("join");
        async move {
            self.ctl.step(SessionEvent::Dial);
            self.authenticate_to(code, target).await
        }
        .instrument(span)
        .await
    }

    /// Direct mode: the target's node id is the trust anchor, no code.
    pub async fn dial(mut self, target: Target) -> Result<ReadySession, SessionError> {
        let span = self.ctl.span("client");
        async move {
            self.ctl.step(SessionEvent::Dial);
            let offer = Offer {
                service: self.service,
                auth: AuthMode::Identity,
            };
            let conn = self.establish(&target, offer).await?;
            let cancel = self.ctl.cancel.clone();
            let accepted = until(
                &cancel,
                tokio::time::timeout(self.node.settings.auth_timeout, auth::await_proceed(conn)),
            )
            .await;
            let authed = match accepted {
                None => return Err(self.ctl.cancelled()),
                Some(Err(_)) => return Err(self.ctl.fail(FailReason::ConnectTimeout)),
                Some(Ok(Err(reason))) => return Err(self.ctl.fail(reason)),
                Some(Ok(Ok(authed))) => authed,
            };
            self.ctl.step(SessionEvent::Secured {
                auth_required: false,
            });
            Ok(self.ready(authed, None, Some(target)))
        }
        .instrument(span)
        .await
    }

    /// Serve under a freshly generated word code.
    pub async fn serve(self, inbound: InboundSet) -> Result<Serving, SessionError> {
        self.serve_code(WordCode::generate(), inbound).await
    }

    /// Publish a record under `code` pointing at `inbound`, and keep it
    /// fresh until a peer authenticates.
    pub async fn serve_code(
        mut self,
        code: WordCode,
        inbound: InboundSet,
    ) -> Result<Serving, SessionError> {
        let span = self.ctl.span("serve");
        async move {
            self.ctl.step(SessionEvent::Discover);
            let Some(directory) = self.node.directory() else {
                tracing::warn!("no directory configured");
                return Err(self.ctl.fail(FailReason::RendezvousTimeout));
            };
            if inbound.hints().is_empty() {
                tracing::warn!("no reachable address and no rendezvous node; nothing to publish");
                return Err(self.ctl.fail(FailReason::RendezvousTimeout));
            }
            let record = DirectoryRecord::new(
                derive_lookup_key(&code),
                self.node.id(),
                inbound.hints().to_vec(),
                self.node.settings.record_ttl,
            );
            let cancel = self.ctl.cancel.clone();
            match until(&cancel, directory.publish(&record)).await {
                None => return Err(self.ctl.cancelled()),
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "publish failed");
                    return Err(self.ctl.fail(FailReason::RendezvousTimeout));
                }
                Some(Ok(())) => {}
            }
            tracing::info!(hints = record.hints.len(), ttl = ?record.ttl(), "record published");
            let republisher = Republisher::spawn(
                directory.clone(),
                record.clone(),
                self.node.settings.republish_every,
            );
            Ok(Serving {
                session: self,
                code,
                record,
                directory,
                republisher,
                inbound,
            })
        }
        .instrument(span)
        .await
    }

    /// Direct mode listener: take the first peer whose secure handshake
    /// completes. Failed handshakes are dropped without counting against the
    /// session.
    pub async fn listen(mut self, mut inbound: InboundSet) -> Result<ReadySession, SessionError> {
        let span = self.ctl.span("server");
        async move {
            self.ctl.step(SessionEvent::Discover);
            let offer = Offer {
                service: self.service,
                auth: AuthMode::Identity,
            };
            let cancel = self.ctl.cancel.clone();
            let mut securing = Securing::new();
            loop {
                let secured =
                    until(&cancel, next_secured(&self.node, &mut inbound, &mut securing, offer)).await;
                let conn = match secured {
                    None => return Err(self.ctl.cancelled()),
                    Some(None) => return Err(self.ctl.fail(FailReason::Disconnected)),
                    Some(Some(conn)) => conn,
                };
                self.ctl.step(SessionEvent::Resolved);
                match auth::proceed(conn).await {
                    Ok(authed) => {
                        self.ctl.step(SessionEvent::Secured {
                            auth_required: false,
                        });
                        self.node.registry.register(authed.connection());
                        spawn_turn_away(&self.node, inbound, securing, offer, self.ctl.cancel.clone());
                        return Ok(self.ready(authed, None, None));
                    }
                    Err(reason) => {
                        tracing::info!(%reason, "inbound attempt dropped");
                        self.ctl.step(SessionEvent::AttemptAbandoned(reason));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn establish(&mut self, target: &Target, offer: Offer) -> Result<Connection, SessionError> {
        let establisher = self.node.establisher();
        let cancel = self.ctl.cancel.clone();
        match until(&cancel, establisher.establish(target, offer)).await {
            None => Err(self.ctl.cancelled()),
            Some(Ok(conn)) => Ok(conn),
            Some(Err(EstablishError::Exhausted)) => Err(self.ctl.fail(FailReason::ConnectTimeout)),
            Some(Err(EstablishError::Refused(reason))) => {
                tracing::info!(?reason, "peer refused the offer");
                Err(self.ctl.fail(FailReason::Unsupported))
            }
        }
    }

    async fn authenticate_to(
        mut self,
        code: &WordCode,
        target: Target,
    ) -> Result<ReadySession, SessionError> {
        let offer = Offer {
            service: self.service,
            auth: AuthMode::Pake,
        };
        let conn = self.establish(&target, offer).await?;
        self.ctl.step(SessionEvent::Secured {
            auth_required: true,
        });
        let password = derive_password(code);
        let cancel = self.ctl.cancel.clone();
        let joined = until(
            &cancel,
            tokio::time::timeout(self.node.settings.auth_timeout, auth::join(conn, &password)),
        )
        .await;
        let (authed, key) = match joined {
            None => return Err(self.ctl.cancelled()),
            Some(Err(_)) => return Err(self.ctl.fail(FailReason::ConnectTimeout)),
            Some(Ok(Err(reason))) => return Err(self.ctl.fail(reason)),
            Some(Ok(Ok(ok))) => ok,
        };
        self.ctl.step(SessionEvent::Authenticated);
        Ok(self.ready(authed, Some(key), Some(target)))
    }

    /// `dialed` is the target this side connected to, if it dialed.
    fn ready(
        self,
        conn: AuthenticatedConnection,
        key: Option<SessionKey>,
        dialed: Option<Target>,
    ) -> ReadySession {
        tracing::info!(
            session = %self.ctl.id,
            peer = %conn.peer().short(),
            path = %conn.path(),
            "session ready"
        );
        if let Some(target) = dialed {
            if self.node.settings.path_upgrade && conn.path() == PathKind::Relay {
                let hole_punch = Arc::new(HolePunch::new(
                    self.node.network.clone(),
                    self.node.settings.hole_punch_timeout,
                ));
                tokio::spawn(
                    upgrade_path(
                        self.node.establisher(),
                        conn.connection().clone(),
                        target,
                        hole_punch,
                        self.ctl.cancel.clone(),
                    )
                    .instrument(self.ctl.span("upgrade")),
                );
            }
        }
        ReadySession {
            ctl: self.ctl,
            conn,
            key,
        }
    }
}

impl Node {
    /// Secure handshake for one inbound attempt, mapped onto the failure
    /// taxonomy.
    async fn secure(&self, attempt: Attempt, offer: Offer) -> Result<Connection, FailReason> {
        let Attempt { link, hello, path } = attempt;
        let handshake = secure::accept(link, hello, &self.identity, offer, path);
        match tokio::time::timeout(self.settings.handshake_timeout, handshake).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(SecureError::Mismatch(_))) => Err(FailReason::Unsupported),
            Ok(Err(e)) => {
                tracing::debug!(%path, error = %e, "inbound handshake failed");
                Err(FailReason::ProtocolViolation)
            }
            Err(_) => Err(FailReason::ConnectTimeout),
        }
    }
}

/// A session that has published its code and waits for a peer.
pub struct Serving {
    session: Session,
    code: WordCode,
    record: DirectoryRecord,
    directory: DirectoryClient,
    republisher: Republisher,
    inbound: InboundSet,
}

impl Serving {
    /// Show this to the operator only; it is the shared secret.
    pub fn code(&self) -> &WordCode {
        &self.code
    }

    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.session.watch_state()
    }

    pub fn canceller(&self) -> CancelToken {
        self.session.canceller()
    }

    /// Authenticate inbound peers until one succeeds, too many wrong codes
    /// burn this one, or the session is cancelled. Handshakes run side by
    /// side; the code exchange takes one peer at a time. The record is
    /// withdrawn on every way out.
    pub async fn wait_ready(self) -> Result<ReadySession, SessionError> {
        let span = self.session.ctl.span("serve");
        let Serving {
            mut session,
            code,
            record,
            directory,
            republisher,
            mut inbound,
        } = self;
        async move {
            let password = derive_password(&code);
            let offer = Offer {
                service: session.service,
                auth: AuthMode::Pake,
            };
            let cancel = session.ctl.cancel.clone();
            let mut securing = Securing::new();
            let outcome = loop {
                let secured = until(
                    &cancel,
                    next_secured(&session.node, &mut inbound, &mut securing, offer),
                )
                .await;
                let conn = match secured {
                    None => break Err(session.ctl.cancelled()),
                    Some(None) => break Err(session.ctl.fail(FailReason::Disconnected)),
                    Some(Some(conn)) => conn,
                };
                tracing::debug!(peer = %conn.peer().short(), path = %conn.path(), "inbound secured");
                session.ctl.step(SessionEvent::Resolved);
                session.ctl.step(SessionEvent::Secured {
                    auth_required: true,
                });

                let exchange = authenticate(&session.node, conn, &password);
                tokio::pin!(exchange);
                let result = loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break None,
                        r = &mut exchange => break Some(r),
                        Some(attempt) = inbound.next() => {
                            admit(&mut securing, &session.node, attempt, offer)
                        }
                    }
                };
                match result {
                    None => break Err(session.ctl.cancelled()),
                    Some(Ok(ok)) => break Ok(ok),
                    Some(Err(reason)) => {
                        tracing::info!(%reason, "inbound attempt failed");
                        if let SessionState::Failed(r) =
                            session.ctl.step(SessionEvent::AttemptAbandoned(reason))
                        {
                            tracing::warn!("too many wrong codes, code burned");
                            break Err(SessionError::Failed(r));
                        }
                    }
                }
            };

            republisher.stop();
            let withdraw = directory.withdraw(&record.key, session.node.identity());
            match tokio::time::timeout(WITHDRAW_GRACE, withdraw).await {
                Ok(Ok(())) => tracing::debug!("record withdrawn"),
                Ok(Err(e)) => tracing::warn!(error = %e, "withdraw failed; record expires on its own"),
                Err(_) => tracing::warn!("withdraw timed out; record expires on its own"),
            }

            let (authed, key) = outcome?;
            session.ctl.step(SessionEvent::Authenticated);
            session.node.registry.register(authed.connection());
            spawn_turn_away(
                &session.node,
                inbound,
                securing,
                offer,
                session.ctl.cancel.clone(),
            );
            Ok(session.ready(authed, Some(key), None))
        }
        .instrument(span)
        .await
    }
}

/// Inbound handshakes in flight.
type Securing = JoinSet<Result<Connection, FailReason>>;

fn admit(securing: &mut Securing, node: &Node, attempt: Attempt, offer: Offer) {
    if securing.len() >= MAX_PENDING_HANDSHAKES {
        tracing::info!(path = %attempt.path, "too many handshakes in flight, dropping attempt");
        return;
    }
    let node = node.clone();
    securing.spawn(async move { node.secure(attempt, offer).await });
}

/// Next inbound peer with a completed secure handshake, or `None` once the
/// inbound set is gone. A peer that stalls mid-handshake only holds its own
/// task.
async fn next_secured(
    node: &Node,
    inbound: &mut InboundSet,
    securing: &mut Securing,
    offer: Offer,
) -> Option<Connection> {
    loop {
        tokio::select! {
            attempt = inbound.next() => match attempt {
                Some(attempt) => admit(securing, node, attempt, offer),
                None => return None,
            },
            Some(joined) = securing.join_next() => match joined {
                Ok(Ok(conn)) => return Some(conn),
                Ok(Err(reason)) => tracing::info!(%reason, "inbound handshake failed"),
                Err(e) => tracing::debug!(error = %e, "handshake task ended"),
            },
        }
    }
}

async fn authenticate(
    node: &Node,
    conn: Connection,
    password: &CodePassword,
) -> Result<(AuthenticatedConnection, SessionKey), FailReason> {
    match tokio::time::timeout(node.settings.auth_timeout, auth::serve(conn, password)).await {
        Ok(result) => result,
        Err(_) => Err(FailReason::ConnectTimeout),
    }
}

/// Every peer after the first successful one gets `Busy`, including those
/// whose handshakes were still running.
fn spawn_turn_away(
    node: &Node,
    mut inbound: InboundSet,
    mut securing: Securing,
    offer: Offer,
    cancel: CancelToken,
) {
    let node = node.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                attempt = inbound.next() => match attempt {
                    Some(attempt) => admit(&mut securing, &node, attempt, offer),
                    None => return,
                },
                Some(joined) = securing.join_next() => {
                    if let Ok(Ok(conn)) = joined {
                        tracing::info!(peer = %conn.peer().short(), "already paired, turning peer away");
                        tokio::spawn(async move { auth::reject(&conn, ControlMessage::Busy).await });
                    }
                }
            }
        }
    });
}

async fn upgrade_path(
    establisher: Establisher,
    conn: Connection,
    target: Target,
    strategy: Arc<dyn Strategy>,
    cancel: CancelToken,
) {
    let mut wait = UPGRADE_RETRY_MIN;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
        if conn.close_reason().is_some() {
            return;
        }
        let attempt = tokio::select! {
            _ = cancel.cancelled() => return,
            r = establisher.upgrade(&conn, &target, strategy.as_ref()) => r,
        };
        match attempt {
            Ok(path) => {
                tracing::info!(peer = %conn.peer().short(), %path, "left the relay");
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, retry_in = ?wait, "path upgrade failed");
                wait = (wait * 2).min(UPGRADE_RETRY_MAX);
            }
        }
    }
}

/// A secured, authenticated session. Dropping it tears down the connection
/// and every background task of the session.
pub struct ReadySession {
    ctl: Controller,
    conn: AuthenticatedConnection,
    key: Option<SessionKey>,
}

impl ReadySession {
    pub fn id(&self) -> Uuid {
        self.ctl.id
    }

    pub fn peer(&self) -> NodeId {
        self.conn.peer()
    }

    pub fn path(&self) -> PathKind {
        self.conn.path()
    }

    /// PAKE session key; `None` in direct mode.
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    pub fn connection(&self) -> &AuthenticatedConnection {
        &self.conn
    }

    pub fn state(&self) -> SessionState {
        self.ctl.machine.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.ctl.state.subscribe()
    }

    pub fn canceller(&self) -> CancelToken {
        self.ctl.cancel.clone()
    }

    /// Hand the connection to `collaborator` and run until it finishes, the
    /// peer goes away, or the session is cancelled. Cancellation and graceful
    /// ends land in `Closed`.
    pub async fn relay<F, Fut>(mut self, collaborator: F) -> Result<(), SessionError>
    where
        F: FnOnce(AuthenticatedConnection) -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let span = self.ctl.span("relay");
        async move {
            self.ctl.step(SessionEvent::RelayStarted);
            let cancel = self.ctl.cancel.clone();
            let work = collaborator(self.conn.clone());
            let reason = tokio::select! {
                _ = cancel.cancelled() => {
                    self.shut().await;
                    self.ctl.step(SessionEvent::Closed);
                    return Ok(());
                }
                r = work => {
                    if let Err(e) = r {
                        tracing::warn!(error = %e, "relay ended with error");
                    }
                    match self.conn.connection().close_reason() {
                        Some(reason) => reason,
                        None => {
                            self.shut().await;
                            CloseReason::Local
                        }
                    }
                }
                reason = self.conn.closed() => reason,
            };
            self.finish(reason)
        }
        .instrument(span)
        .await
    }

    /// Graceful close without relaying.
    pub async fn close(mut self) -> SessionState {
        self.shut().await;
        self.ctl.step(SessionEvent::Closed)
    }

    async fn shut(&self) {
        let _ = tokio::time::timeout(CLOSE_GRACE, self.conn.close()).await;
    }

    fn finish(&mut self, reason: CloseReason) -> Result<(), SessionError> {
        tracing::info!(?reason, "connection closed");
        match reason {
            CloseReason::Local | CloseReason::PeerClosed => {
                self.ctl.step(SessionEvent::Closed);
                Ok(())
            }
            CloseReason::LinkLost => Err(self.ctl.fail(FailReason::Disconnected)),
            CloseReason::ProtocolViolation => Err(self.ctl.fail(FailReason::ProtocolViolation)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::net::TcpNetwork;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (Node, Node) {
        let directory: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        let a = Node::new(NodeIdentity::generate(), Arc::new(TcpNetwork))
            .with_directory(directory.clone());
        let b = Node::new(NodeIdentity::generate(), Arc::new(TcpNetwork)).with_directory(directory);
        (a, b)
    }

    fn loopback() -> Option<SocketAddr> {
        Some("127.0.0.1:0".parse().unwrap())
    }

    #[tokio::test]
    async fn word_code_join_reaches_ready_with_equal_keys() {
        let (server, client) = pair();
        let inbound = server.inbound(loopback()).await.unwrap();
        let code = WordCode::parse("7-tiger-lamp").unwrap();
        let serving = server
            .session(Service::X11)
            .serve_code(code, inbound)
            .await
            .unwrap();
        assert_eq!(serving.state(), SessionState::Discovering);
        let waiting = tokio::spawn(serving.wait_ready());

        let joined = client
            .session(Service::X11)
            .join("7-tiger-lamp")
            .await
            .unwrap();
        let served = waiting.await.unwrap().unwrap();
        assert_eq!(joined.state(), SessionState::Ready);
        assert_eq!(served.state(), SessionState::Ready);
        assert_eq!(joined.session_key(), served.session_key());
        assert_eq!(joined.peer(), server.id());
        assert_eq!(served.peer(), client.id());
        assert_eq!(joined.path(), PathKind::Direct);
    }

    #[tokio::test]
    async fn relay_carries_bytes_and_closes_both_sides() {
        let (server, client) = pair();
        let inbound = server.inbound(loopback()).await.unwrap();
        let serving = server.session(Service::Mirror).serve(inbound).await.unwrap();
        let code = serving.code().to_string();
        let waiting = tokio::spawn(serving.wait_ready());
        let joined = client.session(Service::Mirror).join(&code).await.unwrap();
        let served = waiting.await.unwrap().unwrap();

        let echo = tokio::spawn(served.relay(|conn| async move {
            let mut stream = conn
                .accept_stream()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await?;
            stream.write_all(&buf).await?;
            // Hold the stream until the joiner is done with it.
            let _ = stream.read(&mut buf).await;
            Ok(())
        }));
        let outcome = joined
            .relay(|conn| async move {
                let mut stream = conn.open_stream().await.map_err(io::Error::other)?;
                stream.write_all(b"hello").await?;
                let mut buf = [0u8; 5];
                stream.read_exact(&mut buf).await?;
                assert_eq!(&buf, b"hello");
                Ok(())
            })
            .await;
        assert_eq!(outcome, Ok(()));
        assert_eq!(echo.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn malformed_code_fails_before_any_lookup() {
        let (_, client) = pair();
        let session = client.session(Service::X11);
        let states = session.watch_state();
        assert_eq!(
            session.join("7-tiger").await.err(),
            Some(SessionError::Failed(FailReason::InvalidFormat))
        );
        assert_eq!(
            *states.borrow(),
            SessionState::Failed(FailReason::InvalidFormat)
        );
        let session = client.session(Service::X11);
        assert_eq!(
            session.join("7-tiger-xylophonez").await.err(),
            Some(SessionError::Failed(FailReason::UnknownWord))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn serving_with_no_way_in_fails_before_publishing() {
        let (server, _) = pair();
        let inbound = server.inbound(None).await.unwrap();
        assert!(inbound.hints().is_empty());
        let code = WordCode::parse("7-tiger-lamp").unwrap();
        let lookup = derive_lookup_key(&code);
        let session = server.session(Service::X11);
        let states = session.watch_state();
        assert_eq!(
            session.serve_code(code, inbound).await.err(),
            Some(SessionError::Failed(FailReason::RendezvousTimeout))
        );
        assert_eq!(
            *states.borrow(),
            SessionState::Failed(FailReason::RendezvousTimeout)
        );
        assert_eq!(
            server.directory().unwrap().lookup(&lookup).await.err(),
            Some(LookupError::NotFound)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_code_is_not_found() {
        let (_, client) = pair();
        let result = client.session(Service::X11).join("12-river-apple").await;
        assert_eq!(
            result.err(),
            Some(SessionError::Failed(FailReason::RendezvousNotFound))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_lookup_lands_in_closed() {
        let (_, client) = pair();
        let session = client.session(Service::X11);
        let cancel = session.canceller();
        let states = session.watch_state();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        assert_eq!(
            session.join("12-river-apple").await.err(),
            Some(SessionError::Cancelled)
        );
        assert_eq!(*states.borrow(), SessionState::Closed);
    }

    #[tokio::test]
    async fn direct_mode_dial_and_listen() {
        let (server, client) = pair();
        let inbound = server.inbound(loopback()).await.unwrap();
        let addr = inbound.listen_addr().unwrap();
        let listening = tokio::spawn(server.session(Service::X11).listen(inbound));
        let target = Target::new(server.id()).with_addr(addr);
        let dialed = client.session(Service::X11).dial(target).await.unwrap();
        let accepted = listening.await.unwrap().unwrap();
        assert!(dialed.session_key().is_none());
        assert_eq!(accepted.peer(), client.id());
        assert_eq!(dialed.close().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn dialing_the_wrong_node_id_fails_to_connect() {
        let (server, client) = pair();
        let inbound = server.inbound(loopback()).await.unwrap();
        let addr = inbound.listen_addr().unwrap();
        let _listening = tokio::spawn(server.session(Service::X11).listen(inbound));
        let target = Target::new(NodeIdentity::generate().id()).with_addr(addr);
        assert_eq!(
            client.session(Service::X11).dial(target).await.err(),
            Some(SessionError::Failed(FailReason::ConnectTimeout))
        );
    }

    #[tokio::test]
    async fn service_mismatch_is_unsupported() {
        let (server, client) = pair();
        let inbound = server.inbound(loopback()).await.unwrap();
        let addr = inbound.listen_addr().unwrap();
        let _listening = tokio::spawn(server.session(Service::X11).listen(inbound));
        let target = Target::new(server.id()).with_addr(addr);
        assert_eq!(
            client.session(Service::Mirror).dial(target).await.err(),
            Some(SessionError::Failed(FailReason::Unsupported))
        );
    }
}
