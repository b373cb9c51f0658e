//! Runs the secure-channel handshake over a raw link and hands the link to a
//! [`Connection`].

use x11q_core::handshake::{self, Finish, Hello};
use x11q_core::protocol::{HelloReply, Opening, RejectReason};
use x11q_core::{AuthMode, HandshakeError, NodeId, NodeIdentity, PathKind, Service};

use crate::connection::Connection;
use crate::framed::{read_frame, write_frame};
use crate::net::{BoxedLink, LinkError};

#[derive(Debug, thiserror::Error)]
pub enum SecureError {
    #[error("link: {0}")]
    Link(#[from] LinkError),
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("service or mode mismatch: {0:?}")]
    Mismatch(RejectReason),
}

/// What this end offers or expects on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    pub service: Service,
    pub auth: AuthMode,
}

/// Dialer side: send `Hello`, check the listener's proof, finish.
pub async fn dial(
    mut link: BoxedLink,
    identity: &NodeIdentity,
    offer: Offer,
    expected: Option<NodeId>,
    path: PathKind,
) -> Result<Connection, SecureError> {
    let hs = handshake::dial(identity, offer.service, offer.auth, expected);
    write_frame(&mut link, &Opening::Hello(hs.hello().clone())).await?;
    let ack = match read_frame::<_, HelloReply>(&mut link).await? {
        HelloReply::Ack(ack) => ack,
        HelloReply::Reject(reason) => return Err(SecureError::Mismatch(reason)),
    };
    let (finish, keys) = hs.complete(identity, &ack)?;
    write_frame(&mut link, &finish).await?;
    tracing::debug!(peer = %keys.peer().short(), %path, "secure channel up");
    Ok(Connection::spawn(link, keys, path))
}

/// First frame of an inbound link.
pub async fn read_opening(link: &mut BoxedLink) -> Result<Opening, LinkError> {
    read_frame(link).await
}

/// Listener side, after [`read_opening`] returned `Hello`.
pub async fn accept(
    mut link: BoxedLink,
    hello: Hello,
    identity: &NodeIdentity,
    offer: Offer,
    path: PathKind,
) -> Result<Connection, SecureError> {
    let refusal = if hello.service != offer.service {
        Some(RejectReason::Service)
    } else if hello.auth != offer.auth {
        Some(RejectReason::AuthMode)
    } else {
        None
    };
    if let Some(reason) = refusal {
        write_frame(&mut link, &HelloReply::Reject(reason)).await?;
        return Err(SecureError::Mismatch(reason));
    }
    let (pending, ack) = match handshake::accept(identity, &hello) {
        Ok(ok) => ok,
        Err(HandshakeError::Version(v)) => {
            write_frame(&mut link, &HelloReply::Reject(RejectReason::Version)).await?;
            return Err(HandshakeError::Version(v).into());
        }
        Err(e) => return Err(e.into()),
    };
    write_frame(&mut link, &HelloReply::Ack(ack)).await?;
    let finish: Finish = read_frame(&mut link).await?;
    let keys = pending.complete(&finish)?;
    tracing::debug!(peer = %keys.peer().short(), %path, "secure channel up");
    Ok(Connection::spawn(link, keys, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    const X11_PAKE: Offer = Offer {
        service: Service::X11,
        auth: AuthMode::Pake,
    };

    async fn run(
        dial_offer: Offer,
        accept_offer: Offer,
        expected: impl FnOnce(NodeId) -> Option<NodeId>,
    ) -> (Result<Connection, SecureError>, Result<Connection, SecureError>) {
        let dialer = NodeIdentity::generate();
        let listener = NodeIdentity::generate();
        let expected = expected(listener.id());
        let (a, b) = tokio::io::duplex(64 * 1024);
        let accept_side = tokio::spawn(async move {
            let mut link: BoxedLink = Box::new(b);
            let Opening::Hello(hello) = read_opening(&mut link).await.unwrap() else {
                panic!("expected hello");
            };
            accept(link, hello, &listener, accept_offer, PathKind::Direct).await
        });
        let dialed = dial(Box::new(a), &dialer, dial_offer, expected, PathKind::Direct).await;
        (dialed, accept_side.await.unwrap())
    }

    #[tokio::test]
    async fn handshake_yields_matching_connections() {
        let (d, l) = run(X11_PAKE, X11_PAKE, Some).await;
        let (d, l) = (d.unwrap(), l.unwrap());
        assert_eq!(d.binding(), l.binding());
        assert_eq!(d.connection_id(), l.connection_id());
        assert_ne!(d.peer(), l.peer());
        assert_ne!(d.role(), l.role());
    }

    #[tokio::test]
    async fn service_mismatch_is_refused_on_both_ends() {
        let mirror = Offer {
            service: Service::Mirror,
            auth: AuthMode::Pake,
        };
        let (d, l) = run(mirror, X11_PAKE, Some).await;
        assert!(matches!(d, Err(SecureError::Mismatch(RejectReason::Service))));
        assert!(matches!(l, Err(SecureError::Mismatch(RejectReason::Service))));
    }

    #[tokio::test]
    async fn auth_mode_mismatch_is_refused() {
        let direct = Offer {
            service: Service::X11,
            auth: AuthMode::Identity,
        };
        let (d, _) = run(direct, X11_PAKE, Some).await;
        assert!(matches!(d, Err(SecureError::Mismatch(RejectReason::AuthMode))));
    }

    #[tokio::test]
    async fn unexpected_listener_fails_dial() {
        let stranger = NodeIdentity::generate().id();
        let (d, l) = run(X11_PAKE, X11_PAKE, move |_| Some(stranger)).await;
        assert!(matches!(
            d,
            Err(SecureError::Handshake(HandshakeError::WrongPeer))
        ));
        assert!(l.is_err());
    }
}
