//! Authentication over the control stream of a fresh [`Connection`]: the
//! word-code PAKE exchange, and the accept/busy answer of direct mode.
//!
//! Word-code exchange, server speaks first:
//! server `Pake`, joiner `Pake` + `Confirm`, server `Confirm` or `Abort`.
//! A serving side that is already paired answers `Busy` instead.

use std::time::Duration;

use x11q_core::protocol::{AbortReason, ControlMessage};
use x11q_core::{CodePassword, FailReason, PakeRole, PakeSession, SessionKey};

use crate::connection::{AuthenticatedConnection, CloseReason, Connection, ConnectionError};

const CLOSE_GRACE: Duration = Duration::from_secs(1);

fn closed(err: ConnectionError) -> FailReason {
    match err {
        ConnectionError::Closed(CloseReason::Local) => FailReason::Disconnected,
        ConnectionError::Closed(_) => FailReason::ProtocolViolation,
    }
}

fn aborted(reason: AbortReason) -> FailReason {
    match reason {
        AbortReason::AuthFailed => FailReason::AuthFailed,
        AbortReason::ProtocolViolation => FailReason::ProtocolViolation,
        AbortReason::Unsupported => FailReason::Unsupported,
    }
}

/// A peer that gives up before the serving side has checked its
/// confirmation has not guessed anything.
fn aborted_unconfirmed(reason: AbortReason) -> FailReason {
    match aborted(reason) {
        FailReason::AuthFailed => FailReason::ProtocolViolation,
        other => other,
    }
}

/// What to tell the peer before dropping it over `reason`.
fn abort_for(reason: FailReason) -> Option<AbortReason> {
    match reason {
        FailReason::AuthFailed => Some(AbortReason::AuthFailed),
        FailReason::ProtocolViolation => Some(AbortReason::ProtocolViolation),
        FailReason::Unsupported => Some(AbortReason::Unsupported),
        _ => None,
    }
}

/// Tell the peer why, then close. Control frames go out before `GoAway`.
pub(crate) async fn reject(conn: &Connection, msg: ControlMessage) {
    let _ = conn.send_control(msg).await;
    let _ = tokio::time::timeout(CLOSE_GRACE, conn.close()).await;
}

async fn give_up(conn: &Connection, reason: FailReason) -> FailReason {
    match abort_for(reason) {
        Some(abort) => reject(conn, ControlMessage::Abort(abort)).await,
        None => {
            let _ = tokio::time::timeout(CLOSE_GRACE, conn.close()).await;
        }
    }
    reason
}

/// Joining side of the word-code exchange.
pub async fn join(
    conn: Connection,
    password: &CodePassword,
) -> Result<(AuthenticatedConnection, SessionKey), FailReason> {
    let mut pake = PakeSession::start(PakeRole::Joiner, password, conn.binding());
    let server_msg = match conn.recv_control().await.map_err(closed)? {
        ControlMessage::Pake(msg) => msg,
        ControlMessage::Busy => return Err(FailReason::Rejected),
        ControlMessage::Abort(reason) => return Err(aborted(reason)),
        _ => return Err(give_up(&conn, FailReason::ProtocolViolation).await),
    };
    let tag = match pake.receive(&server_msg) {
        Ok(tag) => tag,
        Err(_) => return Err(give_up(&conn, FailReason::ProtocolViolation).await),
    };
    conn.send_control(ControlMessage::Pake(pake.message().to_vec()))
        .await
        .map_err(closed)?;
    conn.send_control(ControlMessage::Confirm(tag))
        .await
        .map_err(closed)?;

    let server_tag = match conn.recv_control().await.map_err(closed)? {
        ControlMessage::Confirm(tag) => tag,
        ControlMessage::Abort(reason) => return Err(aborted(reason)),
        ControlMessage::Busy => return Err(FailReason::Rejected),
        _ => return Err(give_up(&conn, FailReason::ProtocolViolation).await),
    };
    match pake.verify(&server_tag) {
        Ok(key) => Ok((AuthenticatedConnection::new(conn), key)),
        Err(_) => Err(give_up(&conn, FailReason::AuthFailed).await),
    }
}

/// Serving side of the word-code exchange. On success the connection is
/// marked authenticated before the final `Confirm` leaves. `AuthFailed`
/// means the peer's confirmation did not match, nothing else.
pub async fn serve(
    conn: Connection,
    password: &CodePassword,
) -> Result<(AuthenticatedConnection, SessionKey), FailReason> {
    let mut pake = PakeSession::start(PakeRole::Server, password, conn.binding());
    conn.send_control(ControlMessage::Pake(pake.message().to_vec()))
        .await
        .map_err(closed)?;
    let joiner_msg = match conn.recv_control().await.map_err(closed)? {
        ControlMessage::Pake(msg) => msg,
        ControlMessage::Abort(reason) => return Err(aborted_unconfirmed(reason)),
        _ => return Err(give_up(&conn, FailReason::ProtocolViolation).await),
    };
    let own_tag = match pake.receive(&joiner_msg) {
        Ok(tag) => tag,
        Err(_) => return Err(give_up(&conn, FailReason::ProtocolViolation).await),
    };
    let joiner_tag = match conn.recv_control().await.map_err(closed)? {
        ControlMessage::Confirm(tag) => tag,
        ControlMessage::Abort(reason) => return Err(aborted_unconfirmed(reason)),
        _ => return Err(give_up(&conn, FailReason::ProtocolViolation).await),
    };
    match pake.verify(&joiner_tag) {
        Ok(key) => {
            let authed = AuthenticatedConnection::new(conn.clone());
            conn.send_control(ControlMessage::Confirm(own_tag))
                .await
                .map_err(closed)?;
            Ok((authed, key))
        }
        Err(_) => Err(give_up(&conn, FailReason::AuthFailed).await),
    }
}

/// Direct-mode dialer: wait for the listener to take us.
pub async fn await_proceed(conn: Connection) -> Result<AuthenticatedConnection, FailReason> {
    match conn.recv_control().await.map_err(closed)? {
        ControlMessage::Proceed => Ok(AuthenticatedConnection::new(conn)),
        ControlMessage::Busy => Err(FailReason::Rejected),
        ControlMessage::Abort(reason) => Err(aborted(reason)),
        _ => Err(give_up(&conn, FailReason::ProtocolViolation).await),
    }
}

/// Direct-mode listener: the transport credential is the trust anchor.
pub async fn proceed(conn: Connection) -> Result<AuthenticatedConnection, FailReason> {
    let authed = AuthenticatedConnection::new(conn.clone());
    conn.send_control(ControlMessage::Proceed)
        .await
        .map_err(closed)?;
    Ok(authed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::connected_pair;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use x11q_core::{derive_password, WordCode};

    fn password(code: &str) -> CodePassword {
        derive_password(&WordCode::parse(code).unwrap())
    }

    #[tokio::test]
    async fn matching_codes_agree_on_key_and_open_streams() {
        let (dialer, listener) = connected_pair();
        let pw = password("7-tiger-lamp");
        let pw2 = pw.clone();
        let server = tokio::spawn(async move { serve(listener, &pw2).await });
        let (joined, joiner_key) = join(dialer, &pw).await.unwrap();
        let (served, server_key) = server.await.unwrap().unwrap();
        assert_eq!(joiner_key, server_key);

        let mut out = joined.open_stream().await.unwrap();
        out.write_all(b"x").await.unwrap();
        let mut inbound = served.accept_stream().await.unwrap();
        let mut buf = [0u8; 1];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
    }

    #[tokio::test]
    async fn wrong_code_fails_on_both_sides() {
        let (dialer, listener) = connected_pair();
        let server = tokio::spawn(async move { serve(listener, &password("7-tiger-lamp")).await });
        let joined = join(dialer, &password("7-tiger-river")).await;
        assert!(matches!(joined, Err(FailReason::AuthFailed)));
        assert!(matches!(server.await.unwrap(), Err(FailReason::AuthFailed)));
    }

    #[tokio::test]
    async fn abort_before_confirmation_is_not_a_wrong_code() {
        let (dialer, listener) = connected_pair();
        let server = tokio::spawn(async move { serve(listener, &password("7-tiger-lamp")).await });
        assert!(matches!(
            dialer.recv_control().await.unwrap(),
            ControlMessage::Pake(_)
        ));
        dialer
            .send_control(ControlMessage::Abort(AbortReason::AuthFailed))
            .await
            .unwrap();
        assert!(matches!(
            server.await.unwrap(),
            Err(FailReason::ProtocolViolation)
        ));
    }

    #[tokio::test]
    async fn busy_server_rejects_joiner() {
        let (dialer, listener) = connected_pair();
        tokio::spawn(async move { reject(&listener, ControlMessage::Busy).await });
        assert!(matches!(
            join(dialer, &password("7-tiger-lamp")).await,
            Err(FailReason::Rejected)
        ));
    }

    #[tokio::test]
    async fn direct_mode_proceeds() {
        let (dialer, listener) = connected_pair();
        let accepted = tokio::spawn(async move { proceed(listener).await });
        let dialed = await_proceed(dialer).await.unwrap();
        let accepted = accepted.await.unwrap().unwrap();
        assert_ne!(dialed.peer(), accepted.peer());

        let mut out = dialed.open_stream().await.unwrap();
        out.write_all(b"ok").await.unwrap();
        let mut inbound = accepted.accept_stream().await.unwrap();
        let mut buf = [0u8; 2];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }
}
