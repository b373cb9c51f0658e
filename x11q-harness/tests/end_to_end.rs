use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use x11q_core::{PathKind, Service, SessionState, WordCode};
use x11q_harness::{cone, init_tracing, symmetric, Nat, Scenario};
use x11q_linux::{Node, ReadySession, SessionError};

const SERVER_IP: &str = "10.0.0.2";
const SERVER_LISTEN: &str = "10.0.0.2:7100";

async fn serve(node: &Node, code: &str) -> JoinHandle<Result<ReadySession, SessionError>> {
    let inbound = node
        .inbound(Some(SERVER_LISTEN.parse().unwrap()))
        .await
        .unwrap();
    let serving = node
        .session(Service::X11)
        .serve_code(WordCode::parse(code).unwrap(), inbound)
        .await
        .unwrap();
    assert_eq!(serving.state(), SessionState::Discovering);
    tokio::spawn(serving.wait_ready())
}

#[tokio::test(start_paused = true)]
async fn seven_tiger_lamp_punches_through_cone_nats() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let server = s.node(SERVER_IP, cone("198.51.100.20"));
    let client = s.node("10.1.0.2", cone("198.51.100.30"));
    let waiting = serve(&server, "7-tiger-lamp").await;

    let started = Instant::now();
    let joined = client
        .session(Service::X11)
        .join("7-tiger-lamp")
        .await
        .unwrap();
    let served = waiting.await.unwrap().unwrap();

    assert_eq!(joined.state(), SessionState::Ready);
    assert_eq!(served.state(), SessionState::Ready);
    assert!(joined.session_key().is_some());
    assert_eq!(joined.session_key(), served.session_key());
    assert_eq!(joined.peer(), server.id());
    assert_eq!(served.peer(), client.id());
    // The published private address never answers; the punch does.
    assert_eq!(joined.path(), PathKind::HolePunch);
    assert_eq!(served.path(), PathKind::HolePunch);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(11), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn symmetric_nat_falls_back_to_relay() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let server = s.node(SERVER_IP, cone("198.51.100.20"));
    let client = s.node("10.1.0.2", symmetric("198.51.100.30"));
    let waiting = serve(&server, "7-tiger-lamp").await;

    let started = Instant::now();
    let joined = client
        .session(Service::X11)
        .join("7-tiger-lamp")
        .await
        .unwrap();
    let served = waiting.await.unwrap().unwrap();

    assert_eq!(joined.path(), PathKind::Relay);
    assert_eq!(served.path(), PathKind::Relay);
    assert_eq!(joined.session_key(), served.session_key());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(11), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(21), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn open_server_is_dialled_directly_and_carries_bytes() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let server = s.node("203.0.113.10", Nat::Open);
    let client = s.node("10.1.0.2", cone("198.51.100.30"));
    let inbound = server
        .inbound(Some("203.0.113.10:7100".parse().unwrap()))
        .await
        .unwrap();
    let serving = server.session(Service::Mirror).serve(inbound).await.unwrap();
    let code = serving.code().to_string();
    let waiting = tokio::spawn(serving.wait_ready());

    let joined = client.session(Service::Mirror).join(&code).await.unwrap();
    let served = waiting.await.unwrap().unwrap();
    assert_eq!(joined.path(), PathKind::Direct);

    let sharing = tokio::spawn(served.relay(|conn| async move {
        let mut stream = conn
            .accept_stream()
            .await
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
        stream.write_all(b"frame").await?;
        // Hold the stream until the viewer is done with it.
        let mut buf = [0u8; 1];
        let _ = stream.read(&mut buf).await;
        Ok(())
    }));
    let viewed = joined
        .relay(|conn| async move {
            let mut stream = conn.open_stream().await.map_err(io::Error::other)?;
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await?;
            assert_eq!(&buf, b"frame");
            Ok(())
        })
        .await;
    assert_eq!(viewed, Ok(()));
    assert_eq!(sharing.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn cancelling_the_server_withdraws_its_record() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let server = s.node(SERVER_IP, cone("198.51.100.20"));
    let client = s.node("10.1.0.2", cone("198.51.100.30"));
    let inbound = server
        .inbound(Some(SERVER_LISTEN.parse().unwrap()))
        .await
        .unwrap();
    let serving = server
        .session(Service::X11)
        .serve_code(WordCode::parse("7-tiger-lamp").unwrap(), inbound)
        .await
        .unwrap();
    let cancel = serving.canceller();
    let states = serving.watch_state();
    let waiting = tokio::spawn(serving.wait_ready());

    tokio::time::sleep(Duration::from_secs(1)).await;
    cancel.cancel();
    assert_eq!(waiting.await.unwrap().err(), Some(SessionError::Cancelled));
    assert_eq!(*states.borrow(), SessionState::Closed);

    let result = client.session(Service::X11).join("7-tiger-lamp").await;
    assert_eq!(
        result.err().and_then(|e| e.fail_reason()),
        Some(x11q_core::FailReason::RendezvousNotFound)
    );
}
