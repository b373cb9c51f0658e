use std::sync::Arc;

use x11q_core::{derive_lookup_key, FailReason, Service, SessionState, WordCode};
use x11q_harness::{cone, init_tracing, Scenario};
use x11q_linux::directory::LookupError;
use x11q_linux::{Directory, DirectoryClient, Node, ReadySession, SessionError, Target};

const CODE: &str = "7-tiger-lamp";

fn code(s: &str) -> WordCode {
    WordCode::parse(s).unwrap()
}

async fn serve(
    s: &Scenario,
) -> (
    Node,
    tokio::sync::watch::Receiver<SessionState>,
    tokio::task::JoinHandle<Result<ReadySession, SessionError>>,
) {
    let server = s.node("10.0.0.2", cone("198.51.100.20"));
    let inbound = server
        .inbound(Some("10.0.0.2:7100".parse().unwrap()))
        .await
        .unwrap();
    let serving = server
        .session(Service::X11)
        .serve_code(code(CODE), inbound)
        .await
        .unwrap();
    let states = serving.watch_state();
    (server, states, tokio::spawn(serving.wait_ready()))
}

fn directory(s: &Scenario) -> DirectoryClient {
    DirectoryClient::new(Arc::new(s.directory.clone()) as Arc<dyn Directory>)
}

/// Where the published record says the server can be reached.
async fn resolve(s: &Scenario) -> Target {
    let record = directory(s)
        .lookup(&derive_lookup_key(&code(CODE)))
        .await
        .unwrap();
    Target::new(record.node_id).with_hints(record.hints)
}

#[tokio::test(start_paused = true)]
async fn second_joiner_is_rejected_once_the_first_is_ready() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let (server, _, waiting) = serve(&s).await;
    let first = s.node("10.1.0.2", cone("198.51.100.30"));
    let second = s.node("10.2.0.2", cone("198.51.100.40"));
    // The second joiner resolved the code before the first one got in.
    let target = resolve(&s).await;

    let joined = first.session(Service::X11).join(CODE).await.unwrap();
    let served = waiting.await.unwrap().unwrap();
    assert_eq!(served.peer(), first.id());

    let late = second
        .session(Service::X11)
        .join_target(&code(CODE), target)
        .await;
    assert_eq!(late.err(), Some(SessionError::Failed(FailReason::Rejected)));

    // The pair is unaffected.
    assert_eq!(joined.state(), SessionState::Ready);
    assert_eq!(served.state(), SessionState::Ready);
    assert_eq!(served.peer(), first.id());
    assert_eq!(joined.peer(), server.id());
}

#[tokio::test(start_paused = true)]
async fn record_is_gone_once_paired() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let (_server, _, waiting) = serve(&s).await;
    let first = s.node("10.1.0.2", cone("198.51.100.30"));

    let _joined = first.session(Service::X11).join(CODE).await.unwrap();
    let _served = waiting.await.unwrap().unwrap();

    assert_eq!(
        directory(&s).lookup(&derive_lookup_key(&code(CODE))).await.err(),
        Some(LookupError::NotFound)
    );
    let late = s
        .node("10.2.0.2", cone("198.51.100.40"))
        .session(Service::X11)
        .join(CODE)
        .await;
    assert_eq!(
        late.err(),
        Some(SessionError::Failed(FailReason::RendezvousNotFound))
    );
}

#[tokio::test(start_paused = true)]
async fn wrong_code_fails_without_burning_the_session() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let (server, _, waiting) = serve(&s).await;
    let target = resolve(&s).await;

    let guesser = s.node("10.2.0.2", cone("198.51.100.40"));
    let guess = guesser
        .session(Service::X11)
        .join_target(&code("7-tiger-river"), target)
        .await;
    assert_eq!(guess.err(), Some(SessionError::Failed(FailReason::AuthFailed)));

    let first = s.node("10.1.0.2", cone("198.51.100.30"));
    let joined = first.session(Service::X11).join(CODE).await.unwrap();
    let served = waiting.await.unwrap().unwrap();
    assert_eq!(joined.peer(), server.id());
    assert_eq!(served.peer(), first.id());
    assert_eq!(joined.session_key(), served.session_key());
}

#[tokio::test(start_paused = true)]
async fn repeated_wrong_codes_burn_the_code() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let (_server, states, waiting) = serve(&s).await;
    let target = resolve(&s).await;

    for i in 0..3u8 {
        let public = format!("198.51.100.{}", 40 + i);
        let guesser = s.node(&format!("10.2.0.{}", i + 2), cone(&public));
        let guess = guesser
            .session(Service::X11)
            .join_target(&code("7-tiger-river"), target.clone())
            .await;
        assert_eq!(guess.err(), Some(SessionError::Failed(FailReason::AuthFailed)));
    }

    assert_eq!(
        waiting.await.unwrap().err(),
        Some(SessionError::Failed(FailReason::AuthFailed))
    );
    assert_eq!(
        *states.borrow(),
        SessionState::Failed(FailReason::AuthFailed)
    );
    assert_eq!(
        directory(&s).lookup(&derive_lookup_key(&code(CODE))).await.err(),
        Some(LookupError::NotFound)
    );
}

#[tokio::test(start_paused = true)]
async fn wrong_service_peers_leave_the_code_intact() {
    init_tracing();
    let s = Scenario::start().await.unwrap();
    let (server, states, waiting) = serve(&s).await;
    let target = resolve(&s).await;

    for i in 0..3u8 {
        let public = format!("198.51.100.{}", 40 + i);
        let peer = s.node(&format!("10.2.0.{}", i + 2), cone(&public));
        let result = peer
            .session(Service::Mirror)
            .join_target(&code(CODE), target.clone())
            .await;
        assert_eq!(
            result.err(),
            Some(SessionError::Failed(FailReason::Unsupported))
        );
    }
    assert!(!matches!(*states.borrow(), SessionState::Failed(_)));

    let first = s.node("10.1.0.2", cone("198.51.100.30"));
    let joined = first.session(Service::X11).join(CODE).await.unwrap();
    let served = waiting.await.unwrap().unwrap();
    assert_eq!(joined.peer(), server.id());
    assert_eq!(served.peer(), first.id());
}
