mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use maple_common::Error;
use maple_media::{MediaKind, MediaStream, PlaybackSurface};
use maple_session::{
    ConnectionState, IceCandidate, NegotiatedSession, PeerEvent, RetryConfig, SessionConfig,
    SessionStatus, WsConnector,
};
use serde_json::json;

struct Harness {
    log: Log,
    signaling: Arc<MemoryConnector>,
    peers: Arc<FakePeerConnector>,
    surface: Arc<RecordingSurface>,
    session: NegotiatedSession,
}

fn start_with(config: SessionConfig) -> Harness {
    let log = new_log();
    let signaling = MemoryConnector::new(log.clone());
    let peers = FakePeerConnector::new(log.clone());
    let surface = RecordingSurface::new(log.clone());
    let session = NegotiatedSession::start(
        config,
        signaling.clone(),
        peers.clone(),
        surface.clone(),
    )
    .unwrap();
    Harness {
        log,
        signaling,
        peers,
        surface,
        session,
    }
}

fn start() -> Harness {
    start_with(SessionConfig::default())
}

fn track(id: &str) -> PeerEvent {
    let (_tx, stream) = MediaStream::channel(id, MediaKind::Video, 4);
    PeerEvent::Track(stream)
}

#[tokio::test]
async fn test_peer_is_created_only_after_channel_opens() {
    let h = start();
    settle().await;

    assert_eq!(
        entries(&h.log),
        vec!["signaling:open".to_string(), "peer:create".to_string()]
    );
    assert_eq!(h.session.status(), SessionStatus::Negotiating);
}

#[tokio::test]
async fn test_offer_is_answered_exactly_once() {
    let h = start();
    settle().await;

    h.signaling.send(r#"{"msg":"offer","sdp":"S1"}"#);
    settle().await;

    assert_eq!(h.signaling.take_sent(), vec![json!({"msg": "answer", "sdp": "A1"})]);
    assert_eq!(h.peers.latest().calls(), vec!["remote:S1", "local:A1"]);
    settle().await;
    assert!(h.signaling.take_sent().is_empty());
}

#[tokio::test]
async fn test_unknown_messages_cause_no_traffic() {
    let h = start();
    settle().await;

    h.signaling.send(r#"{"msg":"answer","sdp":"loopback"}"#);
    h.signaling.send(r#"{"msg":"renegotiate"}"#);
    h.signaling.send(r#"{"hello":"world"}"#);
    settle().await;

    assert!(h.signaling.take_sent().is_empty());
    assert!(h.peers.latest().calls().is_empty());
    assert_eq!(h.signaling.opens(), 1);
    assert_eq!(h.session.status(), SessionStatus::Negotiating);
}

#[tokio::test]
async fn test_failed_negotiation_does_not_reconnect() {
    let h = start();
    settle().await;

    h.signaling.send(r#"{"msg":"offer","sdp":"bad offer"}"#);
    settle().await;

    assert!(h.signaling.take_sent().is_empty());
    assert_eq!(h.signaling.opens(), 1);
    assert_eq!(h.peers.created(), 1);
}

#[tokio::test]
async fn test_local_candidates_are_forwarded_but_end_marker_is_not() {
    let h = start();
    settle().await;

    let peer = h.peers.latest();
    peer.events.emit(PeerEvent::LocalCandidate(Some(IceCandidate::new(
        "candidate:1 1 udp 1 10.0.0.2 5000 typ host",
        Some(0),
    ))));
    peer.events.emit(PeerEvent::LocalCandidate(None));
    settle().await;

    assert_eq!(
        h.signaling.take_sent(),
        vec![json!({
            "msg": "candidate",
            "candidate": {
                "candidate": "candidate:1 1 udp 1 10.0.0.2 5000 typ host",
                "sdpMLineIndex": 0
            }
        })]
    );
}

#[tokio::test]
async fn test_candidates_before_offer_are_added_after_remote_description() {
    let h = start();
    settle().await;

    h.signaling.send(
        r#"{"msg":"candidate","candidate":{"candidate":"c-early","sdpMLineIndex":0}}"#,
    );
    settle().await;
    assert!(h.peers.latest().calls().is_empty());

    h.signaling.send(r#"{"msg":"offer","sdp":"S1"}"#);
    settle().await;

    let calls = h.peers.latest().calls();
    let remote = calls.iter().position(|c| c == "remote:S1").unwrap();
    let candidate = calls.iter().position(|c| c == "candidate:c-early").unwrap();
    assert!(remote < candidate, "{calls:?}");
}

#[tokio::test]
async fn test_track_is_bound_and_replaced() {
    let h = start();
    settle().await;

    let peer = h.peers.latest();
    peer.events.emit(track("video-1"));
    peer.events.emit(track("video-2"));
    settle().await;

    assert_eq!(h.surface.attached().as_deref(), Some("video-2"));
}

#[tokio::test]
async fn test_connected_status_follows_peer_state() {
    let h = start();
    settle().await;

    h.peers
        .latest()
        .events
        .emit(PeerEvent::StateChanged(ConnectionState::Connected));
    settle().await;
    assert_eq!(h.session.status(), SessionStatus::Connected);

    h.peers
        .latest()
        .events
        .emit(PeerEvent::StateChanged(ConnectionState::Closed));
    settle().await;
    assert_eq!(h.session.status(), SessionStatus::Connected);
    assert_eq!(h.signaling.opens(), 1);
}

#[tokio::test]
async fn test_peer_disconnect_clears_surface_before_reconnecting() {
    let h = start();
    settle().await;
    h.signaling.send(r#"{"msg":"offer","sdp":"S1"}"#);
    let first = h.peers.latest();
    first.events.emit(track("video-1"));
    first
        .events
        .emit(PeerEvent::StateChanged(ConnectionState::Connected));
    settle().await;
    assert_eq!(h.session.status(), SessionStatus::Connected);
    h.signaling.take_sent();

    first
        .events
        .emit(PeerEvent::StateChanged(ConnectionState::Disconnected));
    settle().await;

    assert_eq!(h.surface.attached(), None);
    assert_eq!(h.signaling.opens(), 2);
    let log = entries(&h.log);
    let detach = position(&h.log, "surface:detach").unwrap();
    let reopen = log
        .iter()
        .enumerate()
        .filter(|(_, e)| *e == "signaling:open")
        .nth(1)
        .map(|(i, _)| i)
        .unwrap();
    assert!(detach < reopen, "{log:?}");
    assert!(first.is_closed());
    assert_eq!(h.signaling.live_links(), 1);

    // No answer or candidate traffic until the server offers again.
    settle().await;
    assert!(h.signaling.take_sent().is_empty());
    assert_eq!(h.session.status(), SessionStatus::Negotiating);

    h.signaling.send(r#"{"msg":"offer","sdp":"S2"}"#);
    settle().await;
    assert_eq!(h.signaling.take_sent(), vec![json!({"msg": "answer", "sdp": "A1"})]);
}

#[tokio::test]
async fn test_failed_peer_state_also_recovers() {
    let h = start();
    settle().await;

    h.peers
        .latest()
        .events
        .emit(PeerEvent::StateChanged(ConnectionState::Failed));
    settle().await;

    assert_eq!(h.signaling.opens(), 2);
    assert_eq!(h.peers.created(), 2);
    assert_eq!(count(&h.log, "surface:detach"), 1);
}

#[tokio::test]
async fn test_events_from_replaced_peer_are_ignored() {
    let h = start();
    settle().await;
    let stale = h.peers.latest();
    stale
        .events
        .emit(PeerEvent::StateChanged(ConnectionState::Failed));
    settle().await;
    assert_eq!(h.peers.created(), 2);

    stale.events.emit(track("late-track"));
    stale
        .events
        .emit(PeerEvent::LocalCandidate(Some(IceCandidate::new("late", Some(0)))));
    stale
        .events
        .emit(PeerEvent::StateChanged(ConnectionState::Disconnected));
    settle().await;

    assert_eq!(h.surface.attached(), None);
    assert!(h.signaling.take_sent().is_empty());
    assert_eq!(h.signaling.opens(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_signaling_failure_retries_after_fixed_delay() {
    let h = start();
    h.signaling.fail_next(1);
    settle().await;

    assert_eq!(h.signaling.opens(), 1);
    assert_eq!(h.session.status(), SessionStatus::WillRetry);
    assert_eq!(h.peers.created(), 0);

    advance_ms(999).await;
    assert_eq!(h.signaling.opens(), 1);

    advance_ms(1).await;
    assert_eq!(h.signaling.opens(), 2);
    assert_eq!(h.session.status(), SessionStatus::Negotiating);
    assert_eq!(h.peers.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_broken_link_reconnects_forever_by_default() {
    let h = start();
    settle().await;

    for expected in 2..=5 {
        h.signaling.break_link();
        settle().await;
        assert_eq!(h.session.status(), SessionStatus::WillRetry);
        advance_ms(1000).await;
        assert_eq!(h.signaling.opens(), expected);
        assert_eq!(h.signaling.live_links(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_capped_policy_gives_up() {
    let h = start_with(SessionConfig {
        retry: RetryConfig {
            max_attempts: Some(2),
            ..RetryConfig::default()
        },
        ..SessionConfig::default()
    });
    h.signaling.fail_next(10);
    settle().await;

    advance_ms(1000).await;
    advance_ms(1000).await;
    assert_eq!(h.signaling.opens(), 3);
    assert_eq!(h.session.status(), SessionStatus::Idle);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.signaling.opens(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_tears_everything_down() {
    let h = start();
    settle().await;
    let peer = h.peers.latest();
    peer.events.emit(track("video-1"));
    settle().await;
    assert!(h.surface.attached().is_some());

    let Harness {
        signaling,
        surface,
        session,
        ..
    } = h;
    let mut status = session.subscribe_status();
    session.disconnect().await.unwrap();
    settle().await;

    assert_eq!(surface.attached(), None);
    assert!(peer.is_closed());
    assert_eq!(signaling.live_links(), 0);
    assert_eq!(*status.borrow_and_update(), SessionStatus::Idle);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(signaling.opens(), 1);
}

#[tokio::test]
async fn test_unusable_signaling_url_fails_start() {
    let log = new_log();
    let result = NegotiatedSession::start(
        SessionConfig {
            signaling_url: "http://127.0.0.1:8080/ws".into(),
            ..SessionConfig::default()
        },
        Arc::new(WsConnector),
        FakePeerConnector::new(log.clone()),
        RecordingSurface::new(log.clone()),
    );
    settle().await;

    assert!(matches!(result, Err(Error::Config(_))));
    assert!(entries(&log).is_empty());
}
