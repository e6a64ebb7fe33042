//! Gateway session tests over the in-memory transport

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use reachy_bridge::Error;
use reachy_bridge::gateway::{ConnectionState, InboundMessage, SessionEvent, ToolRequest};

mod common;

use common::{connect, deliver, next_frame, next_peer};

async fn next_event(session: &mut reachy_bridge::gateway::GatewaySession) -> SessionEvent {
    tokio::time::timeout(Duration::from_secs(5), session.receive())
        .await
        .expect("timed out waiting for an event")
        .unwrap()
}

#[tokio::test]
async fn connect_retries_until_connected() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) = connect(vec![false, false, true], 5, &cancel).await;
    let session = session.unwrap();

    assert_eq!(session.state(), ConnectionState::Connected);
    next_peer(&mut peers).await;
}

#[tokio::test]
async fn connect_gives_up_above_the_cap() {
    let cancel = CancellationToken::new();
    let (session, _connector, _peers) = connect(vec![false; 10], 3, &cancel).await;

    let err = session.err().unwrap();
    assert!(matches!(err, Error::Connect(_)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn send_and_reply_share_an_id() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) = connect(vec![], 3, &cancel).await;
    let mut session = session.unwrap();
    let mut peer = next_peer(&mut peers).await;

    let id = session.send("hello robot").await.unwrap();
    let frame = next_frame(&mut peer).await;
    assert_eq!(frame["type"], "message.send");
    assert_eq!(frame["id"], id.to_string());
    assert_eq!(frame["payload"], "hello robot");

    deliver(
        &peer,
        &json!({ "type": "message.reply", "id": id.to_string(), "payload": "hi!" }),
    );
    assert_eq!(
        next_event(&mut session).await,
        SessionEvent::Message(InboundMessage::Reply {
            id: Some(id.to_string()),
            text: "hi!".into()
        })
    );

    session.shutdown().await;
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn unknown_frames_are_skipped() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) = connect(vec![], 3, &cancel).await;
    let mut session = session.unwrap();
    let peer = next_peer(&mut peers).await;

    peer.to_client.send("not json".into()).unwrap();
    deliver(&peer, &json!({ "type": "presence.update", "payload": {} }));
    deliver(&peer, &json!({ "type": "message.send", "payload": "echo" }));
    deliver(&peer, &json!({ "type": "message.reply", "payload": { "text": "still here" } }));

    assert_eq!(
        next_event(&mut session).await,
        SessionEvent::Message(InboundMessage::Reply {
            id: None,
            text: "still here".into()
        })
    );
}

#[tokio::test]
async fn tool_request_is_answered_exactly_once() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) = connect(vec![], 3, &cancel).await;
    let mut session = session.unwrap();
    let mut peer = next_peer(&mut peers).await;

    deliver(
        &peer,
        &json!({
            "type": "tool.request",
            "id": "42",
            "payload": { "name": "get-status", "arguments": {} }
        }),
    );
    let SessionEvent::Message(InboundMessage::ToolRequest(ToolRequest { id, name, .. })) =
        next_event(&mut session).await
    else {
        panic!("expected a tool request");
    };
    assert_eq!(id, "42");
    assert_eq!(name, "get-status");
    assert_eq!(session.pending_requests(), 1);

    session.respond("42", Ok(json!({ "ok": true }))).await.unwrap();
    let frame = next_frame(&mut peer).await;
    assert_eq!(frame["type"], "tool.response");
    assert_eq!(frame["id"], "42");
    assert_eq!(frame["payload"]["result"]["ok"], true);

    // A second answer is a desync and writes nothing
    let err = session.respond("42", Ok(json!(null))).await.unwrap_err();
    assert!(matches!(err, Error::ProtocolDesync(_)));
    assert!(peer.from_client.try_recv().is_err());
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn gateway_errors_are_decoded() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) = connect(vec![], 3, &cancel).await;
    let mut session = session.unwrap();
    let peer = next_peer(&mut peers).await;

    deliver(
        &peer,
        &json!({ "type": "error", "id": "x", "payload": { "code": 429, "description": "slow down" } }),
    );
    assert_eq!(
        next_event(&mut session).await,
        SessionEvent::Message(InboundMessage::Error {
            id: Some("x".into()),
            code: "429".into(),
            message: "slow down".into()
        })
    );
}

#[tokio::test]
async fn dropped_connection_reconnects() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) = connect(vec![true, false, true], 5, &cancel).await;
    let mut session = session.unwrap();
    let mut states = session.watch_state();

    let first = next_peer(&mut peers).await;
    drop(first);

    assert_eq!(next_event(&mut session).await, SessionEvent::Interrupted);
    assert_eq!(next_event(&mut session).await, SessionEvent::Resumed);
    states
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();

    let mut second = next_peer(&mut peers).await;
    session.send("after reconnect").await.unwrap();
    let frame = next_frame(&mut second).await;
    assert_eq!(frame["payload"], "after reconnect");
}

#[tokio::test]
async fn interruption_forgets_unanswered_requests() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) = connect(vec![], 5, &cancel).await;
    let mut session = session.unwrap();

    let first = next_peer(&mut peers).await;
    deliver(
        &first,
        &json!({ "type": "tool.request", "id": "7", "payload": { "name": "dance" } }),
    );
    next_event(&mut session).await;
    assert_eq!(session.pending_requests(), 1);

    drop(first);
    assert_eq!(next_event(&mut session).await, SessionEvent::Interrupted);
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn exhausted_reconnect_closes_the_session() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) =
        connect(vec![true, false, false, false, false], 3, &cancel).await;
    let mut session = session.unwrap();

    drop(next_peer(&mut peers).await);
    assert_eq!(next_event(&mut session).await, SessionEvent::Interrupted);

    let closed = tokio::time::timeout(Duration::from_secs(5), session.receive())
        .await
        .unwrap();
    assert!(matches!(closed, Err(Error::Connect(_))));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(matches!(session.send("late").await, Err(Error::Send(_))));
}

#[tokio::test]
async fn cancelled_connect_stops_retrying() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let (session, _connector, _peers) = connect(vec![false; 100], 100, &cancel).await;
    assert!(matches!(session.err().unwrap(), Error::Connect(_)));
}

#[tokio::test]
async fn nameless_tool_request_is_surfaced() {
    let cancel = CancellationToken::new();
    let (session, _connector, mut peers) = connect(vec![], 3, &cancel).await;
    let mut session = session.unwrap();
    let mut peer = next_peer(&mut peers).await;

    deliver(
        &peer,
        &json!({ "type": "tool.request", "id": "99", "payload": { "tool": "dance" } }),
    );
    deliver(&peer, &json!({ "type": "message.reply", "payload": "later" }));

    let SessionEvent::Message(InboundMessage::ToolRequest(request)) =
        next_event(&mut session).await
    else {
        panic!("expected the tool request first");
    };
    assert_eq!(request.id, "99");
    assert!(request.name.is_empty());
    assert_eq!(session.pending_requests(), 1);

    session
        .respond("99", Err("unsupported action: (unnamed)".into()))
        .await
        .unwrap();
    let frame = next_frame(&mut peer).await;
    assert_eq!(frame["type"], "tool.response");
    assert_eq!(frame["id"], "99");
    assert_eq!(frame["payload"]["error"], "unsupported action: (unnamed)");
}

#[tokio::test]
async fn reconnect_budget_renews_after_success() {
    let cancel = CancellationToken::new();
    // Each drop costs two failed attempts, one short of the cap
    let (session, _connector, mut peers) =
        connect(vec![true, false, false, true, false, false, true], 3, &cancel).await;
    let mut session = session.unwrap();

    for _ in 0..2 {
        drop(next_peer(&mut peers).await);
        assert_eq!(next_event(&mut session).await, SessionEvent::Interrupted);
        assert_eq!(next_event(&mut session).await, SessionEvent::Resumed);
    }

    let mut peer = next_peer(&mut peers).await;
    session.send("third connection").await.unwrap();
    assert_eq!(next_frame(&mut peer).await["payload"], "third connection");
}
