use reqchat_contracts::{settle, Portal};
use reqchat_engine::OutgoingMessage;
use reqchat_messaging::StreamEvent;

#[tokio::test]
async fn replayed_inserts_render_once() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.admin).await;
    let view = engine.open_conversation(portal.requirement).await.unwrap();

    let message = portal
        .backend
        .post_message(portal.client, portal.requirement, "only once")
        .unwrap();
    settle().await;

    let pipeline = view.pipeline();
    for _ in 0..5 {
        pipeline.apply_stream_event(StreamEvent::Message(message.clone())).await;
    }
    pipeline.load_history(0, 20).await.unwrap();

    let snapshot = pipeline.snapshot().await;
    assert_eq!(snapshot.iter().filter(|m| m.id == message.id).count(), 1);
    view.close().await;
}

#[tokio::test]
async fn optimistic_send_and_echo_merge() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.client).await;
    let view = engine.open_conversation(portal.requirement).await.unwrap();

    let report = view.send(OutgoingMessage::text("hello")).await.unwrap();
    settle().await;

    let snapshot = view.pipeline().snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, report.message.id);
    view.close().await;
}

#[tokio::test]
async fn stream_drop_and_reconnect_does_not_duplicate() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.admin).await;
    let view = engine.open_conversation(portal.requirement).await.unwrap();

    portal
        .backend
        .post_message(portal.client, portal.requirement, "before drop")
        .unwrap();
    settle().await;

    portal.backend.drop_feeds();
    settle().await;
    portal
        .backend
        .post_message(portal.client, portal.requirement, "after reconnect")
        .unwrap();
    settle().await;
    view.pipeline().load_history(0, 20).await.unwrap();

    let snapshot = view.pipeline().snapshot().await;
    let bodies: Vec<String> = snapshot.into_iter().map(|m| m.body).collect();
    assert_eq!(bodies, ["before drop", "after reconnect"]);
    view.close().await;
}
