use reqchat_contracts::{settle, Portal};
use reqchat_engine::realtime::ChannelEvent;
use reqchat_messaging::{ConnectionState, StreamEvent};

#[tokio::test]
async fn two_local_listeners_share_one_stream() {
    let portal = Portal::new();
    let engine = portal.engine_for(portal.admin);
    let connections = engine.connections();

    let mut first = connections.subscribe(portal.requirement).await.unwrap();
    let mut second = connections.subscribe(portal.requirement).await.unwrap();

    assert_eq!(connections.streams_opened(), 1);
    assert_eq!(portal.backend.feed_subscriptions(), 1);
    assert_eq!(connections.listener_count(portal.requirement), 2);

    let posted = portal
        .backend
        .post_message(portal.client, portal.requirement, "shared")
        .unwrap();
    for subscription in [&mut first, &mut second] {
        loop {
            match subscription.recv().await {
                Some(ChannelEvent::Event(StreamEvent::Message(message))) => {
                    assert_eq!(message.id, posted.id);
                    break;
                }
                Some(_) => continue,
                None => panic!("stream closed"),
            }
        }
    }
}

#[tokio::test]
async fn opening_a_conversation_twice_reuses_the_stream() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.admin).await;
    let before = engine.connections().streams_opened();

    let first = engine.open_conversation(portal.requirement).await.unwrap();
    let second = engine.open_conversation(portal.requirement).await.unwrap();

    // The unread tracker already holds a listener on this conversation.
    assert_eq!(engine.connections().streams_opened(), before);
    assert_eq!(engine.connections().listener_count(portal.requirement), 3);
    assert_eq!(first.state(), ConnectionState::Connected);

    first.close().await;
    second.close().await;
    settle().await;
    assert_eq!(engine.connections().listener_count(portal.requirement), 1);
}

#[tokio::test]
async fn offline_subscribe_fails_fast() {
    let portal = Portal::new();
    portal.backend.set_offline(true);
    let engine = portal.engine_for(portal.admin);

    let result = engine.connections().subscribe(portal.requirement).await;
    assert!(matches!(result, Err(reqchat_engine::EngineError::Transport(_))));
    assert_eq!(engine.connections().state(portal.requirement), None);
}
