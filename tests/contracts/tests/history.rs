use reqchat_contracts::Portal;
use reqchat_engine::backend::Backend;
use reqchat_engine::messaging::{AttachmentPolicy, MessagePipeline};
use reqchat_messaging::Message;

fn ids(messages: &[Message]) -> Vec<String> {
    messages.iter().map(|m| m.id.to_string()).collect()
}

fn pipeline(portal: &Portal, backend: &Backend) -> MessagePipeline {
    MessagePipeline::new(portal.requirement, portal.admin, backend, AttachmentPolicy::default())
}

#[tokio::test]
async fn consecutive_pages_match_one_large_page() {
    let portal = Portal::new();
    for i in 0..55 {
        let sender = if i % 2 == 0 { portal.client } else { portal.admin };
        portal
            .backend
            .post_message(sender, portal.requirement, &format!("message {i}"))
            .unwrap();
    }
    let backend = portal.backend_for(portal.admin);

    let paged = pipeline(&portal, &backend);
    let first = paged.load_history(0, 20).await.unwrap();
    let second = paged.load_history(20, 20).await.unwrap();

    let whole = pipeline(&portal, &backend).load_history(0, 40).await.unwrap();

    let first_ids = ids(&first.messages);
    let second_ids = ids(&second.messages);
    assert!(first_ids.iter().all(|id| !second_ids.contains(id)));

    let mut stitched = second_ids.clone();
    stitched.extend(first_ids);
    assert_eq!(stitched, ids(&whole.messages));

    let last_of_older = second.messages.last().unwrap().created_at;
    let first_of_newer = first.messages.first().unwrap().created_at;
    assert!(last_of_older < first_of_newer);

    assert!(whole
        .messages
        .windows(2)
        .all(|pair| pair[0].sort_key() < pair[1].sort_key()));
    assert_eq!(paged.snapshot().await, whole.messages);
}

#[tokio::test]
async fn general_channel_is_paged_separately() {
    let portal = Portal::new();
    portal
        .backend
        .post_message(portal.client, reqchat_messaging::ConversationKey::General, "lobby")
        .unwrap();
    portal
        .backend
        .post_message(portal.client, portal.requirement, "scoped")
        .unwrap();
    let backend = portal.backend_for(portal.admin);

    let page = pipeline(&portal, &backend).load_history(0, 20).await.unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].body, "scoped");
    assert!(!page.has_more);
}
