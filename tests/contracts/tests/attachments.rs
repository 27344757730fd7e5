use reqchat_contracts::{settle, Portal};
use reqchat_engine::messaging::{AttachmentPolicy, MessagePipeline};
use reqchat_engine::{EngineError, OutgoingFile, OutgoingMessage};
use reqchat_messaging::{Attachment, AttachmentId, StreamEvent, Table};

#[tokio::test]
async fn attachment_before_parent_is_kept() {
    let portal = Portal::new();
    let backend = portal.backend_for(portal.admin);
    let policy = AttachmentPolicy::default();
    let pipeline = MessagePipeline::new(portal.requirement, portal.admin, &backend, policy);

    let message = portal
        .backend
        .post_message(portal.client, portal.requirement, "drawing attached")
        .unwrap();
    let attachment = Attachment {
        id: AttachmentId::new(),
        message_id: message.id,
        file_name: "floorplan.png".into(),
        file_url: "memory://chat-attachments/floorplan.png".into(),
        file_type: "image/png".into(),
        file_size: 2048,
        uploaded_by: portal.client.id,
        created_at: message.created_at,
    };

    pipeline.apply_stream_event(StreamEvent::Attachment(attachment.clone())).await;
    pipeline.apply_stream_event(StreamEvent::Attachment(attachment.clone())).await;
    assert!(pipeline.is_empty().await);

    pipeline.apply_stream_event(StreamEvent::Message(message.clone())).await;
    let snapshot = pipeline.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].attachments, vec![attachment]);
}

#[tokio::test]
async fn failed_upload_still_delivers_the_message() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.client).await;
    let view = engine.open_conversation(portal.requirement).await.unwrap();
    portal.backend.fail_uploads(true);

    let report = view
        .send(
            OutgoingMessage::text("contract draft")
                .with_file(OutgoingFile::new("draft.pdf", "application/pdf", b"%PDF-1.7".to_vec()))
                .with_file(OutgoingFile::new("notes.txt", "text/plain", b"notes".to_vec())),
        )
        .await
        .expect("send resolves despite upload failures");
    settle().await;

    assert_eq!(report.warnings.len(), 2);
    assert!(report.message.attachments.is_empty());
    let snapshot = view.pipeline().snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].body, "contract draft");
    view.close().await;
}

#[tokio::test]
async fn partial_upload_failure_keeps_the_good_files() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.client).await;
    let view = engine.open_conversation(portal.requirement).await.unwrap();
    portal.backend.fail_next_inserts(Table::Attachments, 1);

    let report = view
        .send(
            OutgoingMessage::text("two files")
                .with_file(OutgoingFile::new("a.csv", "text/csv", b"a,b".to_vec()))
                .with_file(OutgoingFile::new("b.csv", "text/csv", b"c,d".to_vec())),
        )
        .await
        .unwrap();
    settle().await;

    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].file_name, "a.csv");
    assert_eq!(report.message.attachments.len(), 1);
    let snapshot = view.pipeline().snapshot().await;
    assert_eq!(snapshot[0].attachments.len(), 1);
    assert_eq!(snapshot[0].attachments[0].file_name, "b.csv");
    view.close().await;
}

#[tokio::test]
async fn oversized_file_is_rejected_without_writes() {
    let portal = Portal::new();
    let engine = portal.signed_in(portal.client).await;
    let view = engine.open_conversation(portal.requirement).await.unwrap();

    let too_big = vec![0u8; 10 * 1024 * 1024 + 1];
    let err = view
        .send(
            OutgoingMessage::text("huge")
                .with_file(OutgoingFile::new("scan.png", "image/png", too_big)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Validation(_)));
    assert!(portal.backend.rows(Table::Messages).is_empty());
    view.close().await;
}
