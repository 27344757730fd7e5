use reqchat_engine::backend::{Backend, MemoryBackend};
use reqchat_engine::{init_tracing, ChatEngine, EngineConfig, OutgoingFile, OutgoingMessage};
use reqchat_messaging::{ConversationKey, RequirementId, Role, UserId, Viewer};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Runs a client and an admin against an in-process backend and logs what each sees.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = EngineConfig::from_env()?;
    let backend = Arc::new(MemoryBackend::new());

    let client = Viewer::new(UserId::new(), Role::Client);
    let admin = Viewer::new(UserId::new(), Role::Admin);
    let requirement = ConversationKey::Requirement(RequirementId::new());
    backend.register_requirement(requirement, client.id);

    backend.set_current_user(Some(client));
    let client_engine = ChatEngine::new(config.clone(), Backend::from_shared(backend.clone()));
    client_engine.sign_in().await?;

    backend.set_current_user(Some(admin));
    let admin_engine = ChatEngine::new(config, Backend::from_shared(backend.clone()));
    admin_engine.sign_in().await?;
    let admin_unread = admin_engine
        .tracker()
        .await
        .ok_or_else(|| anyhow::anyhow!("admin tracker missing after sign in"))?;

    let client_view = client_engine.open_conversation(requirement).await?;
    let report = client_view
        .send(
            OutgoingMessage::text("Updated scope attached")
                .with_file(OutgoingFile::new("scope.txt", "text/plain", b"phase 1 only".to_vec())),
        )
        .await?;
    info!(
        message = %report.message.id,
        attachments = report.message.attachments.len(),
        "client sent"
    );

    let mut changes = admin_unread.changes();
    let notified = changes.wait_for(|s| s.count(requirement) > 0);
    tokio::time::timeout(Duration::from_secs(5), notified).await??;
    info!(unread = admin_unread.count(requirement), "admin sees a new message");

    let admin_view = admin_engine.open_conversation(requirement).await?;
    info!(
        unread = admin_unread.count(requirement),
        messages = admin_view.pipeline().len().await,
        "admin opened the conversation"
    );

    admin_view.close().await;
    client_view.close().await;
    admin_engine.sign_out().await;
    client_engine.sign_out().await;
    Ok(())
}
