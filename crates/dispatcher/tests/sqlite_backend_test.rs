use std::sync::Arc;

use serde_json::json;

use coordinator_core::CoordinatorConfig;
use coordinator_dispatcher::{ClaimOptions, Coordinator};
use coordinator_domain::{ClaimStatus, Message, MessageType, TaskRef, WorkerMetadata};
use coordinator_infrastructure::{
    DatabaseManager, InMemoryTransport, SqliteClaimStore, SqliteDeadLetterStore,
    SqliteMessageStore,
};

async fn sqlite_coordinator(url: &str) -> (Arc<Coordinator>, DatabaseManager) {
    let db = DatabaseManager::connect(url).await.unwrap();
    db.migrate().await.unwrap();

    let coordinator = Coordinator::builder(CoordinatorConfig {
        storage_backend: "sqlite".to_string(),
        storage_url: url.to_string(),
        ..Default::default()
    })
    .message_store(Arc::new(SqliteMessageStore::new(db.pool().clone())))
    .dead_letter_store(Arc::new(
        SqliteDeadLetterStore::new(db.pool().clone()).await.unwrap(),
    ))
    .claim_store(Arc::new(
        SqliteClaimStore::new(db.pool().clone()).await.unwrap(),
    ))
    .transport(Arc::new(InMemoryTransport::new()))
    .build()
    .unwrap();

    (coordinator, db)
}

#[tokio::test]
async fn test_messages_and_acks_persist_in_sqlite() {
    let (coordinator, _db) = sqlite_coordinator("sqlite::memory:").await;
    coordinator.start().await.unwrap();

    let message = Message::new(MessageType::TaskAssignment, "coordinator", "W1", json!({"task_id": "T1"}));
    let sent = coordinator.send_message(message).await.unwrap();
    assert!(sent.success);
    assert_eq!(coordinator.dispatch_pending().await.delivered, 1);

    let ack = coordinator
        .acknowledge_message(&sent.message_id, "W1")
        .await
        .unwrap();
    assert!(ack.success);
    let wrong = coordinator
        .acknowledge_message(&sent.message_id, "W2")
        .await
        .unwrap();
    assert!(!wrong.success);

    let status = coordinator.get_status().await.unwrap();
    assert_eq!(status.messages.sent, 1);
    assert_eq!(status.messages.acknowledged, 1);
    assert_eq!(status.messages.pending, 0);

    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn test_dead_letters_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("coordinator.db").display());

    {
        let (coordinator, db) = sqlite_coordinator(&url).await;
        let message = Message::new(MessageType::StatusUpdate, "coordinator", "W1", json!({}))
            .with_retry_count(3);
        let sent = coordinator.send_message(message).await.unwrap();
        assert!(sent.dead_letter);
        db.close().await;
    }

    let (coordinator, _db) = sqlite_coordinator(&url).await;
    let entries = coordinator.dead_letters().list().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.retry_count(), 3);
    assert_eq!(entries[0].message.recipient, "W1");
}

#[tokio::test]
async fn test_claims_and_backlog_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("coordinator.db").display());

    {
        let (coordinator, db) = sqlite_coordinator(&url).await;
        coordinator
            .register_worker("W1", WorkerMetadata::default())
            .await
            .unwrap();
        for id in ["T1", "T2", "T3"] {
            coordinator
                .submit_task(TaskRef::new(id, "task-execution"))
                .await
                .unwrap();
        }
        let claim = coordinator.claim_task("W1", ClaimOptions::new()).await.unwrap();
        assert_eq!(claim.task_id.as_deref(), Some("T1"));
        db.close().await;
    }

    let (coordinator, _db) = sqlite_coordinator(&url).await;
    let claims = coordinator.task_claims();
    let record = claims.get_claim("T1").await.unwrap().unwrap();
    assert_eq!(record.worker_id, "W1");
    assert_eq!(record.status, ClaimStatus::Claimed);
    let pending: Vec<String> = claims
        .pending_tasks()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    assert_eq!(pending, vec!["T2", "T3"]);

    // Worker重新注册后完成重启前的认领
    coordinator
        .register_worker("W1", WorkerMetadata::default())
        .await
        .unwrap();
    assert!(coordinator
        .complete_task("W1", "T1", json!({"rows": 1}))
        .await
        .unwrap());

    coordinator
        .register_worker("W2", WorkerMetadata::default())
        .await
        .unwrap();
    let taken = coordinator
        .claim_task("W2", ClaimOptions::new().task_id("T2"))
        .await
        .unwrap();
    assert!(taken.success);
    let again = coordinator
        .claim_task("W1", ClaimOptions::new().task_id("T2"))
        .await
        .unwrap();
    assert_eq!(again.reason.as_deref(), Some("already_claimed"));

    let status = coordinator.get_status().await.unwrap();
    assert_eq!(status.active_claims, 1);
    assert_eq!(status.pending_tasks, 1);
}
