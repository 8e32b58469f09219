mod common;

use secrecy::ExposeSecret;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{user, World};
use helpdesk_shared::capabilities::{KeyNamespace, KeyValueStore, KvKey, SqliteKvStore};
use helpdesk_shared::crypto::DeviceKeyCipher;
use helpdesk_shared::offline_store::{EnvelopeCodec, StoreContext};
use helpdesk_shared::outbox::EntryState;
use helpdesk_shared::thread::{NoticeAction, NoticeKind, PendingStatus, SendOutcome};
use helpdesk_shared::{CaseId, ItemId, MessageDraft, SyncPhase};

fn sqlite(path: &std::path::Path) -> Arc<dyn KeyValueStore> {
    Arc::new(SqliteKvStore::open(path).unwrap())
}

fn sealed_codec(key: &[u8]) -> EnvelopeCodec {
    EnvelopeCodec::sealed(
        Arc::new(DeviceKeyCipher::new(key).unwrap()),
        StoreContext::new("outbox", "u1"),
    )
}

#[tokio::test]
async fn test_queued_reply_survives_restart_and_replays_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("helpdesk.db");
    let key = DeviceKeyCipher::generate_key().unwrap();

    let mut world = World::new();
    world.kv = sqlite(&db);
    world.backend.set_offline(true);

    let temp_id: ItemId = {
        let outbox = world.outbox_with(sealed_codec(key.expose_secret())).await;
        let sync = world.synchronizer_with(&user(), outbox.clone());
        assert_eq!(sync.open_case(CaseId::new("c1")).await, SyncPhase::Empty);

        let outcome = sync
            .send_reply(MessageDraft::reply("c1", "Sent from the train"))
            .await
            .unwrap();
        let SendOutcome::Queued { temp_id, error } = outcome else {
            panic!("expected the reply to be queued");
        };
        assert!(error.is_retryable());

        let view = sync.view(&user()).await;
        assert_eq!(view.pending_count(), 1);
        assert_eq!(view.items[0].pending, Some(PendingStatus::Queued));
        let notice = view.notice.unwrap();
        assert_eq!(notice.kind, NoticeKind::SendQueued);
        assert_eq!(notice.action, Some(NoticeAction::RetryPending));
        assert_eq!(outbox.len().await, 1);
        temp_id
    };

    let raw = world
        .kv
        .get(&KvKey::new(KeyNamespace::Outbox, "queue").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(!String::from_utf8_lossy(&raw).contains("Sent from the train"));

    // Fresh process: reopen the database with the same device key.
    world.kv = sqlite(&db);
    let outbox = world.outbox_with(sealed_codec(key.expose_secret())).await;
    assert_eq!(outbox.len().await, 1);
    let sync = world.synchronizer_with(&user(), outbox.clone());

    sync.open_case(CaseId::new("c1")).await;
    let view = sync.view(&user()).await;
    assert_eq!(view.pending_count(), 1);
    assert_eq!(view.items[0].id, temp_id);
    assert_eq!(view.items[0].content, "Sent from the train");

    world.backend.set_offline(false);
    let report = sync.retry_pending().await;
    assert_eq!(report.delivered, vec![temp_id.clone()]);
    assert!(report.rescheduled.is_empty());

    let view = sync.view(&user()).await;
    assert_eq!(view.items.len(), 1);
    assert!(!view.items[0].is_optimistic);
    assert!(outbox.is_empty().await);

    let stored = world.backend.replies();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].client_ref.as_deref(), Some(temp_id.as_str()));

    let report = sync.retry_pending().await;
    assert!(report.delivered.is_empty());
    assert_eq!(world.backend.replies().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_replay_of_stored_message_does_not_duplicate() {
    let world = World::new();
    let outbox = world.outbox().await;
    let sync = world.synchronizer_with(&user(), outbox.clone());
    sync.open_case(CaseId::new("c1")).await;

    world.backend.stay_down_after_loss.store(true, Ordering::SeqCst);
    world.backend.lose_next_response.store(true, Ordering::SeqCst);
    let outcome = sync
        .send_reply(MessageDraft::reply("c1", "Did this arrive?"))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Queued { .. }));
    assert_eq!(world.backend.replies().len(), 1);

    world.backend.set_offline(false);
    let report = sync.retry_pending().await;
    assert_eq!(report.delivered.len(), 1);
    assert!(outbox.is_empty().await);

    assert_eq!(world.backend.replies().len(), 1);
    let view = sync.view(&user()).await;
    assert_eq!(view.items.len(), 1);
    assert!(!view.items[0].is_optimistic);
    assert_eq!(view.phase, SyncPhase::Live);
}

#[tokio::test(start_paused = true)]
async fn test_replay_backs_off_then_gives_up() {
    let world = World::new();
    let outbox = world.outbox().await;
    let sync = world.synchronizer_with(&user(), outbox.clone());
    sync.open_case(CaseId::new("c1")).await;

    world.backend.set_offline(true);
    let SendOutcome::Queued { temp_id, .. } = sync
        .send_reply(MessageDraft::reply("c1", "anyone there?"))
        .await
        .unwrap()
    else {
        panic!("expected the reply to be queued");
    };

    let report = sync.retry_pending().await;
    assert_eq!(report.rescheduled, vec![temp_id.clone()]);
    let entry = outbox.get(&temp_id).await.unwrap();
    assert_eq!(entry.attempts, 1);
    assert!(matches!(entry.state, EntryState::Retrying { .. }));

    // Not due until the backoff has passed.
    let report = sync.retry_pending().await;
    assert!(report.rescheduled.is_empty() && report.failed.is_empty());
    assert_eq!(outbox.get(&temp_id).await.unwrap().attempts, 1);

    for attempt in 2..=5 {
        world.clock.advance(300_000);
        let report = sync.retry_pending().await;
        if attempt < 5 {
            assert_eq!(report.rescheduled.len(), 1, "attempt {attempt}");
        } else {
            assert_eq!(report.failed, vec![temp_id.clone()]);
        }
    }

    let entry = outbox.get(&temp_id).await.unwrap();
    assert!(entry.is_failed());
    assert_eq!(entry.attempts, 5);

    let view = sync.view(&user()).await;
    assert_eq!(view.items[0].pending, Some(PendingStatus::Failed));
    assert_eq!(view.notice.unwrap().kind, NoticeKind::SendFailed);

    world.clock.advance(300_000);
    world.backend.set_offline(false);
    let report = sync.retry_pending().await;
    assert!(report.delivered.is_empty());
    assert!(world.backend.replies().is_empty());

    outbox.requeue(&temp_id).await.unwrap();
    let report = sync.retry_pending().await;
    assert_eq!(report.delivered, vec![temp_id]);
    assert_eq!(world.backend.replies().len(), 1);
}

#[tokio::test]
async fn test_unreadable_outbox_is_quarantined() {
    let world = World::new();
    let queue = KvKey::new(KeyNamespace::Outbox, "queue").unwrap();
    world.kv.set(&queue, b"not an envelope".to_vec()).await.unwrap();

    let outbox = world.outbox().await;
    assert!(outbox.is_empty().await);
    assert_eq!(world.kv.get(&queue).await.unwrap(), None);

    let quarantined = world
        .kv
        .get(&KvKey::new(KeyNamespace::Outbox, "quarantine").unwrap())
        .await
        .unwrap();
    assert_eq!(quarantined.as_deref(), Some(&b"not an envelope"[..]));
}
