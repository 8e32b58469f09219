mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{consultant, user, FakeBackend, World, START};
use helpdesk_shared::notify::RecipientType;
use helpdesk_shared::thread::{
    NoticeAction, NoticeKind, PendingStatus, RefreshTrigger, SendOutcome,
};
use helpdesk_shared::{
    CaseId, Clock, ErrorKind, Freshness, ItemKind, ManualClock, MessageDraft, SyncPhase,
    UploadFile,
};

#[tokio::test(start_paused = true)]
async fn test_reply_shows_optimistically_then_confirms() {
    let clock = ManualClock::new(START);
    let (backend, gate) = FakeBackend::gated(clock.clone());
    let world = World::with_backend(clock, backend);
    let sync = world.synchronizer(&user()).await;

    assert_eq!(sync.open_case(CaseId::new("c1")).await, SyncPhase::Live);
    assert!(sync.view(&user()).await.is_empty());

    let sending = tokio::spawn({
        let sync = sync.clone();
        async move { sync.send_reply(MessageDraft::reply("c1", "Hello")).await }
    });

    let mut view = sync.view(&user()).await;
    while view.pending_count() == 0 {
        tokio::task::yield_now().await;
        view = sync.view(&user()).await;
    }
    assert_eq!(view.items.len(), 1);
    assert!(view.items[0].id.is_temporary());
    assert_eq!(view.items[0].pending, Some(PendingStatus::Sending));
    assert_eq!(view.items[0].content, "Hello");

    gate.add_permits(1);
    let outcome = sending.await.unwrap().unwrap();
    let SendOutcome::Confirmed { item, uploads } = outcome else {
        panic!("expected a confirmed send");
    };
    assert!(uploads.is_complete());

    let view = sync.view(&user()).await;
    assert_eq!(view.items.len(), 1);
    let row = &view.items[0];
    assert_eq!(&row.id, item.id());
    assert!(!row.is_optimistic);
    assert!(!row.is_internal);
    assert!(row.is_own);
    assert_eq!(row.kind, ItemKind::Reply);
    assert_eq!(row.time_ago, "Just now");

    let stored = world.backend.replies();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].content, "Hello");
    assert!(!stored[0].is_internal);
}

#[tokio::test(start_paused = true)]
async fn test_internal_note_hidden_from_user() {
    let world = World::new();
    let staff = world.synchronizer(&consultant()).await;
    staff.open_case(CaseId::new("c2")).await;
    staff
        .add_note(MessageDraft::note("c2", "Customer is on the legacy plan"))
        .await
        .unwrap();
    staff
        .send_reply(MessageDraft::reply("c2", "Checking with billing").internal())
        .await
        .unwrap();
    staff
        .send_reply(MessageDraft::reply("c2", "We are looking into it"))
        .await
        .unwrap();

    let staff_view = staff.view(&consultant()).await;
    assert_eq!(staff_view.items.len(), 3);

    let customer = world.synchronizer(&user()).await;
    let notes_before = world.backend.note_fetches.load(Ordering::SeqCst);
    customer.open_case(CaseId::new("c2")).await;

    let view = customer.view(&user()).await;
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].content, "We are looking into it");
    assert_eq!(world.backend.note_fetches.load(Ordering::SeqCst), notes_before);
}

#[tokio::test]
async fn test_user_cannot_post_notes_or_internal_replies() {
    let world = World::new();
    let sync = world.synchronizer(&user()).await;
    sync.open_case(CaseId::new("c1")).await;

    let err = sync
        .add_note(MessageDraft::note("c1", "secret"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);

    let err = sync
        .send_reply(MessageDraft::reply("c1", "hi").internal())
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Authorization);

    let err = sync
        .send_reply(MessageDraft::reply("c1", "   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Validation);

    assert_eq!(world.backend.reply_inserts.load(Ordering::SeqCst), 0);
    assert!(sync.view(&user()).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refresh_requests_are_debounced() {
    let world = World::new();
    let sync = world.synchronizer(&user()).await;
    sync.open_case(CaseId::new("c1")).await;
    assert_eq!(world.backend.reply_fetches.load(Ordering::SeqCst), 1);

    for _ in 0..3 {
        sync.request_refresh().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(world.backend.reply_fetches.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(world.backend.reply_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_pending_refresh() {
    let world = World::new();
    let sync = world.synchronizer(&user()).await;
    sync.open_case(CaseId::new("c1")).await;

    sync.request_refresh().await;
    sync.close().await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(world.backend.reply_fetches.load(Ordering::SeqCst), 1);
    let view = sync.view(&user()).await;
    assert_eq!(view.case_id, None);
    assert_eq!(view.phase, SyncPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_falls_back_to_cache() {
    let world = World::new();
    let sync = world.synchronizer(&consultant()).await;
    sync.open_case(CaseId::new("c1")).await;
    sync.send_reply(MessageDraft::reply("c1", "First answer"))
        .await
        .unwrap();

    world.backend.set_offline(true);
    let phase = sync.refresh_now(RefreshTrigger::UserRefresh).await;
    assert_eq!(phase, SyncPhase::Offline);

    let view = sync.view(&consultant()).await;
    assert!(view.is_offline);
    assert!(!view.is_stale);
    assert_eq!(view.items.len(), 1);
    assert_eq!(view.items[0].content, "First answer");
    let notice = view.notice.unwrap();
    assert_eq!(notice.kind, NoticeKind::FetchFailed);
    assert_eq!(notice.action, Some(NoticeAction::Refresh));

    sync.dismiss_notice().await;
    world.clock.advance(5 * 60 * 1000 + 1);
    sync.refresh_now(RefreshTrigger::Background).await;
    let view = sync.view(&consultant()).await;
    assert!(view.is_stale);
    assert!(view.notice.is_none());
    assert_eq!(view.items.len(), 1);

    world.backend.set_offline(false);
    assert_eq!(
        sync.refresh_now(RefreshTrigger::Reconnect).await,
        SyncPhase::Live
    );
    let view = sync.view(&consultant()).await;
    assert!(!view.is_offline);
    assert!(!view.is_stale);
}

#[tokio::test(start_paused = true)]
async fn test_send_while_offline_keeps_cache_stale() {
    let world = World::new();
    let sync = world.synchronizer(&user()).await;
    sync.open_case(CaseId::new("c1")).await;
    sync.send_reply(MessageDraft::reply("c1", "before the outage"))
        .await
        .unwrap();

    world.clock.advance(10 * 60 * 1000);
    world.backend.set_offline(true);
    assert_eq!(
        sync.refresh_now(RefreshTrigger::UserRefresh).await,
        SyncPhase::Offline
    );
    assert!(sync.view(&user()).await.is_stale);

    world.backend.set_offline(false);
    let outcome = sync
        .send_reply(MessageDraft::reply("c1", "after the outage"))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Confirmed { .. }));

    let snapshot = world.cache().get(&CaseId::new("c1")).await.unwrap();
    assert_eq!(snapshot.items.len(), 2);
    assert_eq!(snapshot.captured_at, START);
    assert_eq!(snapshot.freshness(world.clock.now()), Freshness::Stale);

    world.backend.set_offline(true);
    let other = world.synchronizer(&user()).await;
    assert_eq!(other.open_case(CaseId::new("c1")).await, SyncPhase::Offline);
    let view = other.view(&user()).await;
    assert!(view.is_stale);
    assert_eq!(view.items.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_superseded_fetch_is_discarded() {
    let world = World::new();
    let sync = world.synchronizer(&user()).await;
    for (case, text) in [("c1", "about c1"), ("c2", "about c2")] {
        sync.open_case(CaseId::new(case)).await;
        sync.send_reply(MessageDraft::reply(case, text)).await.unwrap();
    }
    sync.close().await;

    world.backend.slow_fetch("c1", Duration::from_secs(5));
    let fetches = world.backend.reply_fetches.load(Ordering::SeqCst);
    let opening_c1 = tokio::spawn({
        let sync = sync.clone();
        async move { sync.open_case(CaseId::new("c1")).await }
    });
    while world.backend.reply_fetches.load(Ordering::SeqCst) == fetches {
        tokio::task::yield_now().await;
    }

    assert_eq!(sync.open_case(CaseId::new("c2")).await, SyncPhase::Live);
    opening_c1.await.unwrap();

    let view = sync.view(&user()).await;
    assert_eq!(view.case_id, Some(CaseId::new("c2")));
    assert_eq!(view.phase, SyncPhase::Live);
    let contents: Vec<_> = view.items.iter().map(|i| i.content.as_str()).collect();
    assert_eq!(contents, ["about c2"]);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_failure_without_cache_is_empty() {
    let world = World::new();
    world.backend.set_offline(true);
    let sync = world.synchronizer(&user()).await;

    assert_eq!(sync.open_case(CaseId::new("c9")).await, SyncPhase::Empty);
    let view = sync.view(&user()).await;
    assert!(view.is_empty());
    assert!(view.is_offline);
    assert_eq!(view.notice.unwrap().message, "Couldn't load messages.");
    // 3 attempts with the fast retry policy
    assert_eq!(world.backend.reply_fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_switching_case_replaces_thread() {
    let world = World::new();
    let sync = world.synchronizer(&user()).await;
    sync.open_case(CaseId::new("c1")).await;
    sync.send_reply(MessageDraft::reply("c1", "about c1"))
        .await
        .unwrap();

    sync.open_case(CaseId::new("c2")).await;
    let view = sync.view(&user()).await;
    assert_eq!(view.case_id, Some(CaseId::new("c2")));
    assert!(view.is_empty());

    sync.open_case(CaseId::new("c1")).await;
    assert_eq!(sync.view(&user()).await.items.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_response_is_not_duplicated() {
    let world = World::new();
    let sync = world.synchronizer(&user()).await;
    sync.open_case(CaseId::new("c1")).await;

    world.backend.lose_next_response.store(true, Ordering::SeqCst);
    let outcome = sync
        .send_reply(MessageDraft::reply("c1", "only once"))
        .await
        .unwrap();
    assert!(matches!(outcome, SendOutcome::Confirmed { .. }));

    assert_eq!(world.backend.replies().len(), 1);
    let view = sync.view(&user()).await;
    assert_eq!(view.items.len(), 1);
    assert!(!view.items[0].is_optimistic);
}

#[tokio::test(start_paused = true)]
async fn test_partial_upload_keeps_successful_files() {
    let world = World::new();
    world.storage.reject("broken.pdf");
    let sync = world.synchronizer(&user()).await;
    sync.open_case(CaseId::new("c1")).await;

    let report = sync
        .upload_attachments(
            &CaseId::new("c1"),
            None,
            vec![
                UploadFile::new("invoice.pdf", "application/pdf", b"%PDF-1.7".to_vec()),
                UploadFile::new("broken.pdf", "application/pdf", b"%PDF-1.4".to_vec()),
            ],
        )
        .await;

    assert_eq!(report.uploaded.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].file_name, "broken.pdf");
    assert_eq!(report.failed[0].stored_path, None);

    let view = sync.view(&user()).await;
    assert_eq!(view.case_attachments.len(), 1);
    assert_eq!(view.case_attachments[0].file_name, "invoice.pdf");
    assert_eq!(view.notice.unwrap().kind, NoticeKind::UploadIncomplete);
    assert_eq!(world.backend.attachments().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reply_attachments_follow_the_reply() {
    let world = World::new();
    let sync = world.synchronizer(&user()).await;
    sync.open_case(CaseId::new("c1")).await;

    let draft = MessageDraft::reply("c1", "see attached")
        .with_file(UploadFile::new("log.txt", "text/plain", b"boom".to_vec()));
    let SendOutcome::Confirmed { item, .. } = sync.send_reply(draft).await.unwrap() else {
        panic!("expected a confirmed send");
    };
    assert_eq!(item.attachments().len(), 1);

    sync.refresh_now(RefreshTrigger::UserRefresh).await;
    let view = sync.view(&user()).await;
    assert_eq!(view.items[0].attachments.len(), 1);
    assert!(view.case_attachments.is_empty());

    let stored = world.storage.uploaded.lock().unwrap().clone();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].starts_with("u1/c1/"));
}

#[tokio::test(start_paused = true)]
async fn test_notifications_follow_visibility() {
    let world = World::new();
    let staff = world.synchronizer(&consultant()).await;
    staff.open_case(CaseId::new("c1")).await;

    staff
        .send_reply(MessageDraft::reply("c1", "internal").internal())
        .await
        .unwrap();
    staff
        .add_note(MessageDraft::note("c1", "note"))
        .await
        .unwrap();
    assert!(world.notifier.sent.lock().unwrap().is_empty());

    staff
        .send_reply(MessageDraft::reply("c1", "public"))
        .await
        .unwrap();

    let customer = world.synchronizer(&user()).await;
    customer.open_case(CaseId::new("c1")).await;
    customer
        .send_reply(MessageDraft::reply("c1", "thanks"))
        .await
        .unwrap();

    let sent = world.notifier.sent.lock().unwrap().clone();
    let recipients: Vec<_> = sent.iter().map(|r| r.recipient_type).collect();
    assert_eq!(recipients, [RecipientType::User, RecipientType::Consultant]);
}

#[tokio::test(start_paused = true)]
async fn test_replies_render_in_time_order() {
    let world = World::new();
    let sync = world.synchronizer(&consultant()).await;
    sync.open_case(CaseId::new("c1")).await;

    for (i, text) in ["one", "two", "three"].iter().enumerate() {
        if i == 1 {
            sync.add_note(MessageDraft::note("c1", *text)).await.unwrap();
        } else {
            sync.send_reply(MessageDraft::reply("c1", *text)).await.unwrap();
        }
        world.clock.advance(60_000);
    }

    sync.refresh_now(RefreshTrigger::UserRefresh).await;
    let view = sync.view(&consultant()).await;
    let contents: Vec<_> = view.items.iter().map(|i| i.content.as_str()).collect();
    assert_eq!(contents, ["one", "two", "three"]);
    assert_eq!(view.items[0].time_ago, "3m ago");
}
