mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    ScriptedBackend, Step, assistant_response, auth_error, delta, done, fail, page,
    status_error, wait_until, wire,
};
use pretty_assertions::assert_eq;
use tokio::time::Instant;
use zova_client::wire::{CompletionResponse, WireContent, WirePart, WireRole};
use zova_client::{FailureKind, MemoryBlobStore};
use zova_sync::{
    ComposeOutcome, DeliveryMode, IngestOutcome, Message, MessageContent, MessageId,
    MessageStatus, NoticeKind, Role, SendCoordinator, Session, SessionId, SyncError,
    SyncSettings, TranscriptEvent,
};

fn coordinator(backend: &Arc<ScriptedBackend>, settings: SyncSettings) -> Arc<SendCoordinator> {
    Arc::new(
        SendCoordinator::new(
            backend.clone(),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(settings),
        )
        .expect("coordinator"),
    )
}

fn texts(session: &Session) -> Vec<String> {
    session
        .store()
        .all()
        .iter()
        .map(|message| message.content.text())
        .collect()
}

fn status_of(session: &Session, id: MessageId) -> Option<MessageStatus> {
    session.store().get(id).map(|message| message.status)
}

fn batched() -> SyncSettings {
    SyncSettings {
        delivery_mode: DeliveryMode::Batched,
        batch_stagger_ms: 600,
        ..SyncSettings::default()
    }
}

#[tokio::test]
async fn immediate_send_streams_reply_into_placeholder() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![delta("Hel"), delta("lo"), done()]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());

    let composed = coordinator
        .compose(&session_id, "hi".into())
        .await
        .expect("compose");
    let ComposeOutcome::Streamed {
        user_id,
        assistant_id,
        outcome,
    } = composed
    else {
        panic!("expected a streamed reply");
    };

    assert_eq!(
        outcome,
        IngestOutcome::Completed {
            content: "Hello".to_string(),
            usage: None,
        }
    );
    let store = session.store();
    assert_eq!(store.ids(), vec![user_id, assistant_id]);
    let reply = store.get(assistant_id).expect("reply");
    assert_eq!(reply.content, MessageContent::Text("Hello".to_string()));
    assert_eq!(reply.status, MessageStatus::Done);
    assert_eq!(
        store.get(user_id).map(|message| message.status),
        Some(MessageStatus::Done)
    );
    assert_eq!(backend.last_stream_text().as_deref(), Some("hi"));
}

#[tokio::test]
async fn usage_marker_is_stripped_from_finished_reply() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![delta("Done. "), delta("<!-- usage: 42 -->"), done()]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());

    let composed = coordinator
        .compose(&session_id, "go".into())
        .await
        .expect("compose");
    let ComposeOutcome::Streamed {
        assistant_id,
        outcome,
        ..
    } = composed
    else {
        panic!("expected a streamed reply");
    };

    assert_eq!(
        outcome,
        IngestOutcome::Completed {
            content: "Done.".to_string(),
            usage: Some(42),
        }
    );
    assert_eq!(
        session.store().get(assistant_id).map(|message| message.content),
        Some(MessageContent::Text("Done.".to_string()))
    );
}

#[tokio::test]
async fn send_while_streaming_is_rejected_and_abort_keeps_partial_reply() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![delta("par"), Step::Hang]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());
    let store = session.store().clone();

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        let session_id = session_id.clone();
        async move { coordinator.compose(&session_id, "first".into()).await }
    });
    wait_until(|| {
        store
            .all()
            .iter()
            .any(|message| message.role == Role::Assistant && message.content.text() == "par")
    })
    .await;

    let second = coordinator
        .compose(&session_id, "second".into())
        .await
        .expect("compose");
    assert_eq!(second, ComposeOutcome::Busy);
    assert_eq!(store.len(), 2);

    assert!(coordinator.abort(&session_id));
    let composed = first.await.expect("join").expect("compose");
    let ComposeOutcome::Streamed {
        user_id,
        assistant_id,
        outcome,
    } = composed
    else {
        panic!("expected a streamed reply");
    };

    assert_eq!(
        outcome,
        IngestOutcome::Aborted {
            content: "par".to_string()
        }
    );
    assert_eq!(
        store.get(assistant_id).map(|message| message.status),
        Some(MessageStatus::Cancelled)
    );
    assert_eq!(status_of(&session, user_id), Some(MessageStatus::Done));
    assert!(!session.is_streaming());
    assert!(!coordinator.abort(&session_id));
}

#[tokio::test]
async fn failed_stream_keeps_partial_content_and_posts_notice() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![delta("par"), fail(FailureKind::Network, "connection reset")]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());
    let mut notices = coordinator.subscribe_notices();

    let composed = coordinator
        .compose(&session_id, "hi".into())
        .await
        .expect("network failure is not fatal");
    let ComposeOutcome::Streamed {
        user_id,
        assistant_id,
        ..
    } = composed
    else {
        panic!("expected a streamed reply");
    };

    assert_eq!(status_of(&session, user_id), Some(MessageStatus::Done));
    let reply = session.store().get(assistant_id).expect("reply kept");
    assert_eq!(reply.content.text(), "par");
    assert_eq!(
        reply.status,
        MessageStatus::Interrupted("connection reset".to_string())
    );
    let notice = notices.try_recv().expect("notice");
    assert_eq!(notice.kind, NoticeKind::NetworkFailure);
    assert_eq!(notice.session_id, session_id);
}

#[tokio::test]
async fn rejected_request_is_reported_apart_from_network_failures() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![fail(FailureKind::Status(500), "internal error")]);
    backend.script_stream(vec![fail(FailureKind::Protocol, "not a record")]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    coordinator.open_session(session_id.clone());
    let mut notices = coordinator.subscribe_notices();

    for text in ["one", "two"] {
        let composed = coordinator
            .compose(&session_id, text.into())
            .await
            .expect("request failure is not fatal");
        let ComposeOutcome::Streamed { outcome, .. } = composed else {
            panic!("expected a streamed reply");
        };
        assert!(matches!(outcome, IngestOutcome::Failed { .. }));
        assert_eq!(
            notices.try_recv().map(|notice| notice.kind).ok(),
            Some(NoticeKind::RequestFailed)
        );
    }
}

#[tokio::test]
async fn sessions_stream_independently() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![delta("par"), Step::Hang]);
    backend.script_stream(vec![delta("other"), done()]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let first_id = SessionId::from("s1");
    let second_id = SessionId::from("s2");
    let first = coordinator.open_session(first_id.clone());
    let second = coordinator.open_session(second_id.clone());

    let hanging = tokio::spawn({
        let coordinator = coordinator.clone();
        let session_id = first_id.clone();
        async move { coordinator.compose(&session_id, "a".into()).await }
    });
    wait_until(|| texts(&first).contains(&"par".to_string())).await;
    assert!(first.is_streaming());

    let composed = coordinator
        .compose(&second_id, "b".into())
        .await
        .expect("compose");
    let ComposeOutcome::Streamed { outcome, .. } = composed else {
        panic!("expected a streamed reply");
    };
    assert!(outcome.is_completed());
    assert_eq!(texts(&second), vec!["b".to_string(), "other".to_string()]);
    assert!(first.is_streaming());

    assert!(coordinator.abort(&first_id));
    let aborted = hanging.await.expect("join").expect("compose");
    assert!(matches!(
        aborted,
        ComposeOutcome::Streamed {
            outcome: IngestOutcome::Aborted { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn history_arriving_mid_send_keeps_the_local_exchange() {
    let backend = ScriptedBackend::new();
    backend.script_page(page(
        vec![
            wire(1, WireRole::User, "old q"),
            wire(2, WireRole::Assistant, "old a"),
        ],
        false,
    ));
    backend.script_stream(vec![delta("par"), Step::Hang]);
    let gate = backend.gate_pages();
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());

    let loading = tokio::spawn({
        let session = session.clone();
        async move { session.paginator().load_latest().await }
    });
    wait_until(|| backend.history_queries.lock().unwrap().len() == 1).await;
    let sending = tokio::spawn({
        let coordinator = coordinator.clone();
        let session_id = session_id.clone();
        async move { coordinator.compose(&session_id, "new".into()).await }
    });
    wait_until(|| texts(&session).contains(&"par".to_string())).await;

    gate.notify_one();
    let loaded = loading.await.expect("join").expect("history");
    assert!(loaded.is_some());
    assert_eq!(
        texts(&session),
        vec![
            "old q".to_string(),
            "old a".to_string(),
            "new".to_string(),
            "par".to_string(),
        ]
    );

    assert!(coordinator.abort(&session_id));
    let ComposeOutcome::Streamed {
        assistant_id,
        outcome,
        ..
    } = sending.await.expect("join").expect("compose")
    else {
        panic!("expected a streamed reply");
    };
    assert_eq!(
        outcome,
        IngestOutcome::Aborted {
            content: "par".to_string()
        }
    );
    assert_eq!(status_of(&session, assistant_id), Some(MessageStatus::Cancelled));
    assert_eq!(session.store().len(), 4);
}

#[tokio::test]
async fn expired_credential_is_fatal_for_the_send() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![fail(FailureKind::AuthExpired, "expired")]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());
    let mut notices = coordinator.subscribe_notices();

    let error = coordinator
        .compose(&session_id, "hi".into())
        .await
        .expect_err("auth expiry surfaces");

    assert!(error.is_auth_expired());
    assert_eq!(notices.try_recv().map(|notice| notice.kind).ok(), Some(NoticeKind::AuthExpired));
    assert!(!session.is_streaming());
}

#[tokio::test(start_paused = true)]
async fn batched_flush_inserts_reply_turns_with_stagger() {
    let backend = ScriptedBackend::new();
    backend.script_completion(Ok(assistant_response("first turn<|split|>second turn")));
    let coordinator = coordinator(&backend, batched());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());

    let mut queued = Vec::new();
    for text in ["one", "two"] {
        match coordinator.compose(&session_id, text.into()).await {
            Ok(ComposeOutcome::Queued { user_id }) => queued.push(user_id),
            other => panic!("expected a queued message, got {other:?}"),
        }
    }
    assert!(backend.stream_requests.lock().unwrap().is_empty());
    assert_eq!(session.queued(), queued);

    let store = session.store().clone();
    let mut events = store.subscribe();
    let started = Instant::now();
    let (flushed, arrivals) = tokio::join!(coordinator.flush(&session_id), async {
        let mut arrivals = Vec::new();
        while arrivals.len() < 2 {
            match events.recv().await {
                Ok(TranscriptEvent::Appended(id)) => arrivals.push((id, Instant::now())),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        arrivals
    });
    let flushed = flushed.expect("flush");

    assert_eq!(flushed.sent, queued);
    assert_eq!(flushed.inserted.len(), 2);
    assert_eq!(arrivals.len(), 2);
    assert!(arrivals[0].1 - started < Duration::from_millis(600));
    assert!(arrivals[1].1 - arrivals[0].1 >= Duration::from_millis(600));

    let texts = flushed
        .inserted
        .iter()
        .filter_map(|id| store.get(*id))
        .map(|message| message.content.text())
        .collect::<Vec<_>>();
    assert_eq!(texts, vec!["first turn".to_string(), "second turn".to_string()]);
    assert_eq!(
        backend.complete_requests.lock().unwrap()[0].message,
        WireContent::Parts(vec![
            WirePart::Text {
                text: "one".to_string()
            },
            WirePart::Text {
                text: "two".to_string()
            },
        ])
    );
    for id in &queued {
        assert_eq!(
            store.get(*id).map(|message| message.status),
            Some(MessageStatus::Done)
        );
    }
    assert!(session.queued().is_empty());
}

#[tokio::test]
async fn failed_flush_requeues_messages() {
    let backend = ScriptedBackend::new();
    backend.script_completion(Err(status_error(503)));
    backend.script_completion(Ok(assistant_response("late reply")));
    let coordinator = coordinator(
        &backend,
        SyncSettings {
            batch_stagger_ms: 0,
            ..batched()
        },
    );
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());
    let mut notices = coordinator.subscribe_notices();

    coordinator
        .compose(&session_id, "one".into())
        .await
        .expect("queue");
    coordinator
        .compose(&session_id, "two".into())
        .await
        .expect("queue");
    let queued = session.queued();

    let failed = coordinator.flush(&session_id).await.expect("flush");
    assert_eq!(failed.requeued, 2);
    assert!(failed.inserted.is_empty());
    assert_eq!(session.queued(), queued);
    assert_eq!(notices.try_recv().map(|notice| notice.kind).ok(), Some(NoticeKind::BatchFailed));
    assert!(matches!(
        coordinator.set_mode(&session_id, DeliveryMode::Immediate),
        Err(SyncError::ModeSwitchRejected { .. })
    ));

    let retried = coordinator.flush(&session_id).await.expect("flush");
    assert_eq!(retried.sent, queued);
    assert_eq!(retried.inserted.len(), 1);
    coordinator
        .set_mode(&session_id, DeliveryMode::Immediate)
        .expect("idle session can switch");
    assert_eq!(session.mode(), DeliveryMode::Immediate);
}

#[tokio::test]
async fn regenerate_builds_payload_from_state_after_delete() {
    let backend = ScriptedBackend::new();
    backend.script_page(page(
        vec![
            wire(1, WireRole::User, "question"),
            wire(2, WireRole::Assistant, "old answer"),
        ],
        false,
    ));
    backend.script_stream(vec![delta("new answer"), done()]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());
    session
        .paginator()
        .load_latest()
        .await
        .expect("history")
        .expect("not dropped");

    // The user message is edited while the delete is in flight.
    let store = session.store().clone();
    backend.on_delete(move |_| {
        store.remove(MessageId::Server(1));
        store.append(Message::new(
            MessageId::Server(1),
            Role::User,
            "question, edited".into(),
            MessageStatus::Done,
        ));
    });

    let composed = coordinator
        .regenerate(&session_id, MessageId::Server(2))
        .await
        .expect("regenerate");
    let ComposeOutcome::Streamed {
        user_id,
        assistant_id,
        outcome,
    } = composed
    else {
        panic!("expected a streamed reply");
    };

    assert_eq!(user_id, MessageId::Server(1));
    assert!(outcome.is_completed());
    assert_eq!(*backend.deletes.lock().unwrap(), vec![2]);
    assert_eq!(backend.last_stream_text().as_deref(), Some("question, edited"));

    let store = session.store();
    assert_eq!(store.ids(), vec![MessageId::Server(1), assistant_id]);
    assert_eq!(
        store.get(assistant_id).map(|message| message.content.text()),
        Some("new answer".to_string())
    );
}

#[tokio::test]
async fn regenerate_of_local_reply_skips_backend_delete() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![delta("first"), done()]);
    backend.script_stream(vec![delta("again"), done()]);
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());

    let ComposeOutcome::Streamed {
        user_id,
        assistant_id: stale,
        ..
    } = coordinator
        .compose(&session_id, "hi".into())
        .await
        .expect("compose")
    else {
        panic!("expected a streamed reply");
    };

    let ComposeOutcome::Streamed { assistant_id, .. } = coordinator
        .regenerate(&session_id, stale)
        .await
        .expect("regenerate")
    else {
        panic!("expected a streamed reply");
    };

    assert!(backend.deletes.lock().unwrap().is_empty());
    assert!(session.store().get(stale).is_none());
    assert_eq!(session.store().ids(), vec![user_id, assistant_id]);
    assert_eq!(backend.last_stream_text().as_deref(), Some("hi"));
}

#[tokio::test]
async fn regenerated_reply_stays_with_its_question() {
    let backend = ScriptedBackend::new();
    for reply in ["a1", "a2", "a1b", "a1c"] {
        backend.script_stream(vec![delta(reply), done()]);
    }
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());

    let ComposeOutcome::Streamed {
        assistant_id: first_reply,
        ..
    } = coordinator
        .compose(&session_id, "Q1".into())
        .await
        .expect("compose")
    else {
        panic!("expected a streamed reply");
    };
    coordinator
        .compose(&session_id, "Q2".into())
        .await
        .expect("compose");

    let ComposeOutcome::Streamed {
        assistant_id: second_reply,
        ..
    } = coordinator
        .regenerate(&session_id, first_reply)
        .await
        .expect("regenerate")
    else {
        panic!("expected a streamed reply");
    };
    assert_eq!(texts(&session), vec!["Q1", "a1b", "Q2", "a2"]);

    coordinator
        .regenerate(&session_id, second_reply)
        .await
        .expect("regenerate again");
    assert_eq!(backend.last_stream_text().as_deref(), Some("Q1"));
    assert_eq!(texts(&session), vec!["Q1", "a1c", "Q2", "a2"]);
}

#[tokio::test]
async fn streamed_reply_adopts_its_server_copy() {
    let backend = ScriptedBackend::new();
    backend.script_stream(vec![delta("a"), done()]);
    for _ in 0..2 {
        backend.script_page(page(
            vec![wire(1, WireRole::User, "q"), wire(2, WireRole::Assistant, "a")],
            false,
        ));
    }
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());

    let ComposeOutcome::Streamed {
        user_id,
        assistant_id,
        ..
    } = coordinator
        .compose(&session_id, "q".into())
        .await
        .expect("compose")
    else {
        panic!("expected a streamed reply");
    };
    let store = session.store();
    assert_eq!(store.get(user_id).and_then(|message| message.remote), Some(1));
    assert_eq!(store.get(assistant_id).and_then(|message| message.remote), Some(2));

    session.paginator().load_latest().await.expect("history");
    assert_eq!(store.ids(), vec![user_id, assistant_id]);

    coordinator
        .delete_message(&session_id, assistant_id)
        .await
        .expect("delete");
    assert_eq!(*backend.deletes.lock().unwrap(), vec![2]);
    assert_eq!(store.ids(), vec![user_id]);
}

#[tokio::test]
async fn batched_turns_share_the_backend_reply() {
    let backend = ScriptedBackend::new();
    backend.script_completion(Ok(CompletionResponse {
        messages: vec![
            wire(6, WireRole::User, "one"),
            wire(7, WireRole::Assistant, "first<|split|>second"),
        ],
    }));
    backend.script_page(page(
        vec![
            wire(6, WireRole::User, "one"),
            wire(7, WireRole::Assistant, "first<|split|>second"),
        ],
        false,
    ));
    let coordinator = coordinator(
        &backend,
        SyncSettings {
            batch_stagger_ms: 0,
            ..batched()
        },
    );
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());

    let ComposeOutcome::Queued { user_id } = coordinator
        .compose(&session_id, "one".into())
        .await
        .expect("queue")
    else {
        panic!("expected a queued message");
    };
    let flushed = coordinator.flush(&session_id).await.expect("flush");
    assert_eq!(flushed.inserted.len(), 2);

    let store = session.store();
    assert_eq!(store.get(user_id).and_then(|message| message.remote), Some(6));
    for id in &flushed.inserted {
        assert_eq!(store.get(*id).and_then(|message| message.remote), Some(7));
    }

    session.paginator().load_latest().await.expect("history");
    assert_eq!(store.len(), 3);

    coordinator
        .delete_message(&session_id, flushed.inserted[0])
        .await
        .expect("delete");
    assert_eq!(*backend.deletes.lock().unwrap(), vec![7]);
    assert_eq!(store.ids(), vec![user_id]);
}

#[tokio::test]
async fn regenerate_rejects_user_messages() {
    let backend = ScriptedBackend::new();
    backend.script_page(page(vec![wire(1, WireRole::User, "question")], false));
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());
    session.paginator().load_latest().await.expect("history");

    let error = coordinator
        .regenerate(&session_id, MessageId::Server(1))
        .await
        .expect_err("not an assistant reply");
    assert!(matches!(error, SyncError::NotAnAssistantReply { .. }));
    assert!(backend.stream_requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_backend_delete_still_removes_locally() {
    let backend = ScriptedBackend::new();
    backend.script_page(page(vec![wire(5, WireRole::User, "x")], false));
    backend.script_delete(Err(status_error(500)));
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());
    session.paginator().load_latest().await.expect("history");
    let mut notices = coordinator.subscribe_notices();

    let removed = coordinator
        .delete_message(&session_id, MessageId::Server(5))
        .await
        .expect("delete");

    assert_eq!(removed.id, MessageId::Server(5));
    assert!(session.store().is_empty());
    assert_eq!(notices.try_recv().map(|notice| notice.kind).ok(), Some(NoticeKind::DeleteFailed));
}

#[tokio::test]
async fn expired_credential_on_delete_is_fatal() {
    let backend = ScriptedBackend::new();
    backend.script_page(page(vec![wire(5, WireRole::User, "x")], false));
    backend.script_delete(Err(auth_error()));
    let coordinator = coordinator(&backend, SyncSettings::default());
    let session_id = SessionId::from("s1");
    let session = coordinator.open_session(session_id.clone());
    session.paginator().load_latest().await.expect("history");

    let error = coordinator
        .delete_message(&session_id, MessageId::Server(5))
        .await
        .expect_err("fatal");
    assert!(error.is_auth_expired());
}

#[tokio::test]
async fn unknown_session_is_reported() {
    let backend = ScriptedBackend::new();
    let coordinator = coordinator(&backend, SyncSettings::default());

    let error = coordinator
        .compose(&SessionId::from("missing"), "hi".into())
        .await
        .expect_err("session not open");
    assert!(matches!(error, SyncError::SessionNotFound { .. }));
}
