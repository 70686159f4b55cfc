// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::doc_markdown,
    clippy::future_not_send,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc
)]

//! Integration tests for task view state.
//!
//! These tests validate:
//! - `loading` is published while a load is in flight
//! - confirm-then-patch: nothing changes before the server answers
//! - the chat view refetches after each confirmed mutation
//! - filtering, sorting and dashboard stats over a loaded view
//! - a view attached to the notification channel picks up changes made by
//!   another client

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use taskflow::auth::AuthClient;
use taskflow::http::loopback::LoopbackTransport;
use taskflow::http::remote::{DEFAULT_TIMEOUT, ReqwestTransport};
use taskflow::http::{Method, Session};
use taskflow::realtime::{ChannelConfig, NotificationChannel};
use taskflow::resource::TaskClient;
use taskflow::view::{SortKey, TaskFilter, TaskView, ViewState};
use taskflow_proto::task::{Priority, TaskInput, TaskStatus};
use taskflow_server::api::AppState;

fn loopback_view() -> (TaskView<LoopbackTransport>, LoopbackTransport) {
    let transport = LoopbackTransport::new();
    (TaskView::dashboard(TaskClient::new(transport.clone())), transport)
}

// =============================================================================
// Loading and confirm-then-patch
// =============================================================================

#[tokio::test(start_paused = true)]
async fn loading_flag_is_published_during_load() {
    let (view, transport) = loopback_view();
    transport.insert_task("a");
    transport.set_latency(Duration::from_millis(100));
    let mut rx = view.subscribe();

    let loader = view.clone();
    let load = tokio::spawn(async move { loader.load().await });

    rx.changed().await.unwrap();
    assert!(rx.borrow_and_update().loading);
    assert!(view.snapshot().tasks.is_empty());

    load.await.unwrap();
    let state = view.snapshot();
    assert!(!state.loading);
    assert_eq!(state.tasks.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn mutation_is_not_shown_before_confirmation() {
    let (view, transport) = loopback_view();
    view.load().await;
    transport.set_latency(Duration::from_millis(100));

    let creator = view.clone();
    let create = tokio::spawn(async move { creator.create(&TaskInput::new("Buy milk")).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(view.snapshot().tasks.is_empty());

    let created = create.await.unwrap().unwrap();
    let state = view.snapshot();
    assert_eq!(state.tasks.len(), 1);
    assert_eq!(state.tasks[0].id, created.id);
}

#[tokio::test]
async fn validation_error_is_published_without_request() {
    let (view, transport) = loopback_view();
    view.load().await;

    let err = view.create(&TaskInput::new("   ")).await.unwrap_err();
    let state = view.snapshot();
    assert_eq!(state.error.as_deref(), Some(err.message.as_str()));
    assert_eq!(err.message, "Task title cannot be empty");
    assert_eq!(transport.request_count(Method::Post, "/tasks"), 0);
}

#[tokio::test]
async fn success_clears_previous_error() {
    let (view, _transport) = loopback_view();
    view.load().await;
    view.create(&TaskInput::new("")).await.unwrap_err();
    assert!(view.snapshot().error.is_some());

    view.create(&TaskInput::new("ok")).await.unwrap();
    assert_eq!(view.snapshot().error, None);
}

#[tokio::test]
async fn chat_view_refetches_after_each_mutation() {
    let transport = LoopbackTransport::new();
    let view = TaskView::chat(TaskClient::new(transport.clone()));
    let id = transport.insert_task("a");
    view.load().await;

    view.toggle(&id).await.unwrap();
    view.create(&TaskInput::new("b")).await.unwrap();
    view.delete(&id).await.unwrap();

    assert_eq!(transport.request_count(Method::Get, "/tasks"), 4);
    let titles: Vec<_> = view.snapshot().tasks.into_iter().map(|t| t.title).collect();
    assert_eq!(titles, vec!["b"]);
}

// =============================================================================
// Derived views
// =============================================================================

#[tokio::test]
async fn filter_sort_and_stats_over_loaded_tasks() {
    let (view, transport) = loopback_view();
    let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
    transport.insert_record(
        "tasks",
        serde_json::json!({"title": "Pay rent", "priority": "high", "due_date": "2026-03-01", "tags": ["home"]}),
    );
    transport.insert_record(
        "tasks",
        serde_json::json!({"title": "Read book", "priority": "low", "tags": ["fun"]}),
    );
    transport.insert_record(
        "tasks",
        serde_json::json!({"title": "Buy milk", "completed": true, "due_date": "2026-03-05", "tags": ["home"]}),
    );
    view.load().await;

    let home = TaskFilter {
        tag: Some("home".into()),
        ..TaskFilter::default()
    };
    let titles: Vec<_> = view
        .visible(&home, SortKey::DueDate)
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert_eq!(titles, vec!["Pay rent", "Buy milk"]);

    let pending = TaskFilter {
        status: Some(TaskStatus::Pending),
        ..TaskFilter::default()
    };
    let titles: Vec<_> = view
        .visible(&pending, SortKey::Priority)
        .into_iter()
        .map(|t| t.title)
        .collect();
    assert_eq!(titles, vec!["Pay rent", "Read book"]);

    let search = TaskFilter {
        search: Some("MILK".into()),
        ..TaskFilter::default()
    };
    assert_eq!(view.visible(&search, SortKey::Title).len(), 1);

    let stats = view.stats(today);
    assert_eq!(stats.total, 3);
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.overdue, 1);
    assert_eq!(stats.high_priority, 1);
    assert_eq!(stats.completion_percent(), 33);
}

// =============================================================================
// Against the reference server
// =============================================================================

async fn server_client(
    addr: std::net::SocketAddr,
    username: &str,
) -> (ReqwestTransport, Session) {
    let session = Session::default();
    let transport =
        ReqwestTransport::new(format!("http://{addr}"), DEFAULT_TIMEOUT, session.clone()).unwrap();
    AuthClient::new(transport.clone(), session.clone())
        .login(username, "pw")
        .await
        .unwrap();
    (transport, session)
}

#[tokio::test]
async fn attached_view_follows_changes_from_another_client() {
    let state = Arc::new(AppState::new());
    let user = taskflow_server::api::seed_demo(&state, "dana", "pw").await.unwrap();
    let (addr, _handle) = taskflow_server::api::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let (transport, session) = server_client(addr, "dana").await;
    let view = TaskView::dashboard(TaskClient::new(transport));
    view.load().await;
    assert_eq!(view.snapshot().tasks.len(), 3);

    let channel = NotificationChannel::new(ChannelConfig::new(format!("ws://{addr}")));
    view.attach_realtime(&channel);
    let authed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&authed);
    channel.on("auth_success", move |_| flag.store(true, Ordering::SeqCst));
    channel
        .connect(&user.id, &session.token().unwrap())
        .await
        .unwrap();

    // The subscribe frame goes out right after auth_success, ahead of the
    // ping, so the pong proves the server has processed it.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !authed.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        channel.ping().unwrap();
        while channel.last_pong().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let (other, _) = server_client(addr, "dana").await;
    let phone = TaskClient::new(other);
    phone
        .create(&TaskInput {
            priority: Priority::High,
            ..TaskInput::new("Added on phone")
        })
        .await
        .unwrap();

    let mut rx = view.subscribe();
    let found = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s: &ViewState| s.tasks.iter().any(|t| t.title == "Added on phone")),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(found.tasks.len(), 4);
    assert_eq!(found.error, None);
    channel.disconnect();
}

#[tokio::test]
async fn expired_session_surfaces_as_view_error() {
    let state = Arc::new(AppState::new());
    taskflow_server::api::seed_demo(&state, "erin", "pw").await.unwrap();
    let (addr, _handle) = taskflow_server::api::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let (transport, session) = server_client(addr, "erin").await;
    let mut events = session.subscribe();
    events.mark_unchanged();
    let view = TaskView::dashboard(TaskClient::new(transport));
    view.load().await;

    state.store.revoke(&session.token().unwrap()).await;
    view.refresh().await;

    let snapshot = view.snapshot();
    assert_eq!(snapshot.tasks.len(), 3);
    assert_eq!(snapshot.error.as_deref(), Some("Not authenticated"));
    assert!(!session.is_authenticated());
    assert!(events.has_changed().unwrap());
}
