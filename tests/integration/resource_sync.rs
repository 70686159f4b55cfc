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

//! Integration tests for the resource client: caching, request dedup and
//! cache invalidation on writes.
//!
//! Most tests run against the in-process [`LoopbackTransport`], which counts
//! requests per method and path. TTL tests run on paused tokio time. The
//! last group drives the same client over HTTP against the reference server.

use std::time::Duration;

use serde_json::json;
use taskflow::auth::AuthClient;
use taskflow::cache::{CacheKey, DEFAULT_TTL, ResourceKind};
use taskflow::http::loopback::LoopbackTransport;
use taskflow::http::remote::{DEFAULT_TIMEOUT, ReqwestTransport};
use taskflow::http::{HttpError, Method, Session};
use taskflow::resource::{ErrorKind, ProjectClient, TaskClient};
use taskflow_proto::auth::RegisterInput;
use taskflow_proto::project::ProjectInput;
use taskflow_proto::task::{Priority, TaskInput, TaskPatch};

const COLLECTION: CacheKey = CacheKey::Collection(ResourceKind::Tasks);

fn loopback() -> (TaskClient<LoopbackTransport>, LoopbackTransport) {
    let transport = LoopbackTransport::new();
    (TaskClient::new(transport.clone()), transport)
}

fn gets(transport: &LoopbackTransport, path: &str) -> usize {
    transport.request_count(Method::Get, path)
}

// =============================================================================
// Cache validity and expiry
// =============================================================================

#[tokio::test(start_paused = true)]
async fn collection_served_from_cache_within_ttl() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("Water the plants");

    let first = tasks.get_all().await.unwrap();
    transport.edit_record("tasks", &id, json!({"title": "Changed elsewhere"}));
    tokio::time::advance(DEFAULT_TTL - Duration::from_secs(1)).await;
    let second = tasks.get_all().await.unwrap();

    assert_eq!(gets(&transport, "/tasks"), 1);
    assert_eq!(first, second);
    assert_eq!(second[0].title, "Water the plants");
}

#[tokio::test(start_paused = true)]
async fn collection_refetched_after_ttl() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("Water the plants");

    tasks.get_all().await.unwrap();
    transport.edit_record("tasks", &id, json!({"title": "Changed elsewhere"}));
    tokio::time::advance(DEFAULT_TTL).await;
    let fresh = tasks.get_all().await.unwrap();

    assert_eq!(gets(&transport, "/tasks"), 2);
    assert_eq!(fresh[0].title, "Changed elsewhere");
}

#[tokio::test(start_paused = true)]
async fn custom_ttl_is_honoured() {
    let transport = LoopbackTransport::new();
    let tasks = TaskClient::with_ttl(transport.clone(), Duration::from_secs(2));
    let id = transport.insert_task("a");

    tasks.get_one(&id).await.unwrap();
    tokio::time::advance(Duration::from_millis(1999)).await;
    assert!(tasks.is_cached(&CacheKey::Item(ResourceKind::Tasks, id.clone())));
    tasks.get_one(&id).await.unwrap();
    assert_eq!(gets(&transport, &format!("/tasks/{id}")), 1);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(!tasks.is_cached(&CacheKey::Item(ResourceKind::Tasks, id.clone())));
    tasks.get_one(&id).await.unwrap();
    assert_eq!(gets(&transport, &format!("/tasks/{id}")), 2);
}

// =============================================================================
// Dedup of concurrent reads
// =============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_get_all_shares_one_request() {
    let (tasks, transport) = loopback();
    transport.insert_task("a");
    transport.insert_task("b");
    transport.set_latency(Duration::from_millis(50));

    let (a, b, c, d) = tokio::join!(
        tasks.get_all(),
        tasks.get_all(),
        tasks.get_all(),
        tasks.get_all()
    );

    assert_eq!(gets(&transport, "/tasks"), 1);
    let a = a.unwrap();
    assert_eq!(a.len(), 2);
    assert_eq!(a, b.unwrap());
    assert_eq!(a, c.unwrap());
    assert_eq!(a, d.unwrap());
    assert_eq!(tasks.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_failure_is_shared_and_not_cached() {
    let (tasks, transport) = loopback();
    transport.set_latency(Duration::from_millis(20));
    transport.fail_next(
        Method::Get,
        "/tasks",
        HttpError::Status {
            status: 503,
            message: Some("Maintenance".into()),
        },
    );

    let (a, b) = tokio::join!(tasks.get_all(), tasks.get_all());
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert_eq!(a, b);
    assert_eq!(a.message, "Maintenance");
    assert_eq!(a.kind, ErrorKind::Status);
    assert_eq!(gets(&transport, "/tasks"), 1);
    assert_eq!(tasks.pending_requests(), 0);

    assert!(tasks.get_all().await.is_ok());
    assert_eq!(gets(&transport, "/tasks"), 2);
}

#[tokio::test(start_paused = true)]
async fn dropped_caller_does_not_strand_pending_entry() {
    let (tasks, transport) = loopback();
    transport.insert_task("a");
    transport.set_latency(Duration::from_millis(100));

    let abandoned = tokio::time::timeout(Duration::from_millis(10), tasks.get_all()).await;
    assert!(abandoned.is_err());
    assert_eq!(tasks.pending_requests(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tasks.pending_requests(), 0);
    assert!(tasks.is_cached(&COLLECTION));

    tasks.get_all().await.unwrap();
    assert_eq!(gets(&transport, "/tasks"), 1);
}

#[tokio::test(start_paused = true)]
async fn different_keys_are_not_deduplicated() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("a");
    transport.set_latency(Duration::from_millis(20));

    let (all, one) = tokio::join!(tasks.get_all(), tasks.get_one(&id));
    assert_eq!(all.unwrap().len(), 1);
    assert_eq!(one.unwrap().title, "a");
    assert_eq!(transport.total_requests(), 2);
}

// =============================================================================
// Invalidation on write
// =============================================================================

#[tokio::test]
async fn create_invalidates_collection() {
    let (tasks, transport) = loopback();
    tasks.get_all().await.unwrap();
    assert!(tasks.is_cached(&COLLECTION));

    tasks.create(&TaskInput::new("new")).await.unwrap();
    assert!(!tasks.is_cached(&COLLECTION));
    assert_eq!(tasks.get_all().await.unwrap().len(), 1);
    assert_eq!(gets(&transport, "/tasks"), 2);
}

#[tokio::test]
async fn update_invalidates_collection() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("old");
    tasks.get_all().await.unwrap();

    let patch = TaskPatch {
        title: Some("new".into()),
        ..TaskPatch::default()
    };
    tasks.update(&id, &patch).await.unwrap();
    assert!(!tasks.is_cached(&COLLECTION));
    assert_eq!(tasks.get_all().await.unwrap()[0].title, "new");
    assert_eq!(gets(&transport, "/tasks"), 2);
}

#[tokio::test]
async fn delete_invalidates_collection_and_item() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("doomed");
    tasks.get_all().await.unwrap();
    tasks.get_one(&id).await.unwrap();

    tasks.delete(&id).await.unwrap();
    assert!(!tasks.is_cached(&COLLECTION));
    assert!(!tasks.is_cached(&CacheKey::Item(ResourceKind::Tasks, id.clone())));
    assert!(tasks.get_all().await.unwrap().is_empty());

    let err = tasks.get_one(&id).await.unwrap_err();
    assert_eq!(err.status, Some(404));
    assert_eq!(err.message, "Task not found");
}

#[tokio::test]
async fn toggle_invalidates_collection() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("flip");
    tasks.get_all().await.unwrap();

    let toggled = tasks.toggle_completion(&id).await.unwrap();
    assert!(toggled.completed);
    assert!(!tasks.is_cached(&COLLECTION));
    assert!(tasks.get_all().await.unwrap()[0].completed);
}

#[tokio::test]
async fn failed_update_leaves_cache_untouched() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("keep");
    tasks.get_all().await.unwrap();
    tasks.get_one(&id).await.unwrap();
    transport.fail_next(
        Method::Put,
        &format!("/tasks/{id}"),
        HttpError::Status {
            status: 500,
            message: None,
        },
    );

    let patch = TaskPatch {
        priority: Some(Priority::High),
        ..TaskPatch::default()
    };
    let err = tasks.update(&id, &patch).await.unwrap_err();
    assert_eq!(err.message, "Failed to update task");
    assert!(tasks.is_cached(&COLLECTION));
    assert_eq!(tasks.get_one(&id).await.unwrap().priority, Priority::Medium);
    assert_eq!(transport.total_requests(), 3);
}

// =============================================================================
// Single-item consistency
// =============================================================================

#[tokio::test]
async fn get_one_after_update_returns_server_value_without_refetch() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("draft");
    tasks.get_one(&id).await.unwrap();

    let patch = TaskPatch {
        title: Some("final".into()),
        priority: Some(Priority::Low),
        ..TaskPatch::default()
    };
    let updated = tasks.update(&id, &patch).await.unwrap();
    let read = tasks.get_one(&id).await.unwrap();

    assert_eq!(read, updated);
    assert_eq!(read.title, "final");
    assert_eq!(read, transport.task(&id).unwrap());
    assert_eq!(gets(&transport, &format!("/tasks/{id}")), 1);
}

#[tokio::test]
async fn older_updated_at_from_server_still_wins() {
    let (tasks, transport) = loopback();
    let id = transport.insert_task("draft");
    let cached = tasks.get_one(&id).await.unwrap();

    let path = format!("/tasks/{id}");
    let mut stale = serde_json::to_value(&cached).unwrap();
    stale["title"] = json!("final");
    stale["updated_at"] = json!(cached.updated_at - chrono::TimeDelta::hours(1));
    transport.reply_next(Method::Put, &path, stale);

    let patch = TaskPatch {
        title: Some("final".into()),
        ..TaskPatch::default()
    };
    let updated = tasks.update(&id, &patch).await.unwrap();
    assert!(updated.updated_at < cached.updated_at);

    let read = tasks.get_one(&id).await.unwrap();
    assert_eq!(read, updated);
    assert_eq!(read.title, "final");
    assert!(!tasks.is_cached(&COLLECTION));
    assert_eq!(gets(&transport, &path), 1);
}

#[tokio::test]
async fn buy_milk_appears_after_create() {
    let (tasks, transport) = loopback();
    transport.insert_task("Existing");
    tasks.get_all().await.unwrap();

    let created = tasks.create(&TaskInput::new("Buy milk")).await.unwrap();
    assert!(!tasks.is_cached(&COLLECTION));

    let before = gets(&transport, "/tasks");
    let all = tasks.get_all().await.unwrap();
    assert_eq!(gets(&transport, "/tasks"), before + 1);
    assert!(all.iter().any(|t| t.id == created.id && t.title == "Buy milk"));
}

// =============================================================================
// End to end over HTTP
// =============================================================================

async fn logged_in_transport() -> (ReqwestTransport, std::sync::Arc<taskflow_server::api::AppState>) {
    let (addr, state, _handle) = taskflow_server::api::start_server("127.0.0.1:0")
        .await
        .unwrap();
    let session = Session::default();
    let transport =
        ReqwestTransport::new(format!("http://{addr}"), DEFAULT_TIMEOUT, session.clone()).unwrap();
    let auth = AuthClient::new(transport.clone(), session);
    auth.register(&RegisterInput {
        username: "alice".into(),
        email: "alice@example.com".into(),
        password: "secret".into(),
        full_name: None,
    })
    .await
    .unwrap();
    auth.login("alice", "secret").await.unwrap();
    (transport, state)
}

#[tokio::test]
async fn crud_against_server() {
    let (transport, state) = logged_in_transport().await;
    let tasks = TaskClient::new(transport);

    assert!(tasks.get_all().await.unwrap().is_empty());

    let created = tasks
        .create(&TaskInput {
            priority: Priority::High,
            ..TaskInput::new("Buy milk")
        })
        .await
        .unwrap();
    let listed = tasks.get_all().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);

    let id = created.id.as_str();
    let toggled = tasks.toggle_completion(id).await.unwrap();
    assert!(toggled.completed);
    assert!(toggled.updated_at >= created.updated_at);
    assert_eq!(tasks.get_one(id).await.unwrap(), toggled);

    tasks.delete(id).await.unwrap();
    assert!(tasks.get_all().await.unwrap().is_empty());
    assert_eq!(state.requests.count("GET", "/tasks/{id}").await, 0);
}

#[tokio::test]
async fn server_validation_message_reaches_caller() {
    let (transport, _state) = logged_in_transport().await;
    let projects = ProjectClient::new(transport);

    let err = projects
        .create(&ProjectInput {
            name: "  ".into(),
            ..ProjectInput::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.status, Some(422));
    assert_eq!(err.message, "Project name cannot be empty");
}

#[tokio::test]
async fn server_dedups_through_client() {
    let (transport, state) = logged_in_transport().await;
    let tasks = TaskClient::new(transport);
    tasks.create(&TaskInput::new("a")).await.unwrap();
    state.set_latency(Duration::from_millis(50)).await;

    let (a, b, c) = tokio::join!(tasks.get_all(), tasks.get_all(), tasks.get_all());
    assert_eq!(a.unwrap(), b.unwrap());
    assert!(c.is_ok());
    assert_eq!(state.requests.count("GET", "/tasks").await, 1);
}
