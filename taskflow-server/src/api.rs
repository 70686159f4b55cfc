//! REST routes, shared state and server startup.
//!
//! Routes mirror the production API the client is written against:
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | POST | `/auth/login` | form (`grant_type`, `username`, `password`) |
//! | POST | `/auth/register` | JSON [`RegisterInput`] |
//! | GET | `/auth/me` | |
//! | GET/POST | `/tasks` | JSON [`TaskInput`] |
//! | GET/PUT/DELETE | `/tasks/{id}` | JSON [`TaskPatch`] |
//! | PATCH | `/tasks/{id}/toggle-completion` | |
//! | GET/POST | `/projects`, `/tags` | |
//! | GET/PUT/DELETE | `/projects/{id}`, `/tags/{id}` | |
//! | GET | `/notifications`, `/notifications/unread-count` | |
//! | GET | `/ws/notifications/{user_id}?token=` | WebSocket upgrade |
//!
//! Errors are JSON objects of the form `{"detail": "..."}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Form, Json, Router};
use tokio::sync::RwLock;

use taskflow_proto::auth::{LoginForm, RegisterInput, Token, User};
use taskflow_proto::notification::Notification;
use taskflow_proto::project::{Project, ProjectInput, ProjectPatch, Tag, TagInput, TagPatch};
use taskflow_proto::task::{Priority, Task, TaskInput, TaskPatch};

use crate::notify::{self, NotificationHub};
use crate::store::{Store, StoreError};

/// Counts requests per `METHOD route` pair (route as declared, e.g. `/tasks/{id}`).
#[derive(Debug, Default)]
pub struct RequestLog {
    counts: RwLock<HashMap<String, u64>>,
}

impl RequestLog {
    async fn record(&self, method: &str, route: &str) {
        *self
            .counts
            .write()
            .await
            .entry(format!("{method} {route}"))
            .or_default() += 1;
    }

    /// Number of requests seen for `method` on `route`.
    pub async fn count(&self, method: &str, route: &str) -> u64 {
        self.counts
            .read()
            .await
            .get(&format!("{method} {route}"))
            .copied()
            .unwrap_or(0)
    }
}

/// Shared server state: the store, the notification hub and test hooks.
#[derive(Debug, Default)]
pub struct AppState {
    /// Accounts, tasks, projects, tags and notifications.
    pub store: Store,
    /// Live notification sockets.
    pub hub: NotificationHub,
    /// Per-route request counts.
    pub requests: RequestLog,
    latency: RwLock<Duration>,
}

impl AppState {
    /// Creates empty server state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every REST response by `latency`. Used to hold requests in
    /// flight long enough to observe client-side request sharing.
    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.write().await = latency;
    }

    /// Pushes a task mutation's notification to the owner's sockets.
    async fn announce(&self, owner: &str, notification: Notification) {
        let delivered = self.hub.publish(owner, notification).await;
        tracing::debug!(user_id = %owner, delivered, "notification published");
    }
}

/// A JSON error response: `{"detail": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Not authenticated")
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::InvalidCredentials => StatusCode::UNAUTHORIZED,
        };
        Self::new(status, capitalize(&err.to_string()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "detail": self.detail })),
        )
            .into_response()
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

/// Resolves the bearer token in `headers` to a user.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(ApiError::unauthorized)?;
    state
        .store
        .authenticate(token)
        .await
        .ok_or_else(ApiError::unauthorized)
}

type Shared = State<Arc<AppState>>;

// -- Auth --------------------------------------------------------------------

async fn login(State(state): Shared, Form(form): Form<LoginForm>) -> Result<Json<Token>, ApiError> {
    if form.grant_type != "password" {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Unsupported grant type",
        ));
    }
    Ok(Json(state.store.login(&form.username, &form.password).await?))
}

async fn register(
    State(state): Shared,
    Json(input): Json<RegisterInput>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    let user = state.store.register(input).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn me(State(state): Shared, headers: HeaderMap) -> Result<Json<User>, ApiError> {
    Ok(Json(authorize(&state, &headers).await?))
}

// -- Tasks -------------------------------------------------------------------

async fn list_tasks(State(state): Shared, headers: HeaderMap) -> Result<Json<Vec<Task>>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.list_tasks(&user.id).await))
}

async fn get_task(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.get_task(&user.id, &id).await?))
}

async fn create_task(
    State(state): Shared,
    headers: HeaderMap,
    Json(input): Json<TaskInput>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let user = authorize(&state, &headers).await?;
    let (task, notification) = state.store.create_task(&user.id, input).await?;
    state.announce(&user.id, notification).await;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn update_task(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<TaskPatch>,
) -> Result<Json<Task>, ApiError> {
    let user = authorize(&state, &headers).await?;
    let (task, notification) = state.store.update_task(&user.id, &id, &patch).await?;
    state.announce(&user.id, notification).await;
    Ok(Json(task))
}

async fn toggle_task(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    let user = authorize(&state, &headers).await?;
    let (task, notification) = state.store.toggle_task(&user.id, &id).await?;
    state.announce(&user.id, notification).await;
    Ok(Json(task))
}

async fn delete_task(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = authorize(&state, &headers).await?;
    let notification = state.store.delete_task(&user.id, &id).await?;
    state.announce(&user.id, notification).await;
    Ok(StatusCode::NO_CONTENT)
}

// -- Projects ----------------------------------------------------------------

async fn list_projects(
    State(state): Shared,
    headers: HeaderMap,
) -> Result<Json<Vec<Project>>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.list_projects(&user.id).await))
}

async fn get_project(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Project>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.get_project(&user.id, &id).await?))
}

async fn create_project(
    State(state): Shared,
    headers: HeaderMap,
    Json(input): Json<ProjectInput>,
) -> Result<(StatusCode, Json<Project>), ApiError> {
    let user = authorize(&state, &headers).await?;
    let project = state.store.create_project(&user.id, input).await?;
    Ok((StatusCode::CREATED, Json(project)))
}

async fn update_project(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<ProjectPatch>,
) -> Result<Json<Project>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.update_project(&user.id, &id, patch).await?))
}

async fn delete_project(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = authorize(&state, &headers).await?;
    state.store.delete_project(&user.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Tags --------------------------------------------------------------------

async fn list_tags(State(state): Shared, headers: HeaderMap) -> Result<Json<Vec<Tag>>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.list_tags(&user.id).await))
}

async fn get_tag(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Tag>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.get_tag(&user.id, &id).await?))
}

async fn create_tag(
    State(state): Shared,
    headers: HeaderMap,
    Json(input): Json<TagInput>,
) -> Result<(StatusCode, Json<Tag>), ApiError> {
    let user = authorize(&state, &headers).await?;
    let tag = state.store.create_tag(&user.id, input).await?;
    Ok((StatusCode::CREATED, Json(tag)))
}

async fn update_tag(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<TagPatch>,
) -> Result<Json<Tag>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.update_tag(&user.id, &id, patch).await?))
}

async fn delete_tag(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = authorize(&state, &headers).await?;
    state.store.delete_tag(&user.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// -- Notifications -----------------------------------------------------------

async fn list_notifications(
    State(state): Shared,
    headers: HeaderMap,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let user = authorize(&state, &headers).await?;
    Ok(Json(state.store.list_notifications(&user.id).await))
}

async fn unread_count(
    State(state): Shared,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = authorize(&state, &headers).await?;
    let count = state.store.unread_count(&user.id).await;
    Ok(Json(serde_json::json!({ "count": count })))
}

// -- Middleware --------------------------------------------------------------

async fn observe(State(state): Shared, req: Request, next: Next) -> Response {
    let route = req.extensions().get::<MatchedPath>().map_or_else(
        || req.uri().path().to_string(),
        |path| path.as_str().to_string(),
    );
    state.requests.record(req.method().as_str(), &route).await;
    let latency = *state.latency.read().await;
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
    next.run(req).await
}

/// Builds the full router over `state`.
pub fn router(state: Arc<AppState>) -> Router {
    let rest = Router::new()
        .route("/auth/login", post(login))
        .route("/auth/register", post(register))
        .route("/auth/me", get(me))
        .route("/tasks", get(list_tasks).post(create_task))
        .route(
            "/tasks/{id}",
            get(get_task).put(update_task).delete(delete_task),
        )
        .route("/tasks/{id}/toggle-completion", patch(toggle_task))
        .route("/projects", get(list_projects).post(create_project))
        .route(
            "/projects/{id}",
            get(get_project).put(update_project).delete(delete_project),
        )
        .route("/tags", get(list_tags).post(create_tag))
        .route("/tags/{id}", get(get_tag).put(update_tag).delete(delete_tag))
        .route("/notifications", get(list_notifications))
        .route("/notifications/unread-count", get(unread_count))
        .route_layer(middleware::from_fn_with_state(Arc::clone(&state), observe));

    rest.route("/ws/notifications/{user_id}", get(notify::ws_handler))
        .with_state(state)
}

/// Creates an account and a handful of tasks for demos.
///
/// # Errors
///
/// Returns [`StoreError`] if the account cannot be created.
pub async fn seed_demo(state: &AppState, username: &str, password: &str) -> Result<User, StoreError> {
    let user = state
        .store
        .register(RegisterInput {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password: password.to_string(),
            full_name: None,
        })
        .await?;
    let samples = [
        ("Review pull requests", Priority::High),
        ("Plan the sprint", Priority::Medium),
        ("Water the plants", Priority::Low),
    ];
    for (title, priority) in samples {
        let input = TaskInput {
            priority,
            ..TaskInput::new(title)
        };
        state.store.create_task(&user.id, input).await?;
    }
    state.store.mark_all_read(&user.id).await;
    Ok(user)
}

/// Starts the server on the given address with fresh state.
///
/// Returns the actual bound address (useful when binding to port 0),
/// the shared state and a [`tokio::task::JoinHandle`] for the server task.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (
        std::net::SocketAddr,
        Arc<AppState>,
        tokio::task::JoinHandle<()>,
    ),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let state = Arc::new(AppState::new());
    let (bound, handle) = start_server_with_state(addr, Arc::clone(&state)).await?;
    Ok((bound, state, handle))
}

/// Starts the server with pre-built [`AppState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<AppState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}
