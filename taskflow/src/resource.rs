//! Generic resource client: read-through cache, read sharing and write
//! invalidation over an [`HttpTransport`].
//!
//! One [`ResourceClient`] exists per resource type and owns its cache and its
//! map of in-flight reads. Reads check the in-flight map first (concurrent
//! callers share one network call), then the cache, then the network.
//! Successful writes invalidate or overwrite the affected cache entries;
//! failed writes leave the cache untouched.
//!
//! ```rust,no_run
//! use taskflow::http::loopback::LoopbackTransport;
//! use taskflow::resource::TaskClient;
//! use taskflow_proto::task::TaskInput;
//!
//! # async fn example() -> Result<(), taskflow::resource::ResourceError> {
//! let tasks = TaskClient::new(LoopbackTransport::new());
//! let created = tasks.create(&TaskInput::new("Buy milk")).await?;
//! let all = tasks.get_all().await?;
//! assert!(all.iter().any(|t| t.id == created.id));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;

use taskflow_proto::project::{Project, ProjectInput, ProjectPatch, Tag, TagInput, TagPatch};
use taskflow_proto::task::{Task, TaskInput, TaskPatch, validate_title};

use crate::cache::{CacheKey, DEFAULT_TTL, ResourceKind, ResponseCache};
use crate::http::{ApiRequest, HttpError, HttpTransport};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// The client operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `get_all`
    FetchAll,
    /// `get_one`
    FetchOne,
    /// `create`
    Create,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `toggle_completion`
    ToggleCompletion,
}

impl Operation {
    /// The message shown when the server gives no reason of its own.
    #[must_use]
    pub fn default_message(self, kind: ResourceKind) -> String {
        match self {
            Self::FetchAll => format!("Failed to fetch {}", kind.plural()),
            Self::FetchOne => format!("Failed to fetch {}", kind.singular()),
            Self::Create => format!("Failed to create {}", kind.singular()),
            Self::Update => format!("Failed to update {}", kind.singular()),
            Self::Delete => format!("Failed to delete {}", kind.singular()),
            Self::ToggleCompletion => "Failed to toggle task completion".to_string(),
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FetchAll => "get_all",
            Self::FetchOne => "get_one",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::ToggleCompletion => "toggle_completion",
        };
        f.write_str(name)
    }
}

/// Broad category of a [`ResourceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Timeout or connection failure.
    Transport,
    /// The server rejected the session (401).
    Unauthorized,
    /// Any other non-success status.
    Status,
    /// Rejected locally before any request was sent.
    Validation,
    /// The response (or request body) could not be converted.
    Decode,
}

/// A failed resource operation with a user-facing message.
///
/// `message` is the server's own message when it sent one, otherwise the
/// operation's default (e.g. "Failed to fetch tasks"). Cloneable so one
/// shared in-flight result can be handed to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ResourceError {
    /// Operation that failed.
    pub operation: Operation,
    /// Error category.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// HTTP status, when the server answered.
    pub status: Option<u16>,
}

impl ResourceError {
    fn from_http(operation: Operation, resource: ResourceKind, err: &HttpError) -> Self {
        let kind = match err {
            HttpError::Timeout | HttpError::Network(_) => ErrorKind::Transport,
            HttpError::Unauthorized { .. } => ErrorKind::Unauthorized,
            HttpError::Status { .. } => ErrorKind::Status,
            HttpError::Decode(_) => ErrorKind::Decode,
        };
        Self {
            operation,
            kind,
            message: err
                .server_message()
                .map_or_else(|| operation.default_message(resource), str::to_string),
            status: err.status(),
        }
    }

    fn validation(operation: Operation, message: String) -> Self {
        Self {
            operation,
            kind: ErrorKind::Validation,
            message,
            status: None,
        }
    }

    fn decode(operation: Operation, resource: ResourceKind, err: &serde_json::Error) -> Self {
        tracing::warn!(%operation, %resource, error = %err, "unexpected payload");
        Self {
            operation,
            kind: ErrorKind::Decode,
            message: operation.default_message(resource),
            status: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Resource descriptions
// ---------------------------------------------------------------------------

/// Describes one REST resource: its path, item type and request bodies.
pub trait Resource: Send + Sync + 'static {
    /// Which resource this is.
    const KIND: ResourceKind;
    /// Item as returned by the server.
    type Item: DeserializeOwned + Clone + Send + Sync + 'static;
    /// Create body.
    type Input: Serialize + Send + Sync;
    /// Update body.
    type Patch: Serialize + Send + Sync;

    /// Server-assigned id of an item.
    fn id(item: &Self::Item) -> &str;

    /// Rejects a create body before it is sent.
    ///
    /// # Errors
    ///
    /// Returns the user-facing reason for rejecting the body.
    fn validate_input(_input: &Self::Input) -> Result<(), String> {
        Ok(())
    }

    /// Rejects an update body before it is sent.
    ///
    /// # Errors
    ///
    /// Returns the user-facing reason for rejecting the body.
    fn validate_patch(_patch: &Self::Patch) -> Result<(), String> {
        Ok(())
    }

    /// Last modification time, when the item carries one.
    fn updated_at(_item: &Self::Item) -> Option<DateTime<Utc>> {
        None
    }
}

/// The `/tasks` resource.
#[derive(Debug, Clone, Copy)]
pub struct Tasks;

impl Resource for Tasks {
    const KIND: ResourceKind = ResourceKind::Tasks;
    type Item = Task;
    type Input = TaskInput;
    type Patch = TaskPatch;

    fn id(item: &Task) -> &str {
        item.id.as_str()
    }

    fn validate_input(input: &TaskInput) -> Result<(), String> {
        validate_title(&input.title)
    }

    fn validate_patch(patch: &TaskPatch) -> Result<(), String> {
        patch.title.as_deref().map_or(Ok(()), validate_title)
    }

    fn updated_at(item: &Task) -> Option<DateTime<Utc>> {
        Some(item.updated_at)
    }
}

/// The `/projects` resource.
#[derive(Debug, Clone, Copy)]
pub struct Projects;

impl Resource for Projects {
    const KIND: ResourceKind = ResourceKind::Projects;
    type Item = Project;
    type Input = ProjectInput;
    type Patch = ProjectPatch;

    fn id(item: &Project) -> &str {
        &item.id
    }

    fn updated_at(item: &Project) -> Option<DateTime<Utc>> {
        Some(item.updated_at)
    }
}

/// The `/tags` resource.
#[derive(Debug, Clone, Copy)]
pub struct Tags;

impl Resource for Tags {
    const KIND: ResourceKind = ResourceKind::Tags;
    type Item = Tag;
    type Input = TagInput;
    type Patch = TagPatch;

    fn id(item: &Tag) -> &str {
        &item.id
    }

    fn updated_at(item: &Tag) -> Option<DateTime<Utc>> {
        Some(item.updated_at)
    }
}

/// Client for `/tasks`.
pub type TaskClient<T> = ResourceClient<Tasks, T>;
/// Client for `/projects`.
pub type ProjectClient<T> = ResourceClient<Projects, T>;
/// Client for `/tags`.
pub type TagClient<T> = ResourceClient<Tags, T>;

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A cached response: a whole collection or a single item.
#[derive(Debug, Clone)]
enum Cached<I> {
    All(Vec<I>),
    One(I),
}

type SharedFetch<I> = Shared<BoxFuture<'static, Result<Cached<I>, ResourceError>>>;

struct ClientState<I> {
    cache: ResponseCache<Cached<I>>,
    pending: HashMap<CacheKey, SharedFetch<I>>,
}

struct Inner<R: Resource, T> {
    transport: T,
    state: Mutex<ClientState<R::Item>>,
    _resource: PhantomData<fn() -> R>,
}

/// Cached, deduplicating client for one resource type.
///
/// Cloning is cheap; clones share the cache and in-flight map.
pub struct ResourceClient<R: Resource, T> {
    inner: Arc<Inner<R, T>>,
}

impl<R: Resource, T> Clone for ResourceClient<R, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource, T> fmt::Debug for ResourceClient<R, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResourceClient")
            .field("kind", &R::KIND)
            .field("cached", &state.cache.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

fn key_path(key: &CacheKey) -> String {
    match key {
        CacheKey::Collection(kind) => kind.path().to_string(),
        CacheKey::Item(kind, id) => format!("{}/{id}", kind.path()),
    }
}

impl<R: Resource, T: HttpTransport> ResourceClient<R, T> {
    /// Creates a client with the default five-minute TTL.
    pub fn new(transport: T) -> Self {
        Self::with_ttl(transport, DEFAULT_TTL)
    }

    /// Creates a client whose cache entries live for `ttl`.
    pub fn with_ttl(transport: T, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                state: Mutex::new(ClientState {
                    cache: ResponseCache::new(ttl),
                    pending: HashMap::new(),
                }),
                _resource: PhantomData,
            }),
        }
    }

    /// The transport this client sends through.
    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Fetches the whole collection.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] with the server's message, or
    /// "Failed to fetch {plural}" when it gave none.
    pub async fn get_all(&self) -> Result<Vec<R::Item>, ResourceError> {
        match self
            .read(CacheKey::Collection(R::KIND), Operation::FetchAll)
            .await?
        {
            Cached::All(items) => Ok(items),
            Cached::One(item) => Ok(vec![item]),
        }
    }

    /// Fetches one item by id.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceError`] with the server's message, or
    /// "Failed to fetch {singular}" when it gave none.
    pub async fn get_one(&self, id: &str) -> Result<R::Item, ResourceError> {
        let key = CacheKey::Item(R::KIND, id.to_string());
        match self.read(key, Operation::FetchOne).await? {
            Cached::One(item) => Ok(item),
            Cached::All(items) => items
                .into_iter()
                .find(|item| R::id(item) == id)
                .ok_or_else(|| ResourceError {
                    operation: Operation::FetchOne,
                    kind: ErrorKind::Decode,
                    message: Operation::FetchOne.default_message(R::KIND),
                    status: None,
                }),
        }
    }

    /// Creates an item. The collection entry is invalidated so the next
    /// [`get_all`](Self::get_all) refetches.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error before sending if the body is rejected
    /// locally, or the server's error otherwise.
    pub async fn create(&self, input: &R::Input) -> Result<R::Item, ResourceError> {
        let op = Operation::Create;
        R::validate_input(input).map_err(|reason| ResourceError::validation(op, reason))?;
        let body = serde_json::to_value(input).map_err(|e| ResourceError::decode(op, R::KIND, &e))?;
        let value = self
            .send(op, ApiRequest::post(R::KIND.path()).json(body))
            .await?;
        let item: R::Item = decode(op, value)?;

        self.inner
            .state
            .lock()
            .cache
            .remove(&CacheKey::Collection(R::KIND));
        tracing::debug!(resource = %R::KIND, id = R::id(&item), "created");
        Ok(item)
    }

    /// Replaces fields of an item (`PUT`). The item entry is overwritten
    /// with the server's response and the collection entry invalidated.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error before sending if the patch is rejected
    /// locally, or the server's error otherwise. The cache is untouched on
    /// failure.
    pub async fn update(&self, id: &str, patch: &R::Patch) -> Result<R::Item, ResourceError> {
        let op = Operation::Update;
        R::validate_patch(patch).map_err(|reason| ResourceError::validation(op, reason))?;
        let body = serde_json::to_value(patch).map_err(|e| ResourceError::decode(op, R::KIND, &e))?;
        let path = key_path(&CacheKey::Item(R::KIND, id.to_string()));
        let value = self.send(op, ApiRequest::put(path).json(body)).await?;
        let item: R::Item = decode(op, value)?;
        self.store_fresh(id, &item);
        Ok(item)
    }

    /// Deletes an item and purges both its entry and the collection entry.
    ///
    /// # Errors
    ///
    /// Returns the server's error; the cache is untouched on failure.
    pub async fn delete(&self, id: &str) -> Result<(), ResourceError> {
        let op = Operation::Delete;
        let key = CacheKey::Item(R::KIND, id.to_string());
        self.send(op, ApiRequest::delete(key_path(&key))).await?;

        let mut state = self.inner.state.lock();
        state.cache.remove(&key);
        state.cache.remove(&CacheKey::Collection(R::KIND));
        drop(state);
        tracing::debug!(resource = %R::KIND, id, "deleted");
        Ok(())
    }

    /// Drops the cached item and collection so the next read refetches.
    pub fn invalidate(&self, id: &str) {
        let mut state = self.inner.state.lock();
        state.cache.remove(&CacheKey::Item(R::KIND, id.to_string()));
        state.cache.remove(&CacheKey::Collection(R::KIND));
    }

    /// Drops every cached entry of this resource.
    pub fn invalidate_all(&self) {
        self.inner.state.lock().cache.remove_kind(R::KIND);
    }

    /// Whether a valid (unexpired) entry exists for `key`.
    #[must_use]
    pub fn is_cached(&self, key: &CacheKey) -> bool {
        self.inner
            .state
            .lock()
            .cache
            .get(key, Instant::now())
            .is_some()
    }

    /// Number of reads currently in flight.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    async fn send(&self, op: Operation, request: ApiRequest) -> Result<Value, ResourceError> {
        self.inner.transport.send(request).await.map_err(|e| {
            tracing::warn!(operation = %op, resource = %R::KIND, error = %e, "request failed");
            ResourceError::from_http(op, R::KIND, &e)
        })
    }

    /// Overwrites the item entry with a server-confirmed value and
    /// invalidates the collection.
    fn store_fresh(&self, id: &str, item: &R::Item) {
        let key = CacheKey::Item(R::KIND, id.to_string());
        let mut state = self.inner.state.lock();
        let replaced = state
            .cache
            .insert(key, Cached::One(item.clone()), Instant::now());
        state.cache.remove(&CacheKey::Collection(R::KIND));
        drop(state);
        if let Some(Cached::One(old)) = replaced {
            warn_if_older::<R>(id, &old, item);
        }
    }

    /// Pending fetch first, then a valid cache entry, then the network.
    async fn read(&self, key: CacheKey, op: Operation) -> Result<Cached<R::Item>, ResourceError> {
        let fetch = {
            let mut state = self.inner.state.lock();
            if let Some(pending) = state.pending.get(&key) {
                tracing::trace!(%key, "joining in-flight request");
                pending.clone()
            } else if let Some(hit) = state.cache.get(&key, Instant::now()) {
                tracing::trace!(%key, "cache hit");
                return Ok(hit.clone());
            } else {
                let fetch = self.spawn_fetch(key.clone(), op);
                state.pending.insert(key, fetch.clone());
                fetch
            }
        };
        fetch.await
    }

    /// Spawns the network fetch for `key` so it runs to completion (and
    /// clears its pending entry) even if every caller stops waiting.
    ///
    /// Must be called with the state lock held, so the task cannot remove its
    /// pending entry before the caller has inserted it.
    fn spawn_fetch(&self, key: CacheKey, op: Operation) -> SharedFetch<R::Item> {
        let client = self.clone();
        let handle = tokio::spawn(async move {
            let result = client.load(&key, op).await;
            let now = Instant::now();
            let mut state = client.inner.state.lock();
            state.pending.remove(&key);
            if let Ok(value) = &result {
                let replaced = state.cache.insert(key.clone(), value.clone(), now);
                let evicted = state.cache.sweep(now);
                drop(state);
                if evicted > 0 {
                    tracing::debug!(evicted, "swept expired cache entries");
                }
                if let (CacheKey::Item(_, id), Some(Cached::One(old)), Cached::One(new)) =
                    (&key, replaced, value)
                {
                    warn_if_older::<R>(id, &old, new);
                }
            }
            result
        });

        async move {
            handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "fetch task failed");
                Err(ResourceError {
                    operation: op,
                    kind: ErrorKind::Transport,
                    message: op.default_message(R::KIND),
                    status: None,
                })
            })
        }
        .boxed()
        .shared()
    }

    async fn load(&self, key: &CacheKey, op: Operation) -> Result<Cached<R::Item>, ResourceError> {
        let value = self.send(op, ApiRequest::get(key_path(key))).await?;
        match key {
            CacheKey::Collection(_) => decode(op, value).map(Cached::All),
            CacheKey::Item(..) => decode(op, value).map(Cached::One),
        }
    }
}

impl<T: HttpTransport> ResourceClient<Tasks, T> {
    /// Flips a task's completion flag (`PATCH /tasks/{id}/toggle-completion`).
    /// Cache handling matches [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// Returns the server's error, or "Failed to toggle task completion".
    pub async fn toggle_completion(&self, id: &str) -> Result<Task, ResourceError> {
        let op = Operation::ToggleCompletion;
        let path = format!("{}/{id}/toggle-completion", ResourceKind::Tasks.path());
        let value = self.send(op, ApiRequest::patch(path)).await?;
        let task: Task = decode(op, value)?;
        self.store_fresh(id, &task);
        Ok(task)
    }
}

fn decode<I: DeserializeOwned>(op: Operation, value: Value) -> Result<I, ResourceError> {
    serde_json::from_value(value).map_err(|e| ResourceError {
        operation: op,
        kind: ErrorKind::Decode,
        message: format!("Unexpected response: {e}"),
        status: None,
    })
}

fn warn_if_older<R: Resource>(id: &str, old: &R::Item, new: &R::Item) {
    if let (Some(before), Some(after)) = (R::updated_at(old), R::updated_at(new))
        && after < before
    {
        tracing::warn!(
            resource = %R::KIND,
            id,
            %before,
            %after,
            "server returned an older updated_at; keeping server value"
        );
    }
}
