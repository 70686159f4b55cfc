//! View-state adapters.
//!
//! A [`TaskView`] holds the task list a screen renders and publishes it as a
//! [`ViewState`] over a `watch` channel. Mutations are confirm-then-patch:
//! nothing changes in the published list until the server has confirmed the
//! write. Errors are published as display strings and the previous list stays
//! visible.

pub mod filter;
pub mod stats;

use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;
use tokio::sync::watch;

use taskflow_proto::notification::kinds;
use taskflow_proto::task::{Task, TaskInput, TaskPatch};

use crate::http::HttpTransport;
use crate::realtime::{HandlerId, NotificationChannel};
use crate::resource::{ResourceError, TaskClient};

pub use filter::{SortKey, TaskFilter};
pub use stats::DashboardStats;

/// What a task screen renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    /// Tasks in server order.
    pub tasks: Vec<Task>,
    /// A load is in progress.
    pub loading: bool,
    /// Message of the last failed operation, cleared by the next success.
    pub error: Option<String>,
}

/// How a view reflects a confirmed mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MutationStrategy {
    /// Patch the published list with the server's response.
    #[default]
    ConfirmThenPatch,
    /// Refetch the whole list. Used where one action may touch several
    /// tasks, as in the assistant chat.
    ConfirmThenRefetch,
}

/// State holder for one task screen.
///
/// Cloning is cheap; clones publish to the same receivers.
pub struct TaskView<T> {
    client: TaskClient<T>,
    strategy: MutationStrategy,
    state: Arc<watch::Sender<ViewState>>,
}

impl<T> Clone for TaskView<T> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            strategy: self.strategy,
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> std::fmt::Debug for TaskView<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskView")
            .field("strategy", &self.strategy)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

enum Change {
    Upsert(Task),
    Remove(String),
}

impl<T: HttpTransport> TaskView<T> {
    /// Creates a view over `client` with an empty, idle state.
    #[must_use]
    pub fn new(client: TaskClient<T>, strategy: MutationStrategy) -> Self {
        let (state, _) = watch::channel(ViewState::default());
        Self {
            client,
            strategy,
            state: Arc::new(state),
        }
    }

    /// Dashboard view: patches the list in place.
    #[must_use]
    pub fn dashboard(client: TaskClient<T>) -> Self {
        Self::new(client, MutationStrategy::ConfirmThenPatch)
    }

    /// Chat view: refetches after every confirmed mutation.
    #[must_use]
    pub fn chat(client: TaskClient<T>) -> Self {
        Self::new(client, MutationStrategy::ConfirmThenRefetch)
    }

    /// Receiver observing every published state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewState> {
        self.state.subscribe()
    }

    /// Current state.
    #[must_use]
    pub fn snapshot(&self) -> ViewState {
        self.state.borrow().clone()
    }

    /// The underlying resource client.
    #[must_use]
    pub const fn client(&self) -> &TaskClient<T> {
        &self.client
    }

    /// Loads the list (from cache when valid) and publishes it.
    pub async fn load(&self) {
        self.state.send_modify(|s| s.loading = true);
        match self.client.get_all().await {
            Ok(tasks) => self.state.send_modify(|s| {
                s.tasks = tasks;
                s.loading = false;
                s.error = None;
            }),
            Err(e) => {
                tracing::warn!(error = %e, "failed to load tasks");
                self.state.send_modify(|s| {
                    s.loading = false;
                    s.error = Some(e.message);
                });
            }
        }
    }

    /// Drops the cached list and loads it from the server.
    pub async fn refresh(&self) {
        self.client.invalidate_all();
        self.load().await;
    }

    /// Creates a task and shows it once the server confirms.
    ///
    /// # Errors
    ///
    /// Returns the client error; its message is also published.
    pub async fn create(&self, input: &TaskInput) -> Result<Task, ResourceError> {
        let result = self.client.create(input).await;
        self.confirm(result, |task| Change::Upsert(task.clone()))
            .await
    }

    /// Updates a task and shows the server's version once confirmed.
    ///
    /// # Errors
    ///
    /// Returns the client error; its message is also published.
    pub async fn update(&self, id: &str, patch: &TaskPatch) -> Result<Task, ResourceError> {
        let result = self.client.update(id, patch).await;
        self.confirm(result, |task| Change::Upsert(task.clone()))
            .await
    }

    /// Toggles completion and shows the server's version once confirmed.
    ///
    /// # Errors
    ///
    /// Returns the client error; its message is also published.
    pub async fn toggle(&self, id: &str) -> Result<Task, ResourceError> {
        let result = self.client.toggle_completion(id).await;
        self.confirm(result, |task| Change::Upsert(task.clone()))
            .await
    }

    /// Deletes a task and removes it once the server confirms.
    ///
    /// # Errors
    ///
    /// Returns the client error; its message is also published.
    pub async fn delete(&self, id: &str) -> Result<(), ResourceError> {
        let result = self.client.delete(id).await;
        self.confirm(result, |_| Change::Remove(id.to_string()))
            .await
    }

    async fn confirm<V>(
        &self,
        result: Result<V, ResourceError>,
        change: impl FnOnce(&V) -> Change,
    ) -> Result<V, ResourceError> {
        match result {
            Ok(value) => {
                match self.strategy {
                    MutationStrategy::ConfirmThenPatch => {
                        let change = change(&value);
                        self.state.send_modify(|s| {
                            apply(&mut s.tasks, change);
                            s.error = None;
                        });
                    }
                    MutationStrategy::ConfirmThenRefetch => self.load().await,
                }
                Ok(value)
            }
            Err(e) => {
                self.state.send_modify(|s| s.error = Some(e.message.clone()));
                Err(e)
            }
        }
    }

    /// Visible tasks after filtering and sorting.
    #[must_use]
    pub fn visible(&self, filter: &TaskFilter, sort: SortKey) -> Vec<Task> {
        let mut tasks = filter.apply(&self.state.borrow().tasks);
        sort.sort(&mut tasks);
        tasks
    }

    /// Dashboard counts for the current list.
    #[must_use]
    pub fn stats(&self, today: NaiveDate) -> DashboardStats {
        DashboardStats::from_tasks(&self.state.borrow().tasks, today)
    }

    /// Keeps the view current from pushed notifications: each
    /// `new_notification` invalidates the affected entries and reloads in the
    /// background. Returns the handler id for
    /// [`NotificationChannel::off`].
    pub fn attach_realtime(&self, channel: &NotificationChannel) -> HandlerId {
        let view = self.clone();
        channel.on(kinds::NEW_NOTIFICATION, move |frame: &Value| {
            let task_id = frame
                .get("notification")
                .and_then(|n| n.get("task_id"))
                .and_then(Value::as_str);
            match task_id {
                Some(id) => view.client.invalidate(id),
                None => view.client.invalidate_all(),
            }
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                tracing::debug!("no runtime for background refresh");
                return;
            };
            let view = view.clone();
            runtime.spawn(async move { view.load().await });
        })
    }
}

fn apply(tasks: &mut Vec<Task>, change: Change) {
    match change {
        Change::Upsert(task) => match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => tasks.push(task),
        },
        Change::Remove(id) => tasks.retain(|t| t.id.as_str() != id),
    }
}
