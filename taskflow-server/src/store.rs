//! In-memory account, task, project, tag and notification store.
//!
//! The [`Store`] is the reference server's only persistence. Every record is
//! owned by one user and only visible to that user. Task mutations also
//! create a [`Notification`] for the owner, which the HTTP layer pushes to
//! the owner's notification sockets.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use taskflow_proto::auth::{RegisterInput, Token, User};
use taskflow_proto::notification::Notification;
use taskflow_proto::project::{Project, ProjectInput, ProjectPatch, Tag, TagInput, TagPatch};
use taskflow_proto::task::{Task, TaskId, TaskInput, TaskPatch, validate_title};

/// Errors returned by store operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// No record with the given id is visible to the caller.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The request body was rejected.
    #[error("{0}")]
    Validation(String),
    /// A unique field is already taken.
    #[error("{0}")]
    Conflict(String),
    /// Login failed.
    #[error("incorrect username or password")]
    InvalidCredentials,
}

/// A stored value plus its owner and insertion sequence.
#[derive(Debug, Clone)]
struct Owned<T> {
    owner: String,
    seq: u64,
    value: T,
}

/// Records of one kind, keyed by id.
#[derive(Debug)]
struct Records<T> {
    by_id: HashMap<String, Owned<T>>,
}

impl<T: Clone> Records<T> {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
        }
    }

    fn insert(&mut self, id: String, owner: &str, seq: u64, value: T) {
        self.by_id.insert(
            id,
            Owned {
                owner: owner.to_string(),
                seq,
                value,
            },
        );
    }

    /// All records of `owner`, oldest first.
    fn list(&self, owner: &str) -> Vec<T> {
        let mut owned: Vec<&Owned<T>> = self
            .by_id
            .values()
            .filter(|record| record.owner == owner)
            .collect();
        owned.sort_by_key(|record| record.seq);
        owned.into_iter().map(|record| record.value.clone()).collect()
    }

    fn get_mut(&mut self, owner: &str, id: &str) -> Option<&mut T> {
        self.by_id
            .get_mut(id)
            .filter(|record| record.owner == owner)
            .map(|record| &mut record.value)
    }

    fn get(&self, owner: &str, id: &str) -> Option<&T> {
        self.by_id
            .get(id)
            .filter(|record| record.owner == owner)
            .map(|record| &record.value)
    }

    fn remove(&mut self, owner: &str, id: &str) -> Option<T> {
        if self.get(owner, id).is_none() {
            return None;
        }
        self.by_id.remove(id).map(|record| record.value)
    }
}

#[derive(Debug, Clone)]
struct Account {
    user: User,
    password: String,
}

#[derive(Debug)]
struct StoreInner {
    /// Username -> account.
    accounts: HashMap<String, Account>,
    /// Bearer token -> user id.
    tokens: HashMap<String, String>,
    tasks: Records<Task>,
    projects: Records<Project>,
    tags: Records<Tag>,
    /// User id -> notifications, oldest first.
    notifications: HashMap<String, Vec<Notification>>,
    next_seq: u64,
}

impl StoreInner {
    const fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn notify(&mut self, owner: &str, kind: &str, title: &str, task: &Task) -> Notification {
        let notification = Notification {
            id: new_id(),
            title: title.to_string(),
            message: task.title.clone(),
            kind: kind.to_string(),
            read: false,
            task_id: Some(task.id.as_str().to_string()),
            created_at: Utc::now(),
        };
        self.notifications
            .entry(owner.to_string())
            .or_default()
            .push(notification.clone());
        notification
    }
}

/// Thread-safe in-memory store backing the reference server.
#[derive(Debug)]
pub struct Store {
    inner: RwLock<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Returns a timestamp no earlier than `previous`, so `updated_at` never
/// goes backwards for one record.
fn bump(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous)
}

impl Store {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                accounts: HashMap::new(),
                tokens: HashMap::new(),
                tasks: Records::new(),
                projects: Records::new(),
                tags: Records::new(),
                notifications: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    // -- Accounts ----------------------------------------------------------

    /// Registers a new account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an empty username or password,
    /// or [`StoreError::Conflict`] if the username is taken.
    pub async fn register(&self, input: RegisterInput) -> Result<User, StoreError> {
        if input.username.trim().is_empty() || input.password.is_empty() {
            return Err(StoreError::Validation(
                "username and password are required".to_string(),
            ));
        }
        let mut inner = self.inner.write().await;
        if inner.accounts.contains_key(&input.username) {
            return Err(StoreError::Conflict("username already registered".to_string()));
        }
        let user = User {
            id: new_id(),
            username: input.username.clone(),
            email: input.email,
            full_name: input.full_name,
            created_at: Some(Utc::now()),
        };
        inner.accounts.insert(
            input.username,
            Account {
                user: user.clone(),
                password: input.password,
            },
        );
        Ok(user)
    }

    /// Checks credentials and issues a new bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidCredentials`] on a wrong username or password.
    pub async fn login(&self, username: &str, password: &str) -> Result<Token, StoreError> {
        let mut inner = self.inner.write().await;
        let user_id = match inner.accounts.get(username) {
            Some(account) if account.password == password => account.user.id.clone(),
            _ => return Err(StoreError::InvalidCredentials),
        };
        let token = format!("tok-{}", new_id());
        inner.tokens.insert(token.clone(), user_id);
        Ok(Token {
            access_token: token,
            token_type: "bearer".to_string(),
        })
    }

    /// Resolves a bearer token to its user.
    pub async fn authenticate(&self, token: &str) -> Option<User> {
        let inner = self.inner.read().await;
        let user_id = inner.tokens.get(token)?;
        inner
            .accounts
            .values()
            .find(|account| &account.user.id == user_id)
            .map(|account| account.user.clone())
    }

    /// Revokes a token. Later requests carrying it are unauthorized.
    pub async fn revoke(&self, token: &str) -> bool {
        self.inner.write().await.tokens.remove(token).is_some()
    }

    // -- Tasks -------------------------------------------------------------

    /// Lists the user's tasks, oldest first.
    pub async fn list_tasks(&self, owner: &str) -> Vec<Task> {
        self.inner.read().await.tasks.list(owner)
    }

    /// Fetches one task.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the task does not exist for `owner`.
    pub async fn get_task(&self, owner: &str, id: &str) -> Result<Task, StoreError> {
        self.inner
            .read()
            .await
            .tasks
            .get(owner, id)
            .cloned()
            .ok_or(StoreError::NotFound("task"))
    }

    /// Creates a task and a `task_created` notification.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if the title is empty or too long.
    pub async fn create_task(
        &self,
        owner: &str,
        input: TaskInput,
    ) -> Result<(Task, Notification), StoreError> {
        validate_title(&input.title).map_err(StoreError::Validation)?;
        let now = Utc::now();
        let task = Task {
            id: TaskId::new(new_id()),
            title: input.title,
            description: input.description,
            completed: false,
            priority: input.priority,
            due_date: input.due_date,
            tags: input.tags,
            project_id: input.project_id,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq();
        inner
            .tasks
            .insert(task.id.as_str().to_string(), owner, seq, task.clone());
        let notification = inner.notify(owner, "task_created", "Task created", &task);
        Ok((task, notification))
    }

    /// Applies a patch to a task and creates a `task_updated` notification.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown task, or
    /// [`StoreError::Validation`] if the patched title is invalid.
    pub async fn update_task(
        &self,
        owner: &str,
        id: &str,
        patch: &TaskPatch,
    ) -> Result<(Task, Notification), StoreError> {
        if let Some(title) = &patch.title {
            validate_title(title).map_err(StoreError::Validation)?;
        }
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(owner, id)
            .ok_or(StoreError::NotFound("task"))?;
        patch.apply_to(task);
        task.updated_at = bump(task.updated_at);
        let task = task.clone();
        let notification = inner.notify(owner, "task_updated", "Task updated", &task);
        Ok((task, notification))
    }

    /// Flips a task's completion flag and creates a notification.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown task.
    pub async fn toggle_task(
        &self,
        owner: &str,
        id: &str,
    ) -> Result<(Task, Notification), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .get_mut(owner, id)
            .ok_or(StoreError::NotFound("task"))?;
        task.completed = !task.completed;
        task.updated_at = bump(task.updated_at);
        let task = task.clone();
        let title = if task.completed {
            "Task completed"
        } else {
            "Task reopened"
        };
        let notification = inner.notify(owner, "task_toggled", title, &task);
        Ok((task, notification))
    }

    /// Deletes a task and creates a `task_deleted` notification.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown task.
    pub async fn delete_task(&self, owner: &str, id: &str) -> Result<Notification, StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner
            .tasks
            .remove(owner, id)
            .ok_or(StoreError::NotFound("task"))?;
        Ok(inner.notify(owner, "task_deleted", "Task deleted", &task))
    }

    // -- Projects ----------------------------------------------------------

    /// Lists the user's projects, oldest first.
    pub async fn list_projects(&self, owner: &str) -> Vec<Project> {
        self.inner.read().await.projects.list(owner)
    }

    /// Fetches one project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown project.
    pub async fn get_project(&self, owner: &str, id: &str) -> Result<Project, StoreError> {
        self.inner
            .read()
            .await
            .projects
            .get(owner, id)
            .cloned()
            .ok_or(StoreError::NotFound("project"))
    }

    /// Creates a project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an empty name.
    pub async fn create_project(
        &self,
        owner: &str,
        input: ProjectInput,
    ) -> Result<Project, StoreError> {
        if input.name.trim().is_empty() {
            return Err(StoreError::Validation(
                "Project name cannot be empty".to_string(),
            ));
        }
        let now = Utc::now();
        let project = Project {
            id: new_id(),
            name: input.name,
            description: input.description,
            color: input.color,
            owner_id: owner.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.write().await;
        let seq = inner.next_seq();
        inner
            .projects
            .insert(project.id.clone(), owner, seq, project.clone());
        Ok(project)
    }

    /// Updates a project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown project.
    pub async fn update_project(
        &self,
        owner: &str,
        id: &str,
        patch: ProjectPatch,
    ) -> Result<Project, StoreError> {
        let mut inner = self.inner.write().await;
        let project = inner
            .projects
            .get_mut(owner, id)
            .ok_or(StoreError::NotFound("project"))?;
        if let Some(name) = patch.name {
            project.name = name;
        }
        if patch.description.is_some() {
            project.description = patch.description;
        }
        if patch.color.is_some() {
            project.color = patch.color;
        }
        project.updated_at = bump(project.updated_at);
        Ok(project.clone())
    }

    /// Deletes a project.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown project.
    pub async fn delete_project(&self, owner: &str, id: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .projects
            .remove(owner, id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("project"))
    }

    // -- Tags --------------------------------------------------------------

    /// Lists the user's tags, oldest first.
    pub async fn list_tags(&self, owner: &str) -> Vec<Tag> {
        self.inner.read().await.tags.list(owner)
    }

    /// Fetches one tag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown tag.
    pub async fn get_tag(&self, owner: &str, id: &str) -> Result<Tag, StoreError> {
        self.inner
            .read()
            .await
            .tags
            .get(owner, id)
            .cloned()
            .ok_or(StoreError::NotFound("tag"))
    }

    /// Creates a tag. Tag names are unique per user.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an empty name or
    /// [`StoreError::Conflict`] for a duplicate one.
    pub async fn create_tag(&self, owner: &str, input: TagInput) -> Result<Tag, StoreError> {
        if input.name.trim().is_empty() {
            return Err(StoreError::Validation("Tag name cannot be empty".to_string()));
        }
        let mut inner = self.inner.write().await;
        if inner
            .tags
            .list(owner)
            .iter()
            .any(|tag| tag.name == input.name)
        {
            return Err(StoreError::Conflict(format!(
                "tag {} already exists",
                input.name
            )));
        }
        let now = Utc::now();
        let tag = Tag {
            id: new_id(),
            name: input.name,
            color: input.color,
            owner_id: owner.to_string(),
            created_at: now,
            updated_at: now,
        };
        let seq = inner.next_seq();
        inner.tags.insert(tag.id.clone(), owner, seq, tag.clone());
        Ok(tag)
    }

    /// Updates a tag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown tag.
    pub async fn update_tag(
        &self,
        owner: &str,
        id: &str,
        patch: TagPatch,
    ) -> Result<Tag, StoreError> {
        let mut inner = self.inner.write().await;
        let tag = inner
            .tags
            .get_mut(owner, id)
            .ok_or(StoreError::NotFound("tag"))?;
        if let Some(name) = patch.name {
            tag.name = name;
        }
        if patch.color.is_some() {
            tag.color = patch.color;
        }
        tag.updated_at = bump(tag.updated_at);
        Ok(tag.clone())
    }

    /// Deletes a tag.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown tag.
    pub async fn delete_tag(&self, owner: &str, id: &str) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .tags
            .remove(owner, id)
            .map(|_| ())
            .ok_or(StoreError::NotFound("tag"))
    }

    // -- Notifications -----------------------------------------------------

    /// Number of unread notifications for the user.
    pub async fn unread_count(&self, owner: &str) -> u64 {
        self.inner
            .read()
            .await
            .notifications
            .get(owner)
            .map_or(0, |all| all.iter().filter(|n| !n.read).count() as u64)
    }

    /// Lists the user's notifications, newest first.
    pub async fn list_notifications(&self, owner: &str) -> Vec<Notification> {
        let inner = self.inner.read().await;
        let mut all = inner.notifications.get(owner).cloned().unwrap_or_default();
        all.reverse();
        all
    }

    /// Marks every notification of the user as read.
    pub async fn mark_all_read(&self, owner: &str) {
        if let Some(all) = self.inner.write().await.notifications.get_mut(owner) {
            for notification in all {
                notification.read = true;
            }
        }
    }
}
