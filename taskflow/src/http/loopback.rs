//! Loopback HTTP transport for testing.
//!
//! Serves an in-memory REST API (`/tasks`, `/projects`, `/tags` and any other
//! top-level collection) without touching the network. Every request is
//! counted per method and path, replies and failures can be scripted per
//! route, and an artificial latency keeps requests in flight long enough to
//! observe request sharing.
//!
//! ```rust,no_run
//! use taskflow::http::loopback::LoopbackTransport;
//! use taskflow::http::{ApiRequest, HttpTransport, Method};
//!
//! # async fn example() {
//! let transport = LoopbackTransport::new();
//! transport.insert_task("Buy milk");
//! let tasks = transport.send(ApiRequest::get("/tasks")).await.unwrap();
//! assert_eq!(tasks.as_array().unwrap().len(), 1);
//! assert_eq!(transport.request_count(Method::Get, "/tasks"), 1);
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use taskflow_proto::task::{Task, validate_title};

use super::{ApiRequest, Body, HttpError, HttpTransport, Method};

/// In-process REST API backed by JSON records.
///
/// Cloning is cheap; clones share the same records and counters.
#[derive(Debug, Clone, Default)]
pub struct LoopbackTransport {
    state: Arc<Mutex<LoopbackState>>,
}

#[derive(Debug, Default)]
struct LoopbackState {
    collections: HashMap<String, Vec<Value>>,
    next_id: u64,
    last_stamp: Option<DateTime<Utc>>,
    counts: HashMap<(Method, String), usize>,
    scripted: HashMap<(Method, String), VecDeque<Result<Value, HttpError>>>,
    latency: Duration,
}

impl LoopbackTransport {
    /// Creates an empty API.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every response by `latency` (uses `tokio::time`, so paused
    /// test clocks apply).
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Makes the next request for `method path` fail with `error`.
    /// Several calls queue several failures.
    pub fn fail_next(&self, method: Method, path: &str, error: HttpError) {
        self.script(method, path, Err(error));
    }

    /// Makes the next request for `method path` answer with `body` instead
    /// of touching the stored records.
    pub fn reply_next(&self, method: Method, path: &str, body: Value) {
        self.script(method, path, Ok(body));
    }

    fn script(&self, method: Method, path: &str, outcome: Result<Value, HttpError>) {
        self.state
            .lock()
            .scripted
            .entry((method, path.to_string()))
            .or_default()
            .push_back(outcome);
    }

    /// Number of requests received for `method path`.
    #[must_use]
    pub fn request_count(&self, method: Method, path: &str) -> usize {
        self.state
            .lock()
            .counts
            .get(&(method, path.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Total number of requests received.
    #[must_use]
    pub fn total_requests(&self) -> usize {
        self.state.lock().counts.values().sum()
    }

    /// Inserts a record into `collection` directly, bypassing the request
    /// counters. Returns the assigned id.
    pub fn insert_record(&self, collection: &str, fields: Value) -> String {
        self.state.lock().create(collection, fields)
    }

    /// Inserts a task with the given title. Returns the assigned id.
    pub fn insert_task(&self, title: &str) -> String {
        self.insert_record("tasks", json!({ "title": title }))
    }

    /// Changes a record behind the client's back, as another device would.
    /// Returns `false` if the record does not exist.
    pub fn edit_record(&self, collection: &str, id: &str, fields: Value) -> bool {
        self.state.lock().update(collection, id, &fields).is_some()
    }

    /// Reads a task as currently stored.
    #[must_use]
    pub fn task(&self, id: &str) -> Option<Task> {
        let state = self.state.lock();
        let record = state.find(state.collections.get("tasks")?, id)?;
        serde_json::from_value(record.clone()).ok()
    }
}

impl HttpTransport for LoopbackTransport {
    async fn send(&self, request: ApiRequest) -> Result<Value, HttpError> {
        let latency = {
            let mut state = self.state.lock();
            *state
                .counts
                .entry((request.method, request.path.clone()))
                .or_default() += 1;
            state.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.lock().handle(&request)
    }
}

fn not_found(what: &str) -> HttpError {
    HttpError::Status {
        status: 404,
        message: Some(format!("{what} not found")),
    }
}

fn singular(collection: &str) -> String {
    let name = collection.strip_suffix('s').unwrap_or(collection);
    let mut chars = name.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

impl LoopbackState {
    fn handle(&mut self, request: &ApiRequest) -> Result<Value, HttpError> {
        if let Some(outcome) = self
            .scripted
            .get_mut(&(request.method, request.path.clone()))
            .and_then(VecDeque::pop_front)
        {
            tracing::debug!(method = %request.method, path = %request.path, "scripted response");
            return outcome;
        }

        let body = match &request.body {
            Some(Body::Json(value)) => value.clone(),
            Some(Body::Form(_)) | None => Value::Null,
        };
        let segments: Vec<&str> = request
            .path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match (request.method, segments.as_slice()) {
            (Method::Get, [collection]) => Ok(Value::Array(
                self.collections.get(*collection).cloned().unwrap_or_default(),
            )),
            (Method::Post, [collection]) => {
                if *collection == "tasks" {
                    let title = body.get("title").and_then(Value::as_str).unwrap_or("");
                    validate_title(title).map_err(|reason| HttpError::Status {
                        status: 422,
                        message: Some(reason),
                    })?;
                }
                let id = self.create(collection, body);
                self.get(collection, &id)
            }
            (Method::Get, [collection, id]) => self.get(collection, id),
            (Method::Put, [collection, id]) => self
                .update(collection, id, &body)
                .ok_or_else(|| not_found(&singular(collection))),
            (Method::Delete, [collection, id]) => {
                let records = self
                    .collections
                    .get_mut(*collection)
                    .ok_or_else(|| not_found(&singular(collection)))?;
                let before = records.len();
                records.retain(|record| record.get("id").and_then(Value::as_str) != Some(*id));
                if records.len() == before {
                    return Err(not_found(&singular(collection)));
                }
                Ok(Value::Null)
            }
            (Method::Patch, ["tasks", id, "toggle-completion"]) => {
                let current = self.get("tasks", id)?;
                let completed = current
                    .get("completed")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.update("tasks", id, &json!({ "completed": !completed }))
                    .ok_or_else(|| not_found("Task"))
            }
            _ => Err(HttpError::Status {
                status: 404,
                message: Some("Not Found".to_string()),
            }),
        }
    }

    fn stamp(&mut self) -> Value {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + TimeDelta::milliseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        json!(stamp)
    }

    fn find<'a>(&self, records: &'a [Value], id: &str) -> Option<&'a Value> {
        records
            .iter()
            .find(|record| record.get("id").and_then(Value::as_str) == Some(id))
    }

    fn get(&self, collection: &str, id: &str) -> Result<Value, HttpError> {
        self.collections
            .get(collection)
            .and_then(|records| self.find(records, id))
            .cloned()
            .ok_or_else(|| not_found(&singular(collection)))
    }

    fn create(&mut self, collection: &str, fields: Value) -> String {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let mut record = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let stamp = self.stamp();
        record.insert("id".into(), Value::String(id.clone()));
        record.insert("created_at".into(), stamp.clone());
        record.insert("updated_at".into(), stamp);
        if collection == "tasks" {
            record.entry("completed").or_insert(Value::Bool(false));
        }
        self.collections
            .entry(collection.to_string())
            .or_default()
            .push(Value::Object(record));
        id
    }

    fn update(&mut self, collection: &str, id: &str, fields: &Value) -> Option<Value> {
        let stamp = self.stamp();
        let record = self
            .collections
            .get_mut(collection)?
            .iter_mut()
            .find(|record| record.get("id").and_then(Value::as_str) == Some(id))?;
        let object = record.as_object_mut()?;
        if let Some(fields) = fields.as_object() {
            for (key, value) in fields {
                if key != "id" && !value.is_null() {
                    object.insert(key.clone(), value.clone());
                }
            }
        }
        object.insert("updated_at".into(), stamp);
        Some(record.clone())
    }
}
