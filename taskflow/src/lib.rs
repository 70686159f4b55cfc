//! `Taskflow`: task synchronization client library.
//!
//! Cached, deduplicated REST resource clients, token-based authentication, a
//! self-reconnecting notification channel, and view-state adapters for task
//! screens.

pub mod auth;
pub mod cache;
pub mod config;
pub mod http;
pub mod realtime;
pub mod resource;
pub mod view;
