//! `Taskflow` reference server library.
//!
//! An in-memory implementation of the REST and notification WebSocket APIs
//! the `taskflow` client talks to. Exposed as a library so client tests can
//! run it in-process.

pub mod api;
pub mod config;
pub mod notify;
pub mod store;
