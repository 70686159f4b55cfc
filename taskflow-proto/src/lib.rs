//! Shared protocol definitions for the `Taskflow` REST and notification APIs.

pub mod auth;
pub mod codec;
pub mod notification;
pub mod project;
pub mod task;
