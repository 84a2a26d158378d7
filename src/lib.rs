//! Conveyor: an automation-task service.
//!
//! Users submit tasks over HTTP; each task runs a fixed six-stage pipeline
//! (planning, analysis, implementation, review, pr-creation, deployment)
//! driven by a SQLite-backed job queue and a worker pool, with live progress
//! published per task over WebSocket.

pub mod api;
pub mod db;
pub mod errors;
pub mod executor;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod providers;
pub mod queue;
pub mod server;
pub mod worker;
