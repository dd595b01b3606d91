//! # jobq
//!
//! Durable background jobs for a web backend.
//!
//! Producers enqueue typed jobs into a [`store::JobStore`] (Postgres or in
//! memory). A [`worker::Worker`] claims them in batches, dispatches each to
//! the handler registered in its [`processor::Processor`], and records the
//! outcome with linear-backoff retries. [`monitor::BacklogMonitor`] grades
//! the queue depth and [`poller::wait_for_job`] lets request code block on
//! a result.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod monitor;
pub mod poller;
pub mod processor;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod worker;
