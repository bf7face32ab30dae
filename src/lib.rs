//! # Webhook Ingest Library
//!
//! Receives signed webhook callbacks over HTTP, rate limits them per provider
//! and client, validates and authenticates the payload, records every
//! admitted event, and hands it to a bounded processing dispatcher that
//! finalizes each event exactly once.

pub mod admission;
pub mod config;
pub mod counter_store;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod headers;
pub mod middleware;
pub mod models;
pub mod payload;
pub mod providers;
pub mod rate_limit;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod webhook_verification;
pub use migration;
