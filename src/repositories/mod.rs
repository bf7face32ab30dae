//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for database
//! entities behind the store traits the pipeline depends on.

pub mod webhook_event;

pub use webhook_event::{
    EventStore, NewWebhookEvent, ProcessingOutcome, StoreError, WebhookEventRepository,
};
