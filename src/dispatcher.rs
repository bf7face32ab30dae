//! Processing Dispatcher
//!
//! Hands admitted events to the processing hook, either inline within the
//! request or through a bounded worker pool, and records the terminal status
//! of each event. Processing failures are recorded on the event and never
//! propagate back to the admission pipeline.

use std::any::Any;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{DispatchConfig, DispatchMode, QueueFullPolicy};
use crate::models::webhook_event::{EventStatus, Model as WebhookEventModel};
use crate::repositories::{EventStore, ProcessingOutcome, StoreError};
use crate::telemetry;

/// Provider-specific side effects for an admitted event
#[async_trait]
pub trait EventProcessor: Send + Sync {
    /// Process one event. An error marks the event as failed.
    async fn process(&self, event: &WebhookEventModel) -> anyhow::Result<()>;
}

/// Processor with no side effects; every event becomes processed
#[derive(Debug, Clone, Copy, Default)]
pub struct AcknowledgeProcessor;

#[async_trait]
impl EventProcessor for AcknowledgeProcessor {
    async fn process(&self, event: &WebhookEventModel) -> anyhow::Result<()> {
        debug!(
            event_id = %event.id,
            provider = %event.provider,
            event_type = %event.event_type,
            "Acknowledged webhook event"
        );
        Ok(())
    }
}

/// What happened to a dispatched event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Processing ran and the event reached this terminal status
    Completed(EventStatus),
    /// The event had already left pending; nothing ran
    Skipped(EventStatus),
    /// Another task is processing the same event
    AlreadyInFlight,
    /// Submitted to the worker pool
    Queued,
    /// The worker queue was full and the reject policy applies; the event stays pending
    Rejected,
}

/// Errors surfaced by the dispatcher itself (never by the processing hook)
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("webhook event {id} not found")]
    NotFound { id: Uuid },

    #[error("dispatcher is shut down")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct DispatcherInner {
    mode: DispatchMode,
    queue_full_policy: QueueFullPolicy,
    store: Arc<dyn EventStore>,
    processor: Arc<dyn EventProcessor>,
    in_flight: Mutex<HashSet<Uuid>>,
    sender: Mutex<Option<mpsc::Sender<Uuid>>>,
    tracker: TaskTracker,
}

/// Explicitly owned handle to the processing workers
#[derive(Clone)]
pub struct ProcessingDispatcher {
    inner: Arc<DispatcherInner>,
}

impl ProcessingDispatcher {
    /// Build a dispatcher; in pool mode this spawns the queue consumer.
    ///
    /// Must be called within a tokio runtime when `config.mode` is pool.
    pub fn start(
        config: &DispatchConfig,
        store: Arc<dyn EventStore>,
        processor: Arc<dyn EventProcessor>,
    ) -> Self {
        let tracker = TaskTracker::new();
        let (sender, receiver) = match config.mode {
            DispatchMode::Pool => {
                let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
                (Some(sender), Some(receiver))
            }
            DispatchMode::Inline => (None, None),
        };

        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                mode: config.mode,
                queue_full_policy: config.queue_full_policy,
                store,
                processor,
                in_flight: Mutex::new(HashSet::new()),
                sender: Mutex::new(sender),
                tracker,
            }),
        };

        if let Some(receiver) = receiver {
            let workers = config.workers.max(1);
            info!(
                workers,
                queue_capacity = config.queue_capacity,
                queue_full_policy = ?config.queue_full_policy,
                "Starting webhook processing pool"
            );
            let consumer = dispatcher.clone();
            dispatcher
                .inner
                .tracker
                .spawn(consumer.run_workers(receiver, workers));
        } else {
            info!("Webhook processing runs inline");
        }

        dispatcher
    }

    pub fn mode(&self) -> DispatchMode {
        self.inner.mode
    }

    /// Hand an event to processing according to the configured mode
    pub async fn dispatch(&self, id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        match self.inner.mode {
            DispatchMode::Inline => self.process(id).await,
            DispatchMode::Pool => self.enqueue(id).await,
        }
    }

    async fn enqueue(&self, id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DispatchError::Closed)?;

        match self.inner.queue_full_policy {
            QueueFullPolicy::Block => {
                sender.send(id).await.map_err(|_| DispatchError::Closed)?;
                Ok(DispatchOutcome::Queued)
            }
            QueueFullPolicy::Reject => match sender.try_send(id) {
                Ok(()) => Ok(DispatchOutcome::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event_id = %id, "Processing queue full; event left pending");
                    Ok(DispatchOutcome::Rejected)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
            },
        }
    }

    async fn run_workers(self, mut receiver: mpsc::Receiver<Uuid>, workers: usize) {
        let semaphore = Arc::new(Semaphore::new(workers));

        while let Some(id) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let dispatcher = self.clone();
            self.inner.tracker.spawn(async move {
                let _permit = permit;
                if let Err(e) = dispatcher.process(id).await {
                    error!(event_id = %id, "Failed to process webhook event: {}", e);
                }
            });
        }

        debug!("Processing queue closed");
    }

    /// Run the processing hook for one event and record its terminal status.
    ///
    /// At most one attempt runs per event id at a time; events that already
    /// left pending are skipped.
    #[instrument(skip(self), fields(event_id = %id))]
    pub async fn process(&self, id: Uuid) -> Result<DispatchOutcome, DispatchError> {
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, id) else {
            debug!("Webhook event already in flight");
            return Ok(DispatchOutcome::AlreadyInFlight);
        };

        let event = self
            .inner
            .store
            .get(id)
            .await?
            .ok_or(DispatchError::NotFound { id })?;
        if event.status.is_terminal() {
            debug!(status = %event.status, "Webhook event already finalized");
            return Ok(DispatchOutcome::Skipped(event.status));
        }

        let provider = event.provider.clone();
        let processor = Arc::clone(&self.inner.processor);
        let started = Instant::now();
        // Own task so a panicking processor is observed as a JoinError
        let result = tokio::spawn(async move { processor.process(&event).await }).await;
        let elapsed = started.elapsed();

        let outcome = match result {
            Ok(Ok(())) => ProcessingOutcome::Processed,
            Ok(Err(e)) => ProcessingOutcome::Failed {
                message: format!("{e:#}"),
            },
            Err(join_error) if join_error.is_panic() => ProcessingOutcome::Failed {
                message: panic_message(join_error.into_panic()),
            },
            Err(join_error) => ProcessingOutcome::Failed {
                message: join_error.to_string(),
            },
        };

        match self.inner.store.finalize(id, outcome).await {
            Ok(finalized) => {
                telemetry::record_finalized(&provider, finalized.status, elapsed);
                match &finalized.error_message {
                    Some(message) => warn!(
                        provider = %provider,
                        "Webhook event processing failed: {}",
                        message
                    ),
                    None => info!(provider = %provider, "Webhook event processed"),
                }
                Ok(DispatchOutcome::Completed(finalized.status))
            }
            Err(StoreError::AlreadyFinalized { status, .. }) => {
                warn!(status = %status, "Webhook event finalized concurrently");
                Ok(DispatchOutcome::Skipped(status))
            }
            Err(e) => {
                error!("Failed to record webhook event outcome: {}", e);
                Err(e.into())
            }
        }
    }

    /// Close the queue and wait for queued and running work to finish
    pub async fn shutdown(&self) {
        let sender = self
            .inner
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Webhook processing drained");
    }
}

struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<Uuid>>,
    id: Uuid,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(in_flight: &'a Mutex<HashSet<Uuid>>, id: Uuid) -> Option<Self> {
        let inserted = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        inserted.then_some(Self { in_flight, id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("processor panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("processor panicked: {message}")
    } else {
        "processor panicked".to_string()
    }
}
