//! Consumer scheduler: drains inbox rows through registered handlers.
//!
//! Same claim-and-fan-out shape as the sender, but outcomes differ: handler
//! failures are terminal here. Redelivery belongs to the broker, which keeps
//! re-sending unacked messages; once a row is in the inbox it is handled at
//! most once per delivery.

use std::{collections::HashSet, sync::Arc, time::Duration};

use postbox_core::{error::CoreError, Clock, Event, EventId};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DispatchError, Result},
    handler::HandlerRegistry,
    storage::InboxStore,
    DEFAULT_BATCH_SIZE, DEFAULT_DISPATCH_TIMEOUT, DEFAULT_POLLING_INTERVAL,
    DEFAULT_SHUTDOWN_TIMEOUT,
};

/// Configuration for the consumer scheduler.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// How often to poll the inbox when it is empty.
    pub polling_interval: Duration,

    /// Upper bound on handling one claimed batch.
    pub dispatch_timeout: Duration,

    /// Maximum events claimed per sweep.
    pub batch_size: usize,

    /// Grace period for in-flight handlers during shutdown.
    pub shutdown_timeout: Duration,

    /// Stable worker identity for crash recovery.
    pub worker_id: String,
}

impl ConsumerConfig {
    /// Creates a config with default timings for the given identity.
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            worker_id: worker_id.into(),
        }
    }
}

/// Scheduler that feeds queued inbox events to their handlers.
pub struct Consumer {
    inbox: Arc<dyn InboxStore>,
    handlers: Arc<HandlerRegistry>,
    config: ConsumerConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Consumer {
    /// Creates a consumer over the given store and handler registry.
    pub fn new(
        inbox: Arc<dyn InboxStore>,
        handlers: Arc<HandlerRegistry>,
        config: ConsumerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inbox,
            handlers,
            config,
            clock,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops the scheduler when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Recovers events this worker abandoned in a previous run.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Recovery` if the sweep fails.
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self
            .inbox
            .reenqueue_worker(self.config.worker_id.clone())
            .await
            .map_err(|source| DispatchError::Recovery {
                worker_id: self.config.worker_id.clone(),
                source,
            })?;

        if recovered > 0 {
            info!(
                worker_id = %self.config.worker_id,
                recovered,
                "re-enqueued events abandoned by previous run"
            );
        }
        Ok(recovered)
    }

    /// Main scheduler loop. Blocks until the cancellation token fires.
    ///
    /// # Errors
    ///
    /// Returns error only if startup recovery fails. Sweep errors are logged
    /// and retried on the next tick.
    pub async fn run(&self) -> Result<()> {
        self.recover().await?;

        info!(
            worker_id = %self.config.worker_id,
            handlers = self.handlers.len(),
            batch_size = self.config.batch_size,
            "consumer scheduler starting"
        );

        loop {
            if self.cancel.is_cancelled() {
                info!(worker_id = %self.config.worker_id, "consumer scheduler stopping");
                break;
            }

            match self.sweep_once().await {
                Ok(claimed) if claimed >= self.config.batch_size => {}
                Ok(_) => {
                    tokio::select! {
                        () = self.clock.sleep(self.config.polling_interval) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
                Err(error) => {
                    error!(
                        worker_id = %self.config.worker_id,
                        error = %error,
                        "sweep failed"
                    );
                    tokio::select! {
                        () = self.clock.sleep(self.config.polling_interval) => {}
                        () = self.cancel.cancelled() => break,
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "consumer scheduler stopped");
        Ok(())
    }

    /// Claims and handles exactly one batch. Returns the claimed count.
    /// The whole sweep, claim included, is bounded by `dispatch_timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails. Per-event outcomes are recorded on
    /// the rows, never surfaced here.
    pub async fn sweep_once(&self) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + self.config.dispatch_timeout;

        let claim = self
            .inbox
            .claim_batch(self.config.worker_id.clone(), self.config.batch_size);
        let events = match tokio::time::timeout_at(deadline, claim).await {
            Ok(Ok(events)) => events,
            Ok(Err(CoreError::NoEventsToSchedule)) => return Ok(0),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                // Dropping the claim future rolls the transaction back,
                // leaving the rows queued.
                warn!(worker_id = %self.config.worker_id, "batch claim timed out");
                return Ok(0);
            }
        };
        let claimed = events.len();

        debug!(
            worker_id = %self.config.worker_id,
            claimed,
            "handling inbox batch"
        );

        let mut in_flight: HashSet<EventId> = events.iter().map(|e| e.id).collect();
        let mut tasks = JoinSet::new();
        for event in events {
            let inbox = self.inbox.clone();
            let handlers = self.handlers.clone();
            tasks.spawn(async move { handle_one(inbox, handlers, event).await });
        }

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(event_id) => {
                        in_flight.remove(&event_id);
                    }
                    Err(join_error) => error!(error = %join_error, "handler task panicked"),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                worker_id = %self.config.worker_id,
                abandoned = in_flight.len(),
                "batch handling timed out"
            );
            tasks.abort_all();
            // Interrupted events stay scheduled; the startup sweep reclaims
            // them. Unlike the sender there is no mid-run re-enqueue because
            // a handler may not be idempotent within a single process run.
        }

        Ok(claimed)
    }

    /// Cancels the loop and waits for it to drain, bounded by the shutdown
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShutdownTimeout` if the loop does not stop in
    /// time.
    pub async fn shutdown(
        &self,
        handle: tokio::task::JoinHandle<Result<()>>,
    ) -> Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(error = %join_error, "consumer task panicked during shutdown");
                Ok(())
            }
            Err(_) => Err(DispatchError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }
}

/// Handles one claimed event and records its outcome.
async fn handle_one(
    inbox: Arc<dyn InboxStore>,
    handlers: Arc<HandlerRegistry>,
    event: Event,
) -> EventId {
    let event_id = event.id;
    let event_type = event.event_type.clone();

    let outcome = match handlers.get(&event_type) {
        None => {
            warn!(event_id = %event_id, event_type = %event_type, "no handler registered");
            inbox
                .mark_failed(
                    event_id,
                    format!("no handler registered for event type {event_type}"),
                )
                .await
        }
        Some(handler) => match handler.handle(event).await {
            Ok(()) => {
                debug!(event_id = %event_id, event_type = %event_type, "event handled");
                inbox.mark_processed(event_id).await
            }
            Err(error) => {
                warn!(event_id = %event_id, error = %error, "handler failed");
                inbox.mark_failed(event_id, error.to_string()).await
            }
        },
    };

    if let Err(error) = outcome {
        error!(event_id = %event_id, error = %error, "failed to record handling outcome");
    }
    event_id
}
