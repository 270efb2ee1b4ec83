//! Sender scheduler: relays outbox rows to the broker.
//!
//! Polls the outbox table, claims batches with SKIP LOCKED semantics, fans
//! each batch out concurrently, and records a terminal or re-enqueued outcome
//! per event. At-least-once: an event is only marked processed after the
//! broker acknowledged it.

use std::{collections::HashSet, sync::Arc, time::Duration};

use postbox_broker::{Broker, CloudEvent, CONTENT_TYPE_JSON, SPEC_VERSION};
use postbox_core::{error::CoreError, Clock, Event, EventId};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DispatchError, Result},
    storage::OutboxStore,
    DEFAULT_BATCH_SIZE, DEFAULT_DISPATCH_TIMEOUT, DEFAULT_POLLING_INTERVAL,
    DEFAULT_SHUTDOWN_TIMEOUT,
};

/// Configuration for the sender scheduler.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// How often to poll the outbox when it is empty.
    pub polling_interval: Duration,

    /// Upper bound on dispatching one claimed batch.
    pub dispatch_timeout: Duration,

    /// Maximum events claimed per sweep.
    pub batch_size: usize,

    /// Grace period for in-flight sends during shutdown.
    pub shutdown_timeout: Duration,

    /// Stable worker identity; must survive restarts so the startup sweep
    /// can recover events this instance abandoned.
    pub worker_id: String,

    /// CloudEvents `source` attribute stamped on every outbound envelope.
    pub source: String,
}

impl SenderConfig {
    /// Creates a config with default timings for the given identity.
    pub fn new(worker_id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            polling_interval: DEFAULT_POLLING_INTERVAL,
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
            batch_size: DEFAULT_BATCH_SIZE,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            worker_id: worker_id.into(),
            source: source.into(),
        }
    }
}

/// Scheduler that moves queued outbox events to the broker.
pub struct Sender {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    config: SenderConfig,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Sender {
    /// Creates a sender over the given store and broker.
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn Broker>,
        config: SenderConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            outbox,
            broker,
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
    /// Returns them from `scheduled` back to `queued` so the normal claim
    /// path picks them up again.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Recovery` if the sweep fails; the scheduler
    /// must not start dispatching over unrecovered rows.
    pub async fn recover(&self) -> Result<u64> {
        let recovered = self
            .outbox
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
            batch_size = self.config.batch_size,
            polling_interval_ms = self.config.polling_interval.as_millis() as u64,
            "sender scheduler starting"
        );

        loop {
            if self.cancel.is_cancelled() {
                info!(worker_id = %self.config.worker_id, "sender scheduler stopping");
                break;
            }

            match self.sweep_once().await {
                // A full batch suggests a backlog; sweep again immediately.
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

        info!(worker_id = %self.config.worker_id, "sender scheduler stopped");
        Ok(())
    }

    /// Claims and dispatches exactly one batch.
    ///
    /// Returns the number of events claimed. Designed for tests and
    /// controlled batch processing; `run` calls this in a loop. The whole
    /// sweep, claim included, is bounded by `dispatch_timeout`.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails. Per-event outcomes are recorded on
    /// the rows, never surfaced here.
    pub async fn sweep_once(&self) -> Result<usize> {
        let deadline = tokio::time::Instant::now() + self.config.dispatch_timeout;

        let claim = self
            .outbox
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
            "dispatching outbox batch"
        );

        let mut in_flight: HashSet<EventId> = events.iter().map(|e| e.id).collect();
        let mut tasks = JoinSet::new();
        for event in events {
            let outbox = self.outbox.clone();
            let broker = self.broker.clone();
            let source = self.config.source.clone();
            tasks.spawn(async move { dispatch_one(outbox, broker, source, event).await });
        }

        let drained = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(event_id) => {
                        in_flight.remove(&event_id);
                    }
                    Err(join_error) => error!(error = %join_error, "dispatch task panicked"),
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                worker_id = %self.config.worker_id,
                abandoned = in_flight.len(),
                "batch dispatch timed out"
            );
            tasks.abort_all();
            // Return unfinished events to the queue. The status guard makes
            // this a no-op for any event that finished before the abort
            // landed.
            for event_id in in_flight {
                if let Err(error) = self.outbox.reenqueue(event_id).await {
                    error!(event_id = %event_id, error = %error, "failed to re-enqueue event");
                }
            }
        }

        Ok(claimed)
    }

    /// Cancels the loop and waits for it to drain, bounded by the shutdown
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::ShutdownTimeout` if the loop does not stop in
    /// time; abandoned rows stay `scheduled` until the next startup sweep.
    pub async fn shutdown(
        &self,
        handle: tokio::task::JoinHandle<Result<()>>,
    ) -> Result<()> {
        self.cancel.cancel();
        match tokio::time::timeout(self.config.shutdown_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(error = %join_error, "sender task panicked during shutdown");
                Ok(())
            }
            Err(_) => Err(DispatchError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }
}

/// Dispatches one claimed event and records its outcome.
///
/// Finalization failures are logged, not returned: the event stays
/// `scheduled` and is recovered on the next startup sweep.
async fn dispatch_one(
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn Broker>,
    source: String,
    event: Event,
) -> EventId {
    let event_id = event.id;
    let envelope = CloudEvent {
        specversion: SPEC_VERSION.to_string(),
        id: event.id.to_string(),
        source,
        event_type: event.event_type.clone(),
        subject: Some(event.subject.clone()),
        time: event.dispatched_at,
        dataschema: event.dataschema.clone(),
        datacontenttype: CONTENT_TYPE_JSON.to_string(),
        data: event.data.clone(),
    };

    let outcome = match broker.publish(envelope).await {
        Ok(()) => {
            debug!(event_id = %event_id, event_type = %event.event_type, "event published");
            outbox.mark_processed(event_id).await
        }
        Err(error) if error.is_transient() => {
            warn!(
                event_id = %event_id,
                error = %error,
                "transient publish failure, re-enqueueing"
            );
            outbox.reenqueue(event_id).await
        }
        Err(error) => {
            warn!(event_id = %event_id, error = %error, "event rejected by encoder");
            outbox.mark_failed(event_id, error.to_string()).await
        }
    };

    if let Err(error) = outcome {
        error!(event_id = %event_id, error = %error, "failed to record dispatch outcome");
    }
    event_id
}
