//! Ingestion paths in front of the event store: a synchronous
//! validate-then-append path for request handlers, and a channel-based
//! batch writer for high-volume instrumentation traffic.

use astro_core::config::IngestConfig;
use astro_core::error::{AstroError, AstroResult};
use astro_core::event::{self, Event, RawEvent};
use astro_core::types::Ack;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::contract::EventStore;

/// Boundary ingestor: validates raw events and appends them, returning
/// a per-event Ack or the validation error for the caller to correct.
pub struct Ingestor {
    store: Arc<dyn EventStore>,
    max_future_skew: chrono::Duration,
}

impl Ingestor {
    pub fn new(store: Arc<dyn EventStore>, config: &IngestConfig) -> Self {
        Self {
            store,
            max_future_skew: config.max_future_skew(),
        }
    }

    pub fn ingest(&self, raw: RawEvent) -> AstroResult<Ack> {
        let event = event::validate(raw, self.max_future_skew).map_err(|e| {
            metrics::counter!("ingest.rejected").increment(1);
            warn!(error = %e, "Event rejected at validation");
            e
        })?;
        self.store.append(event)
    }

    /// Validate and append a finite batch. Each event succeeds or fails
    /// independently; a malformed event never blocks its neighbors.
    pub fn ingest_batch(&self, batch: Vec<RawEvent>) -> Vec<AstroResult<Ack>> {
        batch.into_iter().map(|raw| self.ingest(raw)).collect()
    }
}

/// Asynchronous pipeline that batches validated events and appends them
/// from a background task.
pub struct EventPipeline {
    sender: mpsc::Sender<Event>,
}

impl EventPipeline {
    /// Create the pipeline and spawn its background writer.
    pub fn new(store: Arc<dyn EventStore>, config: &IngestConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<Event>(config.channel_capacity);

        let writer = BatchWriter { store };
        let batch_size = config.batch_size;
        let flush_interval = std::time::Duration::from_millis(config.flush_interval_ms);

        tokio::spawn(async move {
            writer.run(receiver, batch_size, flush_interval).await;
        });

        info!(
            capacity = config.channel_capacity,
            batch_size, "Event pipeline started"
        );

        Self { sender }
    }

    /// Queue a validated event for durable append (non-blocking). A full
    /// channel is an error for the caller to retry with backoff; events
    /// are never silently dropped.
    pub fn submit(&self, event: Event) -> AstroResult<()> {
        self.sender.try_send(event).map_err(|e| {
            metrics::counter!("pipeline.backpressure").increment(1);
            AstroError::StorageUnavailable(format!("ingest queue full: {e}"))
        })
    }
}

struct BatchWriter {
    store: Arc<dyn EventStore>,
}

impl BatchWriter {
    async fn run(
        self,
        mut receiver: mpsc::Receiver<Event>,
        batch_size: usize,
        flush_interval: std::time::Duration,
    ) {
        let mut buffer: Vec<Event> = Vec::with_capacity(batch_size);
        let mut interval = tokio::time::interval(flush_interval);

        loop {
            tokio::select! {
                maybe_event = receiver.recv() => match maybe_event {
                    Some(event) => {
                        buffer.push(event);
                        if buffer.len() >= batch_size {
                            self.flush(&mut buffer);
                        }
                    }
                    None => {
                        self.flush(&mut buffer);
                        break;
                    }
                },
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&mut buffer);
                    }
                }
            }
        }
    }

    fn flush(&self, buffer: &mut Vec<Event>) {
        if buffer.is_empty() {
            return;
        }
        let count = buffer.len();
        debug!(count, "Flushing event batch");

        match self.store.append_batch(buffer.clone()) {
            Ok(_) => {
                metrics::counter!("pipeline.flushed").increment(count as u64);
                buffer.clear();
            }
            Err(e) => {
                // Keep the batch buffered; the next flush trigger retries.
                // Idempotent appends make the retry safe.
                metrics::counter!("pipeline.flush_errors").increment(1);
                error!(error = %e, count, "Event batch flush failed, will retry");
            }
        }
    }
}
