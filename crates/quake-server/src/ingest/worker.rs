//! Worker execution engine
//!
//! A worker claims one assignment at a time from the worker-requests queue,
//! runs the row pipeline over the partition file in transactional chunks and
//! publishes a reply. The assignment is acknowledged only after the reply is
//! on the queue.
//!
//! While a partition is being processed a lease keeper extends the
//! assignment's visibility every third of the lease, so a slow partition is
//! not handed to a second worker. Parsing runs on the blocking pool and
//! streams finished chunks to the writer over a bounded channel.

use quake_common::messages::{PartitionCounts, WorkAssignment, WorkReply};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::pipeline::{
    DomainRecord, FieldLayout, PartitionKey, RecordReader, RecordSink, RowError, RowProcessor, SinkError,
};
use crate::broker::{publish_json, Delivery, MessageBroker, QueueNames};

/// Identity reported when the hostname cannot be read
pub const UNKNOWN_WORKER: &str = "unknown";

/// Parsed chunks allowed to queue up ahead of the writer
const CHUNK_BUFFER: usize = 2;

/// Shortest interval between lease extensions
const MIN_LEASE_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("cannot read partition file '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Row(#[from] RowError),

    #[error("chunk write failed: {0}")]
    Sink(#[from] SinkError),

    #[error("partition reader stopped unexpectedly: {0}")]
    Reader(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub identity: String,
    pub chunk_size: usize,
    /// How long one receive call waits before re-checking for shutdown
    pub poll_wait: Duration,
    /// Visibility requested on each extension of a claimed assignment;
    /// normally the broker's visibility timeout
    pub lease: Duration,
}

/// Hostname, unless an explicit id is configured
pub fn worker_identity(configured: Option<&str>) -> String {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        return id.to_string();
    }
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| UNKNOWN_WORKER.to_string())
}

pub struct IngestionWorker {
    broker: Arc<dyn MessageBroker>,
    queues: QueueNames,
    sink: Arc<dyn RecordSink>,
    layout: Arc<FieldLayout>,
    processor: RowProcessor,
    settings: WorkerSettings,
}

impl IngestionWorker {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queues: QueueNames,
        sink: Arc<dyn RecordSink>,
        layout: Arc<FieldLayout>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            broker,
            queues,
            sink,
            layout,
            processor: RowProcessor::default(),
            settings,
        }
    }

    pub fn identity(&self) -> &str {
        &self.settings.identity
    }

    /// Claim and process assignments until cancelled
    ///
    /// Cancellation is observed between partitions only.
    pub async fn run(self, cancel: CancellationToken) {
        info!(worker = %self.settings.identity, queue = %self.queues.worker_requests, "Worker started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.broker.receive(&self.queues.worker_requests, self.settings.poll_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker = %self.settings.identity, error = %e, "Failed to claim assignment");
                    tokio::time::sleep(self.settings.poll_wait).await;
                }
            }
        }

        info!(worker = %self.settings.identity, "Worker stopped");
    }

    /// Claim at most one assignment and process it
    ///
    /// Returns `true` if an assignment was handled.
    pub async fn poll_once(&self) -> Result<bool, crate::broker::BrokerError> {
        match self
            .broker
            .receive(&self.queues.worker_requests, self.settings.poll_wait)
            .await?
        {
            Some(delivery) => {
                self.handle(delivery).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let assignment: WorkAssignment = match delivery.decode() {
            Ok(assignment) => assignment,
            Err(e) => {
                warn!(
                    worker = %self.settings.identity,
                    message_id = delivery.id,
                    error = %e,
                    "Malformed assignment left for redelivery"
                );
                return;
            }
        };
        debug!(
            worker = %self.settings.identity,
            partition_id = %assignment.partition_id,
            delivery_count = delivery.delivery_count,
            "Assignment claimed"
        );

        let lease_handle = self.start_lease_keeper(&delivery);
        let reply = self.process_partition(&assignment).await;
        lease_handle.abort();

        debug!(worker = %self.settings.identity, partition_id = %assignment.partition_id, "Publishing reply");
        if let Err(e) = publish_json(self.broker.as_ref(), &self.queues.worker_replies, &reply).await {
            error!(
                worker = %self.settings.identity,
                execution_id = assignment.execution_id,
                partition_id = %assignment.partition_id,
                error = %e,
                "Failed to publish reply, releasing assignment"
            );
            if let Err(e) = self.broker.nack(&delivery).await {
                warn!(error = %e, "Failed to release assignment");
            }
            return;
        }

        if let Err(e) = self.broker.ack(&delivery).await {
            warn!(error = %e, message_id = delivery.id, "Failed to acknowledge assignment");
        }
        debug!(worker = %self.settings.identity, message_id = delivery.id, "Assignment acknowledged");
    }

    /// Keep the claim on `delivery` alive until the returned task is aborted
    fn start_lease_keeper(&self, delivery: &Delivery) -> JoinHandle<()> {
        let broker = self.broker.clone();
        let delivery = delivery.clone();
        let worker = self.settings.identity.clone();
        let lease = self.settings.lease;
        let period = (lease / 3).max(MIN_LEASE_PERIOD);

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match broker.extend(&delivery, lease).await {
                    Ok(true) => debug!(worker = %worker, message_id = delivery.id, "Assignment lease extended"),
                    Ok(false) => {
                        warn!(
                            worker = %worker,
                            message_id = delivery.id,
                            "Assignment lease lost, another worker may process it"
                        );
                        break;
                    }
                    Err(e) => warn!(worker = %worker, error = %e, "Failed to extend assignment lease"),
                }
            }
        })
    }

    /// Run the pipeline over one partition
    ///
    /// Never fails: errors become a FAILED reply carrying the diagnostic.
    pub async fn process_partition(&self, assignment: &WorkAssignment) -> WorkReply {
        let mut counts = PartitionCounts::default();

        match self.ingest(assignment, &mut counts).await {
            Ok(()) => {
                info!(
                    worker = %self.settings.identity,
                    execution_id = assignment.execution_id,
                    partition_id = %assignment.partition_id,
                    read = counts.read,
                    written = counts.written,
                    "Partition completed"
                );
                WorkReply::succeeded(assignment, counts, &self.settings.identity)
            }
            Err(e) => {
                warn!(
                    worker = %self.settings.identity,
                    execution_id = assignment.execution_id,
                    partition_id = %assignment.partition_id,
                    read = counts.read,
                    written = counts.written,
                    skipped = counts.skipped,
                    error = %e,
                    "Partition failed"
                );
                WorkReply::failed(assignment, counts, &self.settings.identity, e.to_string())
            }
        }
    }

    async fn ingest(&self, assignment: &WorkAssignment, counts: &mut PartitionCounts) -> Result<(), PartitionError> {
        let path = PathBuf::from(&assignment.source_path);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file.into_std().await,
            Err(source) => return Err(PartitionError::Io { path, source }),
        };

        let key = PartitionKey {
            execution_id: assignment.execution_id,
            partition_id: assignment.partition_id.clone(),
        };
        let removed = self.sink.reset_partition(&key).await?;
        if removed > 0 {
            info!(partition_id = %key.partition_id, removed, "Removed rows of an earlier attempt");
        }

        let (tx, mut rx) = mpsc::channel(CHUNK_BUFFER);
        let layout = self.layout.clone();
        let processor = self.processor;
        let chunk_size = self.settings.chunk_size.max(1);
        let reader = tokio::task::spawn_blocking(move || read_chunks(file, &layout, processor, chunk_size, tx));

        let written = self.write_chunks(&key, &mut rx, counts).await;
        // The reader stops at its next send once the receiver is gone
        drop(rx);
        let finished = reader.await;

        written?;
        finished?;
        Ok(())
    }

    async fn write_chunks(
        &self,
        key: &PartitionKey,
        rx: &mut mpsc::Receiver<ChunkEvent>,
        counts: &mut PartitionCounts,
    ) -> Result<(), PartitionError> {
        while let Some(event) = rx.recv().await {
            match event {
                ChunkEvent::Rows(records) => {
                    let read = records.len() as u64;
                    counts.read += read;
                    counts.processed += read;

                    match self.sink.write_chunk(key, &records).await {
                        Ok(written) => {
                            counts.written += written;
                            debug!(partition_id = %key.partition_id, written, "Chunk committed");
                        }
                        Err(e) => {
                            counts.skipped += read;
                            return Err(e.into());
                        }
                    }
                }
                ChunkEvent::Failed { pending, error } => {
                    // The failing row and the good rows before it in its chunk
                    counts.read += pending + 1;
                    counts.processed += pending;
                    counts.skipped += pending + 1;
                    return Err(error.into());
                }
            }
        }
        Ok(())
    }
}

/// Output of the blocking reader, in file order
enum ChunkEvent {
    /// A full chunk, or the final partial one
    Rows(Vec<DomainRecord>),
    /// A row could not be processed; `pending` good rows of its chunk are dropped
    Failed { pending: u64, error: RowError },
}

/// Parse, validate and transform the file on the calling thread
///
/// Stops at the first bad row, or as soon as the receiver is dropped.
fn read_chunks(
    file: std::fs::File,
    layout: &FieldLayout,
    processor: RowProcessor,
    chunk_size: usize,
    tx: mpsc::Sender<ChunkEvent>,
) {
    let mut records = Vec::with_capacity(chunk_size);

    for row in RecordReader::new(file, layout) {
        match row.map_err(RowError::from).and_then(|raw| processor.process(raw)) {
            Ok(record) => records.push(record),
            Err(error) => {
                let pending = records.len() as u64;
                let _ = tx.blocking_send(ChunkEvent::Failed { pending, error });
                return;
            }
        }

        if records.len() >= chunk_size {
            let chunk = std::mem::replace(&mut records, Vec::with_capacity(chunk_size));
            if tx.blocking_send(ChunkEvent::Rows(chunk)).is_err() {
                return;
            }
        }
    }

    if !records.is_empty() {
        let _ = tx.blocking_send(ChunkEvent::Rows(records));
    }
}

/// Start `count` workers sharing the same broker and sink
///
/// With more than one worker, each identity gets a `-{n}` suffix.
pub fn spawn_workers(
    count: usize,
    broker: Arc<dyn MessageBroker>,
    queues: QueueNames,
    sink: Arc<dyn RecordSink>,
    layout: Arc<FieldLayout>,
    settings: WorkerSettings,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let count = count.max(1);
    (1..=count)
        .map(|n| {
            let mut settings = settings.clone();
            if count > 1 {
                settings.identity = format!("{}-{}", settings.identity, n);
            }
            let worker = IngestionWorker::new(broker.clone(), queues.clone(), sink.clone(), layout.clone(), settings);
            tokio::spawn(worker.run(cancel.clone()))
        })
        .collect()
}
