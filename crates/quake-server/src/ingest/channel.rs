//! Work distribution channel
//!
//! Assignments go out on the worker-requests queue. Replies come back on the
//! shared worker-replies queue, where a single router task forwards each one
//! to the step that owns its execution id over an in-process mpsc channel.
//! Replies for a step that already closed are acknowledged and dropped;
//! replies for executions this channel never saw are left for redelivery and
//! end up in the dead-letter queue.

use quake_common::messages::{WorkAssignment, WorkReply};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::tracker::TrackerError;
use crate::broker::{publish_json, BrokerError, Delivery, MessageBroker, QueueNames};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Failed to record reply: {0}")]
    Record(#[from] TrackerError),

    #[error("Reply router stopped")]
    RouterClosed,
}

/// A message on the reply path that cannot be matched to a step
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message on '{queue}': {source}")]
    Malformed {
        queue: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("reply for unknown execution {0}")]
    UnknownExecution(i64),

    #[error("reply for unknown partition '{partition_id}' of execution {execution_id}")]
    UnknownPartition { execution_id: i64, partition_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerdict {
    Accepted,
    Duplicate,
    Unknown,
}

/// Partition arena for one step
///
/// Holds at most one reply per planned partition, in plan order.
#[derive(Debug)]
pub struct ReplyGate {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    slots: Vec<Option<WorkReply>>,
}

impl ReplyGate {
    pub fn new<I, S>(partition_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: Vec<String> = partition_ids.into_iter().map(Into::into).collect();
        let index = ids.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        let slots = vec![None; ids.len()];
        Self { ids, index, slots }
    }

    pub fn classify(&self, reply: &WorkReply) -> ReplyVerdict {
        match self.index.get(&reply.partition_id) {
            None => ReplyVerdict::Unknown,
            Some(&slot) if self.slots[slot].is_some() => ReplyVerdict::Duplicate,
            Some(_) => ReplyVerdict::Accepted,
        }
    }

    /// Store the reply if its slot is still empty
    pub fn record(&mut self, reply: WorkReply) -> ReplyVerdict {
        let verdict = self.classify(&reply);
        if verdict == ReplyVerdict::Accepted {
            if let Some(&slot) = self.index.get(&reply.partition_id) {
                self.slots[slot] = Some(reply);
            }
        }
        verdict
    }

    pub fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    pub fn reported(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Partitions still waiting for a reply, in plan order
    pub fn outstanding(&self) -> Vec<String> {
        self.ids
            .iter()
            .zip(&self.slots)
            .filter(|(_, slot)| slot.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn into_replies(self) -> Vec<WorkReply> {
        self.slots.into_iter().flatten().collect()
    }
}

#[derive(Debug)]
pub enum StepOutcome {
    /// Every partition reported; replies in plan order
    Completed { replies: Vec<WorkReply> },
    Cancelled { outstanding: Vec<String> },
    TimedOut { outstanding: Vec<String> },
}

struct RoutedReply {
    reply: WorkReply,
    delivery: Delivery,
}

/// Closed steps remembered for acknowledging late replies
const CLOSED_STEP_MEMORY: usize = 1024;

#[derive(Default)]
struct RouteTable {
    open: HashMap<i64, mpsc::UnboundedSender<RoutedReply>>,
    closed: VecDeque<i64>,
}

impl RouteTable {
    fn close(&mut self, execution_id: i64) {
        if self.open.remove(&execution_id).is_some() {
            if self.closed.len() == CLOSED_STEP_MEMORY {
                self.closed.pop_front();
            }
            self.closed.push_back(execution_id);
        }
    }

    fn is_closed(&self, execution_id: i64) -> bool {
        self.closed.contains(&execution_id)
    }
}

type Routes = Arc<Mutex<RouteTable>>;

fn lock_routes(routes: &Routes) -> MutexGuard<'_, RouteTable> {
    routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Where the router sent a reply
enum Routing {
    Forwarded,
    /// The owning step already closed; acknowledge and drop
    Stale(Delivery),
}

#[derive(Clone)]
pub struct WorkChannel {
    broker: Arc<dyn MessageBroker>,
    queues: QueueNames,
    routes: Routes,
}

impl WorkChannel {
    pub fn new(broker: Arc<dyn MessageBroker>, queues: QueueNames) -> Self {
        Self {
            broker,
            queues,
            routes: Arc::new(Mutex::new(RouteTable::default())),
        }
    }

    pub async fn dispatch(&self, assignment: &WorkAssignment) -> Result<(), BrokerError> {
        publish_json(self.broker.as_ref(), &self.queues.worker_requests, assignment).await?;
        debug!(
            execution_id = assignment.execution_id,
            partition_id = %assignment.partition_id,
            "Dispatched work assignment"
        );
        Ok(())
    }

    /// Register the reply route of one step
    ///
    /// Call before dispatching so no reply can arrive unrouted. The route is
    /// removed when the returned [`StepReplies`] is dropped.
    pub fn open_step<I, S>(&self, execution_id: i64, partition_ids: I) -> StepReplies
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut routes = lock_routes(&self.routes);
        routes.closed.retain(|closed| *closed != execution_id);
        routes.open.insert(execution_id, tx);
        drop(routes);

        StepReplies {
            execution_id,
            gate: ReplyGate::new(partition_ids),
            rx,
            broker: self.broker.clone(),
            routes: self.routes.clone(),
        }
    }

    /// Consume the worker-replies queue until cancelled
    pub fn spawn_router(&self, cancel: CancellationToken, wait: Duration) -> JoinHandle<()> {
        let channel = self.clone();
        tokio::spawn(async move {
            info!(queue = %channel.queues.worker_replies, "Reply router started");
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = channel.broker.receive(&channel.queues.worker_replies, wait) => received,
                };

                match received {
                    Ok(Some(delivery)) => match channel.route_one(delivery) {
                        Ok(Routing::Forwarded) => {}
                        Ok(Routing::Stale(delivery)) => {
                            debug!(message_id = delivery.id, "Late reply for a closed step dropped");
                            if let Err(e) = channel.broker.ack(&delivery).await {
                                warn!(error = %e, "Failed to acknowledge late reply");
                            }
                        }
                        Err(e) => warn!(error = %e, "Unroutable reply left for redelivery"),
                    },
                    Ok(None) => {}
                    Err(e) => {
                        error!(error = %e, "Failed to receive worker reply");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
            info!("Reply router stopped");
        })
    }

    fn route_one(&self, delivery: Delivery) -> Result<Routing, ProtocolError> {
        let reply: WorkReply = delivery.decode().map_err(|source| ProtocolError::Malformed {
            queue: delivery.queue.clone(),
            source,
        })?;
        let execution_id = reply.execution_id;

        let routes = lock_routes(&self.routes);
        let Some(sender) = routes.open.get(&execution_id) else {
            return if routes.is_closed(execution_id) {
                Ok(Routing::Stale(delivery))
            } else {
                Err(ProtocolError::UnknownExecution(execution_id))
            };
        };

        sender
            .send(RoutedReply { reply, delivery })
            .map(|_| Routing::Forwarded)
            .map_err(|_| ProtocolError::UnknownExecution(execution_id))
    }
}

/// Reply side of one step
pub struct StepReplies {
    execution_id: i64,
    gate: ReplyGate,
    rx: mpsc::UnboundedReceiver<RoutedReply>,
    broker: Arc<dyn MessageBroker>,
    routes: Routes,
}

impl StepReplies {
    pub fn execution_id(&self) -> i64 {
        self.execution_id
    }

    /// Wait until every partition has reported
    ///
    /// Each accepted reply goes through `record` before it is acknowledged,
    /// so a crash in between leaves the reply on the queue.
    pub async fn await_replies<F, Fut>(
        &mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
        mut record: F,
    ) -> Result<StepOutcome, ChannelError>
    where
        F: FnMut(WorkReply) -> Fut,
        Fut: Future<Output = Result<(), TrackerError>>,
    {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);

        while !self.gate.is_complete() {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            let routed = tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(StepOutcome::Cancelled { outstanding: self.gate.outstanding() });
                }
                _ = expired => {
                    return Ok(StepOutcome::TimedOut { outstanding: self.gate.outstanding() });
                }
                routed = self.rx.recv() => routed.ok_or(ChannelError::RouterClosed)?,
            };

            let RoutedReply { reply, delivery } = routed;
            match self.gate.classify(&reply) {
                ReplyVerdict::Accepted => {
                    record(reply.clone()).await?;
                    debug!(
                        execution_id = self.execution_id,
                        partition_id = %reply.partition_id,
                        success = reply.is_success(),
                        worker = %reply.worker_identity,
                        "Partition reported"
                    );
                    self.gate.record(reply);
                    self.broker.ack(&delivery).await?;
                }
                ReplyVerdict::Duplicate => {
                    debug!(
                        execution_id = self.execution_id,
                        partition_id = %reply.partition_id,
                        "Duplicate reply ignored"
                    );
                    self.broker.ack(&delivery).await?;
                }
                ReplyVerdict::Unknown => {
                    let e = ProtocolError::UnknownPartition {
                        execution_id: self.execution_id,
                        partition_id: reply.partition_id,
                    };
                    warn!(error = %e, "Reply left for redelivery");
                }
            }
        }

        let gate = std::mem::replace(&mut self.gate, ReplyGate::new(Vec::<String>::new()));
        Ok(StepOutcome::Completed {
            replies: gate.into_replies(),
        })
    }
}

impl Drop for StepReplies {
    fn drop(&mut self) {
        lock_routes(&self.routes).close(self.execution_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::{BrokerSettings, InMemoryBroker};
    use quake_common::messages::PartitionCounts;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn assignment(execution_id: i64, partition_id: &str) -> WorkAssignment {
        WorkAssignment {
            execution_id,
            job_id: "job".into(),
            partition_id: partition_id.into(),
            source_path: format!("/data/{}.csv", partition_id),
        }
    }

    fn reply(execution_id: i64, partition_id: &str) -> WorkReply {
        WorkReply::succeeded(&assignment(execution_id, partition_id), PartitionCounts::default(), "w")
    }

    fn fast_settings() -> BrokerSettings {
        BrokerSettings {
            visibility_timeout: Duration::from_secs(30),
            max_deliveries: 3,
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_gate_classifies_replies() {
        let mut gate = ReplyGate::new(["partition0", "partition1"]);

        assert_eq!(gate.record(reply(1, "partition1")), ReplyVerdict::Accepted);
        assert_eq!(gate.record(reply(1, "partition1")), ReplyVerdict::Duplicate);
        assert_eq!(gate.record(reply(1, "partition7")), ReplyVerdict::Unknown);
        assert!(!gate.is_complete());
        assert_eq!(gate.outstanding(), vec!["partition0".to_string()]);

        gate.record(reply(1, "partition0"));
        assert!(gate.is_complete());
        assert_eq!(gate.reported(), 2);

        let ids: Vec<String> = gate.into_replies().into_iter().map(|r| r.partition_id).collect();
        assert_eq!(ids, vec!["partition0", "partition1"]);
    }

    #[test]
    fn test_empty_gate_is_complete() {
        assert!(ReplyGate::new(Vec::<String>::new()).is_complete());
    }

    #[tokio::test]
    async fn test_step_completes_regardless_of_reply_order() {
        let broker = Arc::new(InMemoryBroker::new(fast_settings()));
        let queues = QueueNames::default();
        let channel = WorkChannel::new(broker.clone(), queues.clone());
        let cancel = CancellationToken::new();
        let router = channel.spawn_router(cancel.clone(), Duration::from_millis(20));

        let mut step = channel.open_step(5, ["partition0", "partition1", "partition2"]);
        for id in ["partition2", "partition0", "partition2", "partition1"] {
            publish_json(broker.as_ref(), &queues.worker_replies, &reply(5, id))
                .await
                .unwrap();
        }

        let recorded = Arc::new(AtomicUsize::new(0));
        let counter = recorded.clone();
        let outcome = step
            .await_replies(&cancel, Some(Duration::from_secs(5)), move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();

        match outcome {
            StepOutcome::Completed { replies } => assert_eq!(replies.len(), 3),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(recorded.load(Ordering::SeqCst), 3);

        cancel.cancel();
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_publishes_assignment() {
        let broker = Arc::new(InMemoryBroker::new(fast_settings()));
        let queues = QueueNames::default();
        let channel = WorkChannel::new(broker.clone(), queues.clone());

        channel.dispatch(&assignment(3, "partition0")).await.unwrap();

        let delivery = broker
            .receive(&queues.worker_requests, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        let decoded: WorkAssignment = delivery.decode().unwrap();
        assert_eq!(decoded, assignment(3, "partition0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_times_out_with_outstanding_partitions() {
        let broker = Arc::new(InMemoryBroker::new(fast_settings()));
        let channel = WorkChannel::new(broker, QueueNames::default());
        let cancel = CancellationToken::new();

        let mut step = channel.open_step(9, ["partition0", "partition1"]);
        let outcome = step
            .await_replies(&cancel, Some(Duration::from_secs(1)), |_| async { Ok(()) })
            .await
            .unwrap();

        match outcome {
            StepOutcome::TimedOut { outstanding } => assert_eq!(outstanding, vec!["partition0", "partition1"]),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let broker = Arc::new(InMemoryBroker::new(fast_settings()));
        let channel = WorkChannel::new(broker, QueueNames::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut step = channel.open_step(2, ["partition0"]);
        let outcome = step.await_replies(&cancel, None, |_| async { Ok(()) }).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Cancelled { .. }));
    }

    fn delivery_of(execution_id: i64) -> Delivery {
        Delivery {
            id: 1,
            queue: "replies".into(),
            payload: serde_json::to_value(reply(execution_id, "partition0")).unwrap(),
            delivery_count: 1,
        }
    }

    #[tokio::test]
    async fn test_dropping_step_closes_route() {
        let broker = Arc::new(InMemoryBroker::new(fast_settings()));
        let channel = WorkChannel::new(broker.clone(), QueueNames::default());

        let step = channel.open_step(4, ["partition0"]);
        drop(step);

        assert!(matches!(channel.route_one(delivery_of(4)), Ok(Routing::Stale(_))));
        assert!(matches!(
            channel.route_one(delivery_of(8)),
            Err(ProtocolError::UnknownExecution(8))
        ));
    }

    #[tokio::test]
    async fn test_late_duplicate_after_step_closed_is_acknowledged() {
        let broker = Arc::new(InMemoryBroker::new(fast_settings()));
        let queues = QueueNames::default();
        let channel = WorkChannel::new(broker.clone(), queues.clone());
        let cancel = CancellationToken::new();
        let router = channel.spawn_router(cancel.clone(), Duration::from_millis(20));

        let mut step = channel.open_step(6, ["partition0"]);
        publish_json(broker.as_ref(), &queues.worker_replies, &reply(6, "partition0"))
            .await
            .unwrap();
        let outcome = step
            .await_replies(&cancel, Some(Duration::from_secs(5)), |_| async { Ok(()) })
            .await
            .unwrap();
        assert!(matches!(outcome, StepOutcome::Completed { .. }));
        drop(step);

        // A redelivered assignment reports again after the step closed
        publish_json(broker.as_ref(), &queues.worker_replies, &reply(6, "partition0"))
            .await
            .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while broker.pending(&queues.worker_replies).await + broker.in_flight(&queues.worker_replies).await > 0 {
            assert!(tokio::time::Instant::now() < deadline, "late reply was never acknowledged");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(broker.dead_letters(&queues.worker_replies).await.is_empty());

        cancel.cancel();
        router.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_for_unknown_execution_ends_in_dead_letter_queue() {
        let broker = Arc::new(InMemoryBroker::new(fast_settings()));
        let queues = QueueNames::default();
        let channel = WorkChannel::new(broker.clone(), queues.clone());
        let cancel = CancellationToken::new();
        let router = channel.spawn_router(cancel.clone(), Duration::from_millis(20));

        publish_json(broker.as_ref(), &queues.worker_replies, &reply(77, "partition0"))
            .await
            .unwrap();

        // Three visibility windows exhaust max_deliveries
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(broker.pending(&queues.worker_replies).await, 0);
        assert_eq!(broker.in_flight(&queues.worker_replies).await, 0);
        assert_eq!(broker.dead_letters(&queues.worker_replies).await.len(), 1);

        cancel.cancel();
        router.await.unwrap();
    }
}
