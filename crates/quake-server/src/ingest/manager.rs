//! Job manager
//!
//! Consumes the job-requests queue and drives each execution through its
//! single partitioned step: plan, dispatch one assignment per partition,
//! collect every reply, then record the terminal status. Only the manager
//! writes job and partition state.

use anyhow::Context;
use quake_common::messages::{JobRequest, JobStatus, WorkAssignment, EARTHQUAKE_INGESTION_JOB};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::channel::{StepOutcome, WorkChannel};
use super::partition::PartitionPlanner;
use super::tracker::JobStore;
use crate::broker::{Delivery, MessageBroker, QueueNames};

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// `None` waits for replies indefinitely
    pub reply_timeout: Option<Duration>,
    pub max_concurrent_jobs: usize,
    pub poll_wait: Duration,
}

#[derive(Clone)]
pub struct JobManager {
    broker: Arc<dyn MessageBroker>,
    queues: QueueNames,
    planner: PartitionPlanner,
    channel: WorkChannel,
    tracker: Arc<dyn JobStore>,
    settings: ManagerSettings,
    permits: Arc<Semaphore>,
}

impl JobManager {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        queues: QueueNames,
        planner: PartitionPlanner,
        tracker: Arc<dyn JobStore>,
        settings: ManagerSettings,
    ) -> Self {
        let channel = WorkChannel::new(broker.clone(), queues.clone());
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            broker,
            queues,
            planner,
            channel,
            tracker,
            settings,
            permits,
        }
    }

    /// Consume job requests until cancelled
    ///
    /// On shutdown, running executions stop waiting for replies and are
    /// recorded as STOPPED before this returns.
    pub async fn run(self, cancel: CancellationToken) {
        let router = self.channel.spawn_router(cancel.clone(), self.settings.poll_wait);
        let mut executions = JoinSet::new();
        info!(
            queue = %self.queues.job_requests,
            max_concurrent_jobs = self.settings.max_concurrent_jobs,
            "Job manager started"
        );

        loop {
            while executions.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.broker.receive(&self.queues.job_requests, self.settings.poll_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => self.accept(delivery, permit, &mut executions, &cancel).await,
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Failed to receive job request");
                    tokio::time::sleep(self.settings.poll_wait).await;
                }
            }
        }

        info!(running = executions.len(), "Job manager stopping");
        while executions.join_next().await.is_some() {}
        if let Err(e) = router.await {
            warn!(error = %e, "Reply router task failed");
        }
        info!("Job manager stopped");
    }

    async fn accept(
        &self,
        delivery: Delivery,
        permit: OwnedSemaphorePermit,
        executions: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) {
        let request: JobRequest = match delivery.decode() {
            Ok(request) => request,
            Err(e) => {
                warn!(message_id = delivery.id, error = %e, "Malformed job request left for redelivery");
                return;
            }
        };

        if request.job_type != EARTHQUAKE_INGESTION_JOB {
            debug!(job_type = %request.job_type, job_id = %request.job_id, "Ignoring request for another job type");
            if let Err(e) = self.broker.ack(&delivery).await {
                warn!(error = %e, "Failed to acknowledge ignored request");
            }
            return;
        }

        let execution_id = match self.launch(&request).await {
            Ok(id) => id,
            Err(e) => {
                error!(job_id = %request.job_id, error = %e, "Failed to create job execution");
                if let Err(e) = self.broker.nack(&delivery).await {
                    warn!(error = %e, "Failed to release job request");
                }
                return;
            }
        };

        if let Err(e) = self.broker.ack(&delivery).await {
            warn!(execution_id, error = %e, "Failed to acknowledge job request");
        }

        let manager = self.clone();
        let cancel = cancel.clone();
        executions.spawn(async move {
            manager.execute(execution_id, request, &cancel).await;
            drop(permit);
        });
    }

    /// Create the execution record for a request
    pub async fn launch(&self, request: &JobRequest) -> anyhow::Result<i64> {
        let execution_id = self
            .tracker
            .create_execution(request)
            .await
            .context("Failed to create execution")?;
        info!(execution_id, job_id = %request.job_id, "Job execution created");
        Ok(execution_id)
    }

    /// Run the step of an execution and record how it ended
    pub async fn execute(&self, execution_id: i64, request: JobRequest, cancel: &CancellationToken) {
        let (status, description) = match self.run_step(execution_id, &request, cancel).await {
            Ok(result) => result,
            Err(e) => (JobStatus::Failed, Some(format!("{:#}", e))),
        };

        match self.tracker.finish(execution_id, status, description.as_deref()).await {
            Ok(()) => info!(
                execution_id,
                job_id = %request.job_id,
                status = %status,
                description = description.as_deref().unwrap_or(""),
                "Job execution finished"
            ),
            Err(e) => error!(execution_id, status = %status, error = %e, "Failed to record execution outcome"),
        }
    }

    async fn run_step(
        &self,
        execution_id: i64,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(JobStatus, Option<String>)> {
        self.tracker
            .mark_started(execution_id)
            .await
            .context("Failed to start execution")?;

        let plan = match self.planner.plan(&request.data_directory).await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(execution_id, error = %e, "Partition planning failed");
                return Ok((JobStatus::Failed, Some(e.to_string())));
            }
        };

        if plan.is_empty() {
            info!(execution_id, directory = %plan.directory.display(), "No partitions to process");
            return Ok((JobStatus::Completed, None));
        }

        self.tracker
            .record_partitions(execution_id, &plan.partitions)
            .await
            .context("Failed to record partitions")?;

        let total = plan.partitions.len();
        let mut step = self
            .channel
            .open_step(execution_id, plan.partitions.iter().map(|p| p.id.clone()));

        for partition in &plan.partitions {
            let assignment = WorkAssignment {
                execution_id,
                job_id: request.job_id.clone(),
                partition_id: partition.id.clone(),
                source_path: partition.source_path.to_string_lossy().into_owned(),
            };
            self.channel
                .dispatch(&assignment)
                .await
                .with_context(|| format!("Failed to dispatch {}", partition.id))?;
        }
        info!(execution_id, partitions = total, "Dispatched partitions");

        let tracker = self.tracker.clone();
        let outcome = step
            .await_replies(cancel, self.settings.reply_timeout, move |reply| {
                let tracker = tracker.clone();
                async move { tracker.record_reply(execution_id, &reply).await.map(|_| ()) }
            })
            .await
            .context("Failed while collecting replies")?;

        Ok(match outcome {
            StepOutcome::Completed { replies } => {
                let failed = replies.iter().filter(|r| !r.is_success()).count();
                if failed == 0 {
                    (JobStatus::Completed, None)
                } else {
                    (
                        JobStatus::Failed,
                        Some(format!("{} of {} partitions failed", failed, total)),
                    )
                }
            }
            StepOutcome::Cancelled { outstanding } => (
                JobStatus::Stopped,
                Some(format!(
                    "stopped while waiting for {} of {} partitions",
                    outstanding.len(),
                    total
                )),
            ),
            StepOutcome::TimedOut { outstanding } => (
                JobStatus::Failed,
                Some(format!("no reply received from: {}", outstanding.join(", "))),
            ),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::{publish_json, BrokerSettings, InMemoryBroker};
    use crate::ingest::tracker::MemoryJobStore;
    use quake_common::messages::{PartitionCounts, WorkReply};
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        root: TempDir,
        broker: Arc<InMemoryBroker>,
        tracker: Arc<MemoryJobStore>,
        manager: JobManager,
    }

    fn fixture(reply_timeout: Option<Duration>) -> Fixture {
        let root = TempDir::new().unwrap();
        let broker = Arc::new(InMemoryBroker::new(BrokerSettings::default()));
        let tracker = Arc::new(MemoryJobStore::new());
        let manager = JobManager::new(
            broker.clone(),
            QueueNames::default(),
            PartitionPlanner::new(root.path(), "earthquakes", ".csv"),
            tracker.clone(),
            ManagerSettings {
                reply_timeout,
                max_concurrent_jobs: 2,
                poll_wait: Duration::from_millis(20),
            },
        );
        Fixture {
            root,
            broker,
            tracker,
            manager,
        }
    }

    async fn run_job(f: &Fixture, directory: &str) -> i64 {
        let request = JobRequest::earthquake_ingestion("job-1", directory);
        let id = f.manager.launch(&request).await.unwrap();
        f.manager.execute(id, request, &CancellationToken::new()).await;
        id
    }

    #[tokio::test]
    async fn test_empty_directory_completes_without_workers() {
        let f = fixture(None);
        fs::create_dir(f.root.path().join("empty")).unwrap();

        run_job(&f, "empty").await;

        let status = f.tracker.latest_by_job_id("job-1").await.unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.worker_count, 0);
        assert_eq!(f.broker.pending(&QueueNames::default().worker_requests).await, 0);
    }

    #[tokio::test]
    async fn test_planning_failure_fails_execution() {
        let f = fixture(None);
        fs::write(f.root.path().join("not-a-dir"), "x").unwrap();

        let id = run_job(&f, "not-a-dir").await;

        let failure = f.tracker.failure_by_execution(id).await.unwrap().unwrap();
        assert_eq!(failure.exit_code, "FAILED");
        assert!(failure.exit_description.starts_with("[managerStep]: cannot list input directory"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_workers_time_out() {
        let f = fixture(Some(Duration::from_secs(60)));
        let dir = f.root.path().join("2024");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("earthquakes-a.csv"), "header\n").unwrap();

        let manager = f.manager.clone();
        let cancel = CancellationToken::new();
        let router = manager.channel.spawn_router(cancel.clone(), Duration::from_millis(20));
        let id = run_job(&f, "2024").await;

        let failure = f.tracker.failure_by_execution(id).await.unwrap().unwrap();
        assert_eq!(failure.exit_code, "FAILED");
        assert!(failure.exit_description.contains("no reply received from: partition0"));
        assert!(failure.exit_description.contains("[workerStep:partition0]"));

        cancel.cancel();
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_partition_fails_execution() {
        let f = fixture(None);
        let dir = f.root.path().join("2024");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("earthquakes-a.csv"), "header\n").unwrap();
        fs::write(dir.join("earthquakes-b.csv"), "header\n").unwrap();

        let cancel = CancellationToken::new();
        let router = f.manager.channel.spawn_router(cancel.clone(), Duration::from_millis(20));

        // Answer assignments by hand: first succeeds, second fails
        let broker = f.broker.clone();
        let responder = tokio::spawn(async move {
            let queues = QueueNames::default();
            for n in 0..2 {
                let delivery = loop {
                    if let Some(d) = broker.receive(&queues.worker_requests, Duration::from_millis(50)).await.unwrap() {
                        break d;
                    }
                };
                let assignment: WorkAssignment = delivery.decode().unwrap();
                let reply = if n == 0 {
                    WorkReply::succeeded(&assignment, PartitionCounts::default(), "w1")
                } else {
                    WorkReply::failed(&assignment, PartitionCounts::default(), "w2", "line 2 failed validation")
                };
                publish_json(broker.as_ref(), &queues.worker_replies, &reply).await.unwrap();
                broker.ack(&delivery).await.unwrap();
            }
        });

        let id = run_job(&f, "2024").await;
        responder.await.unwrap();

        let status = f.tracker.latest_by_job_id("job-1").await.unwrap().unwrap();
        assert_eq!(status.status, JobStatus::Failed);
        assert_eq!(status.worker_count, 2);

        let failure = f.tracker.failure_by_execution(id).await.unwrap().unwrap();
        assert_eq!(
            failure.exit_description,
            "[managerStep]: 1 of 2 partitions failed\n[workerStep:partition1]: line 2 failed validation"
        );

        cancel.cancel();
        router.await.unwrap();
    }

    #[tokio::test]
    async fn test_other_job_types_are_acknowledged_and_ignored() {
        let f = fixture(None);
        let queues = QueueNames::default();
        let mut request = JobRequest::earthquake_ingestion("job-x", "2024");
        request.job_type = "some-other-job".into();
        publish_json(f.broker.as_ref(), &queues.job_requests, &request).await.unwrap();

        let cancel = CancellationToken::new();
        let running = tokio::spawn(f.manager.clone().run(cancel.clone()));
        while f.broker.pending(&queues.job_requests).await > 0 || f.broker.in_flight(&queues.job_requests).await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        running.await.unwrap();

        assert!(f.tracker.latest_by_job_id("job-x").await.unwrap().is_none());
    }
}
