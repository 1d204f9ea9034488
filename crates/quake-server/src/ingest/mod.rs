//! Partitioned ingestion: planning, distribution, execution and tracking

pub mod channel;
pub mod manager;
pub mod partition;
pub mod pipeline;
pub mod tracker;
pub mod worker;

pub use channel::{ReplyGate, StepOutcome, WorkChannel};
pub use manager::{JobManager, ManagerSettings};
pub use partition::{Partition, PartitionPlan, PartitionPlanner, PlanningError};
pub use tracker::{JobStore, MemoryJobStore, PgJobStore, TrackerError};
pub use worker::{spawn_workers, worker_identity, IngestionWorker, WorkerSettings};
