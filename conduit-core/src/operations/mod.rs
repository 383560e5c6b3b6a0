pub mod admission;
pub mod job;
pub mod maintainer;
pub mod provision;
pub mod runner;
pub mod scheduler;
pub mod state;
pub mod worker_pool;

pub use admission::ActiveOperations;
pub use job::{CreateJob, DeleteJob, Job, JobKind, JobOutcome, UpdateJob};
pub use maintainer::{OperationMaintainer, OperationResumer};
pub use provision::ProvisionInstanceJob;
pub use runner::JobRunner;
pub use scheduler::Scheduler;
pub use worker_pool::{JobQueue, WorkerPool};
