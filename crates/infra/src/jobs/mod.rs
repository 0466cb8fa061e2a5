//! Durable job queue engine.
//!
//! ## Components
//!
//! - `JobStore`: persistence with an atomic claim (in-memory or Postgres)
//! - `SubmissionGateway`: idempotent job creation
//! - `LeaseReclaimer`: returns abandoned in-progress jobs to pending
//! - `HandlerRegistry`: maps task types to executors
//! - `JobWorker`: claim / execute / finalize loop
//!
//! All coordination between workers goes through the store; nothing is
//! shared in-process except the store handle itself.

pub mod clock;
pub mod events;
pub mod executor;
pub mod postgres;
pub mod reclaim;
pub mod store;
pub mod submission;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use events::{JobEvent, JobEventSink, MetricsSnapshot, WorkerMetrics};
pub use executor::{HandlerRegistry, SleepTestTask, TaskExecutor, TaskHandler};
pub use postgres::PostgresJobStore;
pub use reclaim::LeaseReclaimer;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
pub use submission::{SubmissionGateway, SubmitError, SubmitOutcome, SubmitRequest, Submission};
pub use worker::{JobWorker, Tick, WorkerHandle, WorkerSettings};
