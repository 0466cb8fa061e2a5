//! `jobforge-core`: job queue domain building blocks.
//!
//! This crate contains **pure domain** primitives: the job state machine, the
//! task failure classification and the retry/backoff decision logic. Storage,
//! scheduling and transport live in other crates.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;
pub mod task;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, WorkerId};
pub use job::{Job, JobStatus, MAX_ATTEMPTS_LIMIT, NewJob};
pub use retry::{FailureDecision, PermanentReason, RetryPolicy};
pub use task::{FailureKind, TaskFailure, TaskOutcome};
