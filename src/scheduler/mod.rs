//! In-process scheduling of work items.
//!
//! - **WorkQueue**: priority queue with a deferred heap for retry delays
//! - **LeaseTable**: per-item leases so no two workers advance the same item
//! - **SubmissionLimiter**: spacing between submission calls, with an
//!   adaptive multiplier when recent submissions fail
//! - **JobScheduler**: bounded worker pool tying the three together
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │      WorkQueue       │
//!                 │  ready  │  deferred  │
//!                 └────┬────┴─────▲──────┘
//!          claim+lease │          │ retry-after
//!        ┌─────────────┼──────────┼──────────┐
//!        ▼             ▼          │          ▼
//!   ┌─────────┐   ┌─────────┐     │     ┌─────────┐
//!   │ Worker 0│   │ Worker 1│ ────┘     │ Worker N│
//!   └─────────┘   └─────────┘           └─────────┘
//! ```

pub mod lease;
pub mod queue;
pub mod rate_limit;
pub mod worker_pool;

pub use lease::{ItemLease, LeaseError, LeaseId, LeaseTable};
pub use queue::{DeferredState, QueueState, WorkQueue};
pub use rate_limit::{LimiterError, SubmissionLimiter};
pub use worker_pool::{InitialState, JobScheduler, SchedulerControl, SchedulerError};
