//! Warden DLQ
//!
//! Failed units land in a [`DeadLetterQueue`] classified as TRANSIENT,
//! PERMANENT or POLICY. Only TRANSIENT items are retried, on an exponential
//! backoff schedule; the rest arrive exhausted and wait for an operator to
//! reprocess or discard them.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod backoff;
pub mod error;
pub mod item;
pub mod queue;

pub use backoff::{BackoffPolicy, DlqConfig};
pub use error::DlqError;
pub use item::{DlqItem, DlqRecord, DlqStats, Failure, RetryOutcome, RetrySchedule, RetrySweep};
pub use queue::{DeadLetterQueue, DlqIndex, DlqIndexEntry, DLQ_INDEX_KEY};
