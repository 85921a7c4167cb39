#![forbid(unsafe_code)]

//! Adaptive bitrate selection.
//!
//! One [`AbrCoordinator`] exists per media track. It consumes throughput
//! samples published by the segment pipeline, plus runtime constraints
//! (manual override, throttling, display width), and answers with the
//! representation the buffer should fetch next. Decisions are debounced so
//! quality does not oscillate on noisy networks.

mod coordinator;
mod estimator;
mod types;

pub use coordinator::{AbrCoordinator, Selection, SelectionReason};
pub use estimator::{Estimator, ThroughputEstimator};
pub use types::{AbrOptions, Candidate, ThroughputSample};
