//! Progress fan-out for generation jobs.
//!
//! - [`ProgressBroadcaster`] relays per-job [`ProgressEvent`]s and periodic
//!   [`SystemStatus`] aggregates to any number of observers.
//! - [`Subscription`] is the observer's end: a bounded stream that closes
//!   after a job's final event, or when the observer falls too far behind.
//!
//! [`ProgressEvent`]: kiln_core::job_events::ProgressEvent
//! [`SystemStatus`]: kiln_core::job_events::SystemStatus

pub mod bus;
pub mod subscription;

pub use bus::ProgressBroadcaster;
pub use subscription::Subscription;
