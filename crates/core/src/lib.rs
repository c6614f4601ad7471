//! Pure domain logic for the generation job orchestrator.
//!
//! Everything in this crate is free of I/O so it can be unit-tested in
//! isolation and shared by the pipeline, persistence and API crates.

pub mod adjuster;
pub mod classifier;
pub mod error;
pub mod job;
pub mod job_events;
pub mod params;
pub mod quality_gate;
pub mod types;
