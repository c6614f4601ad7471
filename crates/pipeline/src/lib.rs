//! Generation job orchestration.
//!
//! A caller enqueues a parameter document through [`GenerationService`].
//! The [`pool::WorkerPool`] hands queued jobs to the
//! [`orchestrator::Orchestrator`], which drives each one through
//! submit, poll and recovery against a render gateway, then runs the
//! quality gate on success. Every state change is published to the
//! progress broadcaster and, when configured, written through to storage.

pub mod config;
pub mod janitor;
pub mod orchestrator;
pub mod pool;
pub mod quality;
pub mod recovery;
pub mod service;
pub mod status;
pub mod store;
pub mod table;

pub use config::PipelineConfig;
pub use service::{GenerationService, GenerationServiceBuilder};
