//! Row structs for the tables this crate owns.

pub mod generation_job;
