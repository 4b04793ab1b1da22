//! Workflow engine and repository trait definitions for Threadline.
//!
//! This crate defines the "ports" (repository traits) that the infrastructure
//! layer implements, plus the engine that walks workflow graphs. It depends
//! only on `threadline-types` -- never on `threadline-infra` or any
//! database/IO crate.

pub mod event;
pub mod functions;
pub mod repository;
pub mod workflow;
