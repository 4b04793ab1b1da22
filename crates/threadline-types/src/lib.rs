//! Shared domain types for Threadline.
//!
//! This crate contains the types passed between the engine, its storage
//! backends and the application layer: sessions, workflow graphs, engine
//! events, configuration and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod session;
