//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (threadline-infra) implements. The core crate never depends on any
//! specific storage technology.

pub mod graph;
pub mod session;

pub use graph::GraphRepository;
pub use session::SessionRepository;
