//! Infrastructure layer for Threadline.
//!
//! Contains implementations of the repository traits defined in
//! `threadline-core`: in-memory stores, SQLite storage, the backend enums
//! that select between them at startup, and config file loading.

pub mod backend;
pub mod config;
pub mod memory;
pub mod sqlite;
