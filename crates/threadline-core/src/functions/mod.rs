//! Built-in step functions.
//!
//! Graphs refer to these by locator (`request.request`, `reply.reply`,
//! `data.set`, `condition.*`). Applications register their own functions
//! next to them on the same [`FunctionRegistry`].

pub mod condition;
pub mod data;
pub mod reply;
pub mod request;

use crate::workflow::registry::FunctionRegistry;

/// Register every built-in function on `registry`.
pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register(request::LOCATOR, request::RequestInput);
    registry.register(reply::LOCATOR, reply::EmitReply);
    registry.register(data::LOCATOR, data::SetData);
    condition::register(registry);
}
