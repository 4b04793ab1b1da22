//! Workflow execution: reference resolution, transition evaluation, the
//! function registry, step execution, deferral, and the engine that ties
//! them together.

pub mod definition;
pub mod deferral;
pub mod engine;
pub mod executor;
pub mod function;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod transition;
pub mod value;

pub use definition::{GraphError, load_graph_file, validate_graph};
pub use engine::{EngineError, EngineResponse, WorkflowEngine};
pub use function::{FunctionError, FunctionKind, SessionView, StepFunction};
pub use registry::FunctionRegistry;
