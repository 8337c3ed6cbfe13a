//! Context engine - assembles size-bounded context bundles for agents

pub mod assembler;
pub mod context_builder;

pub use assembler::{ContextAssembler, ContextBundle, ContextRequest, ContextSources, ManagerSources};
pub use context_builder::{ContextBuilder, DroppedCounts};
