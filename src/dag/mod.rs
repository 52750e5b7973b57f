// src/dag/mod.rs

//! Task graph construction.
//!
//! - [`definition`] holds the nested workflow/task definitions as declared.
//! - [`graph`] holds the compiled arena of task nodes.
//! - [`builder`] flattens a definition into a graph and rejects cycles.

pub mod builder;
pub mod definition;
pub mod graph;

pub use builder::build;
pub use definition::{TaskDefinition, WorkflowDefinition};
pub use graph::{TaskGraph, TaskNode};
