//! Agent graph engine.
//!
//! `GraphValidator` turns agent and connection records into a `Graph` view with
//! cycle detection and topological levels. `WorkflowCompiler` turns a valid graph
//! into a `JobFlow` where every job waits on the jobs of its input agents.

pub mod compiler;
pub mod graph;

pub use compiler::WorkflowCompiler;
pub use graph::{Graph, GraphEdge, GraphNode, GraphValidator};
