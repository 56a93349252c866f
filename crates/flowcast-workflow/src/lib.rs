//! Flowcast Workflow
//!
//! This crate provides the "locked" workflow representation for flowcast.
//! A locked workflow is a validated form of a [`GraphDef`] that the
//! streaming pipeline can analyse once per run and then share immutably.
//!
//! Key differences from `flowcast-config`:
//! - Edges and iteration membership are validated against the node set
//! - Nodes are indexed by id while keeping declaration order
//! - Upstream adjacency is precomputed in a [`Graph`]
//!
//! [`GraphDef`]: flowcast_config::GraphDef

mod error;
mod graph;
mod workflow;

pub use error::WorkflowError;
pub use graph::Graph;
pub use workflow::Workflow;
