//! Flowcast Config
//!
//! This crate contains the serializable types consumed by the streaming
//! pipeline before anything is validated or resolved:
//!
//! - [`GraphDef`]: the node graph of a workflow as authored (nodes, edges,
//!   answer templates, iteration membership).
//! - [`PipelineConfig`]: per-run knobs for the pipeline (audio side-channel,
//!   finalize timeout, naming task, iteration error policy, moderation).
//!
//! Both can be loaded from JSON files (via CLI with `--graph` / `--config`)
//! or from database storage as JSON blobs.

mod edge;
mod enums;
mod node;
mod pipeline;
mod workflow;

pub use edge::Edge;
pub use enums::{IterationErrorPolicy, NodeKind};
pub use node::{NodeDef, NodeType};
pub use pipeline::{ModerationConfig, PipelineConfig, TtsConfig};
pub use workflow::GraphDef;
