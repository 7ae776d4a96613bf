//! Workflow definitions
//!
//! This module contains the static configuration the engine reads:
//! - [`WorkflowDefinition`] - a named, ordered template of steps
//! - [`Step`] - one delayed action within a workflow
//! - [`Channel`] - how a step reaches its audience

mod channel;
mod workflow;

pub use channel::{Channel, ChannelKind};
pub use workflow::{DefinitionError, Step, WorkflowDefinition};
