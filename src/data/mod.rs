//! Workflow Data Module
//!
//! - [`container`]: the entity × period envelope passed between steps
//! - [`field`]: dot-path field access over payloads

pub mod container;
pub mod field;

pub use container::{DataContainer, Issue, Payload, Shape};
