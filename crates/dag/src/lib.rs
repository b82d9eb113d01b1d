//! # keel-dag
//!
//! Validates component declarations and compiles them into a dependency
//! graph partitioned into levels. A level is the unit of parallel dispatch:
//! every dependency of a level-k node lives in a level below k.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod graph;

pub use error::{DagError, DagResult};
pub use graph::{DependencyGraph, Edge, GraphNode, NodeIndex};
