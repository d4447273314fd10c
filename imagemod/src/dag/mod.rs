//! In-memory model of the image being modified.
//!
//! The tree is built once per modify operation by [`DagManifest::load`],
//! mutated in place by pipeline steps, and afterwards re-walked by whatever
//! serializes the result. Every node carries a [`Change`] so that only
//! modified subtrees need new digests.

mod change;
mod config;
mod layer;
mod load;
mod manifest;

pub use change::Change;
pub use config::DagOciConfig;
pub use layer::{DagLayer, RewrittenBlob};
pub use manifest::{DagManifest, DagNode};

pub(crate) use layer::delete_original_positions;
#[cfg(test)]
pub(crate) use layer::test_descriptor;
