//! Cluster collaborators.
//!
//! - [`topology`] - segment ownership, topology installs, the shared topology lock
//! - [`rpc`] - remote invocation and partition handling seams

pub mod rpc;
pub mod topology;
