//! scompose - orchestration for groups of Singularity instances
//!
//! Instances are declared in a `singularity-compose.yml` file. scompose
//! orders them by their dependencies, gives each an address on a bridge
//! network and drives the container runtime to build, start and stop them:
//!
//! - Compose file loading, merging and validation
//! - Dependency ordering with cycle detection
//! - Deterministic address allocation and a shared hosts file
//! - Per-instance lifecycle with exec, run and post hooks

pub mod compose;
pub mod error;
pub mod network;
pub mod runtime;

pub use error::{ComposeError, Result};
