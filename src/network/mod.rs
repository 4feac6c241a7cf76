//! Network identity for instances
//!
//! Addresses are drawn from a bridge CIDR and published to every instance
//! through a generated hosts file.

pub mod hosts;
pub mod pool;

pub use hosts::HostsSynthesizer;
pub use pool::{AddressAssignment, AddressPool, Cidr, DEFAULT_BRIDGE};
