//! Network management for lab topologies
//!
//! Provides:
//! - IP address allocation within declared subnets
//! - The registry of live networks and their members

pub mod ip;
pub mod registry;

pub use registry::NetworkRegistry;
