//! Declared lab topology
//!
//! This module provides:
//! - The declarative data model (networks, hosts, address requests)
//! - The validator that cross-checks a topology before realization

pub mod types;
pub mod validator;

pub use types::{
    resource_name, AddressBinding, Driver, HostSpec, NetworkRequest, NetworkSpec, Topology,
};
pub use validator::{validate, ValidationError};
