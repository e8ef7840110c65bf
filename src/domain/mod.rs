//! Domain layer - Port definitions
//!
//! This module defines the collaborator traits (ports) that the registry core
//! consumes and that store and configuration adapters implement.

pub mod ports;

pub use ports::*;
