//! Domain layer - attach request types and I/O port definitions
//!
//! This module defines the data that flows through a connect/disconnect call
//! and the traits (ports) the host adapters implement, following hexagonal
//! architecture principles.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
