//! Domain layer - Core types and port definitions
//!
//! This module defines the traits (ports) that the array client, the
//! backend plugins and the attachers implement, plus the plain data they
//! exchange.

pub mod ports;
pub mod types;

pub use ports::*;
pub use types::*;
