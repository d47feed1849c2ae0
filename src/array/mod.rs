//! Array clients
//!
//! The plugin layer talks to storage controllers only through
//! [`ArrayClient`](crate::domain::ArrayClient). This module ships the
//! in-memory implementation used in standalone mode and in tests.

pub mod simulated;

pub use simulated::{SimulatedArray, SimulatedClientFactory};
