//! Storage plugin families
//!
//! One plugin type per array family. All of them share [`common::ArrayBase`]
//! for session tracking and capability probing.

mod common;
pub mod distributed_san;
pub mod dtree;
pub mod san;

pub use distributed_san::DistributedSanPlugin;
pub use dtree::DtreePlugin;
pub use san::SanPlugin;
