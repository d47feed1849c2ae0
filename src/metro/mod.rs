//! HyperMetro dispatch
//!
//! Decides, per operation, whether a block volume is handled on the local
//! array, the bonded metro remote, or both.

pub mod dispatch;

pub use dispatch::{select_strategy, MetroDispatcher, Reachability, Strategy};

use crate::attach::AttacherSpec;
use crate::backend::session::ArraySession;
use std::sync::Arc;

/// Everything the dispatcher needs to attach through one block backend
#[derive(Debug, Clone)]
pub struct BlockTarget {
    pub spec: AttacherSpec,
    pub session: Arc<ArraySession>,
}

impl BlockTarget {
    pub fn backend(&self) -> &str {
        &self.spec.backend
    }
}
