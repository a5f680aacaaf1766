//! Resource types consumed by the validator

mod volume_populator;

pub use volume_populator::*;
