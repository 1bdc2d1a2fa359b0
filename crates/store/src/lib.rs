//! Emissary store: the Accumulator, turning N list+watch streams into one
//! coalesced, read-your-writes snapshot source.

#![forbid(unsafe_code)]

mod accumulator;
mod field;
mod informer;

pub use accumulator::{Accumulator, AccumulatorConfig, AccumulatorError};
pub use informer::Informer;
