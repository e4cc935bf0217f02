//! Test doubles and fixtures shared by the Refinery crates.

mod fixtures;
mod mock_processor;

pub use fixtures::*;
pub use mock_processor::{MockProcessor, ProcessorCall};
