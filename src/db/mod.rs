//! Database module.
//!
//! Record model, normalization of raw device fields and the ClickHouse sink.

mod models;
mod normalize;
mod store;

pub use models::*;
pub use store::*;

#[cfg(test)]
pub(crate) use models::test_target;
