#![forbid(unsafe_code)]
//! Public API facade for the direct I/O engine.
//!
//! Re-exports everything from `dio-engine` through one stable interface;
//! this is the crate downstream consumers depend on.

pub use dio_engine::*;
