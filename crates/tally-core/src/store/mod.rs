//! Store implementations that ship with the core crate.
//!
//! The persistent store lives in `tally-sqlite`.

pub mod memory;
