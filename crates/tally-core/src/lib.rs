//! Core of the running-total chat bot.
//!
//! This crate is framework-agnostic. Persistence and chat transports live
//! behind ports (traits) implemented in adapter crates.

pub mod audit;
pub mod commands;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod expression;
pub mod formatting;
pub mod ledger;
pub mod logging;
pub mod messaging;
pub mod orchestrator;
pub mod ports;
pub mod store;

pub use errors::{Error, Result};
