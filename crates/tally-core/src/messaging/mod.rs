//! Transport-facing abstractions (Telegram and console today).

pub mod port;
pub mod throttled;
pub mod types;
