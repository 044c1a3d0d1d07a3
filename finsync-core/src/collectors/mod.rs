//! Built-in collector plugins.

pub mod yahoo;

pub use yahoo::{YahooCollector, DAILY_BAR_URI};
