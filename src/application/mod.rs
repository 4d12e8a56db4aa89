//! Application wiring
//!
//! Turns validated [`Settings`](crate::config::Settings) into the running
//! proxy server and the replay engine.

pub mod app;

pub use app::Application;
