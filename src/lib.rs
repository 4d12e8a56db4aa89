//! Chat Relay - a forwarding proxy for chat completion APIs
//!
//! Requests are rewritten on the way out (header merge, bearer token
//! injection, content flattening, tool-role rewrites), forwarded to a
//! configurable target and optionally recorded so they can be replayed later
//! through the same transform chain.

pub mod application;
pub mod cli;
pub mod config;
pub mod error;
pub mod proxy;

pub use application::Application;
pub use error::{Error, Result};
