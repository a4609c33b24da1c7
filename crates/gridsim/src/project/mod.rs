//! Project Management
//!
//! Loads a simulation project from disk, applies it to an engine, and
//! watches it for edits.

mod config;
mod loader;
mod watcher;

pub use config::*;
pub use loader::*;
pub use watcher::*;
