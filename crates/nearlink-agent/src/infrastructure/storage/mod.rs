//! Persistent storage for agent configuration.

pub mod config;
