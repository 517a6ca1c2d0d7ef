//! Utility functions and helpers.
//!
//! Common utilities for environment variable handling and other helpers.

pub mod env;

pub use env::get_env_with_prefix;
