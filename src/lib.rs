//! Update sandbox: runs a dependency-update job inside an isolated container
//! sandbox.
//!
//! The updater container only reaches the outside world through a
//! credential-injecting proxy, and reports its results to a local mock of
//! the control-plane API. Runs can be recorded as scenario files and later
//! replayed with the recorded output as ordered expectations.

pub mod api;
pub mod cli;
pub mod config;
pub mod context;
pub mod credentials;
pub mod error;
pub mod input;
pub mod model;
pub mod output;
pub mod run;
pub mod sandbox;
pub mod security;

pub use error::{Error, Result};
