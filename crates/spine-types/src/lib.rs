//! Core types for the spine RPC and pub/sub framework.
//!
//! This crate defines the configuration model and the error taxonomy shared
//! by every spine component. It contains no networking logic.

pub mod config;
pub mod error;

pub use config::SpineConfig;
pub use error::{SpineError, SpineResult, Stage};
