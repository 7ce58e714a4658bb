//! # courier-core
//!
//! Core types, traits, configuration, and error handling for the Courier agent.

pub mod config;
pub mod error;
pub mod filter;
pub mod model;
pub mod traits;

pub use config::shellexpand;
pub use error::CourierError;
