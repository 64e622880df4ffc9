pub mod config;
pub mod data;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logging;

pub use error::{PatternError, Result};
