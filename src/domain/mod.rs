pub mod signal;
pub mod types;

pub use signal::*;
pub use types::*;
