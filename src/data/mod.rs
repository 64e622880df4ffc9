pub mod feed;
pub mod sink;

pub use feed::*;
pub use sink::*;
