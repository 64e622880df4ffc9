pub mod aggregator;
pub mod extractor;
pub mod generator;
pub mod lifecycle;
pub mod matcher;
pub mod snapshot;
pub mod store;
pub mod trainer;

pub use aggregator::*;
pub use extractor::*;
pub use generator::*;
pub use lifecycle::*;
pub use matcher::*;
pub use snapshot::*;
pub use store::*;
pub use trainer::*;
