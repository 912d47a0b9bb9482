pub mod directory;
pub mod error;
pub mod metrics;
pub mod model;
