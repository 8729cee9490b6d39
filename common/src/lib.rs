pub mod metrics;
pub mod protocol;

pub use metrics::*;
pub use protocol::*;
