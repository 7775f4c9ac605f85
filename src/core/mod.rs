pub mod backoff;
pub mod logs;
pub mod metrics;
pub mod model;
pub mod status_resolver;
pub mod types;

pub use backoff::*;
pub use logs::*;
pub use metrics::*;
pub use model::*;
pub use status_resolver::*;
pub use types::*;
