// Application layer - use cases and orchestration.
// The ledger facade drives the bill repository, the per-user feed merger
// and the live aggregates derived from it.

pub mod bills;
pub mod collaborators;
pub mod error;
pub mod feed;
pub mod reporting;
pub mod service;

pub use bills::*;
pub use collaborators::*;
pub use error::*;
pub use feed::*;
pub use reporting::*;
pub use service::*;
