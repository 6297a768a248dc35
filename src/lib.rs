mod error;
mod finalize;
mod flight;
mod map;
mod signal;
mod stats;
mod store;
mod timer;
mod tracker;

pub use error::{BoxError, PanicError};
pub use finalize::Finalize;
pub use flight::{FlightMap, FlightResult, SharedError};
pub use map::{EntryRef, Lease, LeaseMap};
pub use stats::Metrics;
pub use tracker::IdleTracker;
