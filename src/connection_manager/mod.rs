//! Live connection bookkeeping.
//!
//! One `ConnectionManager` instance owns every authenticated connection, the
//! per-user presence refcount and the per-room joined sets. All three indices
//! sit behind a single lock so a disconnect is observed all at once.

mod fanout;
mod registry;
mod stats;
mod types;

pub use fanout::{fan_out, FanOut};
pub use registry::{ConnectionManager, JoinOutcome, LeaveOutcome, Registration, Teardown};
pub use stats::{ConnectionStats, RoomInfo};
pub use types::{ConnectionError, ConnectionHandle, ConnectionLimits};
