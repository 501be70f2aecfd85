//! Run controllers, one per gather mode.

pub mod navigation;
pub mod page_load_error;
pub mod snapshot;
pub mod timespan;

pub use navigation::navigation_gather;
pub use page_load_error::page_load_error;
pub use snapshot::snapshot_gather;
pub use timespan::{TimespanSession, start_timespan};
