//! State module for tracking pipeline progress
//!
//! # Components
//!
//! - `ItemState`: lifecycle of a single work item (discovered, queued, fetching, ...)
//! - `FailureClass`: why an item was dead-lettered or stalled
//! - `HostState`: per-host dispatch bookkeeping used by the frontier

mod host_state;
mod item_state;

pub use host_state::HostState;
pub use item_state::{FailureClass, ItemState};
