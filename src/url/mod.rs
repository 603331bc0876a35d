//! URL handling module for Lurker
//!
//! This module turns raw addresses into stable work item identifiers and
//! decides which hosts the pipeline is allowed to follow.

mod host;
mod normalize;
mod scope;

pub use host::{host_name, origin_host};
pub use normalize::normalize_url;
pub use scope::{matches_wildcard, Scope};
