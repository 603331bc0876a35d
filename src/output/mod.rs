//! Output module for job summaries
//!
//! This module handles:
//! - Building the end-of-job summary from the work log and entity store
//! - Printing it for operators

mod summary;

pub use summary::{load_summary, print_summary, DeadLetter, JobSummary};
