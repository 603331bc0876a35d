//! Job summary generation from the work log
//!
//! The summary is what an operator reads after a run: how many items made
//! it, how many were given up on and why, and how many are left for the
//! next run.

use crate::state::{FailureClass, ItemState};
use crate::storage::{EntityStore, StorageResult, WorkLog};

/// Outcome counts for a pipeline job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSummary {
    /// Items whose entities were all persisted
    pub persisted: u64,

    /// Items given up on
    pub dead_lettered: u64,

    /// Items known but not finished: discovered, queued or interrupted
    pub pending: u64,

    /// Stored entities across all runs
    pub entities: u64,

    /// Every dead-lettered item with its final failure
    pub dead_letters: Vec<DeadLetter>,
}

/// A dead-lettered item as reported to operators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub identifier: String,
    pub failure_class: Option<FailureClass>,
    pub last_error: Option<String>,
    pub attempts: u32,
}

/// Loads the job summary from storage
pub fn load_summary(log: &dyn WorkLog, entities: &dyn EntityStore) -> StorageResult<JobSummary> {
    let mut pending = 0;
    for state in ItemState::all_states() {
        if !state.is_terminal() {
            pending += log.count_by_state(state)?;
        }
    }

    let dead_letters = log
        .dead_letters()?
        .into_iter()
        .map(|record| DeadLetter {
            identifier: record.identifier,
            failure_class: record.failure_class,
            last_error: record.last_error,
            attempts: record.attempt_count,
        })
        .collect::<Vec<_>>();

    Ok(JobSummary {
        persisted: log.count_by_state(ItemState::Persisted)?,
        dead_lettered: dead_letters.len() as u64,
        pending,
        entities: entities.count_entities()?,
        dead_letters,
    })
}

/// Prints the summary to stdout
pub fn print_summary(summary: &JobSummary) {
    println!("=== Job Summary ===\n");

    println!("Items:");
    println!("  Persisted: {}", summary.persisted);
    println!("  Dead-lettered: {}", summary.dead_lettered);
    println!("  Pending: {}", summary.pending);
    println!("  Entities stored: {}", summary.entities);
    println!();

    if !summary.dead_letters.is_empty() {
        println!("Dead Letters ({}):", summary.dead_letters.len());
        for dead in &summary.dead_letters {
            let class = dead
                .failure_class
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "  - {} [{} after {} attempt(s)]: {}",
                dead.identifier,
                class,
                dead.attempts,
                dead.last_error.as_deref().unwrap_or("-")
            );
        }
        println!();
    }
}
