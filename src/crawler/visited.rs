//! Visited/dedup store
//!
//! A concurrent in-memory cache over the durable work log. The cache answers
//! the hot-path questions (is this identifier known, is someone working on
//! it) without touching the database; every state change is also written
//! through to the log so a restart can resume.

use crate::state::ItemState;
use crate::storage::{StorageResult, Transition, WorkLog};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    /// Admitted and waiting, in the frontier or spilled to the log
    Pending,
    /// A worker holds it
    InFlight,
    /// Reached a terminal state
    Done(ItemState),
}

pub struct VisitedStore {
    log: Arc<dyn WorkLog>,
    marks: DashMap<String, Mark>,
}

impl VisitedStore {
    pub fn new(log: Arc<dyn WorkLog>) -> Self {
        Self {
            log,
            marks: DashMap::new(),
        }
    }

    /// Claims an identifier for processing
    ///
    /// Returns true exactly once per identifier, across concurrent callers and
    /// across restarts. `state` is the durable state the new row starts in.
    pub fn admit(
        &self,
        identifier: &str,
        host: &str,
        source_hint: Option<&str>,
        state: ItemState,
    ) -> StorageResult<bool> {
        // The shard stays locked until the log answers, so two callers racing
        // on one identifier cannot both insert.
        match self.marks.entry(identifier.to_string()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let created = self
                    .log
                    .record_discovered(identifier, host, source_hint, state)?;
                // Rows left by an earlier run are known but not ours to queue;
                // resumable ones come back through `readmit`.
                slot.insert(if created {
                    Mark::Pending
                } else {
                    Mark::Done(ItemState::Discovered)
                });
                Ok(created)
            }
        }
    }

    /// Re-claims an item loaded back from the log and marks it queued
    pub fn readmit(&self, identifier: &str, attempt_count: u32) -> StorageResult<()> {
        self.log
            .update_state(identifier, &Transition::to(ItemState::Queued, attempt_count))?;
        self.marks.insert(identifier.to_string(), Mark::Pending);
        Ok(())
    }

    /// Marks an item as held by a worker and records it as `Fetching`
    ///
    /// Returns false if another worker already holds it.
    pub fn mark_in_flight(&self, identifier: &str, attempt_count: u32) -> StorageResult<bool> {
        {
            let mut mark = self
                .marks
                .entry(identifier.to_string())
                .or_insert(Mark::Pending);
            if *mark == Mark::InFlight {
                return Ok(false);
            }
            *mark = Mark::InFlight;
        }

        self.log.update_state(
            identifier,
            &Transition::to(ItemState::Fetching, attempt_count),
        )?;
        Ok(true)
    }

    /// Records an intermediate state without changing ownership
    pub fn record(&self, identifier: &str, transition: &Transition<'_>) -> StorageResult<()> {
        self.log.update_state(identifier, transition)
    }

    /// Hands an in-flight item back to the queue with the given durable state
    pub fn release(&self, identifier: &str, transition: &Transition<'_>) -> StorageResult<()> {
        self.marks.insert(identifier.to_string(), Mark::Pending);
        self.log.update_state(identifier, transition)
    }

    /// Records a terminal outcome
    pub fn mark_done(&self, identifier: &str, transition: &Transition<'_>) -> StorageResult<()> {
        self.log.update_state(identifier, transition)?;
        self.marks
            .insert(identifier.to_string(), Mark::Done(transition.state));
        Ok(())
    }

    /// True if the identifier was ever admitted, in this process or a previous one
    pub fn is_known(&self, identifier: &str) -> StorageResult<bool> {
        if self.marks.contains_key(identifier) {
            return Ok(true);
        }
        Ok(self.log.get_item(identifier)?.is_some())
    }

    pub fn is_in_flight(&self, identifier: &str) -> bool {
        matches!(
            self.marks.get(identifier).map(|m| *m),
            Some(Mark::InFlight)
        )
    }

    /// Returns every item still marked in flight to the `Queued` state
    ///
    /// Called after workers stop so interrupted items are resumed next run
    /// rather than lost. Returns the number of items parked.
    pub fn park_in_flight(&self) -> StorageResult<usize> {
        let in_flight: Vec<String> = self
            .marks
            .iter()
            .filter(|entry| *entry.value() == Mark::InFlight)
            .map(|entry| entry.key().clone())
            .collect();

        for identifier in &in_flight {
            let attempts = self
                .log
                .get_item(identifier)?
                .map(|record| record.attempt_count)
                .unwrap_or(0);
            self.release(identifier, &Transition::to(ItemState::Queued, attempts))?;
        }
        Ok(in_flight.len())
    }
}
