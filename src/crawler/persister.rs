//! Idempotent entity persistence
//!
//! Entities are upserted by key. Writing the same entity twice leaves one row;
//! a changed entity replaces the stored content (last writer wins).

use crate::crawler::extractor::Entity;
use crate::storage::{EntityStore, StorageError, UpsertOutcome};
use std::sync::Arc;
use thiserror::Error;

/// The store could not be written at all
#[derive(Debug, Error)]
#[error("persistence unavailable for {entity_key}: {source}")]
pub struct PersistenceFatal {
    pub entity_key: String,
    #[source]
    pub source: StorageError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Updated,
    Unchanged,
    /// A concurrent writer won the key twice in a row
    Conflict,
}

impl From<UpsertOutcome> for Outcome {
    fn from(outcome: UpsertOutcome) -> Self {
        match outcome {
            UpsertOutcome::Inserted => Outcome::Inserted,
            UpsertOutcome::Updated => Outcome::Updated,
            UpsertOutcome::Unchanged => Outcome::Unchanged,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceOutcome {
    pub entity_key: String,
    pub outcome: Outcome,
}

/// Tally of a batch of outcomes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub conflicts: usize,
}

impl OutcomeCounts {
    pub fn tally(outcomes: &[PersistenceOutcome]) -> Self {
        let mut counts = Self::default();
        for outcome in outcomes {
            match outcome.outcome {
                Outcome::Inserted => counts.inserted += 1,
                Outcome::Updated => counts.updated += 1,
                Outcome::Unchanged => counts.unchanged += 1,
                Outcome::Conflict => counts.conflicts += 1,
            }
        }
        counts
    }
}

pub struct Persister {
    store: Arc<dyn EntityStore>,
}

impl Persister {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    /// Upserts every entity, stopping at the first fatal storage error
    pub fn persist(&self, entities: &[Entity]) -> Result<Vec<PersistenceOutcome>, PersistenceFatal> {
        entities
            .iter()
            .map(|entity| {
                Ok(PersistenceOutcome {
                    entity_key: entity.key.clone(),
                    outcome: self.persist_one(entity)?,
                })
            })
            .collect()
    }

    fn persist_one(&self, entity: &Entity) -> Result<Outcome, PersistenceFatal> {
        let record = entity.to_record();
        let fatal = |source| PersistenceFatal {
            entity_key: entity.key.clone(),
            source,
        };

        match self.store.upsert_entity(&record) {
            Ok(outcome) => Ok(outcome.into()),
            Err(e) if e.is_conflict() => {
                tracing::debug!("Upsert conflict on {}, retrying once", entity.key);
                match self.store.upsert_entity(&record) {
                    Ok(outcome) => Ok(outcome.into()),
                    Err(e) if e.is_conflict() => Ok(Outcome::Conflict),
                    Err(e) => Err(fatal(e)),
                }
            }
            Err(e) => Err(fatal(e)),
        }
    }
}
