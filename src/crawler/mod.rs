//! Ingestion pipeline
//!
//! This module contains the fetch, extract and persist pipeline, including:
//! - The frontier and the visited/dedup store
//! - Rate-limited HTTP fetching with retry backoff and per-host circuit breaking
//! - Selector-driven entity extraction and asset downloads
//! - Idempotent entity persistence
//! - The orchestrator running the worker pool

mod assets;
mod breaker;
mod events;
mod extractor;
mod fetcher;
mod frontier;
mod orchestrator;
mod persister;
mod retry;
mod visited;

pub use assets::AssetStore;
pub use breaker::{BreakerDecision, CircuitBreaker};
pub use events::{EventBus, PipelineEvent, DEFAULT_EVENT_CAPACITY};
pub use extractor::{
    ContentKind, Entity, Extraction, ExtractionError, Extractor, ASSET_KIND, PAGE_KIND,
};
pub use fetcher::{
    build_http_client, classify_status, Document, FetchError, FetchOutcome, FetchResult, Fetcher,
    StatusClass,
};
pub use frontier::{Admission, Frontier, WorkItem};
pub use orchestrator::Orchestrator;
pub use persister::{Outcome, OutcomeCounts, PersistenceFatal, PersistenceOutcome, Persister};
pub use retry::RetryPolicy;
pub use visited::VisitedStore;
