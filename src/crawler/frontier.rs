//! Host-aware, retry-aware work queue
//!
//! Items wait in per-host queues ordered by eligibility time. Dequeue walks
//! the hosts round-robin so one busy host cannot starve the rest, and skips
//! hosts that are at their concurrency limit or inside their politeness
//! interval. Retries are just items whose eligibility lies in the future.
//!
//! The schedule sits behind one mutex that is only held for short,
//! non-blocking bookkeeping; no lock is held across an await.

use crate::config::FrontierConfig;
use crate::crawler::visited::VisitedStore;
use crate::state::{HostState, ItemState};
use crate::storage::{StorageResult, WorkRecord};
use crate::url::origin_host;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A unit of pending ingestion work
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Normalized source address
    pub identifier: String,
    pub host: String,
    pub discovered_at: DateTime<Utc>,
    /// Retryable failures so far
    pub attempt_count: u32,
    pub next_eligible_at: Instant,
    /// Identifier of the document that referenced this one, if any
    pub source_hint: Option<String>,
}

impl WorkItem {
    pub fn new(identifier: String, host: String, source_hint: Option<String>) -> Self {
        Self {
            identifier,
            host,
            discovered_at: Utc::now(),
            attempt_count: 0,
            next_eligible_at: Instant::now(),
            source_hint,
        }
    }

    /// Builds an item from a normalized URL; None if it has no host
    pub fn from_url(url: &Url, source_hint: Option<String>) -> Option<Self> {
        let host = origin_host(url)?;
        Some(Self::new(url.to_string(), host, source_hint))
    }

    /// Restores an item from the work log, keeping any pending retry delay
    pub fn from_record(record: &WorkRecord) -> Self {
        let now = Instant::now();
        let next_eligible_at = record
            .next_eligible_at
            .as_deref()
            .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
            .and_then(|at| (at.with_timezone(&Utc) - Utc::now()).to_std().ok())
            .map(|wait| now + wait)
            .unwrap_or(now);

        Self {
            identifier: record.identifier.clone(),
            host: record.host.clone(),
            discovered_at: DateTime::parse_from_rfc3339(&record.discovered_at)
                .map(|at| at.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            attempt_count: record.attempt_count,
            next_eligible_at,
            source_hint: record.source_hint.clone(),
        }
    }
}

/// Result of offering an item to the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued in memory
    Admitted,
    /// New, but the frontier is full: recorded as `Discovered` for later
    Spilled,
    /// Already visited, queued or in flight
    AlreadyKnown,
    /// The frontier no longer accepts work
    Closed,
}

impl Admission {
    /// True when the identifier was new and is now tracked
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Admitted | Self::Spilled)
    }
}

#[derive(Default)]
struct Schedule {
    /// Per-host queues keyed by (eligible time, insertion sequence)
    queues: HashMap<String, BTreeMap<(Instant, u64), WorkItem>>,
    /// Hosts with queued items, in round-robin order
    ring: VecDeque<String>,
    hosts: HashMap<String, HostState>,
    pending: usize,
    in_flight: usize,
    seq: u64,
}

impl Schedule {
    fn insert(&mut self, item: WorkItem) {
        self.seq += 1;
        let key = (item.next_eligible_at, self.seq);
        if !self.queues.contains_key(&item.host) {
            self.ring.push_back(item.host.clone());
        }
        self.queues
            .entry(item.host.clone())
            .or_default()
            .insert(key, item);
        self.pending += 1;
    }
}

enum Poll {
    Ready(WorkItem),
    Wait(Option<Duration>),
    Closed,
}

pub struct Frontier {
    schedule: Mutex<Schedule>,
    visited: Arc<VisitedStore>,
    config: FrontierConfig,
    closed: AtomicBool,
    changed: Notify,
    /// Signalled whenever an item leaves the pending set
    freed: Notify,
}

impl Frontier {
    pub fn new(config: FrontierConfig, visited: Arc<VisitedStore>) -> Self {
        Self {
            schedule: Mutex::new(Schedule::default()),
            visited,
            config,
            closed: AtomicBool::new(false),
            changed: Notify::new(),
            freed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Schedule> {
        // Schedule updates cannot leave it half-modified, so a poisoned lock is still usable
        self.schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Offers a newly discovered item
    ///
    /// Identifiers already known to the visited store are refused. When the
    /// in-memory bound is reached the item is recorded durably and picked up
    /// again by `readmit` once there is room.
    pub fn enqueue(&self, item: WorkItem) -> StorageResult<Admission> {
        if self.is_closed() {
            return Ok(Admission::Closed);
        }

        let full = self.pending() >= self.config.max_pending;
        let state = if full {
            ItemState::Discovered
        } else {
            ItemState::Queued
        };

        if !self.visited.admit(
            &item.identifier,
            &item.host,
            item.source_hint.as_deref(),
            state,
        )? {
            return Ok(Admission::AlreadyKnown);
        }

        if full {
            tracing::debug!(identifier = %item.identifier, "frontier full, spilled");
            return Ok(Admission::Spilled);
        }

        self.insert(item);
        Ok(Admission::Admitted)
    }

    /// Offers an item, waiting for capacity instead of spilling
    ///
    /// Returns `Closed` if the frontier closes or `cancel` fires first. A known
    /// identifier is refused immediately without waiting.
    pub async fn enqueue_wait(
        &self,
        item: WorkItem,
        cancel: &CancellationToken,
    ) -> StorageResult<Admission> {
        if self.visited.is_known(&item.identifier)? {
            return Ok(Admission::AlreadyKnown);
        }

        loop {
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if cancel.is_cancelled() || self.is_closed() {
                return Ok(Admission::Closed);
            }
            if self.room() > 0 {
                return self.enqueue(item);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(Admission::Closed),
                _ = &mut freed => {}
            }
        }
    }

    /// Puts an item loaded from the work log back into memory
    pub fn readmit(&self, record: &WorkRecord) -> StorageResult<()> {
        self.visited
            .readmit(&record.identifier, record.attempt_count)?;
        self.insert(WorkItem::from_record(record));
        Ok(())
    }

    fn insert(&self, item: WorkItem) {
        self.lock().insert(item);
        self.changed.notify_waiters();
    }

    /// Waits for the next eligible item
    ///
    /// Returns None once the frontier is closed or `cancel` fires. Each item
    /// is handed to exactly one caller.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before inspecting so a concurrent change is not missed
            notified.as_mut().enable();

            match self.poll(Instant::now()) {
                Poll::Ready(item) => {
                    self.freed.notify_waiters();
                    return Some(item);
                }
                Poll::Closed => return None,
                Poll::Wait(Some(wait)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Poll::Wait(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = &mut notified => {}
                    }
                }
            }
        }
    }

    fn poll(&self, now: Instant) -> Poll {
        if self.is_closed() {
            return Poll::Closed;
        }

        let mut guard = self.lock();
        let Schedule {
            queues,
            ring,
            hosts,
            pending,
            in_flight,
            ..
        } = &mut *guard;

        let mut earliest: Option<Instant> = None;

        for _ in 0..ring.len() {
            let Some(host) = ring.pop_front() else { break };
            ring.push_back(host.clone());

            let host_state = hosts.entry(host.clone()).or_default();
            if host_state.active >= self.config.per_host_concurrency {
                // Freed by `complete`, which notifies
                continue;
            }

            let Some(queue) = queues.get_mut(&host) else {
                continue;
            };
            let Some((&(eligible_at, _), _)) = queue.first_key_value() else {
                continue;
            };

            let host_ready = host_state
                .time_until_dispatch(&self.config, now)
                .map(|wait| now + wait)
                .unwrap_or(now);
            let ready_at = eligible_at.max(host_ready);

            if ready_at > now {
                earliest = Some(earliest.map_or(ready_at, |e| e.min(ready_at)));
                continue;
            }

            let Some((_, item)) = queue.pop_first() else {
                continue;
            };
            if queue.is_empty() {
                queues.remove(&host);
                ring.retain(|h| h != &host);
            }
            host_state.record_dispatch(now);
            *pending -= 1;
            *in_flight += 1;
            return Poll::Ready(item);
        }

        Poll::Wait(earliest.map(|at| at - now))
    }

    fn reinsert(&self, item: WorkItem) {
        {
            let mut schedule = self.lock();
            if let Some(host_state) = schedule.hosts.get_mut(&item.host) {
                host_state.record_complete();
            }
            schedule.in_flight = schedule.in_flight.saturating_sub(1);
            schedule.insert(item);
        }
        self.changed.notify_waiters();
    }

    /// Schedules a retry: one more attempt consumed, eligible after `delay`
    pub fn requeue_with_delay(&self, mut item: WorkItem, delay: Duration) {
        item.attempt_count += 1;
        item.next_eligible_at = Instant::now() + delay;
        self.reinsert(item);
    }

    /// Puts a dispatched item back without consuming an attempt
    pub fn defer(&self, mut item: WorkItem, delay: Duration) {
        item.next_eligible_at = Instant::now() + delay;
        self.reinsert(item);
    }

    /// Releases the host slot of a dispatched item that reached an outcome
    pub fn complete(&self, host: &str) {
        {
            let mut schedule = self.lock();
            if let Some(host_state) = schedule.hosts.get_mut(host) {
                host_state.record_complete();
                if host_state.is_idle() && !schedule.queues.contains_key(host) {
                    schedule.hosts.remove(host);
                }
            }
            schedule.in_flight = schedule.in_flight.saturating_sub(1);
        }
        self.changed.notify_waiters();
    }

    /// Stops handing out work and wakes every waiter
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
        self.freed.notify_waiters();
    }

    /// Closes the frontier only if nothing is queued or in flight
    pub fn close_if_idle(&self) -> bool {
        let schedule = self.lock();
        if schedule.pending == 0 && schedule.in_flight == 0 {
            self.closed.store(true, Ordering::SeqCst);
            drop(schedule);
            self.changed.notify_waiters();
            self.freed.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Items waiting in memory
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    pub fn is_idle(&self) -> bool {
        let schedule = self.lock();
        schedule.pending == 0 && schedule.in_flight == 0
    }

    /// Free capacity before new discoveries spill
    pub fn room(&self) -> usize {
        self.config.max_pending.saturating_sub(self.pending())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStorage, WorkLog};
    use std::collections::HashSet;

    fn create_test_config() -> FrontierConfig {
        FrontierConfig {
            max_pending: 100,
            per_host_concurrency: 1,
            min_host_interval_ms: 0,
        }
    }

    fn frontier(config: FrontierConfig) -> (Arc<SqliteStorage>, Frontier) {
        let storage = Arc::new(SqliteStorage::new_in_memory().unwrap());
        let visited = Arc::new(VisitedStore::new(storage.clone()));
        (storage, Frontier::new(config, visited))
    }

    fn item(url: &str) -> WorkItem {
        WorkItem::from_url(&Url::parse(url).unwrap(), None).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_dedups() {
        let (_, f) = frontier(create_test_config());

        assert_eq!(
            f.enqueue(item("https://a.org/1")).unwrap(),
            Admission::Admitted
        );
        assert_eq!(
            f.enqueue(item("https://a.org/1")).unwrap(),
            Admission::AlreadyKnown
        );
        assert_eq!(f.pending(), 1);
    }

    #[tokio::test]
    async fn test_completed_items_are_not_readmitted() {
        let (_, f) = frontier(create_test_config());
        let cancel = CancellationToken::new();

        f.enqueue(item("https://a.org/1")).unwrap();
        let taken = f.dequeue(&cancel).await.unwrap();
        f.complete(&taken.host);

        assert_eq!(
            f.enqueue(item("https://a.org/1")).unwrap(),
            Admission::AlreadyKnown
        );
        assert!(f.is_idle());
    }

    #[tokio::test]
    async fn test_spills_when_full() {
        let mut config = create_test_config();
        config.max_pending = 1;
        let (storage, f) = frontier(config);

        assert_eq!(
            f.enqueue(item("https://a.org/1")).unwrap(),
            Admission::Admitted
        );
        assert_eq!(
            f.enqueue(item("https://a.org/2")).unwrap(),
            Admission::Spilled
        );
        assert_eq!(f.pending(), 1);
        assert_eq!(f.room(), 0);
        assert_eq!(storage.count_by_state(ItemState::Discovered).unwrap(), 1);

        let spilled = storage.load_discovered(10).unwrap();
        let cancel = CancellationToken::new();
        let first = f.dequeue(&cancel).await.unwrap();
        f.complete(&first.host);

        f.readmit(&spilled[0]).unwrap();
        let second = f.dequeue(&cancel).await.unwrap();
        assert_eq!(second.identifier, "https://a.org/2");
        assert_eq!(storage.count_by_state(ItemState::Discovered).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_across_hosts() {
        let mut config = create_test_config();
        config.per_host_concurrency = 10;
        let (_, f) = frontier(config);
        let cancel = CancellationToken::new();

        for url in [
            "https://a.org/1",
            "https://a.org/2",
            "https://a.org/3",
            "https://b.org/1",
        ] {
            f.enqueue(item(url)).unwrap();
        }

        let first = f.dequeue(&cancel).await.unwrap();
        let second = f.dequeue(&cancel).await.unwrap();
        assert_ne!(first.host, second.host);
    }

    #[tokio::test]
    async fn test_per_host_concurrency() {
        let (_, f) = frontier(create_test_config());
        let cancel = CancellationToken::new();

        f.enqueue(item("https://a.org/1")).unwrap();
        f.enqueue(item("https://a.org/2")).unwrap();

        let first = f.dequeue(&cancel).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), f.dequeue(&cancel)).await;
        assert!(blocked.is_err(), "second item for a busy host was handed out");

        f.complete(&first.host);
        let second = tokio::time::timeout(Duration::from_millis(500), f.dequeue(&cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.identifier, "https://a.org/2");
    }

    #[tokio::test]
    async fn test_requeue_with_delay_defers_eligibility() {
        let (_, f) = frontier(create_test_config());
        let cancel = CancellationToken::new();

        f.enqueue(item("https://a.org/1")).unwrap();
        let taken = f.dequeue(&cancel).await.unwrap();
        assert_eq!(taken.attempt_count, 0);

        let started = Instant::now();
        f.requeue_with_delay(taken, Duration::from_millis(80));
        let again = f.dequeue(&cancel).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(again.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_defer_keeps_attempt_count() {
        let (_, f) = frontier(create_test_config());
        let cancel = CancellationToken::new();

        f.enqueue(item("https://a.org/1")).unwrap();
        let taken = f.dequeue(&cancel).await.unwrap();
        f.defer(taken, Duration::from_millis(10));

        let again = f.dequeue(&cancel).await.unwrap();
        assert_eq!(again.attempt_count, 0);
    }

    #[tokio::test]
    async fn test_dequeue_returns_none_on_cancel_and_close() {
        let (_, f) = frontier(create_test_config());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(f.dequeue(&cancel).await.is_none());

        let f = Arc::new(f);
        let waiter = {
            let f = f.clone();
            tokio::spawn(async move { f.dequeue(&CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.close_if_idle());
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(
            f.enqueue(item("https://a.org/1")).unwrap(),
            Admission::Closed
        );
    }

    #[tokio::test]
    async fn test_enqueue_wait_blocks_until_room() {
        let mut config = create_test_config();
        config.max_pending = 1;
        let (_, f) = frontier(config);
        let f = Arc::new(f);
        let cancel = CancellationToken::new();

        f.enqueue(item("https://a.org/1")).unwrap();

        let waiter = {
            let f = f.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { f.enqueue_wait(item("https://b.org/2"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let taken = f.dequeue(&cancel).await.unwrap();
        assert_eq!(taken.identifier, "https://a.org/1");
        assert_eq!(waiter.await.unwrap().unwrap(), Admission::Admitted);
        assert_eq!(f.pending(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_wait_refuses_known_and_honours_cancel() {
        let mut config = create_test_config();
        config.max_pending = 1;
        let (_, f) = frontier(config);
        let cancel = CancellationToken::new();

        f.enqueue(item("https://a.org/1")).unwrap();
        assert_eq!(
            f.enqueue_wait(item("https://a.org/1"), &cancel).await.unwrap(),
            Admission::AlreadyKnown
        );

        cancel.cancel();
        assert_eq!(
            f.enqueue_wait(item("https://b.org/2"), &cancel).await.unwrap(),
            Admission::Closed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_concurrent_double_dequeue() {
        let mut config = create_test_config();
        config.per_host_concurrency = 64;
        config.max_pending = 256;
        let (_, f) = frontier(config);
        let f = Arc::new(f);
        let cancel = CancellationToken::new();

        for i in 0..200 {
            let admission = f
                .enqueue(item(&format!("https://h{}.org/{}", i % 5, i)))
                .unwrap();
            assert_eq!(admission, Admission::Admitted);
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let f = f.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Ok(Some(item)) =
                    tokio::time::timeout(Duration::from_millis(100), f.dequeue(&cancel)).await
                {
                    f.complete(&item.host);
                    taken.push(item.identifier);
                }
                taken
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for id in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "identifier dequeued twice");
            }
        }
        assert_eq!(total, 200);
    }
}
