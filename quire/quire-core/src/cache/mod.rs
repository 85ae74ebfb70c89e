//! Per-document content cache.
//!
//! Sits in front of a [`DocumentStore`]: bounded TTL + LRU cache of bodies,
//! a pending map of queued writes flushed in batches, and single-flight
//! deduplication of concurrent reads and of identical concurrent writes.
//!
//! Reads always see the newest write made through the cache, queued or not.

use crate::config::CacheConfig;
use crate::error::{Result, StoreError};
use crate::storage::{DocumentContent, DocumentStore};
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex as AsyncMutex, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

type SharedRead = Shared<BoxFuture<'static, std::result::Result<DocumentContent, Arc<StoreError>>>>;
type SharedWrite = Shared<BoxFuture<'static, std::result::Result<(), Arc<StoreError>>>>;

/// Version of what the cache knows about one id; a fetch or write only
/// populates the cache if the stamp it started with is still current.
type Stamp = (u64, u64);

#[derive(Debug, Clone)]
struct CacheEntry {
    content: DocumentContent,
    inserted_at: Instant,
    ttl: Duration,
    last_accessed: Instant,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) >= self.ttl
    }
}

struct PendingWrite {
    content: DocumentContent,
    seq: u64,
}

struct InflightRead {
    fetch: SharedRead,
    stamp: Stamp,
}

struct InflightWrite {
    content: DocumentContent,
    done: SharedWrite,
    ticket: u64,
    /// A differing write is queued behind this one; identical callers must queue too.
    superseded: bool,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingWrite>,
    reads: HashMap<String, InflightRead>,
    writes: HashMap<String, InflightWrite>,
    /// Per-id FIFO turn for store writes; dropped once nobody holds or awaits it.
    lanes: HashMap<String, Arc<AsyncMutex<()>>>,
    /// Only ids with work in flight keep a generation.
    generations: HashMap<String, u64>,
    epoch: u64,
    next_generation: u64,
    next_seq: u64,
}

impl CacheState {
    fn stamp(&self, id: &str) -> Stamp {
        (self.epoch, self.generations.get(id).copied().unwrap_or(0))
    }

    /// Generations are drawn from one counter, so a pruned id can never
    /// return to a stamp an older operation captured.
    fn bump(&mut self, id: &str) -> Stamp {
        self.next_generation += 1;
        self.generations.insert(id.to_string(), self.next_generation);
        self.stamp(id)
    }

    /// Forget the generation of an id nothing is reading, writing or queueing.
    fn settle(&mut self, id: &str) {
        if !self.reads.contains_key(id)
            && !self.writes.contains_key(id)
            && !self.pending.contains_key(id)
        {
            self.generations.remove(id);
        }
    }

    fn release_lane(&mut self, id: &str) {
        if self
            .lanes
            .get(id)
            .map_or(false, |lane| Arc::strong_count(lane) == 1)
        {
            self.lanes.remove(id);
        }
    }

    fn insert_entry(
        &mut self,
        id: &str,
        content: DocumentContent,
        config: &CacheConfig,
        counters: &Counters,
    ) {
        let now = Instant::now();
        self.entries.insert(
            id.to_string(),
            CacheEntry {
                content,
                inserted_at: now,
                ttl: config.ttl,
                last_accessed: now,
            },
        );
        let capacity = config.max_entries.max(1);
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    counters.evictions.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %key, "evicted least recently used body");
                }
                None => break,
            }
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    store_reads: AtomicU64,
    store_writes: AtomicU64,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub store_reads: u64,
    pub store_writes: u64,
    pub evictions: u64,
    pub entries: usize,
    pub pending_writes: usize,
    pub inflight_reads: usize,
}

enum ReadPlan {
    Ready(DocumentContent),
    Await(SharedRead),
}

struct WriteJob {
    id: String,
    content: DocumentContent,
    stamp: Stamp,
    flushed_seq: Option<u64>,
    ticket: u64,
}

enum WritePlan {
    Join(SharedWrite),
    Queue(Arc<AsyncMutex<()>>),
}

pub struct ContentCache {
    store: Arc<dyn DocumentStore>,
    config: CacheConfig,
    state: Arc<Mutex<CacheState>>,
    counters: Arc<Counters>,
    flush_signal: Notify,
}

impl ContentCache {
    pub fn new(store: Arc<dyn DocumentStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            state: Arc::new(Mutex::new(CacheState::default())),
            counters: Arc::new(Counters::default()),
            flush_signal: Notify::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Current body of `id`. A document never written reads as empty.
    pub async fn read(&self, id: &str) -> Result<DocumentContent> {
        let plan = {
            let mut state = self.state.lock();
            self.plan_read(&mut state, id)
        };
        let fetch = match plan {
            ReadPlan::Ready(content) => return Ok(content),
            ReadPlan::Await(fetch) => fetch,
        };

        let outcome = fetch.clone().await;
        {
            let mut state = self.state.lock();
            let ours = state
                .reads
                .get(id)
                .filter(|inflight| inflight.fetch.ptr_eq(&fetch))
                .map(|inflight| inflight.stamp);
            if let Some(stamp) = ours {
                state.reads.remove(id);
                if let Ok(content) = &outcome {
                    if state.stamp(id) == stamp && !state.pending.contains_key(id) {
                        state.insert_entry(id, content.clone(), &self.config, &self.counters);
                    }
                }
                state.settle(id);
            }
        }
        outcome.map_err(StoreError::from_shared)
    }

    fn plan_read(&self, state: &mut CacheState, id: &str) -> ReadPlan {
        if let Some(pending) = state.pending.get(id) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return ReadPlan::Ready(pending.content.clone());
        }
        let now = Instant::now();
        let expired = match state.entries.get_mut(id) {
            Some(entry) if !entry.expired(now) => {
                entry.last_accessed = now;
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!(%id, "content cache hit");
                return ReadPlan::Ready(entry.content.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(id);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(%id, "content cache entry expired");
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(inflight) = state.reads.get(id) {
            debug!(%id, "joining in-flight read");
            return ReadPlan::Await(inflight.fetch.clone());
        }

        debug!(%id, "content cache miss");
        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let key = id.to_string();
        let fetch = async move {
            counters.store_reads.fetch_add(1, Ordering::Relaxed);
            match store.read(&key).await {
                Ok(content) => Ok(content.unwrap_or_default()),
                Err(err) => Err(Arc::new(err)),
            }
        }
        .boxed()
        .shared();
        let stamp = state.stamp(id);
        state.reads.insert(
            id.to_string(),
            InflightRead {
                fetch: fetch.clone(),
                stamp,
            },
        );
        ReadPlan::Await(fetch)
    }

    /// Store a new body for `id`.
    ///
    /// Immediate writes reach the store before returning; an immediate write
    /// supersedes any queued write of the same id. Otherwise the body is
    /// queued and written by the next flush.
    pub async fn write(&self, id: &str, content: DocumentContent, immediate: bool) -> Result<()> {
        if immediate {
            return self.write_through(id, content, None).await;
        }
        let queued = {
            let mut state = self.state.lock();
            state.bump(id);
            state.next_seq += 1;
            let seq = state.next_seq;
            state.pending.insert(
                id.to_string(),
                PendingWrite {
                    content: content.clone(),
                    seq,
                },
            );
            state.insert_entry(id, content, &self.config, &self.counters);
            state.pending.len()
        };
        debug!(%id, queued, "write queued");
        if queued >= self.config.batch_size.max(1) {
            self.flush_signal.notify_one();
        }
        Ok(())
    }

    async fn write_through(
        &self,
        id: &str,
        content: DocumentContent,
        flushed_seq: Option<u64>,
    ) -> Result<()> {
        let plan = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let plan = match state.writes.get_mut(id) {
                Some(inflight) if !inflight.superseded && inflight.content == content => {
                    WritePlan::Join(inflight.done.clone())
                }
                Some(inflight) => {
                    inflight.superseded = true;
                    WritePlan::Queue(Arc::clone(state.lanes.entry(id.to_string()).or_default()))
                }
                None => WritePlan::Queue(Arc::clone(state.lanes.entry(id.to_string()).or_default())),
            };
            plan
        };
        let lane = match plan {
            WritePlan::Join(done) => {
                debug!(%id, "joining identical in-flight write");
                return done.await.map_err(StoreError::from_shared);
            }
            WritePlan::Queue(lane) => lane,
        };

        let turn = lane.lock_owned().await;
        let done = {
            let mut state = self.state.lock();
            let stamp = if flushed_seq.is_none() {
                state.pending.remove(id);
                state.entries.remove(id);
                state.bump(id)
            } else {
                state.stamp(id)
            };
            state.next_seq += 1;
            let ticket = state.next_seq;

            // The store write and its bookkeeping run detached, so a caller
            // that gives up waiting cannot strand the lane.
            let task = tokio::spawn(Self::run_write(
                Arc::clone(&self.store),
                Arc::clone(&self.state),
                Arc::clone(&self.counters),
                self.config.clone(),
                WriteJob {
                    id: id.to_string(),
                    content: content.clone(),
                    stamp,
                    flushed_seq,
                    ticket,
                },
                turn,
            ));
            let done = async move {
                match task.await {
                    Ok(outcome) => outcome,
                    Err(err) => Err(Arc::new(StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("document write task failed: {err}"),
                    )))),
                }
            }
            .boxed()
            .shared();
            state.writes.insert(
                id.to_string(),
                InflightWrite {
                    content,
                    done: done.clone(),
                    ticket,
                    superseded: false,
                },
            );
            done
        };
        done.await.map_err(StoreError::from_shared)
    }

    async fn run_write(
        store: Arc<dyn DocumentStore>,
        state: Arc<Mutex<CacheState>>,
        counters: Arc<Counters>,
        config: CacheConfig,
        job: WriteJob,
        turn: OwnedMutexGuard<()>,
    ) -> std::result::Result<(), Arc<StoreError>> {
        counters.store_writes.fetch_add(1, Ordering::Relaxed);
        let outcome = store.write(&job.id, &job.content).await.map_err(Arc::new);

        let mut guard = state.lock();
        let state = &mut *guard;
        if state
            .writes
            .get(&job.id)
            .map_or(false, |inflight| inflight.ticket == job.ticket)
        {
            state.writes.remove(&job.id);
        }
        if outcome.is_ok() {
            if let Some(seq) = job.flushed_seq {
                if state.pending.get(&job.id).map(|p| p.seq) == Some(seq) {
                    state.pending.remove(&job.id);
                }
            }
            if state.stamp(&job.id) == job.stamp {
                // Reads that missed while this write ran hold the current
                // stamp; moving past it keeps them from caching the old body.
                state.bump(&job.id);
                state.insert_entry(&job.id, job.content, &config, &counters);
            }
        }
        drop(turn);
        state.release_lane(&job.id);
        state.settle(&job.id);
        outcome
    }

    /// Write every queued body in parallel.
    ///
    /// Failed writes stay queued for the next flush; the first failure is
    /// returned after all writes have been attempted.
    pub async fn flush(&self) -> Result<usize> {
        let batch: Vec<(String, DocumentContent, u64)> = {
            let state = self.state.lock();
            let batch = state
                .pending
                .iter()
                .map(|(id, p)| (id.clone(), p.content.clone(), p.seq))
                .collect();
            batch
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let started = Instant::now();
        let outcomes = join_all(
            batch
                .iter()
                .map(|(id, content, seq)| self.write_through(id, content.clone(), Some(*seq))),
        )
        .await;

        let mut written = 0;
        let mut first_error = None;
        for ((id, _, _), outcome) in batch.iter().zip(outcomes) {
            match outcome {
                Ok(()) => written += 1,
                Err(err) => {
                    warn!(%id, error = %err, "queued write failed, keeping it queued");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        info!(written, failed = batch.len() - written, elapsed = ?started.elapsed(), "content cache flushed");
        match first_error {
            Some(err) => Err(err),
            None => Ok(written),
        }
    }

    /// Drop cached bodies for `id`, or all of them. Queued writes are kept.
    pub fn invalidate(&self, id: Option<&str>) {
        let mut state = self.state.lock();
        match id {
            Some(id) => {
                state.entries.remove(id);
                state.bump(id);
                state.settle(id);
            }
            None => {
                state.entries.clear();
                state.epoch += 1;
            }
        }
        debug!(id = id.unwrap_or("*"), "content cache invalidated");
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_cached(&self, id: &str) -> bool {
        let state = self.state.lock();
        state
            .entries
            .get(id)
            .map_or(false, |entry| !entry.expired(Instant::now()))
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            store_reads: self.counters.store_reads.load(Ordering::Relaxed),
            store_writes: self.counters.store_writes.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            entries: state.entries.len(),
            pending_writes: state.pending.len(),
            inflight_reads: state.reads.len(),
        }
    }

    /// Background flusher: flushes when the batch threshold is reached, on
    /// every interval tick, and once more when `shutdown` flips to `true`.
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let period = cache.config.flush_interval.max(Duration::from_millis(1));
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cache.flush_signal.notified() => {}
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if cache.pending_len() > 0 {
                    if let Err(err) = cache.flush().await {
                        warn!(error = %err, "background flush failed");
                    }
                }
            }
            if let Err(err) = cache.flush().await {
                warn!(error = %err, "final flush failed");
            }
            debug!("content cache flusher stopped");
        })
    }
}

#[cfg(test)]
mod tests;
