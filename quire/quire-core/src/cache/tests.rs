use super::*;
use async_trait::async_trait;
use futures::future::join;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use tokio::sync::Mutex as TokioMutex;
use tokio::time::{sleep, timeout};

#[derive(Default)]
struct MockDocumentStore {
    docs: TokioMutex<HashMap<String, DocumentContent>>,
    write_log: TokioMutex<Vec<String>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
    read_delay: Duration,
    write_delay: Duration,
    fail_writes: AtomicBool,
}

impl MockDocumentStore {
    fn with_delays(read_delay: Duration, write_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            read_delay,
            write_delay,
            ..Default::default()
        })
    }

    async fn put(&self, id: &str, text: &str) {
        self.docs
            .lock()
            .await
            .insert(id.to_string(), DocumentContent::plain(text));
    }

    async fn text(&self, id: &str) -> Option<String> {
        self.docs.lock().await.get(id).map(|c| c.plain_text.clone())
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MockDocumentStore {
    async fn read(&self, id: &str) -> Result<Option<DocumentContent>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        // Snapshot first so a slow read returns what was there when it started.
        let found = self.docs.lock().await.get(id).cloned();
        sleep(self.read_delay).await;
        Ok(found)
    }

    async fn write(&self, id: &str, content: &DocumentContent) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        sleep(self.write_delay).await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        self.write_log.lock().await.push(content.plain_text.clone());
        self.docs
            .lock()
            .await
            .insert(id.to_string(), content.clone());
        Ok(())
    }
}

fn config() -> CacheConfig {
    CacheConfig {
        ttl: Duration::from_secs(60),
        max_entries: 64,
        batch_size: 100,
        flush_interval: Duration::from_secs(3600),
    }
}

fn cache_over(store: &Arc<MockDocumentStore>, config: CacheConfig) -> Arc<ContentCache> {
    Arc::new(ContentCache::new(store.clone(), config))
}

fn plain(text: &str) -> DocumentContent {
    DocumentContent::plain(text)
}

#[tokio::test]
async fn missing_document_reads_empty() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    let cache = cache_over(&store, config());
    assert_eq!(cache.read("ghost").await.unwrap(), DocumentContent::default());
    assert!(cache.is_cached("ghost"));
}

#[tokio::test]
async fn concurrent_reads_share_one_store_read() {
    let store = MockDocumentStore::with_delays(Duration::from_millis(50), Duration::ZERO);
    store.put("ch1", "It begins.").await;
    let cache = cache_over(&store, config());

    let results = join_all((0..10).map(|_| cache.read("ch1"))).await;
    for result in results {
        assert_eq!(result.unwrap().plain_text, "It begins.");
    }
    assert_eq!(store.reads(), 1);

    // Now cached.
    cache.read("ch1").await.unwrap();
    assert_eq!(store.reads(), 1);
    let stats = cache.stats();
    assert_eq!(stats.store_reads, 1);
    assert_eq!(stats.inflight_reads, 0);
}

#[tokio::test]
async fn immediate_write_is_visible_without_store_read() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    store.put("ch1", "old").await;
    let cache = cache_over(&store, config());

    assert_eq!(cache.read("ch1").await.unwrap().plain_text, "old");
    cache.write("ch1", plain("new"), true).await.unwrap();
    assert_eq!(cache.read("ch1").await.unwrap().plain_text, "new");
    assert_eq!(store.reads(), 1);
    assert_eq!(store.text("ch1").await.as_deref(), Some("new"));
}

#[tokio::test]
async fn identical_immediate_writes_share_one_store_write() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::from_millis(30));
    let cache = cache_over(&store, config());

    let results = join_all((0..5).map(|_| cache.write("ch1", plain("same"), true))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(store.writes(), 1);
}

#[tokio::test]
async fn differing_writes_land_in_call_order() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::from_millis(10));
    let cache = cache_over(&store, config());

    let bodies = ["A", "B", "A", "C"];
    let results = join_all(bodies.iter().map(|b| cache.write("ch1", plain(b), true))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    assert_eq!(*store.write_log.lock().await, vec!["A", "B", "A", "C"]);
    assert_eq!(store.text("ch1").await.as_deref(), Some("C"));
    assert_eq!(cache.read("ch1").await.unwrap().plain_text, "C");
}

#[tokio::test]
async fn slow_read_does_not_clobber_newer_write() {
    let store = MockDocumentStore::with_delays(Duration::from_millis(50), Duration::ZERO);
    store.put("ch1", "old").await;
    let cache = cache_over(&store, config());

    let (read, write) = join(cache.read("ch1"), async {
        sleep(Duration::from_millis(10)).await;
        cache.write("ch1", plain("new"), true).await
    })
    .await;
    write.unwrap();
    assert_eq!(read.unwrap().plain_text, "old");
    assert_eq!(cache.read("ch1").await.unwrap().plain_text, "new");
}

#[tokio::test]
async fn read_missing_during_write_does_not_cache_old_body() {
    let store = MockDocumentStore::with_delays(Duration::from_millis(100), Duration::from_millis(50));
    store.put("ch1", "old").await;
    let cache = cache_over(&store, config());

    let (write, read) = join(cache.write("ch1", plain("new"), true), async {
        sleep(Duration::from_millis(10)).await;
        cache.read("ch1").await
    })
    .await;
    write.unwrap();
    assert_eq!(read.unwrap().plain_text, "old");
    assert_eq!(store.text("ch1").await.as_deref(), Some("new"));
    assert_eq!(cache.read("ch1").await.unwrap().plain_text, "new");
    assert_eq!(store.reads(), 1);
}

#[tokio::test]
async fn abandoned_write_does_not_block_later_writes() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::from_millis(50));
    let cache = cache_over(&store, config());

    let abandoned = timeout(Duration::from_millis(5), cache.write("ch1", plain("v1"), true)).await;
    assert!(abandoned.is_err());

    let next = timeout(Duration::from_secs(2), cache.write("ch1", plain("v2"), true)).await;
    assert!(matches!(next, Ok(Ok(()))));
    assert_eq!(*store.write_log.lock().await, vec!["v1", "v2"]);
    assert_eq!(cache.read("ch1").await.unwrap().plain_text, "v2");

    cache.write("ch1", plain("v3"), false).await.unwrap();
    let flushed = timeout(Duration::from_secs(2), cache.flush()).await;
    assert!(matches!(flushed, Ok(Ok(1))));
    assert_eq!(store.text("ch1").await.as_deref(), Some("v3"));
}

#[tokio::test]
async fn idle_ids_release_bookkeeping() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::from_millis(5));
    store.put("c", "kept").await;
    let cache = cache_over(&store, config());

    cache.write("a", plain("a1"), true).await.unwrap();
    cache.write("b", plain("b1"), false).await.unwrap();
    cache.flush().await.unwrap();
    cache.read("c").await.unwrap();
    cache.invalidate(Some("c"));
    let results = join_all(["d1", "d2", "d3"].map(|b| cache.write("d", plain(b), true))).await;
    assert!(results.iter().all(|r| r.is_ok()));

    {
        let state = cache.state.lock();
        assert!(state.lanes.is_empty());
        assert!(state.generations.is_empty());
        assert!(state.writes.is_empty());
    }
    assert_eq!(cache.read("d").await.unwrap().plain_text, "d3");
    assert_eq!(cache.read("b").await.unwrap().plain_text, "b1");
}

#[tokio::test]
async fn queued_writes_coalesce_until_flush() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    let cache = cache_over(&store, config());

    cache.write("a", plain("a1"), false).await.unwrap();
    cache.write("a", plain("a2"), false).await.unwrap();
    cache.write("b", plain("b1"), false).await.unwrap();
    assert_eq!(store.writes(), 0);
    assert_eq!(cache.pending_len(), 2);
    assert_eq!(cache.read("a").await.unwrap().plain_text, "a2");
    assert_eq!(store.reads(), 0);

    assert_eq!(cache.flush().await.unwrap(), 2);
    assert_eq!(store.writes(), 2);
    assert_eq!(store.text("a").await.as_deref(), Some("a2"));
    assert_eq!(cache.pending_len(), 0);
    assert_eq!(cache.flush().await.unwrap(), 0);
}

#[tokio::test]
async fn immediate_write_supersedes_queued_one() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    let cache = cache_over(&store, config());

    cache.write("a", plain("queued"), false).await.unwrap();
    cache.write("a", plain("now"), true).await.unwrap();
    assert_eq!(cache.pending_len(), 0);
    cache.flush().await.unwrap();
    assert_eq!(*store.write_log.lock().await, vec!["now"]);
}

#[tokio::test]
async fn failed_flush_keeps_writes_queued() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    let cache = cache_over(&store, config());
    store.fail_writes.store(true, Ordering::SeqCst);

    cache.write("a", plain("precious"), false).await.unwrap();
    assert!(matches!(cache.flush().await, Err(StoreError::Io(_))));
    assert_eq!(cache.pending_len(), 1);
    assert_eq!(cache.read("a").await.unwrap().plain_text, "precious");

    store.fail_writes.store(false, Ordering::SeqCst);
    assert_eq!(cache.flush().await.unwrap(), 1);
    assert_eq!(cache.pending_len(), 0);
    assert_eq!(store.text("a").await.as_deref(), Some("precious"));
}

#[tokio::test]
async fn batch_threshold_wakes_flusher() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    let cache = cache_over(
        &store,
        CacheConfig {
            batch_size: 2,
            ..config()
        },
    );
    let (stop, stopped) = watch::channel(false);
    let flusher = cache.spawn_flusher(stopped);

    cache.write("a", plain("a"), false).await.unwrap();
    cache.write("b", plain("b"), false).await.unwrap();
    for _ in 0..100 {
        if store.writes() == 2 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.writes(), 2);

    stop.send(true).unwrap();
    flusher.await.unwrap();
}

#[tokio::test]
async fn shutdown_flushes_remaining_writes() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    let cache = cache_over(&store, config());
    let (stop, stopped) = watch::channel(false);
    let flusher = cache.spawn_flusher(stopped);

    cache.write("a", plain("last words"), false).await.unwrap();
    stop.send(true).unwrap();
    flusher.await.unwrap();
    assert_eq!(store.text("a").await.as_deref(), Some("last words"));
    assert_eq!(cache.pending_len(), 0);
}

#[tokio::test]
async fn entries_expire_after_ttl() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    store.put("a", "body").await;
    let cache = cache_over(
        &store,
        CacheConfig {
            ttl: Duration::from_millis(40),
            ..config()
        },
    );

    cache.read("a").await.unwrap();
    cache.read("a").await.unwrap();
    assert_eq!(store.reads(), 1);
    sleep(Duration::from_millis(60)).await;
    assert!(!cache.is_cached("a"));
    cache.read("a").await.unwrap();
    assert_eq!(store.reads(), 2);
}

#[tokio::test]
async fn least_recently_used_entry_is_evicted() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    for id in ["a", "b", "c"] {
        store.put(id, id).await;
    }
    let cache = cache_over(
        &store,
        CacheConfig {
            max_entries: 2,
            ..config()
        },
    );

    for id in ["a", "b", "a", "c"] {
        cache.read(id).await.unwrap();
        sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(store.reads(), 3);
    assert!(cache.is_cached("a"));
    assert!(!cache.is_cached("b"));
    cache.read("b").await.unwrap();
    assert_eq!(store.reads(), 4);
    assert_eq!(cache.stats().entries, 2);
}

#[tokio::test]
async fn invalidate_keeps_pending_writes() {
    let store = MockDocumentStore::with_delays(Duration::ZERO, Duration::ZERO);
    store.put("cached", "v1").await;
    let cache = cache_over(&store, config());

    cache.read("cached").await.unwrap();
    cache.write("queued", plain("draft"), false).await.unwrap();

    cache.invalidate(None);
    assert!(!cache.is_cached("cached"));
    assert_eq!(cache.read("queued").await.unwrap().plain_text, "draft");
    assert_eq!(cache.pending_len(), 1);

    store.put("cached", "v2").await;
    assert_eq!(cache.read("cached").await.unwrap().plain_text, "v2");
    cache.invalidate(Some("cached"));
    assert_eq!(cache.read("cached").await.unwrap().plain_text, "v2");
    assert_eq!(store.reads(), 3);
}
