//! Observable history state for UI consumers.
//!
//! [`HistoryStore`] turns [`HistoryApi`] calls into a [`HistoryState`]
//! that observers read through a [`tokio::sync::watch`] channel:
//!
//! - `loading` is `true` while at least one load is in flight and drops
//!   back to `false` on every exit path, including a dropped future.
//! - A successful load replaces `records`, `total_records` and
//!   `current_page` in one update.
//! - A failed load clears `records`, zeroes `total_records` and hands the
//!   error to the [`ErrorReporter`].
//!
//! Two guards keep late results out of the state. Only the most recently
//! started load may apply its outcome, and after [`HistoryStore::detach`]
//! no load touches the state at all.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fetch::FetchError;
use crate::history::{HistoryApi, HistoryPage, QueryParams, TestRecord};

/// Snapshot of what the history view displays.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryState {
    pub records: Vec<TestRecord>,
    pub loading: bool,
    pub total_records: u64,
    pub current_page: u32,
}

impl Default for HistoryState {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            loading: false,
            total_records: 0,
            current_page: 1,
        }
    }
}

/// Receives load and delete failures, typically to show a toast or log.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, operation: &str, error: &FetchError);
}

/// Logs failures through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, operation: &str, error: &FetchError) {
        match error.retry_after() {
            Some(retry_after) => {
                warn!(operation, retry_after, error = %error, "history request rate limited");
            }
            None => warn!(operation, error = %error, "history request failed"),
        }
    }
}

/// Bridges [`HistoryApi`] to observable state.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use testhist::config::ClientConfig;
/// use testhist::history::{HistoryApi, QueryParams};
/// use testhist::store::{HistoryStore, TracingReporter};
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let api = HistoryApi::from_config(&ClientConfig::default())?;
/// let store = HistoryStore::new(api, Arc::new(TracingReporter));
/// let mut updates = store.subscribe();
///
/// store.load(QueryParams::new().page(1).page_size(10)).await?;
/// updates.changed().await?;
/// println!("{} records", updates.borrow().total_records);
/// # Ok(())
/// # }
/// ```
pub struct HistoryStore {
    api: HistoryApi,
    reporter: Arc<dyn ErrorReporter>,
    state: watch::Sender<HistoryState>,
    // Sequence number of the most recently started load.
    latest: AtomicU64,
    // Only mutated inside `send_modify`, which serializes it with `loading`.
    in_flight: AtomicUsize,
    last_params: Mutex<Option<QueryParams>>,
    detached: CancellationToken,
}

impl HistoryStore {
    pub fn new(api: HistoryApi, reporter: Arc<dyn ErrorReporter>) -> Self {
        let (state, _) = watch::channel(HistoryState::default());
        Self {
            api,
            reporter,
            state,
            latest: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            last_params: Mutex::new(None),
            detached: CancellationToken::new(),
        }
    }

    /// Current state.
    pub fn snapshot(&self) -> HistoryState {
        self.state.borrow().clone()
    }

    /// A receiver notified on every state change.
    pub fn subscribe(&self) -> watch::Receiver<HistoryState> {
        self.state.subscribe()
    }

    pub fn api(&self) -> &HistoryApi {
        &self.api
    }

    /// Stops all further state updates. Loads already in flight still
    /// finish and return their outcome to the caller.
    pub fn detach(&self) {
        debug!("history store detached");
        self.detached.cancel();
    }

    pub fn is_detached(&self) -> bool {
        self.detached.is_cancelled()
    }

    /// Token cancelled by [`detach`](Self::detach), for tying other tasks to
    /// the store's lifetime.
    pub fn detach_token(&self) -> CancellationToken {
        self.detached.clone()
    }

    /// Loads one page of history into the state.
    ///
    /// The outcome is also returned. On failure the error has already been
    /// passed to the reporter.
    pub async fn load(&self, params: QueryParams) -> Result<Arc<HistoryPage>, FetchError> {
        let seq = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut last) = self.last_params.lock() {
            *last = Some(params.clone());
        }

        let _loading = LoadingGuard::enter(self);
        let outcome = self.api.list(&params).await;

        if let Err(e) = &outcome {
            self.reporter.report("load", e);
        }

        if self.is_detached() {
            debug!(seq, "load finished after detach, state untouched");
            return outcome;
        }
        if self.latest.load(Ordering::SeqCst) != seq {
            debug!(seq, "superseded load finished, state untouched");
            return outcome;
        }

        match &outcome {
            Ok(page) => self.state.send_modify(|s| {
                s.records = page.tests.clone();
                s.total_records = page.pagination.total;
                s.current_page = page.pagination.page;
            }),
            Err(_) => self.state.send_modify(|s| {
                s.records.clear();
                s.total_records = 0;
            }),
        }
        outcome
    }

    /// Repeats the most recent [`load`](Self::load), or loads the first
    /// page with default parameters if there was none.
    pub async fn reload(&self) -> Result<Arc<HistoryPage>, FetchError> {
        let params = self
            .last_params
            .lock()
            .ok()
            .and_then(|last| last.clone())
            .unwrap_or_default();
        self.load(params).await
    }

    /// Deletes one record. Failures are reported and returned.
    pub async fn delete_record(&self, id: &str) -> Result<u64, FetchError> {
        let outcome = self.api.delete(id).await;
        if let Err(e) = &outcome {
            self.reporter.report("delete", e);
        }
        outcome
    }

    /// Deletes several records in one call. Failures are reported and returned.
    pub async fn delete_records(&self, ids: &[String]) -> Result<u64, FetchError> {
        let outcome = self.api.delete_batch(ids).await;
        if let Err(e) = &outcome {
            self.reporter.report("delete_batch", e);
        }
        outcome
    }
}

/// Holds `loading` up for as long as it lives.
struct LoadingGuard<'a> {
    store: &'a HistoryStore,
}

impl<'a> LoadingGuard<'a> {
    fn enter(store: &'a HistoryStore) -> Self {
        if !store.is_detached() {
            store.state.send_modify(|s| {
                store.in_flight.fetch_add(1, Ordering::SeqCst);
                s.loading = true;
            });
        }
        Self { store }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let store = self.store;
        if store.is_detached() {
            return;
        }
        store.state.send_modify(|s| {
            // Saturating: a load entered before detach may leave after it.
            let previous = store
                .in_flight
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
                .unwrap_or(0);
            if previous <= 1 {
                s.loading = false;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::tests::{api_over, page_json};
    use crate::transport::testing::{Reply, ScriptedTransport};

    #[derive(Default)]
    struct RecordingReporter {
        seen: Mutex<Vec<(String, FetchError)>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, operation: &str, error: &FetchError) {
            self.seen
                .lock()
                .unwrap()
                .push((operation.to_owned(), error.clone()));
        }
    }

    fn store_over(transport: &Arc<ScriptedTransport>) -> (Arc<HistoryStore>, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let store = HistoryStore::new(api_over(transport), reporter.clone());
        (Arc::new(store), reporter)
    }

    async fn wait_for_calls(transport: &ScriptedTransport, n: usize) {
        while transport.calls() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn success_replaces_state() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, page_json(&["a", "b", "c"], 23, 3));
        let (store, reporter) = store_over(&transport);

        store.load(QueryParams::new().page(3).page_size(10)).await.unwrap();

        let state = store.snapshot();
        assert!(!state.loading);
        assert_eq!(state.records.len(), 3);
        assert_eq!(state.records[0].id, "a");
        assert_eq!(state.total_records, 23);
        assert_eq!(state.current_page, 3);
        assert!(reporter.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn identical_concurrent_loads_share_one_fetch() {
        let transport = Arc::new(ScriptedTransport::gated());
        transport.push_json(200, page_json(&["a"], 1, 1));
        let (store, _) = store_over(&transport);
        let params = QueryParams::new().page(1).page_size(10);

        let first = tokio::spawn({
            let store = store.clone();
            let params = params.clone();
            async move { store.load(params).await }
        });
        let second = tokio::spawn({
            let store = store.clone();
            let params = params.clone();
            async move { store.load(params).await }
        });

        wait_for_calls(&transport, 1).await;
        assert!(store.snapshot().loading);
        transport.release();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(transport.calls(), 1);
        assert!(!store.snapshot().loading);
    }

    #[tokio::test]
    async fn shared_failure_reaches_every_caller() {
        let transport = Arc::new(ScriptedTransport::gated());
        transport.push_json(200, serde_json::json!({ "success": false, "message": "db offline" }));
        let (store, reporter) = store_over(&transport);
        let params = QueryParams::new().page(1);

        let first = tokio::spawn({
            let store = store.clone();
            let params = params.clone();
            async move { store.load(params).await }
        });
        let second = tokio::spawn({
            let store = store.clone();
            async move { store.load(params).await }
        });
        wait_for_calls(&transport, 1).await;
        tokio::task::yield_now().await;
        transport.release();

        let expected = FetchError::Business {
            message: "db offline".to_owned(),
        };
        assert_eq!(first.await.unwrap().unwrap_err(), expected);
        assert_eq!(second.await.unwrap().unwrap_err(), expected);
        assert_eq!(transport.calls(), 1);
        assert_eq!(reporter.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn network_failure_clears_records() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, page_json(&["a", "b"], 2, 1));
        transport.push(Reply::Fail);
        let (store, reporter) = store_over(&transport);

        store.load(QueryParams::new().page(1)).await.unwrap();
        assert_eq!(store.snapshot().records.len(), 2);

        let err = store.load(QueryParams::new().page(2)).await.unwrap_err();
        assert!(matches!(err, FetchError::Network { .. }));

        let state = store.snapshot();
        assert!(state.records.is_empty());
        assert_eq!(state.total_records, 0);
        assert!(!state.loading);

        let seen = reporter.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "load");
    }

    #[tokio::test]
    async fn superseded_load_does_not_overwrite_newer_one() {
        let transport = Arc::new(ScriptedTransport::gated());
        transport.push_json(200, page_json(&["old"], 1, 1));
        transport.push_json(200, page_json(&["new"], 1, 2));
        let (store, _) = store_over(&transport);

        let older = tokio::spawn({
            let store = store.clone();
            async move { store.load(QueryParams::new().page(1)).await }
        });
        wait_for_calls(&transport, 1).await;
        let newer = tokio::spawn({
            let store = store.clone();
            async move { store.load(QueryParams::new().page(2)).await }
        });
        wait_for_calls(&transport, 2).await;

        transport.release();
        let old_page = older.await.unwrap().unwrap();
        assert_eq!(old_page.tests[0].id, "old");
        let state = store.snapshot();
        assert!(state.records.is_empty());
        assert!(state.loading);

        transport.release();
        newer.await.unwrap().unwrap();
        let state = store.snapshot();
        assert_eq!(state.records[0].id, "new");
        assert_eq!(state.current_page, 2);
        assert!(!state.loading);
    }

    #[tokio::test]
    async fn dropped_load_clears_loading() {
        let transport = Arc::new(ScriptedTransport::gated());
        let (store, reporter) = store_over(&transport);

        let mut load = Box::pin(store.load(QueryParams::new().page(1)));
        assert!(futures::poll!(load.as_mut()).is_pending());
        assert_eq!(transport.calls(), 1);
        assert!(store.snapshot().loading);

        drop(load);
        assert!(!store.snapshot().loading);
        assert!(reporter.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn detach_blocks_late_updates() {
        let transport = Arc::new(ScriptedTransport::gated());
        transport.push_json(200, page_json(&["late"], 1, 1));
        let (store, _) = store_over(&transport);
        let mut updates = store.subscribe();

        let pending = tokio::spawn({
            let store = store.clone();
            async move { store.load(QueryParams::new()).await }
        });
        wait_for_calls(&transport, 1).await;
        updates.borrow_and_update();

        store.detach();
        transport.release();

        // The caller still gets the data; the state does not.
        let page = pending.await.unwrap().unwrap();
        assert_eq!(page.tests[0].id, "late");
        assert!(store.snapshot().records.is_empty());
        assert!(!updates.has_changed().unwrap());
    }

    #[tokio::test]
    async fn reload_repeats_last_params() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_json(200, page_json(&["a"], 1, 4));
        let (store, _) = store_over(&transport);

        store.load(QueryParams::new().page(4)).await.unwrap();
        store.api().cache().clear_all();
        transport.push_json(200, page_json(&["b"], 1, 4));
        store.reload().await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].target(), requests[1].target());
        assert_eq!(store.snapshot().records[0].id, "b");
    }

    #[tokio::test]
    async fn delete_failures_are_reported() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(Reply::Respond(
            crate::http::Response::new(crate::http::StatusCode::TOO_MANY_REQUESTS, "")
                .with_header("Retry-After", "5"),
        ));
        let (store, reporter) = store_over(&transport);

        let err = store.delete_records(&["x".to_owned()]).await.unwrap_err();
        assert_eq!(err.retry_after(), Some("5"));
        let seen = reporter.seen.lock().unwrap();
        assert_eq!(seen[0].0, "delete_batch");
    }

    #[test]
    fn tracing_reporter_is_silent_without_subscriber() {
        TracingReporter.report(
            "load",
            &FetchError::RateLimited {
                retry_after: "60".to_owned(),
            },
        );
    }
}
