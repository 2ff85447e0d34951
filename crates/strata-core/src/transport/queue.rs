// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Coalescing transport requests.
//!
//! All requests for the same connection configuration that overlap in time
//! share a single transport, opened once after the configuration's safe open
//! interval and closed when the last holder releases it.
//!
//! ```ignore
//! let mut request = queue.request_transport(&auth)?;
//! let transport = request.transport().await?;
//! transport.exec("squeue").await?;
//! request.release().await;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{AuthInfo, Transport, TransportError};

#[derive(Clone)]
enum Grant {
    Pending,
    Open(Arc<dyn Transport>),
    Failed(TransportError),
}

struct Entry {
    id: u64,
    holders: usize,
    transport: Arc<dyn Transport>,
    grant: Arc<watch::Sender<Grant>>,
    opener: JoinHandle<()>,
}

#[derive(Default)]
struct QueueInner {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl QueueInner {
    /// Remove the entry for `key` if it is still the one with `id`.
    fn remove_entry(&self, key: &str, id: u64) -> Option<Entry> {
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key)
        } else {
            None
        }
    }
}

/// Shares open transports among concurrent requests.
#[derive(Clone, Default)]
pub struct TransportQueue {
    inner: Arc<QueueInner>,
}

impl TransportQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in a transport for `auth`.
    ///
    /// The first request for a key schedules the open after the transport's
    /// safe open interval; later requests join the same entry, whether it is
    /// still pending or already open. Must be called within a tokio runtime.
    pub fn request_transport(&self, auth: &dyn AuthInfo) -> Result<TransportRequest, TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::QueueClosed);
        }

        let key = auth.key();
        let mut entries = self.inner.entries.lock();
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| self.new_entry(&key, auth.transport()));
        entry.holders += 1;

        debug!(key = %key, holders = entry.holders, "Transport requested");

        Ok(TransportRequest {
            queue: self.clone(),
            key,
            entry_id: entry.id,
            grant: entry.grant.subscribe(),
            released: false,
        })
    }

    fn new_entry(&self, key: &str, transport: Arc<dyn Transport>) -> Entry {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, _) = watch::channel(Grant::Pending);
        let grant = Arc::new(tx);
        let interval = transport.safe_open_interval();

        let opener = {
            let inner = Arc::clone(&self.inner);
            let grant = Arc::clone(&grant);
            let transport = Arc::clone(&transport);
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                match transport.open().await {
                    Ok(()) => {
                        info!(key = %key, "Transport opened");
                        grant.send_replace(Grant::Open(transport));
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to open transport");
                        inner.remove_entry(&key, id);
                        grant.send_replace(Grant::Failed(e));
                    }
                }
            })
        };

        Entry {
            id,
            holders: 0,
            transport,
            grant,
            opener,
        }
    }

    async fn release(&self, key: &str, entry_id: u64) {
        let finished = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.id == entry_id => {
                    entry.holders = entry.holders.saturating_sub(1);
                    debug!(key = %key, holders = entry.holders, "Transport released");
                    if entry.holders == 0 {
                        entries.remove(key)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(entry) = finished {
            shutdown_entry(key, entry).await;
        }
    }

    /// Keys with a pending or open transport.
    pub fn active_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of requests currently holding the entry for `key`.
    pub fn holders(&self, key: &str) -> usize {
        self.inner
            .entries
            .lock()
            .get(key)
            .map_or(0, |entry| entry.holders)
    }

    /// Run `f` with an open transport for `auth`, releasing it afterwards.
    pub async fn with_transport<F, Fut, T>(&self, auth: &dyn AuthInfo, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(Arc<dyn Transport>) -> Fut,
        Fut: Future<Output = T>,
    {
        let mut request = self.request_transport(auth)?;
        let transport = match request.transport().await {
            Ok(transport) => transport,
            Err(e) => {
                request.release().await;
                return Err(e);
            }
        };
        let output = f(transport).await;
        request.release().await;
        Ok(output)
    }

    /// Close every transport and reject further requests. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<(String, Entry)> = self.inner.entries.lock().drain().collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "Closing transport queue");
        }
        for (key, entry) in drained {
            shutdown_entry(&key, entry).await;
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

async fn shutdown_entry(key: &str, entry: Entry) {
    // cancel a pending open and wait for the opener to stop before reading
    // the transport state; an open that already completed is kept as is
    entry.opener.abort();
    if let Err(e) = entry.opener.await
        && !e.is_cancelled()
    {
        warn!(key = %key, error = %e, "Transport opener failed");
    }
    if entry.transport.is_open() {
        match entry.transport.close().await {
            Ok(()) => info!(key = %key, "Transport closed"),
            Err(e) => warn!(key = %key, error = %e, "Failed to close transport"),
        }
    } else {
        debug!(key = %key, "Transport released before it was opened");
    }
}

/// One holder's claim on a shared transport.
///
/// Call [`release`](Self::release) when done; dropping an unreleased request
/// releases it in the background.
pub struct TransportRequest {
    queue: TransportQueue,
    key: String,
    entry_id: u64,
    grant: watch::Receiver<Grant>,
    released: bool,
}

impl fmt::Debug for TransportRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRequest")
            .field("key", &self.key)
            .field("entry_id", &self.entry_id)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl TransportRequest {
    /// Configuration key of this request.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Wait until the shared transport is open.
    pub async fn transport(&mut self) -> Result<Arc<dyn Transport>, TransportError> {
        let grant = self
            .grant
            .wait_for(|grant| !matches!(grant, Grant::Pending))
            .await
            .map_err(|_| TransportError::QueueClosed)?
            .clone();

        match grant {
            Grant::Open(transport) => Ok(transport),
            Grant::Failed(e) => Err(e),
            Grant::Pending => Err(TransportError::QueueClosed),
        }
    }

    /// Give up this claim. The last holder closes the transport.
    pub async fn release(mut self) {
        self.released = true;
        self.queue.release(&self.key, self.entry_id).await;
    }
}

impl Drop for TransportRequest {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let queue = self.queue.clone();
        let key = std::mem::take(&mut self.key);
        let entry_id = self.entry_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { queue.release(&key, entry_id).await });
        } else {
            warn!(key = %key, "Transport request dropped outside a runtime, not released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ExecOutput, LocalAuthInfo};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingTransport {
        open: AtomicBool,
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail: bool,
        interval: Duration,
    }

    #[async_trait::async_trait]
    impl Transport for CountingTransport {
        async fn open(&self) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Open {
                    key: "flaky".to_string(),
                    message: "connection refused".to_string(),
                });
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn safe_open_interval(&self) -> Duration {
            self.interval
        }

        async fn exec(&self, _command: &str) -> Result<ExecOutput, TransportError> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    struct CountingAuth {
        key: String,
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail: bool,
        interval: Duration,
    }

    impl CountingAuth {
        fn new(key: &str, interval: Duration) -> Self {
            Self {
                key: key.to_string(),
                opens: Arc::default(),
                closes: Arc::default(),
                fail: false,
                interval,
            }
        }
    }

    impl AuthInfo for CountingAuth {
        fn key(&self) -> String {
            self.key.clone()
        }

        fn transport(&self) -> Arc<dyn Transport> {
            Arc::new(CountingTransport {
                open: AtomicBool::new(false),
                opens: Arc::clone(&self.opens),
                closes: Arc::clone(&self.closes),
                fail: self.fail,
                interval: self.interval,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_requests_share_one_open() {
        let queue = TransportQueue::new();
        let auth = CountingAuth::new("cluster", Duration::from_secs(5));

        let mut first = queue.request_transport(&auth).unwrap();
        let mut second = queue.request_transport(&auth).unwrap();
        assert_eq!(queue.holders("cluster"), 2);

        let a = first.transport().await.unwrap();
        let b = second.transport().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(auth.opens.load(Ordering::SeqCst), 1);

        // a late requester joins the open transport without a new open
        let mut third = queue.request_transport(&auth).unwrap();
        third.transport().await.unwrap();
        assert_eq!(auth.opens.load(Ordering::SeqCst), 1);

        first.release().await;
        second.release().await;
        assert_eq!(auth.closes.load(Ordering::SeqCst), 0);
        third.release().await;
        assert_eq!(auth.closes.load(Ordering::SeqCst), 1);
        assert!(queue.active_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_waits_for_safe_interval() {
        let queue = TransportQueue::new();
        let auth = CountingAuth::new("slow", Duration::from_secs(30));
        let mut request = queue.request_transport(&auth).unwrap();

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(auth.opens.load(Ordering::SeqCst), 0);

        request.transport().await.unwrap();
        assert_eq!(auth.opens.load(Ordering::SeqCst), 1);
        request.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_before_open_cancels_it() {
        let queue = TransportQueue::new();
        let auth = CountingAuth::new("never", Duration::from_secs(10));
        let request = queue.request_transport(&auth).unwrap();
        request.release().await;

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(auth.opens.load(Ordering::SeqCst), 0);
        assert_eq!(auth.closes.load(Ordering::SeqCst), 0);
        assert!(queue.active_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_debug_shows_key() {
        let queue = TransportQueue::new();
        let auth = CountingAuth::new("cluster-a", Duration::from_secs(1));
        let request = queue.request_transport(&auth).unwrap();

        let rendered = format!("{request:?}");
        assert!(rendered.starts_with("TransportRequest"));
        assert!(rendered.contains("\"cluster-a\""));
        assert!(rendered.contains("released: false"));
        request.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_notifies_all_waiters() {
        let queue = TransportQueue::new();
        let mut auth = CountingAuth::new("flaky", Duration::from_secs(1));
        auth.fail = true;

        let mut first = queue.request_transport(&auth).unwrap();
        let mut second = queue.request_transport(&auth).unwrap();
        assert!(matches!(first.transport().await, Err(TransportError::Open { .. })));
        assert!(matches!(second.transport().await, Err(TransportError::Open { .. })));
        assert!(queue.active_keys().is_empty());

        // releasing stale requests leaves a fresh entry untouched
        auth.fail = false;
        let mut fresh = queue.request_transport(&auth).unwrap();
        first.release().await;
        second.release().await;
        assert_eq!(queue.holders("flaky"), 1);
        fresh.transport().await.unwrap();
        fresh.release().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_distinct_keys_get_distinct_transports() {
        let queue = TransportQueue::new();
        let a = CountingAuth::new("a", Duration::ZERO);
        let b = CountingAuth::new("b", Duration::ZERO);
        let mut ra = queue.request_transport(&a).unwrap();
        let mut rb = queue.request_transport(&b).unwrap();
        ra.transport().await.unwrap();
        rb.transport().await.unwrap();
        assert_eq!(queue.active_keys(), vec!["a".to_string(), "b".to_string()]);
        ra.release().await;
        rb.release().await;
    }

    #[tokio::test]
    async fn test_with_transport_and_close() {
        let queue = TransportQueue::new();
        let auth = LocalAuthInfo::new("localhost");

        let output = queue
            .with_transport(&auth, |transport| async move { transport.exec("echo hi").await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(output.stdout.trim(), "hi");
        assert!(queue.active_keys().is_empty());

        queue.close().await;
        queue.close().await;
        assert!(queue.is_closed());
        assert!(matches!(
            queue.request_transport(&auth),
            Err(TransportError::QueueClosed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_shuts_open_transports() {
        let queue = TransportQueue::new();
        let auth = CountingAuth::new("cluster", Duration::ZERO);
        let mut request = queue.request_transport(&auth).unwrap();
        request.transport().await.unwrap();

        queue.close().await;
        assert_eq!(auth.closes.load(Ordering::SeqCst), 1);
        // the stale request no longer matches any entry
        request.release().await;
        assert_eq!(auth.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_request_is_released() {
        let queue = TransportQueue::new();
        let auth = CountingAuth::new("cluster", Duration::ZERO);
        {
            let mut request = queue.request_transport(&auth).unwrap();
            request.transport().await.unwrap();
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(queue.active_keys().is_empty());
        assert_eq!(auth.closes.load(Ordering::SeqCst), 1);
    }

    /// Opens inside a single poll, so an abort cannot interrupt it.
    #[derive(Default)]
    struct BlockingOpen {
        started: Arc<AtomicBool>,
        open: AtomicBool,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Transport for BlockingOpen {
        async fn open(&self) -> Result<(), TransportError> {
            self.started.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            self.open.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn safe_open_interval(&self) -> Duration {
            Duration::ZERO
        }

        async fn exec(&self, _command: &str) -> Result<ExecOutput, TransportError> {
            Err(TransportError::NotOpen)
        }
    }

    struct BlockingAuth(Arc<BlockingOpen>);

    impl AuthInfo for BlockingAuth {
        fn key(&self) -> String {
            "blocking".to_string()
        }

        fn transport(&self) -> Arc<dyn Transport> {
            Arc::clone(&self.0) as Arc<dyn Transport>
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_during_open_leaves_nothing_open() {
        let transport = Arc::new(BlockingOpen::default());
        let auth = BlockingAuth(Arc::clone(&transport));
        let queue = TransportQueue::new();
        let _request = queue.request_transport(&auth).unwrap();

        while !transport.started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        queue.close().await;

        assert!(!transport.is_open());
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }
}
