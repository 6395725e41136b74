//! Session tracking and usage flushing
//!
//! A session is the ephemeral state of one authenticated client connection:
//! the account snapshot, the shared traffic counter, and a cancellation
//! token that force-closes every peer socket of the session exactly once.
//! The registry keeps all live sessions so a periodic flusher can merge
//! accumulated deltas back into the account store, and so shutdown can run
//! one final unconditional flush.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::quota::SessionCounter;
use crate::store::{Account, AccountStore};

/// How often accumulated usage of live sessions is written out.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// One authenticated client connection.
#[derive(Debug)]
pub struct Session {
    /// Account row the session belongs to.
    pub account_id: i64,
    /// Username, for logging.
    pub username: String,
    /// Shared traffic counter fed by the metered stream.
    pub counter: Arc<SessionCounter>,
    /// When the session was opened.
    pub started_at: Instant,
    cancel: CancellationToken,
}

impl Session {
    fn new(account: &Account, parent: &CancellationToken) -> Self {
        Self {
            account_id: account.id,
            username: account.username.clone(),
            counter: Arc::new(SessionCounter::new(
                account.traffic_used,
                account.traffic_limit,
            )),
            started_at: Instant::now(),
            cancel: parent.child_token(),
        }
    }

    /// Token the session's relay tasks select against; cancelled when the
    /// session closes or the gateway shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Force-close all peer sockets of this session.
    pub fn close_peers(&self) {
        self.cancel.cancel();
    }
}

/// Registry of live sessions across all gateways.
#[derive(Debug)]
pub struct SessionRegistry {
    store: Arc<AccountStore>,
    sessions: RwLock<HashMap<u64, Arc<Session>>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl SessionRegistry {
    /// New registry flushing into `store`; session tokens are children of
    /// `shutdown`.
    pub fn new(store: Arc<AccountStore>, shutdown: CancellationToken) -> Self {
        Self {
            store,
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Open a session for an authenticated account.
    pub fn open(&self, account: &Account) -> (u64, Arc<Session>) {
        let session = Arc::new(Session::new(account, &self.shutdown));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().insert(id, session.clone());
        debug!(
            session = id,
            username = %session.username,
            "session opened"
        );
        (id, session)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no sessions are live.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close a session: force-close its peers, flush its usage, drop it.
    pub async fn close(&self, id: u64) {
        let session = self.sessions.write().remove(&id);
        if let Some(session) = session {
            session.close_peers();
            self.flush_one(&session).await;
            info!(
                session = id,
                username = %session.username,
                up = session.counter.bytes_up(),
                down = session.counter.bytes_down(),
                "session closed"
            );
        }
    }

    /// Flush every live session's accumulated delta.
    pub async fn flush_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in sessions {
            self.flush_one(&session).await;
        }
    }

    async fn flush_one(&self, session: &Session) {
        let delta = session.counter.take_flush_delta();
        if delta == 0 {
            return;
        }
        if let Err(err) = self.store.add_usage(session.account_id, delta).await {
            warn!(
                username = %session.username,
                error = %err,
                "failed to flush traffic usage"
            );
        }
    }

    /// Periodic flusher; runs until shutdown, flushing one last time on the
    /// way out.
    pub async fn run_flusher(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.flush_all().await,
                _ = self.shutdown.cancelled() => {
                    self.flush_all().await;
                    debug!("usage flusher stopped");
                    return;
                }
            }
        }
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    zero_notify: Arc<Notify>,
}

impl ConnectionTracker {
    /// New tracker with no active connections.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one connection.
    pub fn increment(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    /// Unregister one connection, waking drain waiters at zero.
    pub fn decrement(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.zero_notify.notify_waiters();
        }
    }

    /// Current number of active connections.
    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until no connections remain or the deadline passes.
    pub async fn wait_for_zero(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.count() == 0 {
                return true;
            }
            let notified = self.zero_notify.notified();
            if self.count() == 0 {
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.count() == 0,
            }
        }
    }
}

/// Guard that decrements the connection count on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
}

impl ConnectionGuard {
    /// Register a connection with `tracker` for the guard's lifetime.
    pub fn new(tracker: ConnectionTracker) -> Self {
        tracker.increment();
        Self { tracker }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.decrement();
    }
}
