//! Key Pool — ordered collection of Key States; round-robin selection under a mutex;
//! availability query.

pub mod key_state;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use chrono::Utc;
use serde::Serialize;

use crate::db::models::GlobalLimits;
use crate::db::{errors::Result as DbResult, Store};
use key_state::KeyState;

/// Read-only projection of a Key State for the admin status endpoint. Never carries the
/// full credential.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key_preview: String,
    pub available_in_seconds: i64,
    pub success: u64,
    pub fail: u64,
}

/// Outcome of a single acquisition attempt handed to the Retry Controller.
pub struct Acquired {
    pub key: Arc<KeyState>,
}

/// Fire-and-forget usage write-back event, produced by `record_success`.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub credential: String,
    pub day_count: i64,
    pub last_used_at: chrono::DateTime<Utc>,
}

const USAGE_SYNC_CHANNEL_CAPACITY: usize = 256;
const USAGE_SYNC_WORKERS: usize = 4;

/// Concurrent, reloadable pool of Key States.
///
/// The cursor mutex is the single source of round-robin fairness and the sole mutex
/// covering "check then mark": it is never held across network I/O.
pub struct KeyPool {
    keys: ArcSwap<Vec<Arc<KeyState>>>,
    cursor: Mutex<usize>,
    limits: ArcSwap<GlobalLimits>,
    usage_tx: tokio::sync::mpsc::Sender<UsageEvent>,
}

impl KeyPool {
    pub fn new(keys: Vec<Arc<KeyState>>, limits: GlobalLimits, store: Store) -> Arc<Self> {
        let (usage_tx, usage_rx) = tokio::sync::mpsc::channel(USAGE_SYNC_CHANNEL_CAPACITY);
        spawn_usage_sync_workers(store, usage_rx);
        Arc::new(Self {
            keys: ArcSwap::from_pointee(keys),
            cursor: Mutex::new(0),
            limits: ArcSwap::from_pointee(limits),
            usage_tx,
        })
    }

    pub fn len(&self) -> usize {
        self.keys.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `token` matches any credential currently in the pool. Used by client
    /// authentication — any pooled key doubles as a valid bearer token.
    pub fn has_credential(&self, token: &str) -> bool {
        self.keys.load().iter().any(|k| k.key == token)
    }

    pub fn limits(&self) -> GlobalLimits {
        *self.limits.load_full()
    }

    pub fn set_limits(&self, limits: GlobalLimits) {
        self.limits.store(Arc::new(limits));
    }

    /// Replace the state list atomically. In-flight requests holding a prior `Arc<KeyState>`
    /// continue unaffected; subsequent acquisitions see the new pool.
    pub fn reload(&self, keys: Vec<Arc<KeyState>>) {
        self.keys.store(Arc::new(keys));
    }

    /// Round-robin acquire. Scans at most `N = |states|` slots starting from the cursor;
    /// on the first available hit, advances the cursor past that slot, marks the key
    /// picked, and returns it. Returns `None` without mutation if nothing is available.
    pub fn next_available(&self) -> Option<Arc<KeyState>> {
        let keys = self.keys.load_full();
        if keys.is_empty() {
            return None;
        }
        let limits = self.limits();
        let now = Utc::now();

        let mut cursor = self.cursor.lock().unwrap();
        let n = keys.len();
        for offset in 0..n {
            let idx = (*cursor + offset) % n;
            let candidate = &keys[idx];
            if candidate.is_available(now, limits) {
                *cursor = (idx + 1) % n;
                candidate.mark_picked(now);
                return Some(candidate.clone());
            }
        }
        None
    }

    /// Used by the Retry Controller for model-listing requests: one available key chosen
    /// uniformly at random, falling back to the key with the earliest `banned_until` if
    /// none are currently available.
    pub fn random_or_earliest_banned(&self) -> Option<Arc<KeyState>> {
        let keys = self.keys.load_full();
        if keys.is_empty() {
            return None;
        }
        let limits = self.limits();
        let now = Utc::now();
        let available: Vec<&Arc<KeyState>> = keys.iter().filter(|k| k.is_available(now, limits)).collect();
        if !available.is_empty() {
            let idx = rand_index(available.len());
            return Some(available[idx].clone());
        }
        keys.iter().min_by_key(|k| k.banned_until()).cloned()
    }

    pub fn status(&self) -> Vec<KeyStatus> {
        let keys = self.keys.load_full();
        let now = Utc::now();
        keys.iter()
            .map(|k| KeyStatus {
                key_preview: k.key_preview(),
                available_in_seconds: (k.banned_until() - now).num_seconds().max(0),
                success: k.success_count(),
                fail: k.failure_count(),
            })
            .collect()
    }

    /// Success-side mutation plus Usage Sync dispatch. Drops the event on a full queue
    /// rather than block the request path.
    pub fn record_success(&self, key: &Arc<KeyState>) {
        let now = Utc::now();
        let day_count = key.mark_success(now);
        let event = UsageEvent {
            credential: key.key.clone(),
            day_count,
            last_used_at: now,
        };
        if self.usage_tx.try_send(event).is_err() {
            tracing::debug!(key_preview = %key.key_preview(), "usage sync queue full, dropping event");
        }
    }

    pub fn record_failure(&self, key: &Arc<KeyState>) {
        key.mark_failure(Utc::now());
    }
}

fn rand_index(len: usize) -> usize {
    use rand::Rng;
    rand::thread_rng().gen_range(0..len)
}

/// Bounded worker pool draining the usage-sync channel. Failures are logged and
/// swallowed — the next pool reload reconciles via the baseline regardless.
fn spawn_usage_sync_workers(store: Store, rx: tokio::sync::mpsc::Receiver<UsageEvent>) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for worker_id in 0..USAGE_SYNC_WORKERS {
        let store = store.clone();
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let event = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                let Some(event) = event else { break };
                if let Err(err) = sync_one(&store, &event).await {
                    tracing::warn!(worker_id, error = %err, "usage sync write failed, dropping");
                }
            }
        });
    }
}

async fn sync_one(store: &Store, event: &UsageEvent) -> DbResult<()> {
    store.record_usage(&event.credential, event.day_count, event.last_used_at).await
}
