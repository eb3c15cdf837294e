use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

/// A chunk of `go_test:*` items closes once its cumulative estimate would
/// pass this.
pub const CHUNK_THRESHOLD: Duration = Duration::from_secs(10);

/// Estimate for tests absent from the statistics table.
pub const DEFAULT_TEST_DURATION: Duration = Duration::from_secs(3);

/// A test item may be attempted this many times before it permanently
/// fails on communication errors.
pub const MAX_ITEM_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// DurationTable
// ---------------------------------------------------------------------------

/// Estimated test durations keyed by `(builder, test)`, refreshed
/// periodically from historical statistics.
#[derive(Default)]
pub struct DurationTable {
    table: Mutex<HashMap<(String, String), Duration>>,
}

impl DurationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn estimate(&self, builder: &str, test: &str) -> Duration {
        self.table
            .lock()
            .expect("duration table lock poisoned")
            .get(&(builder.to_string(), test.to_string()))
            .copied()
            .unwrap_or(DEFAULT_TEST_DURATION)
    }

    /// Replace the whole table with a fresh statistics pull.
    pub fn update(&self, entries: HashMap<(String, String), Duration>) {
        *self.table.lock().expect("duration table lock poisoned") = entries;
    }

    pub fn record(&self, builder: &str, test: &str, dur: Duration) {
        self.table
            .lock()
            .expect("duration table lock poisoned")
            .insert((builder.to_string(), test.to_string()), dur);
    }
}

// ---------------------------------------------------------------------------
// TestItem
// ---------------------------------------------------------------------------

/// One dist test in a sharded plan.
///
/// The take token has capacity one: `try_take` transfers exclusive
/// ownership of the mutable fields to the taker. `untake` returns the token
/// for a retry after a communication failure. The done signal fires exactly
/// once; after it fires the result fields never change again.
pub struct TestItem {
    pub name: String,
    pub estimate: Duration,
    state: Mutex<ItemState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

#[derive(Default)]
struct ItemState {
    taken: bool,
    done: bool,
    attempts: u32,
    output: Vec<u8>,
    remote_err: Option<String>,
    actual_duration: Option<Duration>,
    shard_worker: Option<String>,
    group_size: usize,
}

/// Result fields populated when an item completes.
#[derive(Debug, Clone)]
pub struct ItemResult {
    pub output: Vec<u8>,
    pub remote_err: Option<String>,
    pub actual_duration: Option<Duration>,
    pub shard_worker: Option<String>,
    pub group_size: usize,
}

impl TestItem {
    pub fn new(name: impl Into<String>, estimate: Duration) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(false);
        Arc::new(Self {
            name: name.into(),
            estimate,
            state: Mutex::new(ItemState::default()),
            done_tx,
            done_rx,
        })
    }

    /// Claim the item. `true` transfers exclusive ownership to the caller
    /// and counts an attempt.
    pub fn try_take(&self) -> bool {
        let mut state = self.state.lock().expect("test item lock poisoned");
        if state.taken || state.done {
            return false;
        }
        state.taken = true;
        state.attempts += 1;
        true
    }

    /// Return the token after a communication failure so another worker can
    /// retry the item.
    pub fn untake(&self) {
        let mut state = self.state.lock().expect("test item lock poisoned");
        state.taken = false;
    }

    /// Whether another attempt is allowed.
    pub fn retryable(&self) -> bool {
        let state = self.state.lock().expect("test item lock poisoned");
        state.attempts < MAX_ITEM_ATTEMPTS
    }

    pub fn attempts(&self) -> u32 {
        self.state.lock().expect("test item lock poisoned").attempts
    }

    /// Complete the item, firing the done signal. Later calls are ignored:
    /// the signal fires exactly once and results are immutable after it.
    pub fn mark_done(&self, result: ItemResult) {
        {
            let mut state = self.state.lock().expect("test item lock poisoned");
            if state.done {
                return;
            }
            state.done = true;
            state.output = result.output;
            state.remote_err = result.remote_err;
            state.actual_duration = result.actual_duration;
            state.shard_worker = result.shard_worker;
            state.group_size = result.group_size;
        }
        let _ = self.done_tx.send(true);
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().expect("test item lock poisoned").done
    }

    /// Wait until the done signal fires.
    pub async fn done(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn result(&self) -> Option<ItemResult> {
        let state = self.state.lock().expect("test item lock poisoned");
        if !state.done {
            return None;
        }
        Some(ItemResult {
            output: state.output.clone(),
            remote_err: state.remote_err.clone(),
            actual_duration: state.actual_duration,
            shard_worker: state.shard_worker.clone(),
            group_size: state.group_size,
        })
    }
}

// ---------------------------------------------------------------------------
// TestSet
// ---------------------------------------------------------------------------

/// The sharded plan for one build: every dist test once, with two chunking
/// views over the same items.
///
/// `in_order` keeps the readable streaming order the primary buildlet
/// consumes: `go_test:*` tests grouped into small chunks, then each
/// remaining test as its own chunk. `biggest_first` is every item as a
/// singleton chunk, largest estimate first, for helpers to grab.
pub struct TestSet {
    pub items: Vec<Arc<TestItem>>,
    pub in_order: Vec<Vec<Arc<TestItem>>>,
    pub biggest_first: Vec<Vec<Arc<TestItem>>>,
}

impl TestSet {
    pub fn plan(builder: &str, test_names: &[String], durations: &DurationTable) -> Self {
        let items: Vec<Arc<TestItem>> = test_names
            .iter()
            .map(|name| TestItem::new(name.clone(), durations.estimate(builder, name)))
            .collect();

        let mut go_tests: Vec<Arc<TestItem>> = items
            .iter()
            .filter(|i| i.name.starts_with("go_test:"))
            .cloned()
            .collect();
        // src/* packages sort before cmd/* so standard-library output
        // streams first.
        go_tests.sort_by(|a, b| {
            let key = |i: &Arc<TestItem>| {
                let pkg = i.name.trim_start_matches("go_test:");
                (pkg.starts_with("cmd/"), pkg.to_string())
            };
            key(a).cmp(&key(b))
        });

        let mut in_order: Vec<Vec<Arc<TestItem>>> = Vec::new();
        let mut chunk: Vec<Arc<TestItem>> = Vec::new();
        let mut chunk_dur = Duration::ZERO;
        for item in &go_tests {
            if !chunk.is_empty() && chunk_dur + item.estimate > CHUNK_THRESHOLD {
                in_order.push(std::mem::take(&mut chunk));
                chunk_dur = Duration::ZERO;
            }
            chunk_dur += item.estimate;
            chunk.push(item.clone());
        }
        if !chunk.is_empty() {
            in_order.push(chunk);
        }
        for item in items.iter().filter(|i| !i.name.starts_with("go_test:")) {
            in_order.push(vec![item.clone()]);
        }

        let mut biggest: Vec<Arc<TestItem>> = items.clone();
        biggest.sort_by(|a, b| b.estimate.cmp(&a.estimate).then(a.name.cmp(&b.name)));
        let biggest_first = biggest.into_iter().map(|i| vec![i]).collect();

        Self {
            items,
            in_order,
            biggest_first,
        }
    }

    /// Atomically claim every item of `chunk`; on partial failure the taken
    /// ones are returned and the claim fails.
    pub fn try_take_chunk(chunk: &[Arc<TestItem>]) -> bool {
        let mut taken = Vec::new();
        for item in chunk {
            if item.try_take() {
                taken.push(item.clone());
            } else {
                for t in taken {
                    // Roll back without burning the attempt budget of items
                    // we never ran.
                    t.rollback_take();
                }
                return false;
            }
        }
        true
    }

    /// Items not yet completed.
    pub fn remaining(&self) -> usize {
        self.items.iter().filter(|i| !i.is_done()).count()
    }

    /// Fail every not-yet-done item; used when the build is torn down so
    /// waiters unblock.
    pub fn cancel_remaining(&self, reason: &str) {
        for item in &self.items {
            if item.try_take() || !item.is_done() {
                item.mark_done(ItemResult {
                    output: Vec::new(),
                    remote_err: Some(reason.to_string()),
                    actual_duration: None,
                    shard_worker: None,
                    group_size: 1,
                });
            }
        }
    }
}

impl TestItem {
    /// Undo a `try_take` that never ran, restoring the attempt count.
    fn rollback_take(&self) {
        let mut state = self.state.lock().expect("test item lock poisoned");
        state.taken = false;
        state.attempts = state.attempts.saturating_sub(1);
    }
}
