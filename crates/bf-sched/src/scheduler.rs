use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bf_buildlet::Buildlet;
use bf_pools::{BuildletPool, PoolError};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::item::{sched_less, SchedItem};

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Matches ready buildlets to waiters.
///
/// All state lives under one short-held mutex: the waiting sets per host
/// type and the count of acquisitions in flight. The driver never holds the
/// lock across I/O; pool calls run in their own tasks and report back.
pub struct Scheduler {
    pool: Arc<dyn BuildletPool>,
    /// Canceled at coordinator shutdown; aborts in-flight acquisitions.
    shutdown: CancellationToken,
    state: Mutex<SchedState>,
}

#[derive(Default)]
struct SchedState {
    next_id: u64,
    waiting: HashMap<String, HashMap<u64, Waiter>>,
    creating: HashMap<String, usize>,
}

struct Waiter {
    item: SchedItem,
    sink: oneshot::Sender<Result<Arc<dyn Buildlet>, PoolError>>,
}

/// Status-page view of scheduler state.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub host_types: Vec<HostTypeSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostTypeSnapshot {
    pub host_type: String,
    pub waiting: usize,
    pub creating: usize,
    pub oldest_wait_secs: i64,
}

impl Scheduler {
    pub fn new(pool: Arc<dyn BuildletPool>, shutdown: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            pool,
            shutdown,
            state: Mutex::new(SchedState::default()),
        })
    }

    /// Request a buildlet for `item`, blocking until one is matched, the
    /// token cancels, or acquisition fails. On cancellation the item is
    /// removed from the waiting set; a handle racing in anyway is closed,
    /// never leaked.
    pub async fn get_buildlet(
        self: &Arc<Self>,
        token: &CancellationToken,
        mut item: SchedItem,
    ) -> Result<Arc<dyn Buildlet>, PoolError> {
        let (tx, mut rx) = oneshot::channel();
        let host_type = item.host_type.clone();
        let id = {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            let id = state.next_id;
            state.next_id += 1;
            item.request_time = Utc::now();
            item.id = id;
            debug!(host_type = %host_type, id, is_try = item.is_try, is_gomote = item.is_gomote,
                   "buildlet requested");
            state
                .waiting
                .entry(host_type.clone())
                .or_default()
                .insert(id, Waiter { item, sink: tx });
            id
        };
        self.poke(&host_type);

        tokio::select! {
            res = &mut rx => {
                // Sender dropped only if the scheduler itself went away.
                res.unwrap_or(Err(PoolError::Canceled))
            }
            _ = token.cancelled() => {
                self.remove_waiter(&host_type, id);
                // A handle may have been delivered between the cancel and
                // the removal; close it rather than leak it.
                if let Ok(Ok(handle)) = rx.try_recv() {
                    handle.close().await;
                }
                Err(PoolError::Canceled)
            }
        }
    }

    /// Counts for the status page.
    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.state.lock().expect("scheduler lock poisoned");
        let now = Utc::now();
        let mut host_types: Vec<HostTypeSnapshot> = state
            .waiting
            .iter()
            .filter(|(_, w)| !w.is_empty())
            .map(|(host, waiters)| HostTypeSnapshot {
                host_type: host.clone(),
                waiting: waiters.len(),
                creating: state.creating.get(host).copied().unwrap_or(0),
                oldest_wait_secs: waiters
                    .values()
                    .map(|w| now.signed_duration_since(w.item.request_time).num_seconds())
                    .max()
                    .unwrap_or(0),
            })
            .collect();
        host_types.sort_by(|a, b| a.host_type.cmp(&b.host_type));
        SchedulerSnapshot { host_types }
    }

    fn remove_waiter(&self, host_type: &str, id: u64) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        if let Some(waiters) = state.waiting.get_mut(host_type) {
            waiters.remove(&id);
            if waiters.is_empty() {
                state.waiting.remove(host_type);
            }
        }
    }

    /// Launch pool acquisitions until in-flight creations cover demand for
    /// `host_type`.
    fn poke(self: &Arc<Self>, host_type: &str) {
        let deficit = {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            let waiting = state.waiting.get(host_type).map(|w| w.len()).unwrap_or(0);
            let creating = state.creating.entry(host_type.to_string()).or_insert(0);
            let deficit = waiting.saturating_sub(*creating);
            *creating += deficit;
            deficit
        };
        for _ in 0..deficit {
            let scheduler = self.clone();
            let host_type = host_type.to_string();
            tokio::spawn(async move {
                let res = scheduler
                    .pool
                    .get(&scheduler.shutdown, &host_type)
                    .await;
                scheduler.finish(&host_type, res).await;
            });
        }
    }

    /// One acquisition finished: deliver to the best waiter, skipping any
    /// that vanished; close an undeliverable handle.
    async fn finish(
        self: &Arc<Self>,
        host_type: &str,
        mut res: Result<Arc<dyn Buildlet>, PoolError>,
    ) {
        loop {
            let delivery = {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                if let Some(creating) = state.creating.get_mut(host_type) {
                    *creating = creating.saturating_sub(1);
                }
                let best = state.waiting.get(host_type).and_then(|waiters| {
                    waiters
                        .values()
                        .map(|w| &w.item)
                        .fold(None::<&SchedItem>, |best, item| match best {
                            Some(b) if !sched_less(item, b) => Some(b),
                            _ => Some(item),
                        })
                        .map(|item| item.id)
                });
                match best {
                    Some(id) => {
                        let waiters = state.waiting.get_mut(host_type).expect("checked above");
                        let waiter = waiters.remove(&id).expect("checked above");
                        if waiters.is_empty() {
                            state.waiting.remove(host_type);
                        }
                        Some(waiter)
                    }
                    None => None,
                }
            };

            match delivery {
                Some(waiter) => match waiter.sink.send(res) {
                    Ok(()) => return,
                    Err(undelivered) => {
                        // Waiter canceled between selection and send; offer
                        // the result to the next one. Re-count this delivery
                        // attempt as an in-flight creation so the deficit
                        // math stays consistent around the loop.
                        {
                            let mut state =
                                self.state.lock().expect("scheduler lock poisoned");
                            *state.creating.entry(host_type.to_string()).or_insert(0) += 1;
                        }
                        res = undelivered;
                    }
                },
                None => {
                    if let Ok(handle) = res {
                        warn!(host_type, buildlet = %handle.name(),
                              "no waiter for acquired buildlet, closing");
                        handle.close().await;
                    }
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bf_buildlet::FakeBuildlet;
    use bf_pools::PoolStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Pool that hands out buildlets only when the test releases them.
    struct GatedPool {
        gate: tokio::sync::Semaphore,
        created: AtomicUsize,
    }

    impl GatedPool {
        fn new() -> Self {
            Self {
                gate: tokio::sync::Semaphore::new(0),
                created: AtomicUsize::new(0),
            }
        }

        fn release(&self, n: usize) {
            self.gate.add_permits(n);
        }
    }

    #[async_trait]
    impl BuildletPool for GatedPool {
        fn serves(&self, _host_type: &str) -> bool {
            true
        }

        async fn get(
            &self,
            token: &CancellationToken,
            host_type: &str,
        ) -> Result<Arc<dyn Buildlet>, PoolError> {
            tokio::select! {
                _ = token.cancelled() => Err(PoolError::Canceled),
                permit = self.gate.acquire() => {
                    permit.expect("semaphore closed").forget();
                    let n = self.created.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(FakeBuildlet::new(format!("b{n}"), host_type)))
                }
            }
        }

        fn has_capacity(&self, _host_type: &str) -> bool {
            true
        }

        fn status(&self) -> PoolStatus {
            PoolStatus {
                name: "gated".to_string(),
                detail: vec![],
            }
        }
    }

    fn scheduler_with(pool: Arc<GatedPool>) -> Arc<Scheduler> {
        Scheduler::new(pool, CancellationToken::new())
    }

    #[tokio::test]
    async fn simple_get_matches_buildlet() {
        let pool = Arc::new(GatedPool::new());
        let sched = scheduler_with(pool.clone());
        pool.release(1);

        let token = CancellationToken::new();
        let b = sched
            .get_buildlet(&token, SchedItem::new("host-linux"))
            .await
            .unwrap();
        assert_eq!(b.host_type(), "host-linux");
    }

    #[tokio::test]
    async fn higher_priority_waiter_is_served_first() {
        let pool = Arc::new(GatedPool::new());
        let sched = scheduler_with(pool.clone());
        let token = CancellationToken::new();

        // Post-submit waiter enqueues first...
        let post = {
            let sched = sched.clone();
            let token = token.clone();
            tokio::spawn(async move { sched.get_buildlet(&token, SchedItem::new("host-linux")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // ...then a try waiter arrives.
        let try_handle = {
            let sched = sched.clone();
            let token = token.clone();
            let mut item = SchedItem::new("host-linux");
            item.is_try = true;
            tokio::spawn(async move { sched.get_buildlet(&token, item).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One buildlet becomes ready: the try waiter must win it.
        pool.release(1);
        let b = tokio::time::timeout(Duration::from_secs(1), try_handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(b.host_type(), "host-linux");

        // The post-submit waiter gets the next one.
        pool.release(1);
        let b = tokio::time::timeout(Duration::from_secs(1), post)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(b.host_type(), "host-linux");
    }

    #[tokio::test]
    async fn canceled_waiter_is_removed() {
        let pool = Arc::new(GatedPool::new());
        let sched = scheduler_with(pool.clone());
        let token = CancellationToken::new();

        let waiter = {
            let sched = sched.clone();
            let token = token.clone();
            tokio::spawn(async move { sched.get_buildlet(&token, SchedItem::new("host-linux")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sched.snapshot().host_types.len(), 1);

        token.cancel();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(PoolError::Canceled)));
        assert!(sched.snapshot().host_types.is_empty());
    }

    #[tokio::test]
    async fn unmatched_handle_goes_to_next_waiter_after_cancel_race() {
        let pool = Arc::new(GatedPool::new());
        let sched = scheduler_with(pool.clone());

        let token_a = CancellationToken::new();
        let a = {
            let sched = sched.clone();
            let token = token_a.clone();
            tokio::spawn(async move { sched.get_buildlet(&token, SchedItem::new("host-linux")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let token_b = CancellationToken::new();
        let b = {
            let sched = sched.clone();
            let token = token_b.clone();
            tokio::spawn(async move { sched.get_buildlet(&token, SchedItem::new("host-linux")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Cancel the older (preferred) waiter, then satisfy the demand.
        token_a.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), a).await.unwrap();
        pool.release(2);

        let res = tokio::time::timeout(Duration::from_secs(1), b)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn pool_error_propagates_to_waiter() {
        struct FailPool;

        #[async_trait]
        impl BuildletPool for FailPool {
            fn serves(&self, _h: &str) -> bool {
                true
            }
            async fn get(
                &self,
                _token: &CancellationToken,
                host_type: &str,
            ) -> Result<Arc<dyn Buildlet>, PoolError> {
                Err(PoolError::QuotaExhausted(host_type.to_string()))
            }
            fn has_capacity(&self, _h: &str) -> bool {
                false
            }
            fn status(&self) -> PoolStatus {
                PoolStatus {
                    name: "fail".to_string(),
                    detail: vec![],
                }
            }
        }

        let sched = Scheduler::new(Arc::new(FailPool), CancellationToken::new());
        let token = CancellationToken::new();
        let res = sched
            .get_buildlet(&token, SchedItem::new("host-linux"))
            .await;
        assert!(matches!(res, Err(PoolError::QuotaExhausted(_))));
    }

    #[tokio::test]
    async fn snapshot_reports_waiting_and_creating() {
        let pool = Arc::new(GatedPool::new());
        let sched = scheduler_with(pool.clone());
        let token = CancellationToken::new();

        let _waiter = {
            let sched = sched.clone();
            let token = token.clone();
            tokio::spawn(async move { sched.get_buildlet(&token, SchedItem::new("host-linux")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snap = sched.snapshot();
        assert_eq!(snap.host_types.len(), 1);
        assert_eq!(snap.host_types[0].waiting, 1);
        assert_eq!(snap.host_types[0].creating, 1);
        token.cancel();
    }
}
