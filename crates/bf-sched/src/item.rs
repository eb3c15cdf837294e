use bf_core::types::BuilderRev;
use chrono::{DateTime, Utc};

/// One pending buildlet request.
///
/// `request_time` and `id` are stamped by the scheduler at enqueue; the
/// rest describes the work so the priority order can rank it.
#[derive(Debug, Clone)]
pub struct SchedItem {
    pub host_type: String,
    /// The build this request serves, when it serves one (gomote sessions
    /// have none).
    pub builder_rev: Option<BuilderRev>,
    /// Interactive user session: preempts everything.
    pub is_gomote: bool,
    /// Pre-submit try-bot work: preempts post-submit.
    pub is_try: bool,
    /// Secondary buildlet for test sharding.
    pub is_helper: bool,
    /// User the request is on behalf of, for the status page.
    pub requester: Option<String>,
    /// Commit time of post-submit work; newest is served first.
    pub commit_time: Option<DateTime<Utc>>,
    pub branch: Option<String>,

    pub(crate) request_time: DateTime<Utc>,
    pub(crate) id: u64,
}

impl SchedItem {
    pub fn new(host_type: impl Into<String>) -> Self {
        Self {
            host_type: host_type.into(),
            builder_rev: None,
            is_gomote: false,
            is_try: false,
            is_helper: false,
            requester: None,
            commit_time: None,
            branch: None,
            request_time: Utc::now(),
            id: 0,
        }
    }

    pub fn for_build(rev: BuilderRev, host_type: impl Into<String>, is_try: bool) -> Self {
        let mut item = Self::new(host_type);
        item.builder_rev = Some(rev);
        item.is_try = is_try;
        item
    }

    pub fn gomote(host_type: impl Into<String>, requester: impl Into<String>) -> Self {
        let mut item = Self::new(host_type);
        item.is_gomote = true;
        item.requester = Some(requester.into());
        item
    }

    pub fn request_time(&self) -> DateTime<Utc> {
        self.request_time
    }
}

/// Strict total priority order: `true` when `a` must be served before `b`.
///
/// Pairwise rules, evaluated in order:
/// 1. gomote beats everything else;
/// 2. try beats post-submit;
/// 3. among gomote or try items, earlier request wins (FIFO fairness);
/// 4. among post-submit items, later commit wins (LIFO by commit time),
///    then later request time.
///
/// Every comparison falls through to the enqueue id, so for any distinct
/// `a`, `b` exactly one of `sched_less(a, b)` and `sched_less(b, a)` holds,
/// even with equal timestamps.
pub fn sched_less(a: &SchedItem, b: &SchedItem) -> bool {
    if a.is_gomote != b.is_gomote {
        return a.is_gomote;
    }
    if !a.is_gomote && a.is_try != b.is_try {
        return a.is_try;
    }
    if a.is_gomote || a.is_try {
        // FIFO: earlier request first.
        return (a.request_time, a.id) < (b.request_time, b.id);
    }
    // Post-submit: LIFO by commit time, then by request time.
    if a.commit_time != b.commit_time {
        return a.commit_time > b.commit_time;
    }
    if a.request_time != b.request_time {
        return a.request_time > b.request_time;
    }
    a.id > b.id
}
