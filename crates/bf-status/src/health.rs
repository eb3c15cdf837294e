use std::sync::Arc;

/// Result of one health probe.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub ok: bool,
    pub lines: Vec<String>,
}

impl CheckResult {
    pub fn ok(lines: Vec<String>) -> Self {
        Self { ok: true, lines }
    }

    pub fn failing(lines: Vec<String>) -> Self {
        Self { ok: false, lines }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.ok { "ok\n" } else { "FAILING\n" });
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

/// A pluggable health probe surfaced on the status page and at
/// `/status/<id>`.
pub trait HealthChecker: Send + Sync {
    fn id(&self) -> &str;
    fn title(&self) -> &str;
    fn check(&self) -> CheckResult;
}

/// Checker built from a closure, for probes that are a single expression at
/// wiring time.
pub struct FnChecker {
    id: String,
    title: String,
    f: Box<dyn Fn() -> CheckResult + Send + Sync>,
}

impl FnChecker {
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        f: impl Fn() -> CheckResult + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            title: title.into(),
            f: Box::new(f),
        })
    }
}

impl HealthChecker for FnChecker {
    fn id(&self) -> &str {
        &self.id
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn check(&self) -> CheckResult {
        (self.f)()
    }
}

/// The set of registered checkers.
#[derive(Default)]
pub struct HealthRegistry {
    checkers: Vec<Arc<dyn HealthChecker>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    pub fn find(&self, id: &str) -> Option<&Arc<dyn HealthChecker>> {
        self.checkers.iter().find(|c| c.id() == id)
    }

    pub fn all(&self) -> &[Arc<dyn HealthChecker>] {
        &self.checkers
    }
}
