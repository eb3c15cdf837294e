use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::client::{Buildlet, CommError, DirEntry, ExecOpts, ExecOutcome};

/// Programmed response for one exec against a [`FakeBuildlet`].
#[derive(Debug, Clone)]
pub struct ScriptedExec {
    /// Bytes streamed to the output sink before the outcome is returned.
    pub output: Vec<u8>,
    pub outcome: Result<ExecOutcome, CommError>,
}

impl ScriptedExec {
    pub fn ok() -> Self {
        Self {
            output: Vec::new(),
            outcome: Ok(ExecOutcome::Ok),
        }
    }

    pub fn ok_with_output(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
            outcome: Ok(ExecOutcome::Ok),
        }
    }

    pub fn remote_failure(detail: impl Into<String>) -> Self {
        Self {
            output: Vec::new(),
            outcome: Ok(ExecOutcome::Remote(detail.into())),
        }
    }

    pub fn comm_failure(err: CommError) -> Self {
        Self {
            output: Vec::new(),
            outcome: Err(err),
        }
    }
}

type ExecHandler = dyn Fn(&str, &ExecOpts) -> ScriptedExec + Send + Sync;

/// In-memory buildlet used by dev mode and by tests.
///
/// Execs are answered by a programmable handler keyed on the command path
/// (longest prefix wins), falling back to a catch-all handler. Tar puts are
/// recorded so tests can assert on staging behavior.
pub struct FakeBuildlet {
    name: String,
    host_type: String,
    broken: AtomicBool,
    closed: AtomicBool,
    scripts: Mutex<HashMap<String, ScriptedExec>>,
    fallback: Mutex<Option<Arc<ExecHandler>>>,
    /// (dest, byte length) of every put_tar, plus URLs of put_tar_from_url.
    puts: Mutex<Vec<(String, usize)>>,
    put_urls: Mutex<Vec<(String, String)>>,
    execs: Mutex<Vec<String>>,
}

impl FakeBuildlet {
    pub fn new(name: impl Into<String>, host_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host_type: host_type.into(),
            broken: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            scripts: Mutex::new(HashMap::new()),
            fallback: Mutex::new(None),
            puts: Mutex::new(Vec::new()),
            put_urls: Mutex::new(Vec::new()),
            execs: Mutex::new(Vec::new()),
        }
    }

    /// Program the response for commands whose path starts with `cmd_prefix`.
    pub fn script(&self, cmd_prefix: impl Into<String>, resp: ScriptedExec) {
        self.scripts
            .lock()
            .unwrap()
            .insert(cmd_prefix.into(), resp);
    }

    /// Catch-all handler for commands with no scripted prefix.
    pub fn on_exec<F>(&self, f: F)
    where
        F: Fn(&str, &ExecOpts) -> ScriptedExec + Send + Sync + 'static,
    {
        *self.fallback.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Destinations and sizes of recorded put_tar calls.
    pub fn recorded_puts(&self) -> Vec<(String, usize)> {
        self.puts.lock().unwrap().clone()
    }

    /// (url, dest) pairs of recorded put_tar_from_url calls.
    pub fn recorded_put_urls(&self) -> Vec<(String, String)> {
        self.put_urls.lock().unwrap().clone()
    }

    /// Command paths of every exec, in order.
    pub fn recorded_execs(&self) -> Vec<String> {
        self.execs.lock().unwrap().clone()
    }

    fn respond(&self, cmd: &str, opts: &ExecOpts) -> ScriptedExec {
        let scripts = self.scripts.lock().unwrap();
        let mut best: Option<(&String, &ScriptedExec)> = None;
        for (prefix, resp) in scripts.iter() {
            if cmd.starts_with(prefix.as_str())
                && best.map_or(true, |(b, _)| prefix.len() > b.len())
            {
                best = Some((prefix, resp));
            }
        }
        if let Some((_, resp)) = best {
            return resp.clone();
        }
        drop(scripts);
        if let Some(f) = self.fallback.lock().unwrap().clone() {
            return f(cmd, opts);
        }
        ScriptedExec::ok()
    }

    fn check_usable(&self) -> Result<(), CommError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommError::Connection("buildlet closed".to_string()));
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(CommError::Broken);
        }
        Ok(())
    }
}

#[async_trait]
impl Buildlet for FakeBuildlet {
    fn name(&self) -> &str {
        &self.name
    }

    fn host_type(&self) -> &str {
        &self.host_type
    }

    fn ip_port(&self) -> String {
        "127.0.0.1:0".to_string()
    }

    async fn work_dir(&self, _token: &CancellationToken) -> Result<String, CommError> {
        self.check_usable()?;
        Ok("/workdir".to_string())
    }

    async fn put_tar(
        &self,
        token: &CancellationToken,
        tar_gz: Vec<u8>,
        dest: &str,
    ) -> Result<(), CommError> {
        self.check_usable()?;
        if token.is_cancelled() {
            return Err(CommError::Canceled);
        }
        self.puts.lock().unwrap().push((dest.to_string(), tar_gz.len()));
        Ok(())
    }

    async fn put_tar_from_url(
        &self,
        token: &CancellationToken,
        url: &str,
        dest: &str,
    ) -> Result<(), CommError> {
        self.check_usable()?;
        if token.is_cancelled() {
            return Err(CommError::Canceled);
        }
        self.put_urls
            .lock()
            .unwrap()
            .push((url.to_string(), dest.to_string()));
        Ok(())
    }

    async fn get_tar(&self, _token: &CancellationToken, _dir: &str) -> Result<Vec<u8>, CommError> {
        self.check_usable()?;
        Ok(Vec::new())
    }

    async fn exec(
        &self,
        token: &CancellationToken,
        cmd: &str,
        opts: ExecOpts,
        output: flume::Sender<Vec<u8>>,
    ) -> Result<ExecOutcome, CommError> {
        self.check_usable()?;
        if token.is_cancelled() {
            return Err(CommError::Canceled);
        }
        self.execs.lock().unwrap().push(cmd.to_string());
        let resp = self.respond(cmd, &opts);
        if !resp.output.is_empty() {
            let _ = output.send_async(resp.output.clone()).await;
        }
        resp.outcome
    }

    async fn list_dir(
        &self,
        _token: &CancellationToken,
        _dir: &str,
    ) -> Result<Vec<DirEntry>, CommError> {
        self.check_usable()?;
        Ok(Vec::new())
    }

    async fn remove_all(
        &self,
        _token: &CancellationToken,
        _paths: &[String],
    ) -> Result<(), CommError> {
        self.check_usable()?;
        Ok(())
    }

    fn mark_broken(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn is_broken(&self) -> bool {
        self.broken.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_exec_longest_prefix_wins() {
        let b = FakeBuildlet::new("fake1", "host-linux");
        b.script("go/bin", ScriptedExec::remote_failure("generic"));
        b.script(
            "go/bin/go",
            ScriptedExec::ok_with_output(b"specific".to_vec()),
        );

        let (tx, rx) = flume::unbounded();
        let token = CancellationToken::new();
        let out = b
            .exec(&token, "go/bin/go", ExecOpts::default(), tx)
            .await
            .unwrap();
        assert_eq!(out, ExecOutcome::Ok);
        assert_eq!(rx.recv().unwrap(), b"specific");
    }

    #[tokio::test]
    async fn default_exec_succeeds_silently() {
        let b = FakeBuildlet::new("fake1", "host-linux");
        let (tx, _rx) = flume::unbounded();
        let token = CancellationToken::new();
        let out = b
            .exec(&token, "anything", ExecOpts::default(), tx)
            .await
            .unwrap();
        assert!(out.is_ok());
    }

    #[tokio::test]
    async fn broken_buildlet_rejects_ops() {
        let b = FakeBuildlet::new("fake1", "host-linux");
        b.mark_broken();
        let token = CancellationToken::new();
        assert!(matches!(
            b.work_dir(&token).await,
            Err(CommError::Broken)
        ));
    }

    #[tokio::test]
    async fn canceled_token_short_circuits() {
        let b = FakeBuildlet::new("fake1", "host-linux");
        let token = CancellationToken::new();
        token.cancel();
        let (tx, _rx) = flume::unbounded();
        assert!(matches!(
            b.exec(&token, "cmd", ExecOpts::default(), tx).await,
            Err(CommError::Canceled)
        ));
    }

    #[tokio::test]
    async fn put_tar_records_dest_and_size() {
        let b = FakeBuildlet::new("fake1", "host-linux");
        let token = CancellationToken::new();
        b.put_tar(&token, vec![0u8; 16], "go").await.unwrap();
        assert_eq!(b.recorded_puts(), vec![("go".to_string(), 16)]);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let b = FakeBuildlet::new("fake1", "host-linux");
        b.close().await;
        b.close().await;
        assert!(b.is_closed());
    }
}
