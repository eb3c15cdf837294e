//! Status surface tests: real HTTP against the assembled router, with all
//! collaborators in memory.

use std::sync::Arc;

use bf_build::registry::BuildRegistry;
use bf_build::runner::RunnerDeps;
use bf_build::shard::DurationTable;
use bf_build::snapshot::SnapshotStore;
use bf_build::sourcecache::SourceCache;
use bf_build::status::BuildStatus;
use bf_build::TrySetManager;
use bf_core::builders::BuilderCatalog;
use bf_core::config::EnvConfig;
use bf_core::types::BuilderRev;
use bf_integrations::{MemoryDashboard, MemoryObjectStore, MemoryReview, MemorySource};
use bf_pools::dev::DevPool;
use bf_pools::reverse::ReversePool;
use bf_pools::{BuildletPool, PoolSet};
use bf_sched::Scheduler;
use bf_status::server::{GomoteState, StatusState};
use bf_status::{status_router, FnChecker, GomoteAuth, HealthRegistry};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

struct TestServer {
    base: String,
    state: Arc<StatusState>,
}

async fn start_server() -> TestServer {
    let dev: Arc<dyn BuildletPool> =
        Arc::new(DevPool::new(vec!["host-linux".to_string()], 4));
    let reverse = Arc::new(ReversePool::new());
    let pools = Arc::new(PoolSet::new(vec![dev, reverse.clone()]));
    let scheduler = Scheduler::new(pools.clone(), CancellationToken::new());
    let registry = Arc::new(BuildRegistry::new());
    let store = Arc::new(MemoryObjectStore::new());
    let source = Arc::new(MemorySource::new());
    let deps = Arc::new(RunnerDeps {
        scheduler: scheduler.clone(),
        registry: registry.clone(),
        sources: Arc::new(SourceCache::new(source.clone())),
        source_client: source,
        snapshots: Arc::new(SnapshotStore::new(store.clone(), "farm-snapshots")),
        dashboard: Arc::new(MemoryDashboard::new()),
        logs: store,
        durations: Arc::new(DurationTable::new()),
        env: EnvConfig::default(),
    });
    let catalog = Arc::new(BuilderCatalog::default());
    let tries = TrySetManager::new(deps, Arc::new(MemoryReview::new()), catalog.clone());

    let mut health = HealthRegistry::new();
    health.register(FnChecker::new("allgood", "Always good", || {
        bf_status::health::CheckResult::ok(vec!["fine".to_string()])
    }));
    health.register(FnChecker::new("broken", "Always broken", || {
        bf_status::health::CheckResult::failing(vec!["nope".to_string()])
    }));

    let state = Arc::new(StatusState {
        registry,
        scheduler,
        pools,
        reverse,
        tries,
        health,
        catalog,
        gomote: Some(GomoteState::new(GomoteAuth::new(b"test-master-key"))),
        environment: "test".to_string(),
        started: Utc::now(),
        version: "0.0-test".to_string(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = status_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base: format!("http://{addr}"),
        state,
    }
}

#[tokio::test]
async fn index_page_renders() {
    let server = start_server().await;
    let body = reqwest::get(format!("{}/", server.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("farm coordinator"));
    assert!(body.contains("health"));
    assert!(body.contains("Always broken"));
}

#[tokio::test]
async fn builders_page_lists_catalog() {
    let server = start_server().await;
    let body = reqwest::get(format!("{}/builders", server.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("linux-amd64"));
    assert!(body.contains("plan9-386"));
}

#[tokio::test]
async fn health_endpoints_use_status_codes() {
    let server = start_server().await;
    let ok = reqwest::get(format!("{}/status/allgood", server.base))
        .await
        .unwrap();
    assert_eq!(ok.status().as_u16(), 200);
    assert!(ok.text().await.unwrap().starts_with("ok"));

    let bad = reqwest::get(format!("{}/status/broken", server.base))
        .await
        .unwrap();
    assert_eq!(bad.status().as_u16(), 500);

    let missing = reqwest::get(format!("{}/status/nothere", server.base))
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn temporary_logs_nostream_returns_snapshot() {
    let server = start_server().await;
    let conf = server.state.catalog.get("linux-amd64").unwrap();
    let bs = BuildStatus::new(BuilderRev::new("linux-amd64", "abc123def"), conf, false);
    bs.log.write_line("make.bash: building");
    server.state.registry.register(bs.clone());

    let url = format!(
        "{}/temporarylogs?name=linux-amd64&rev=abc123def&nostream=1",
        server.base
    );
    let body = reqwest::get(url).await.unwrap().text().await.unwrap();
    assert!(body.contains("make.bash: building"));

    let missing = reqwest::get(format!(
        "{}/temporarylogs?name=linux-amd64&rev=nope",
        server.base
    ))
    .await
    .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn temporary_logs_streams_until_done() {
    let server = start_server().await;
    let conf = server.state.catalog.get("linux-amd64").unwrap();
    let bs = BuildStatus::new(BuilderRev::new("linux-amd64", "streamrev1"), conf, false);
    server.state.registry.register(bs.clone());

    bs.log.write_line("line one");
    let fetch = tokio::spawn({
        let url = format!(
            "{}/temporarylogs?name=linux-amd64&rev=streamrev1",
            server.base
        );
        async move { reqwest::get(url).await.unwrap().text().await.unwrap() }
    });

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    bs.log.write_line("line two");
    bs.mark_done(true);

    let body = tokio::time::timeout(std::time::Duration::from_secs(2), fetch)
        .await
        .expect("stream should terminate at done")
        .unwrap();
    assert!(body.contains("line one"));
    assert!(body.contains("line two"));
    assert!(body.contains("done"));
}

#[tokio::test]
async fn try_json_sets_cors_and_404s_unknown() {
    let server = start_server().await;
    let resp = reqwest::get(format!("{}/try.json?commit=deadbeef", server.base))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 404);
    assert_eq!(
        resp.headers()
            .get("access-control-allow-origin")
            .map(|v| v.to_str().unwrap()),
        Some("*")
    );
}

#[tokio::test]
async fn post_submit_active_json_lists_only_post_submit() {
    let server = start_server().await;
    let conf = server.state.catalog.get("linux-amd64").unwrap();
    server.state.registry.register(BuildStatus::new(
        BuilderRev::new("linux-amd64", "postsubmitrev"),
        conf.clone(),
        false,
    ));
    server.state.registry.register(BuildStatus::new(
        BuilderRev::new("linux-amd64", "tryrev"),
        conf,
        true,
    ));

    let body = reqwest::get(format!("{}/status/post-submit-active.json", server.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("postsubmitrev"));
    assert!(!body.contains("tryrev"));
}

#[tokio::test]
async fn gomote_requires_auth_and_creates_sessions() {
    let server = start_server().await;
    let client = reqwest::Client::new();

    // No credentials: rejected.
    let resp = client
        .post(format!("{}/buildlet/create?type=host-linux", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    // Proper HMAC-derived key: accepted.
    let auth = GomoteAuth::new(b"test-master-key");
    let key = auth.user_key("alice");
    let resp = client
        .post(format!("{}/buildlet/create?type=host-linux", server.base))
        .basic_auth("alice", Some(&key))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body = resp.text().await.unwrap();
    assert!(body.contains("host-linux"));

    let list = client
        .get(format!("{}/buildlet/list", server.base))
        .basic_auth("alice", Some(&key))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(list.contains("alice"));
}
