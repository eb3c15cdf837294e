//! Whole-coordinator integration: dev-mode wiring, the discovery loops,
//! and the status surface, all against in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use bf_core::config::{EnvConfig, Flags};
use bf_daemon::{Collaborators, Coordinator};
use bf_integrations::{
    DashboardStatus, MemoryDashboard, MemoryObjectStore, MemoryReview, MemorySource, RevisionSlot,
    TryWorkItem,
};
use clap::Parser;

struct Fixture {
    coordinator: Arc<Coordinator>,
    dashboard: Arc<MemoryDashboard>,
    review: Arc<MemoryReview>,
    source: Arc<MemorySource>,
    base: String,
}

async fn start(extra_args: &[&str]) -> Fixture {
    let mut args = vec!["buildfarmd", "--mode", "dev"];
    args.extend(extra_args);
    let flags = Flags::parse_from(args);

    let dashboard = Arc::new(MemoryDashboard::new());
    let review = Arc::new(MemoryReview::new());
    let source = Arc::new(MemorySource::new());
    let storage = Arc::new(MemoryObjectStore::new());
    let collab = Collaborators {
        dashboard: dashboard.clone(),
        review: review.clone(),
        storage,
        source: source.clone(),
        vm_launcher: None,
        container_launcher: None,
    };

    let env = EnvConfig::default();
    let coordinator =
        Arc::new(Coordinator::new(&flags, env, collab.clone()).expect("coordinator builds"));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    {
        let coordinator = coordinator.clone();
        let collab = collab.clone();
        tokio::spawn(async move {
            let _ = coordinator.run(listener, &collab).await;
        });
    }
    // Let the server come up.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Fixture {
        coordinator,
        dashboard,
        review,
        source,
        base,
    }
}

async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn post_submit_work_flows_to_dashboard_result() {
    let f = start(&[]).await;
    f.source.add_tarball("go", "integration-rev-1", b"src".to_vec());
    f.dashboard.set_status(DashboardStatus {
        builders: vec!["linux-amd64".to_string()],
        revisions: vec![RevisionSlot {
            repo: "go".to_string(),
            revision: "integration-rev-1".to_string(),
            branch: "master".to_string(),
            results: vec!["".to_string()],
            ..Default::default()
        }],
    });

    let dashboard = f.dashboard.clone();
    eventually(
        move || dashboard.recorded().iter().any(|r| r.rev == "integration-rev-1"),
        "post-submit result to be recorded",
    )
    .await;

    let recorded = f.dashboard.recorded();
    let rec = recorded
        .iter()
        .find(|r| r.rev == "integration-rev-1")
        .unwrap();
    assert!(rec.ok);
    assert_eq!(rec.builder, "linux-amd64");

    f.coordinator.shutdown.cancel();
}

#[tokio::test]
async fn try_work_produces_a_verdict_comment() {
    let f = start(&[]).await;
    f.source.add_tarball("go", "try-commit-1", b"src".to_vec());
    f.review.set_work(vec![TryWorkItem {
        project: "go".to_string(),
        branch: "master".to_string(),
        change_id: "I-integration".to_string(),
        commit: "try-commit-1".to_string(),
        slow_bot_terms: vec![],
        extra_repos: vec![],
    }]);

    let review = f.review.clone();
    eventually(
        move || {
            review
                .comments()
                .iter()
                .any(|(_, msg, _)| msg.contains("TryBots are happy") || msg.contains("failed"))
        },
        "try verdict comment",
    )
    .await;

    let comments = f.review.comments();
    assert!(comments[0].1.contains("TryBots beginning"));
    f.coordinator.shutdown.cancel();
}

#[tokio::test]
async fn status_surface_serves_while_loops_run() {
    let f = start(&[]).await;
    let body = reqwest::get(format!("{}/", f.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("farm coordinator"));

    let builders = reqwest::get(format!("{}/builders", f.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(builders.contains("linux-amd64"));

    let reverse = reqwest::get(format!("{}/status/reverse.json", f.base))
        .await
        .unwrap();
    assert_eq!(reverse.status().as_u16(), 200);

    f.coordinator.shutdown.cancel();
}

#[test]
fn prod_mode_without_master_key_fails_init() {
    let flags = Flags::parse_from(["buildfarmd", "--mode", "prod"]);
    let env = EnvConfig::default();
    let collab = Collaborators {
        dashboard: Arc::new(MemoryDashboard::new()),
        review: Arc::new(MemoryReview::new()),
        storage: Arc::new(MemoryObjectStore::new()),
        source: Arc::new(MemorySource::new()),
        vm_launcher: None,
        container_launcher: None,
    };
    assert!(Coordinator::new(&flags, env, collab).is_err());
}
