//! HTTP client tests against an in-process axum server, so the wire shapes
//! the coordinator depends on are pinned without any network access.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use bf_integrations::{
    BuildRecord, DashboardClient, DashboardStatus, HttpDashboardClient, HttpReviewClient,
    ReviewClient, RevisionSlot, TryWorkItem,
};

#[derive(Default, Clone)]
struct Recorded {
    results: Arc<Mutex<Vec<BuildRecord>>>,
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn dashboard_fetch_and_record() {
    let recorded = Recorded::default();
    let app = Router::new()
        .route(
            "/status.json",
            get(|| async {
                Json(DashboardStatus {
                    builders: vec!["linux-amd64".to_string()],
                    revisions: vec![RevisionSlot {
                        repo: "go".to_string(),
                        revision: "abc123".to_string(),
                        branch: "master".to_string(),
                        results: vec!["".to_string()],
                        ..Default::default()
                    }],
                })
            }),
        )
        .route(
            "/result",
            post(
                |State(rec): State<Recorded>, Json(record): Json<BuildRecord>| async move {
                    rec.results.lock().unwrap().push(record);
                    "ok"
                },
            ),
        )
        .with_state(recorded.clone());

    let base = serve(app).await;
    let client = HttpDashboardClient::new(&base);

    let status = client.fetch_status().await.unwrap();
    assert_eq!(status.builders, vec!["linux-amd64"]);
    assert!(status.revisions[0].needs_build(0));

    client
        .record_result(&BuildRecord {
            builder: "linux-amd64".to_string(),
            repo: "go".to_string(),
            rev: "abc123".to_string(),
            go_rev: None,
            ok: true,
            log_url: Some("https://example.org/log".to_string()),
            run_time_secs: 100,
        })
        .await
        .unwrap();

    let results = recorded.results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].rev, "abc123");
}

#[tokio::test]
async fn review_pending_work_decodes() {
    let app = Router::new().route(
        "/try-work",
        get(|| async {
            Json(vec![TryWorkItem {
                project: "go".to_string(),
                branch: "master".to_string(),
                change_id: "I123".to_string(),
                commit: "def456".to_string(),
                slow_bot_terms: vec!["js".to_string()],
                extra_repos: vec![],
            }])
        }),
    );

    let base = serve(app).await;
    let client = HttpReviewClient::new(&base);
    let work = client.pending_try_work().await.unwrap();
    assert_eq!(work.len(), 1);
    assert_eq!(work[0].slow_bot_terms, vec!["js"]);
    assert_eq!(work[0].key().change_id, "I123");
}

#[tokio::test]
async fn dashboard_error_status_is_surfaced() {
    let app = Router::new().route(
        "/status.json",
        get(|| async { (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let base = serve(app).await;
    let client = HttpDashboardClient::new(&base);
    assert!(client.fetch_status().await.is_err());
}
