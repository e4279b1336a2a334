//! End-to-end scenarios driven through the HTTP router with a shell
//! one-liner standing in for the builder binary.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use tokio::sync::watch;
use tower::ServiceExt;

use playpen::{
    config::CoordinatorConfig,
    coordinator::Coordinator,
    event::Event,
    http::{AppState, routes},
    metrics::MetricsRegistry,
    storage::BundleStore,
};

const TWO_EVENTS: &str = concat!(
    r#"printf '{"File":"","Message":"PROGRAM START","Stream":"stdout","Timestamp":1}\n'; "#,
    r#"printf '{"File":"","Message":"PROGRAM END","Stream":"stdout","Timestamp":2}\n'"#
);

struct TestServer {
    router: Router,
    coordinator: Arc<Coordinator>,
    metrics: Arc<MetricsRegistry>,
    lameduck: watch::Sender<bool>,
}

fn test_config(builder_script: &str) -> CoordinatorConfig {
    CoordinatorConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        parallelism: 2,
        job_queue_cap: 8,
        max_size: 1 << 16,
        max_time: Duration::from_secs(10),
        total_memory_mb: 256,
        use_sandbox: false,
        sandbox_image: "playground".to_string(),
        builder_command: vec![
            "sh".to_string(),
            "-c".to_string(),
            builder_script.to_string(),
        ],
        listen_timeout: Duration::ZERO,
        origin: "*".to_string(),
        database_path: None,
        cache_capacity: 16,
        log_level: "info".to_string(),
    }
}

fn serve(config: CoordinatorConfig, store: Option<Arc<BundleStore>>) -> TestServer {
    let metrics = Arc::new(MetricsRegistry::new());
    let coordinator = Arc::new(Coordinator::new(config, metrics.clone()).unwrap());
    let (lameduck, lameduck_rx) = watch::channel(false);
    let router = routes(AppState {
        coordinator: coordinator.clone(),
        store,
        metrics: metrics.clone(),
        lameduck: lameduck_rx,
    });
    TestServer {
        router,
        coordinator,
        metrics,
        lameduck,
    }
}

async fn post_compile(router: &Router, body: &[u8], debug: bool) -> (StatusCode, Vec<Event>) {
    let uri = if debug { "/compile?debug=1" } else { "/compile" };
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let events = String::from_utf8_lossy(&bytes)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<Event>(line).unwrap())
        .collect();
    (status, events)
}

fn messages(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.message.clone()).collect()
}

#[tokio::test]
async fn happy_path_streams_events_and_caches() {
    let server = serve(test_config(TWO_EVENTS), None);

    let (status, events) = post_compile(&server.router, b"bundle-1", false).await;
    assert_eq!(status, StatusCode::OK);
    let messages = messages(&events);
    assert!(messages.contains(&"PROGRAM START".to_string()));
    assert!(messages.contains(&"PROGRAM END".to_string()));
    // Debug markers are filtered without debug=1.
    assert!(events.iter().all(|e| e.stream != "debug"));

    assert_eq!(server.coordinator.cache_len(), 1);
    assert_eq!(server.metrics.snapshot().completed, 1);
}

#[tokio::test]
async fn debug_param_opts_into_debug_events() {
    let server = serve(test_config(TWO_EVENTS), None);

    let (_, events) = post_compile(&server.router, b"bundle-dbg", true).await;
    assert!(events
        .iter()
        .any(|e| e.stream == "debug" && e.message == "Preparing to run program"));
}

#[tokio::test]
async fn second_identical_request_is_served_from_cache() {
    let server = serve(test_config(TWO_EVENTS), None);

    let (_, first) = post_compile(&server.router, b"bundle-2", false).await;
    let started_after_first = server.metrics.snapshot().started;

    let (status, second) = post_compile(&server.router, b"bundle-2", true).await;
    assert_eq!(status, StatusCode::OK);

    // No new worker activation: the second run never reached the pool.
    assert_eq!(server.metrics.snapshot().started, started_after_first);
    assert_eq!(server.metrics.snapshot().cache_hits, 1);

    assert!(second
        .iter()
        .any(|e| e.stream == "debug" && e.message == "Sending cached response"));

    // Replayed events match what the first client saw, timestamps aside.
    let first_visible: Vec<&Event> = first.iter().filter(|e| e.stream != "debug").collect();
    let second_visible: Vec<&Event> = second.iter().filter(|e| e.stream != "debug").collect();
    assert_eq!(first_visible.len(), second_visible.len());
    for (a, b) in first_visible.iter().zip(&second_visible) {
        assert_eq!(a.file, b.file);
        assert_eq!(a.stream, b.stream);
        assert_eq!(a.message, b.message);
    }
}

#[tokio::test]
async fn oversize_body_is_rejected_without_running() {
    let mut config = test_config(TWO_EVENTS);
    config.max_size = 64;
    let server = serve(config, None);

    let body = vec![b'x'; 65];
    let (status, events) = post_compile(&server.router, &body, false).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(events
        .iter()
        .any(|e| e.stream == "stderr" && e.message == "Program too large."));
    assert_eq!(server.metrics.snapshot().started, 0);
    assert_eq!(server.coordinator.cache_len(), 0);
}

#[tokio::test]
async fn exactly_max_size_is_accepted() {
    let mut config = test_config(TWO_EVENTS);
    config.max_size = 64;
    let server = serve(config, None);

    let body = vec![b'x'; 64];
    let (status, _) = post_compile(&server.router, &body, false).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn full_queue_reports_busy() {
    let mut config = test_config("sleep 2");
    config.parallelism = 1;
    config.job_queue_cap = 1;
    let server = serve(config, None);

    let first = tokio::spawn({
        let router = server.router.clone();
        async move { post_compile(&router, b"job-1", false).await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let second = tokio::spawn({
        let router = server.router.clone();
        async move { post_compile(&router, b"job-2", false).await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (status, events) = post_compile(&server.router, b"job-3", false).await;
    assert_eq!(status, StatusCode::OK);
    assert!(events
        .iter()
        .any(|e| e.stream == "stderr" && e.message == "Service busy. Please try again later."));

    let (first_status, _) = first.await.unwrap();
    let (second_status, _) = second.await.unwrap();
    assert_eq!(first_status, StatusCode::OK);
    assert_eq!(second_status, StatusCode::OK);
}

#[tokio::test]
async fn disconnect_before_dispatch_cancels_the_job() {
    let mut config = test_config("sleep 1");
    config.parallelism = 1;
    config.job_queue_cap = 4;
    let server = serve(config, None);

    // Occupy the only worker.
    let running = tokio::spawn({
        let router = server.router.clone();
        async move { post_compile(&router, b"occupier", false).await }
    });
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Enqueue a second job and immediately drop the response, simulating a
    // client disconnect before a worker picks it up.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/compile")
                .body(Body::from("abandoned"))
                .unwrap(),
        )
        .await
        .unwrap();
    drop(response);

    running.await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    // The abandoned job was rejected before running: only the first run is
    // cached, and only one job ever reached a worker.
    assert_eq!(server.coordinator.cache_len(), 1);
    assert_eq!(server.metrics.snapshot().started, 1);
}

#[tokio::test]
async fn wrong_method_is_a_bad_request() {
    let server = serve(test_config(TWO_EVENTS), None);

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/compile")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn preflight_returns_cors_headers() {
    let server = serve(test_config(TWO_EVENTS), None);

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("OPTIONS")
                .uri("/compile")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "*"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-methods")
            .unwrap(),
        "POST, OPTIONS"
    );
}

#[tokio::test]
async fn healthz_fails_in_lame_duck() {
    let server = serve(test_config(TWO_EVENTS), None);

    let healthy = server
        .router
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(healthy.status(), StatusCode::OK);

    server.lameduck.send(true).unwrap();

    let draining = server
        .router
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(draining.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn save_and_load_round_trip() {
    let db_path = std::env::temp_dir().join(format!(
        "playpen-test-{}-{}.db",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    let store = Arc::new(BundleStore::open(&db_path).unwrap());
    let server = serve(test_config(TWO_EVENTS), Some(store));

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/save")
                .body(Body::from("{\"files\":[{\"name\":\"main.go\"}]}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let saved: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let link = saved["Link"].as_str().unwrap();
    assert!(link.starts_with('_'));

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/load?id={link}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let loaded: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(loaded["Data"], saved["Data"]);

    let missing = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/load?id=_doesnotexist")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let no_id = server
        .router
        .clone()
        .oneshot(Request::builder().uri("/load").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(no_id.status(), StatusCode::BAD_REQUEST);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn save_is_not_mounted_without_a_database() {
    let server = serve(test_config(TWO_EVENTS), None);

    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/save")
                .body(Body::from("bundle"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
