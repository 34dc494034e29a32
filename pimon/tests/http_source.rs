//! HttpSource against an in-process fake host.
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use url::Url;

use pimon::engine::RefreshEngine;
use pimon::error::Error;
use pimon::source::{HttpSource, TelemetrySource};
use pimon::targets::Target;
use pimon::types::KillRequest;

fn cpu_body() -> Value {
    json!({
        "cpu_temperature": 47.2,
        "cpu_usage": {
            "full": {
                "user_norm": 1200, "user_nice": 10, "kernel": 300, "idle": 8000,
                "iowait": 40, "irq": 0, "soft_irq": 50
            },
            "cores": [
                { "core_id": 0, "user_norm": 600, "kernel": 150, "idle": 4000 },
                { "core_id": 1, "user_norm": 600, "kernel": 150, "idle": 4000 }
            ]
        }
    })
}

async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn fake_host(killed: Arc<Mutex<Vec<u32>>>) -> SocketAddr {
    let router = Router::new()
        .route("/cpu", get(|| async { Json(cpu_body()) }))
        .route(
            "/memory",
            get(|| async { Json(json!({"total": 3882924, "free": 1200000, "available": 2900000})) }),
        )
        .route(
            "/processes",
            get(|| async {
                Json(json!({"processes": [
                    {"pid": 1, "name": "systemd", "state_code": "S", "state_description": "sleeping",
                     "user": "0", "group": "0", "memory_rss": 11000, "memory_virt": 170000,
                     "swap": 0, "threads": 1, "utime": 120},
                    {"pid": 512, "name": "node"}
                ]}))
            }),
        )
        .route("/ext_temp", get(|| async { Json(json!({"temperature": 22.75})) }))
        .route(
            "/control/process/kill",
            post(move |Json(req): Json<KillRequest>| {
                let killed = killed.clone();
                async move {
                    if req.pid == 1 {
                        return (StatusCode::FORBIDDEN, "refusing to kill init".to_string());
                    }
                    killed.lock().unwrap().push(req.pid);
                    (StatusCode::OK, String::new())
                }
            }),
        );
    serve(router).await
}

fn base(addr: SocketAddr) -> Url {
    Url::parse(&format!("http://{addr}/")).unwrap()
}

#[tokio::test]
async fn test_decodes_all_facets() {
    let addr = fake_host(Arc::default()).await;
    let src = HttpSource::new(Duration::from_secs(2));
    let base = base(addr);

    let cpu = src.cpu(&base).await.unwrap();
    assert_eq!(cpu.cpu_temperature, Some(47.2));
    assert_eq!(cpu.cpu_usage.full.io_wait, 40);
    assert_eq!(cpu.cpu_usage.full.total(), 9600);
    assert_eq!(cpu.cpu_usage.cores.len(), 2);
    assert_eq!(cpu.cpu_usage.cores[1].core_id, 1);
    assert_eq!(cpu.cpu_usage.cores[1].stats.idle, 4000);

    let mem = src.memory(&base).await.unwrap();
    assert_eq!(mem.total, 3_882_924);
    assert_eq!(mem.available, 2_900_000);

    let procs = src.processes(&base).await.unwrap();
    assert_eq!(procs.processes.len(), 2);
    assert_eq!(procs.processes[0].name, "systemd");
    // fields the host left out default to empty
    assert_eq!(procs.processes[1].pid, 512);
    assert_eq!(procs.processes[1].user, "");

    let ext = src.external_temperature(&base).await.unwrap();
    assert_eq!(ext.temperature, 22.75);
}

#[tokio::test]
async fn test_kill_posts_pid() {
    let killed = Arc::new(Mutex::new(Vec::new()));
    let addr = fake_host(killed.clone()).await;
    let src = HttpSource::new(Duration::from_secs(2));

    src.kill_process(&base(addr), 512).await.unwrap();
    assert_eq!(*killed.lock().unwrap(), vec![512]);

    match src.kill_process(&base(addr), 1).await {
        Err(Error::Status { status, body }) => {
            assert_eq!(status, 403);
            assert_eq!(body, "refusing to kill init");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_error_statuses_and_bad_payloads() {
    let router = Router::new()
        .route(
            "/cpu",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "could not read /proc/stat") }),
        )
        .route("/memory", get(|| async { "not json" }))
        .route("/ext_temp", get(|| async { Json(json!({"celsius": 20})) }));
    let addr = serve(router).await;
    let src = HttpSource::new(Duration::from_secs(2));
    let base = base(addr);

    match src.cpu(&base).await {
        Err(Error::Status { status, .. }) => assert_eq!(status, 500),
        other => panic!("expected status error, got {other:?}"),
    }
    assert!(matches!(src.memory(&base).await, Err(Error::Decode(_))));
    assert!(matches!(
        src.external_temperature(&base).await,
        Err(Error::Decode(_))
    ));
    // unknown route
    assert!(matches!(
        src.processes(&base).await,
        Err(Error::Status { status: 404, .. })
    ));
}

#[tokio::test]
async fn test_unreachable_host_and_timeout() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(300))
        .build()
        .unwrap();
    let src = HttpSource::with_client(client);
    assert!(matches!(src.cpu(&base(dead)).await, Err(Error::Http(_))));

    let router = Router::new().route(
        "/cpu",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Json(cpu_body())
        }),
    );
    let slow = serve(router).await;
    match src.cpu(&base(slow)).await {
        Err(Error::Http(e)) => assert!(e.is_timeout(), "{e}"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_engine_over_http() {
    let addr = fake_host(Arc::default()).await;
    let source = Arc::new(HttpSource::new(Duration::from_secs(2)));
    let (engine, _effects) = RefreshEngine::new(source, Duration::from_secs(60));
    engine
        .start(Target::new(addr.ip().to_string(), addr.port()))
        .unwrap();

    let mut rx = engine.subscribe();
    let t = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|t| !t.is_loading()))
        .await
        .expect("first round in time")
        .expect("engine alive")
        .clone();
    assert!(!t.is_error(), "{t:?}");
    assert_eq!(t.cpu_temperature, Some(47.2));
    assert!((t.used_ram_percent.unwrap() - 25.3).abs() < 0.05);
    assert_eq!(t.external_temperature, Some(22.75));
    engine.stop();
}
