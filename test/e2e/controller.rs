//! End-to-end test of the controller daemon wiring: manifest directory in,
//! status API out.
//!
//! Starts the HTTP API on an ephemeral port with a running reconciler, edits
//! manifests on disk and follows convergence through `/v1/status`.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p steward-e2e --test controller
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{json, Value};
use steward_controller::{api, manifest::ManifestStore, state::AppState};
use steward_id::{ResourceKey, ResourceKind};
use steward_reconcile::{MemoryCluster, Ownership, Reconciler, ReconcilerConfig};
use steward_testing::{eventually, init_tracing};
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

struct Harness {
    base_url: String,
    client: reqwest::Client,
    root: TempDir,
    manifests: PathBuf,
    cluster: Arc<MemoryCluster>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Harness {
    async fn start(prune: bool) -> Self {
        init_tracing();
        let root = TempDir::new().unwrap();
        let manifests = root.path().join("manifests");
        std::fs::create_dir(&manifests).unwrap();

        let store = Arc::new(ManifestStore::new(&manifests, Ownership::none()));
        let cluster = Arc::new(MemoryCluster::new());
        let config = ReconcilerConfig {
            desired_poll_interval: Duration::from_millis(20),
            observe_poll_interval: Duration::from_millis(20),
            prune,
            ..ReconcilerConfig::default()
        };
        let reconciler = Reconciler::new(config, store, cluster.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let reconcile_task = tokio::spawn({
            let reconciler = reconciler.clone();
            let shutdown_rx = shutdown_rx.clone();
            async move { reconciler.run(shutdown_rx).await }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr: SocketAddr = listener.local_addr().unwrap();
        let app = api::create_router(AppState::new(reconciler));
        let server_task = tokio::spawn(async move {
            let mut shutdown_rx = shutdown_rx;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !*shutdown_rx.borrow() {
                        if shutdown_rx.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            root,
            manifests,
            cluster,
            shutdown,
            tasks: vec![reconcile_task, server_task],
        }
    }

    fn write_manifest(&self, file: &str, manifest: Value) {
        write_atomically(&self.manifests, file, &manifest);
    }

    fn remove_manifest(&self, file: &str) {
        std::fs::remove_file(self.manifests.join(file)).unwrap();
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap();
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn post(&self, path: &str) -> (StatusCode, Value) {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .send()
            .await
            .unwrap();
        let status = response.status();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    /// Wait until `path` reports `status` at `generation`.
    async fn wait_for(&self, path: &str, status: &str, generation: u64) -> bool {
        eventually(Duration::from_secs(10), move || async move {
            let (code, body) = self.get(path).await;
            code == StatusCode::OK && body["status"] == status && body["generation"] == generation
        })
        .await
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for task in self.tasks {
            tokio::time::timeout(Duration::from_secs(5), task)
                .await
                .expect("task did not stop")
                .unwrap();
        }
        self.root.close().unwrap();
    }
}

/// Write through a temporary file so a rescan never sees a half-written manifest.
fn write_atomically(dir: &Path, file: &str, manifest: &Value) {
    let tmp = dir.join(format!(".{file}.tmp"));
    std::fs::write(&tmp, serde_json::to_vec_pretty(manifest).unwrap()).unwrap();
    std::fs::rename(&tmp, dir.join(file)).unwrap();
}

fn web() -> ResourceKey {
    ResourceKey::new(ResourceKind::Deployment, "default", "web").unwrap()
}

fn web_manifest(replicas: u64) -> Value {
    json!({
        "kind": "Deployment",
        "namespace": "default",
        "name": "web",
        "spec": {"replicas": replicas, "image": "web:1"}
    })
}

const WEB_STATUS: &str = "/v1/status/Deployment/default/web";

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manifest_lifecycle_over_http() {
    let harness = Harness::start(true).await;

    let (status, body) = harness.get("/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    // Declare: created and synced at generation 1.
    harness.write_manifest("web.json", web_manifest(1));
    assert!(harness.wait_for(WEB_STATUS, "synced", 1).await);
    assert_eq!(
        harness.cluster.spec(&web()).await,
        Some(json!({"spec": {"replicas": 1, "image": "web:1"}}))
    );

    // Scale: generation 2.
    harness.write_manifest("web.json", web_manifest(3));
    assert!(harness.wait_for(WEB_STATUS, "synced", 2).await);
    assert_eq!(
        harness.cluster.spec(&web()).await,
        Some(json!({"spec": {"replicas": 3, "image": "web:1"}}))
    );

    let (status, body) = harness.get("/v1/status?status=synced").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["summary"]["total"], 1);
    assert_eq!(body["items"][0]["key"]["name"], "web");

    // Drift from another writer is reverted without a new generation.
    harness
        .cluster
        .put(&web(), json!({"spec": {"replicas": 0, "image": "web:1"}}))
        .await;
    let cluster = harness.cluster.clone();
    assert!(
        eventually(Duration::from_secs(10), || {
            let cluster = cluster.clone();
            async move {
                cluster.spec(&web()).await
                    == Some(json!({"spec": {"replicas": 3, "image": "web:1"}}))
            }
        })
        .await
    );
    assert!(harness.wait_for(WEB_STATUS, "synced", 2).await);

    // Remove: pruned from the live system and dropped from status.
    harness.remove_manifest("web.json");
    let h = &harness;
    assert!(
        eventually(Duration::from_secs(10), move || async move {
            h.get(WEB_STATUS).await.0 == StatusCode::NOT_FOUND
        })
        .await
    );
    assert!(harness.cluster.spec(&web()).await.is_none());

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_manifest_is_reported_and_retried_on_request() {
    let harness = Harness::start(false).await;

    harness.write_manifest(
        "web.json",
        json!({
            "kind": "Deployment",
            "namespace": "default",
            "name": "web",
            "spec": {"replicas": "many"}
        }),
    );
    assert!(harness.wait_for(WEB_STATUS, "error", 1).await);

    let (_, body) = harness.get(WEB_STATUS).await;
    assert!(body["message"].as_str().unwrap().contains("spec.replicas"));

    let (status, body) = harness.get("/v1/status?status=error").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"].as_array().unwrap().len(), 1);

    // An operator retry runs the same generation again and fails the same way.
    let (status, body) = harness.post(&format!("{WEB_STATUS}/retry")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["generation"], 1);
    assert!(harness.wait_for(WEB_STATUS, "error", 1).await);

    // Fixing the manifest recovers.
    harness.write_manifest("web.json", web_manifest(2));
    assert!(harness.wait_for(WEB_STATUS, "synced", 2).await);

    // Without pruning, removal leaves the live resource alone.
    harness.remove_manifest("web.json");
    let h = &harness;
    assert!(
        eventually(Duration::from_secs(10), move || async move {
            h.get(WEB_STATUS).await.0 == StatusCode::NOT_FOUND
        })
        .await
    );
    assert!(harness.cluster.spec(&web()).await.is_some());

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_manifest_directory_degrades_readiness() {
    let harness = Harness::start(false).await;
    harness.write_manifest("web.json", web_manifest(1));
    assert!(harness.wait_for(WEB_STATUS, "synced", 1).await);

    let parked = harness.root.path().join("parked");
    std::fs::rename(&harness.manifests, &parked).unwrap();
    let h = &harness;
    assert!(
        eventually(Duration::from_secs(10), move || async move {
            h.get("/readyz").await.0 == StatusCode::SERVICE_UNAVAILABLE
        })
        .await
    );
    let (_, body) = harness.get("/readyz").await;
    assert_eq!(body["components"]["desired_store"]["status"], "unavailable");

    // Status of already-known resources stays readable during the outage.
    let (status, body) = harness.get(WEB_STATUS).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "synced");

    std::fs::rename(&parked, &harness.manifests).unwrap();
    assert!(
        eventually(Duration::from_secs(10), move || async move {
            h.get("/readyz").await.0 == StatusCode::OK
        })
        .await
    );

    harness.stop().await;
}
