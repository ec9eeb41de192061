use homelab_devkit::{write_inventory, SAMPLE_INVENTORY};
use homelab_kernel::config::GroupNames;
use homelab_kernel::endpoints::ResolutionContext;
use homelab_kernel::env::EnvSnapshot;
use homelab_kernel::health::HealthTracker;
use homelab_kernel::http::{build_router, AppState};
use homelab_kernel::servers::{AnsibleServer, DockerServer};
use homelab_kernel::{Dispatcher, MergePolicy};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

fn ctx(path: &Path) -> ResolutionContext {
    ResolutionContext {
        inventory_path: Some(path.to_path_buf()),
        merge_policy: MergePolicy::FirstSeen,
        groups: GroupNames::default(),
        env: Arc::new(EnvSnapshot::default()),
    }
}

fn dispatcher(path: &Path) -> (Dispatcher, Arc<AnsibleServer>) {
    let ansible = Arc::new(AnsibleServer::new(ctx(path)));
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(ansible.clone()).register(Arc::new(DockerServer::new(ctx(path))));
    (dispatcher, ansible)
}

#[tokio::test]
async fn dispatcher_routes_by_prefix() {
    let file = write_inventory(SAMPLE_INVENTORY).unwrap();
    let (dispatcher, _) = dispatcher(file.path());

    let group = dispatcher.call("ansible_get_group_hosts", &json!({"group": "core"})).await;
    assert!(group.starts_with("Group all/infra/core (1 host(s))"), "{group}");
    assert!(group.contains("cyber.lan: 10.0.0.5"), "{group}");

    let hosts = dispatcher.call("docker_list_all_hosts", &json!({})).await;
    assert!(hosts.contains("Container hosts (2)"), "{hosts}");

    let catalog = dispatcher.call("homelab_get_tool_catalog", &json!({})).await;
    assert!(catalog.starts_with(&format!("Homelab tools ({})", dispatcher.tool_count())), "{catalog}");
    assert!(catalog.contains("ansible_find_hosts"));

    let unknown = dispatcher.call("nas_reboot", &json!({})).await;
    assert!(unknown.starts_with("✗ homelab Not Found"), "{unknown}");
    assert!(unknown.contains("homelab_get_tool_catalog"));

    let missing_arg = dispatcher.call("ansible_get_host_details", &json!({})).await;
    assert!(missing_arg.contains("Invalid Argument"), "{missing_arg}");

    assert_eq!(dispatcher.calls(), 5);
}

#[tokio::test]
async fn status_api_requires_key_except_health() {
    let file = write_inventory(SAMPLE_INVENTORY).unwrap();
    let (dispatcher, ansible) = dispatcher(file.path());
    let state = AppState {
        dispatcher: Arc::new(dispatcher),
        ansible,
        health_tracker: HealthTracker::new(),
        api_key: Some("k3y".into()),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move { axum::serve(listener, build_router(state)).await });

    let client = reqwest::Client::new();
    let health = client.get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    assert_eq!(health.text().await.unwrap(), "ok");

    let denied = client.get(format!("{base}/system/health")).send().await.unwrap();
    assert_eq!(denied.status(), 401);

    let wrong = client.get(format!("{base}/system/health")).header("x-api-key", "nope").send().await.unwrap();
    assert_eq!(wrong.status(), 401);

    let allowed = client.get(format!("{base}/system/health")).header("x-api-key", "k3y").send().await.unwrap();
    assert_eq!(allowed.status(), 200);
    let body: Value = allowed.json().await.unwrap();
    assert_eq!(body["hosts_tracked"], json!(5));
    assert!(body["caches"].get("docker").is_some());
    assert!(body["tools_registered"].as_u64().is_some_and(|n| n > 1));

    server.abort();
}
