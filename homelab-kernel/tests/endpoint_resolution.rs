use homelab_devkit::{env_pairs, write_inventory, SAMPLE_INVENTORY};
use homelab_kernel::config::GroupNames;
use homelab_kernel::endpoints::{resolve_endpoints, resolve_ping_targets, ResolutionContext, DOCKER, NUT, OLLAMA, PIHOLE};
use homelab_kernel::env::EnvSnapshot;
use homelab_kernel::models::{EndpointSource, ServiceKind};
use homelab_kernel::servers::{DockerServer, ToolServer};
use homelab_kernel::MergePolicy;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn ctx(path: Option<&Path>, env: &[(&str, &str)]) -> ResolutionContext {
    ResolutionContext {
        inventory_path: path.map(PathBuf::from),
        merge_policy: MergePolicy::FirstSeen,
        groups: GroupNames::default(),
        env: Arc::new(EnvSnapshot::from_pairs(env_pairs(env))),
    }
}

#[test]
fn env_fallback_without_inventory() {
    let table = resolve_endpoints(&DOCKER, &ctx(None, &[("DOCKER_CYBER_ENDPOINT", "10.0.0.5:2375")]));

    assert_eq!(table.len(), 1);
    let cyber = &table["cyber"];
    assert_eq!(cyber.address, "10.0.0.5:2375");
    assert_eq!(cyber.kind, ServiceKind::Docker);
    assert_eq!(cyber.source, EndpointSource::Env);
}

#[test]
fn env_fallback_when_inventory_missing_or_group_empty() {
    let env = [("DOCKER_CYBER_ENDPOINT", "10.0.0.5:2375")];
    let missing = resolve_endpoints(&DOCKER, &ctx(Some(Path::new("/nonexistent/hosts.yml")), &env));
    assert_eq!(missing["cyber"].address, "10.0.0.5:2375");

    let file = write_inventory("all:\n  children:\n    docker_hosts:\n    other:\n      hosts:\n        x: {}\n").unwrap();
    let empty_group = resolve_endpoints(&DOCKER, &ctx(Some(file.path()), &env));
    assert_eq!(empty_group["cyber"].source, EndpointSource::Env);
}

#[test]
fn inventory_wins_over_env() {
    let file = write_inventory(SAMPLE_INVENTORY).unwrap();
    let table = resolve_endpoints(&DOCKER, &ctx(Some(file.path()), &[("DOCKER_OTHER_ENDPOINT", "10.9.9.9")]));

    assert_eq!(table.keys().collect::<Vec<_>>(), vec!["cyber", "forge"]);
    assert_eq!(table["cyber"].address, "10.0.0.5:2375");
    assert_eq!(table["forge"].address, "10.0.0.6:2376");
    assert!(table.values().all(|r| r.source == EndpointSource::Inventory));
}

#[test]
fn named_form_suppresses_indexed_duplicate() {
    let env = [
        ("OLLAMA_GPU_ENDPOINT", "10.0.0.9:11434"),
        ("OLLAMA_1_ENDPOINT", "10.0.0.9:11434"),
        ("OLLAMA_1_NAME", "duplicate"),
        ("OLLAMA_2_ENDPOINT", "10.0.0.10"),
    ];
    let table = resolve_endpoints(&OLLAMA, &ctx(None, &env));

    assert_eq!(table.keys().collect::<Vec<_>>(), vec!["gpu", "ollama-server2"]);
    assert_eq!(table["ollama-server2"].address, "10.0.0.10:11434");
}

#[test]
fn credentials_from_inventory_and_env() {
    let file = write_inventory(SAMPLE_INVENTORY).unwrap();
    let pihole = resolve_endpoints(&PIHOLE, &ctx(Some(file.path()), &[]));
    assert_eq!(pihole["dns1"].address, "10.0.0.2:80");
    assert_eq!(pihole["dns1"].credentials.as_ref().unwrap().secret, "secret-one");

    let env = [("PIHOLE_DNS_2_HOST", "10.0.0.3"), ("PIHOLE_API_KEY_DNS_2", "secret-two")];
    let from_env = resolve_endpoints(&PIHOLE, &ctx(None, &env));
    assert_eq!(from_env["dns-2"].credentials.as_ref().unwrap().secret, "secret-two");

    let nut = resolve_endpoints(&NUT, &ctx(Some(file.path()), &[("NUT_USERNAME", "monuser"), ("NUT_PASSWORD", "pw")]));
    let rack = &nut["rack"];
    assert_eq!(rack.devices[0].name, "apc");
    assert_eq!(rack.credentials.as_ref().unwrap().username.as_deref(), Some("monuser"));
}

#[test]
fn ping_targets_cover_whole_inventory() {
    let file = write_inventory(SAMPLE_INVENTORY).unwrap();
    let table = resolve_ping_targets(&ctx(Some(file.path()), &[]));

    assert_eq!(table.targets.len(), 5);
    assert_eq!(table.targets["cyber"].address, "10.0.0.5");
    assert_eq!(table.groups["core"], vec!["cyber"]);

    let env_only = resolve_ping_targets(&ctx(None, &[("PING_TARGET1", "10.0.0.1"), ("PING_TARGET1_NAME", "gateway")]));
    assert_eq!(env_only.targets["gateway"].address, "10.0.0.1");
}

#[tokio::test]
async fn reload_reresolves_from_disk() {
    let file = write_inventory("all:\n  children:\n    docker_hosts:\n      hosts:\n        a: {}\n").unwrap();
    let server = DockerServer::new(ctx(Some(file.path()), &[]));

    assert!(!server.cache_populated());
    assert_eq!(server.endpoints().len(), 1);
    assert!(server.cache_populated());

    std::fs::write(file.path(), "all:\n  children:\n    docker_hosts:\n      hosts:\n        a: {}\n        b: {}\n").unwrap();
    // sans reload : contenu en cache inchangé
    assert_eq!(server.endpoints().len(), 1);

    let text = server.call("docker_reload_inventory", &json!({})).await;
    assert!(text.contains('2'), "{text}");
    assert_eq!(server.endpoints().len(), 2);
}
