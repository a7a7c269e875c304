//! Integration tests for the Proxmox provider against a mock API.

use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use virt::{provision, CloneRequest, Hypervisor, PowerState, Proxmox, VmHandle};

const UPID: &str = "UPID:pve:000ABCDE:0012345:66AA00FF:qmclone:900:forgelab@pam!deploy:";

async fn mock_resources(server: &MockServer, vms: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/resources"))
        .and(query_param("type", "vm"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": vms })))
        .mount(server)
        .await;
}

fn provider(server: &MockServer) -> Proxmox {
    Proxmox::new(server.uri(), "pve", "forgelab@pam!deploy", "secret", false).unwrap()
}

#[tokio::test]
async fn provision_returns_existing_vm_without_cloning() {
    let server = MockServer::start().await;
    mock_resources(
        &server,
        json!([
            {"vmid": 411, "name": "lab-server", "node": "pve", "template": 0}
        ]),
    )
    .await;

    // Any clone attempt would be a bug: the name collision means the VM is
    // already provisioned.
    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/411/clone"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let hv = provider(&server);
    let req = CloneRequest::new("ubuntu-gpu-template", "lab-server");

    let first = provision(&hv, &req).await.unwrap();
    let second = provision(&hv, &req).await.unwrap();

    assert_eq!(first.vmid, 411);
    assert_eq!(second.vmid, 411);
    assert_eq!(first.name, second.name);
}

#[tokio::test]
async fn provision_clones_when_name_is_free() {
    let server = MockServer::start().await;
    mock_resources(
        &server,
        json!([
            {"vmid": 100, "name": "ubuntu-gpu-template", "node": "pve", "template": 1}
        ]),
    )
    .await;

    Mock::given(method("GET"))
        .and(path("/api2/json/cluster/nextid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": "900" })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/100/clone"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": UPID })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(format!("/api2/json/nodes/pve/tasks/{UPID}/status")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "data": {"status": "stopped", "exitstatus": "OK"} })),
        )
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api2/json/nodes/pve/qemu/900/config"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": null })))
        .expect(1)
        .mount(&server)
        .await;

    let hv = provider(&server);
    let req = CloneRequest::new("ubuntu-gpu-template", "lab-server")
        .with_cores(8)
        .with_memory_mb(16384);

    let vm = provision(&hv, &req).await.unwrap();
    assert_eq!(vm.vmid, 900);
    assert_eq!(vm.name, "lab-server");
    assert_eq!(vm.node, "pve");
}

#[tokio::test]
async fn clone_rejects_non_template_source() {
    let server = MockServer::start().await;
    mock_resources(
        &server,
        json!([
            {"vmid": 100, "name": "ubuntu-gpu-template", "node": "pve", "template": 0}
        ]),
    )
    .await;

    let hv = provider(&server);
    let err = hv
        .clone_from_template(&CloneRequest::new("ubuntu-gpu-template", "lab-server"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not a template"));
}

#[tokio::test]
async fn guest_addresses_reports_ipv4_only() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/900/agent/network-get-interfaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {
                "result": [
                    {"name": "lo", "ip-addresses": [
                        {"ip-address": "127.0.0.1", "ip-address-type": "ipv4"}
                    ]},
                    {"name": "eth0", "ip-addresses": [
                        {"ip-address": "10.30.0.11", "ip-address-type": "ipv4"},
                        {"ip-address": "fe80::aa", "ip-address-type": "ipv6"}
                    ]}
                ]
            }
        })))
        .mount(&server)
        .await;

    let hv = provider(&server);
    let vm = VmHandle {
        vmid: 900,
        name: "lab-server".into(),
        node: "pve".into(),
    };

    let addrs = hv.guest_addresses(&vm).await.unwrap();
    assert_eq!(addrs, vec!["127.0.0.1", "10.30.0.11"]);
}

#[tokio::test]
async fn guest_addresses_empty_while_agent_down() {
    let server = MockServer::start().await;

    // Proxmox answers 500 "QEMU guest agent is not running" until boot.
    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/900/agent/network-get-interfaces"))
        .respond_with(ResponseTemplate::new(500).set_body_string("guest agent is not running"))
        .mount(&server)
        .await;

    let hv = provider(&server);
    let vm = VmHandle {
        vmid: 900,
        name: "lab-server".into(),
        node: "pve".into(),
    };

    assert!(hv.guest_addresses(&vm).await.unwrap().is_empty());
}

#[tokio::test]
async fn power_state_parses_current_status() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api2/json/nodes/pve/qemu/900/status/current"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "data": {"status": "running"} })),
        )
        .mount(&server)
        .await;

    let hv = provider(&server);
    let vm = VmHandle {
        vmid: 900,
        name: "lab-server".into(),
        node: "pve".into(),
    };

    assert_eq!(hv.power_state(&vm).await.unwrap(), PowerState::Running);
}
