//! Proxmox VE API request/response models.

use serde::{Deserialize, Serialize};

/// Generic Proxmox response envelope.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// One entry from `GET /cluster/resources?type=vm`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterVm {
    pub vmid: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub node: String,
    /// 1 when the VM is a template.
    #[serde(default)]
    pub template: u8,
}

/// Body for `POST /nodes/{node}/qemu/{vmid}/clone`.
#[derive(Debug, Serialize)]
pub struct CloneBody {
    pub newid: u32,
    pub name: String,
    /// 1 = full clone (independent disk), which lab nodes need.
    pub full: u8,
}

/// Body for `POST /nodes/{node}/qemu/{vmid}/config`.
#[derive(Debug, Serialize)]
pub struct SizingBody {
    pub cores: u32,
    pub memory: u64,
}

/// Response of `GET /nodes/{node}/qemu/{vmid}/status/current`.
#[derive(Debug, Deserialize)]
pub struct CurrentStatus {
    pub status: String,
}

/// Response of `GET /nodes/{node}/tasks/{upid}/status`.
#[derive(Debug, Deserialize)]
pub struct TaskStatus {
    pub status: String,
    #[serde(default)]
    pub exitstatus: Option<String>,
}

impl TaskStatus {
    /// Whether the task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    /// Whether a finished task succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exitstatus.as_deref() == Some("OK")
    }
}

/// Guest agent `network-get-interfaces` payload.
#[derive(Debug, Deserialize)]
pub struct AgentInterfaces {
    pub result: Vec<AgentInterface>,
}

/// One guest NIC as reported by the agent.
#[derive(Debug, Deserialize)]
pub struct AgentInterface {
    pub name: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentAddress>,
}

/// One address on a guest NIC.
#[derive(Debug, Deserialize)]
pub struct AgentAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type")]
    pub ip_address_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_agent_interfaces() {
        let raw = r#"{
            "result": [
                {
                    "name": "lo",
                    "ip-addresses": [
                        {"ip-address": "127.0.0.1", "ip-address-type": "ipv4"}
                    ]
                },
                {
                    "name": "eth0",
                    "ip-addresses": [
                        {"ip-address": "10.30.0.11", "ip-address-type": "ipv4"},
                        {"ip-address": "fe80::1", "ip-address-type": "ipv6"}
                    ]
                }
            ]
        }"#;

        let parsed: AgentInterfaces = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.result.len(), 2);
        assert_eq!(parsed.result[1].name, "eth0");
        assert_eq!(parsed.result[1].ip_addresses[0].ip_address, "10.30.0.11");
    }

    #[test]
    fn test_task_status() {
        let done: TaskStatus =
            serde_json::from_str(r#"{"status": "stopped", "exitstatus": "OK"}"#).unwrap();
        assert!(!done.is_running());
        assert!(done.succeeded());

        let running: TaskStatus = serde_json::from_str(r#"{"status": "running"}"#).unwrap();
        assert!(running.is_running());
        assert!(!running.succeeded());
    }
}
