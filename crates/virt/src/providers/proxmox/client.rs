//! Proxmox VE API client implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, info, warn};

use super::models::{
    AgentInterfaces, ApiResponse, CloneBody, ClusterVm, CurrentStatus, SizingBody, TaskStatus,
};
use crate::providers::traits::{
    CloneRequest, Hypervisor, HypervisorError, PowerState, VmHandle,
};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Polling interval when waiting for a hypervisor task.
const TASK_POLL_INTERVAL_SECS: u64 = 3;

/// Window to wait for a hypervisor task to finish.
const TASK_TIMEOUT_SECS: u64 = 600;

/// Proxmox VE hypervisor provider.
#[derive(Clone)]
pub struct Proxmox {
    /// HTTP client.
    client: Client,
    /// API base URL (e.g. `https://pve.lab:8006`).
    base_url: String,
    /// Hypervisor node that hosts the lab VMs.
    node: String,
    /// API token ID (`user@realm!tokenname`).
    token_id: String,
    /// API token secret.
    token_secret: String,
}

impl Proxmox {
    /// Create a new Proxmox provider.
    ///
    /// # Arguments
    /// * `base_url` - API endpoint, e.g. `https://pve.lab:8006`
    /// * `node` - hypervisor node name hosting the lab
    /// * `token_id` - API token ID (`user@realm!tokenname`)
    /// * `token_secret` - API token secret
    /// * `insecure_tls` - accept the self-signed certificate most lab
    ///   hypervisors ship with
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(
        base_url: impl Into<String>,
        node: impl Into<String>,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
        insecure_tls: bool,
    ) -> Result<Self, HypervisorError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .danger_accept_invalid_certs(insecure_tls)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            node: node.into(),
            token_id: token_id.into(),
            token_secret: token_secret.into(),
        })
    }

    fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }

    /// Make an authenticated GET request.
    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, HypervisorError> {
        let url = format!("{}/api2/json{path}", self.base_url);
        debug!(url = %url, "GET request");

        let response = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request with a form body.
    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, HypervisorError>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize,
    {
        let url = format!("{}/api2/json{path}", self.base_url);
        debug!(url = %url, "POST request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .form(body)
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Make an authenticated POST request with no parameters.
    async fn post_action<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, HypervisorError> {
        let empty: [(&str, &str); 0] = [];
        self.post(path, &empty).await
    }

    /// Make an authenticated DELETE request.
    async fn delete<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<T, HypervisorError> {
        let url = format!("{}/api2/json{path}", self.base_url);
        debug!(url = %url, "DELETE request");

        let response = self
            .client
            .delete(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await?;

        Self::handle_response(response).await
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, HypervisorError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "failed to parse response");
                HypervisorError::Serialization(e)
            })
        } else if status == StatusCode::NOT_FOUND {
            Err(HypervisorError::NotFound(text))
        } else {
            Err(HypervisorError::Api {
                status: status.as_u16(),
                message: text,
            })
        }
    }

    /// List all non-template VMs in the cluster.
    async fn list_vms(&self) -> Result<Vec<ClusterVm>, HypervisorError> {
        let response: ApiResponse<Vec<ClusterVm>> =
            self.get("/cluster/resources?type=vm").await?;
        Ok(response.data)
    }

    /// Look up any VM (template or not) by name.
    async fn find_any(&self, name: &str) -> Result<Option<ClusterVm>, HypervisorError> {
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .find(|vm| vm.name.as_deref() == Some(name)))
    }

    /// Allocate the next free vmid.
    async fn next_vmid(&self) -> Result<u32, HypervisorError> {
        let response: ApiResponse<String> = self.get("/cluster/nextid").await?;
        response
            .data
            .parse()
            .map_err(|_| HypervisorError::Config(format!("bad nextid: {}", response.data)))
    }

    /// Wait for a hypervisor task (UPID) to finish.
    async fn wait_task(&self, upid: &str) -> Result<(), HypervisorError> {
        let start = std::time::Instant::now();
        let timeout = Duration::from_secs(TASK_TIMEOUT_SECS);
        // UPIDs contain ':' which must survive the path segment intact;
        // Proxmox accepts them unencoded.
        let path = format!("/nodes/{}/tasks/{upid}/status", self.node);

        loop {
            let response: ApiResponse<TaskStatus> = self.get(&path).await?;
            let task = response.data;

            if !task.is_running() {
                if task.succeeded() {
                    return Ok(());
                }
                return Err(HypervisorError::TaskFailed {
                    upid: upid.to_string(),
                    status: task.exitstatus.unwrap_or_else(|| "unknown".to_string()),
                });
            }

            if start.elapsed() > timeout {
                return Err(HypervisorError::Timeout(TASK_TIMEOUT_SECS));
            }

            debug!(upid, elapsed_secs = start.elapsed().as_secs(), "task running");
            tokio::time::sleep(Duration::from_secs(TASK_POLL_INTERVAL_SECS)).await;
        }
    }
}

#[async_trait]
impl Hypervisor for Proxmox {
    async fn find_vm(&self, name: &str) -> Result<Option<VmHandle>, HypervisorError> {
        Ok(self.find_any(name).await?.map(|vm| VmHandle {
            vmid: vm.vmid,
            name: name.to_string(),
            node: vm.node,
        }))
    }

    async fn clone_from_template(&self, req: &CloneRequest) -> Result<VmHandle, HypervisorError> {
        let template = self
            .find_any(&req.template)
            .await?
            .ok_or_else(|| HypervisorError::NotFound(req.template.clone()))?;
        if template.template != 1 {
            return Err(HypervisorError::Config(format!(
                "{} is not a template",
                req.template
            )));
        }

        let newid = self.next_vmid().await?;

        info!(
            template = %req.template,
            name = %req.name,
            vmid = newid,
            "cloning VM"
        );

        let body = CloneBody {
            newid,
            name: req.name.clone(),
            full: 1,
        };
        let response: ApiResponse<String> = self
            .post(
                &format!("/nodes/{}/qemu/{}/clone", template.node, template.vmid),
                &body,
            )
            .await?;
        self.wait_task(&response.data).await?;

        // Apply requested sizing to the fresh clone.
        let sizing = SizingBody {
            cores: req.cores,
            memory: req.memory_mb,
        };
        let _: ApiResponse<Option<String>> = self
            .post(
                &format!("/nodes/{}/qemu/{newid}/config", template.node),
                &sizing,
            )
            .await?;

        info!(name = %req.name, vmid = newid, "VM cloned");
        Ok(VmHandle {
            vmid: newid,
            name: req.name.clone(),
            node: template.node,
        })
    }

    async fn power_state(&self, vm: &VmHandle) -> Result<PowerState, HypervisorError> {
        let response: ApiResponse<CurrentStatus> = self
            .get(&format!(
                "/nodes/{}/qemu/{}/status/current",
                vm.node, vm.vmid
            ))
            .await?;

        Ok(match response.data.status.as_str() {
            "running" => PowerState::Running,
            "stopped" => PowerState::Stopped,
            _ => PowerState::Unknown,
        })
    }

    async fn power_on(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        info!(name = %vm.name, vmid = vm.vmid, "powering on");
        let response: ApiResponse<String> = self
            .post_action(&format!("/nodes/{}/qemu/{}/status/start", vm.node, vm.vmid))
            .await?;
        self.wait_task(&response.data).await
    }

    async fn power_off(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        info!(name = %vm.name, vmid = vm.vmid, "powering off");
        let response: ApiResponse<String> = self
            .post_action(&format!("/nodes/{}/qemu/{}/status/stop", vm.node, vm.vmid))
            .await?;
        self.wait_task(&response.data).await
    }

    async fn guest_addresses(&self, vm: &VmHandle) -> Result<Vec<String>, HypervisorError> {
        let result: Result<ApiResponse<AgentInterfaces>, _> = self
            .get(&format!(
                "/nodes/{}/qemu/{}/agent/network-get-interfaces",
                vm.node, vm.vmid
            ))
            .await;

        // The agent endpoint errors until the guest agent is up; callers
        // poll, so an empty list is the right answer here.
        let interfaces = match result {
            Ok(response) => response.data,
            Err(HypervisorError::Api { .. } | HypervisorError::NotFound(_)) => {
                return Ok(Vec::new())
            }
            Err(e) => return Err(e),
        };

        Ok(interfaces
            .result
            .into_iter()
            .flat_map(|iface| iface.ip_addresses)
            .filter(|addr| addr.ip_address_type == "ipv4")
            .map(|addr| addr.ip_address)
            .collect())
    }

    async fn destroy(&self, vm: &VmHandle) -> Result<(), HypervisorError> {
        info!(name = %vm.name, vmid = vm.vmid, "destroying VM");
        let response: ApiResponse<String> = self
            .delete(&format!("/nodes/{}/qemu/{}", vm.node, vm.vmid))
            .await?;
        self.wait_task(&response.data).await?;
        info!(name = %vm.name, "VM destroyed");
        Ok(())
    }
}
