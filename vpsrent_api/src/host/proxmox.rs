use crate::host::{
    GuestIpEntry, HypervisorClient, NodeInfo, PowerAction, SnapshotEntry, StorageInfo, TaskId,
    TaskState, TaskStatus, VersionInfo, VmConfigPatch, VmPowerState, VmStatusInfo, VncProxyInfo,
};
use crate::json_api::JsonApi;
use crate::op_fatal;
use crate::retry::OpResult;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Deserializer, Serialize};

/// How long a freshly minted VNC ticket is usable, surfaced to clients
const VNC_TICKET_EXPIRES: u64 = 7200;

#[derive(Clone)]
pub struct ProxmoxClient {
    api: JsonApi,
}

impl ProxmoxClient {
    /// `token` is the full `USER@REALM!TOKENID=UUID` API token value
    pub fn new(base: &str, token: &str, allow_invalid_certs: bool) -> Result<Self> {
        Ok(Self {
            api: JsonApi::token(
                base,
                &format!("PVEAPIToken={}", token),
                allow_invalid_certs,
            )?,
        })
    }
}

#[async_trait]
impl HypervisorClient for ProxmoxClient {
    async fn version(&self) -> OpResult<VersionInfo> {
        let rsp: ResponseBase<VersionResponse> = self.api.get("/api2/json/version").await?;
        Ok(VersionInfo {
            version: rsp.data.version,
            release: rsp.data.release,
        })
    }

    async fn list_nodes(&self) -> OpResult<Vec<NodeInfo>> {
        let rsp: ResponseBase<Vec<NodeResponse>> = self.api.get("/api2/json/nodes").await?;
        Ok(rsp
            .data
            .into_iter()
            .map(|n| NodeInfo {
                name: n.name,
                online: matches!(n.status, NodeStatus::Online),
                max_cpu: n.max_cpu,
                max_mem: n.max_mem,
                uptime: n.uptime,
            })
            .collect())
    }

    async fn list_storage(&self, node: &str) -> OpResult<Vec<StorageInfo>> {
        let rsp: ResponseBase<Vec<NodeStorageResponse>> = self
            .api
            .get(&format!("/api2/json/nodes/{node}/storage"))
            .await?;
        Ok(rsp
            .data
            .into_iter()
            .map(|s| StorageInfo {
                name: s.storage,
                total: s.total,
                used: s.used,
                shared: s.shared.unwrap_or(0) != 0,
            })
            .collect())
    }

    async fn next_vmid(&self) -> OpResult<u32> {
        let rsp: ResponseBase<String> = self.api.get("/api2/json/cluster/nextid").await?;
        match rsp.data.parse() {
            Ok(v) => Ok(v),
            Err(e) => op_fatal!("Invalid vmid from nextid: {} {}", rsp.data, e),
        }
    }

    async fn clone_vm(
        &self,
        node: &str,
        template_vmid: u32,
        new_vmid: u32,
        name: &str,
    ) -> OpResult<TaskId> {
        let rsp: ResponseBase<Option<String>> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu/{}/clone", node, template_vmid),
                &CloneRequest {
                    new_id: new_vmid,
                    name: name.to_string(),
                    full: 1,
                },
            )
            .await?;
        if let Some(id) = rsp.data {
            Ok(TaskId {
                id,
                node: node.to_string(),
            })
        } else {
            op_fatal!("Clone of {} to {} returned no task", template_vmid, new_vmid)
        }
    }

    async fn configure_vm(&self, node: &str, vmid: u32, patch: &VmConfigPatch) -> OpResult<()> {
        let _: ResponseBase<Option<String>> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu/{}/config", node, vmid),
                &ConfigRequest {
                    cores: patch.cores,
                    memory: patch.memory_mb,
                    name: patch.name.clone(),
                    on_boot: patch.on_boot.map(|b| if b { 1 } else { 0 }),
                },
            )
            .await?;
        Ok(())
    }

    async fn resize_disk(
        &self,
        node: &str,
        vmid: u32,
        disk: &str,
        size: &str,
    ) -> OpResult<TaskId> {
        let rsp: ResponseBase<String> = self
            .api
            .req(
                Method::PUT,
                &format!("/api2/json/nodes/{}/qemu/{}/resize", node, vmid),
                Some(&ResizeRequest {
                    disk: disk.to_string(),
                    size: size.to_string(),
                }),
            )
            .await?;
        Ok(TaskId {
            id: rsp.data,
            node: node.to_string(),
        })
    }

    async fn power(&self, node: &str, vmid: u32, action: PowerAction) -> OpResult<TaskId> {
        let rsp: ResponseBase<String> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu/{}/status/{}", node, vmid, action),
                (),
            )
            .await?;
        Ok(TaskId {
            id: rsp.data,
            node: node.to_string(),
        })
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> OpResult<TaskId> {
        let rsp: ResponseBase<Option<String>> = self
            .api
            .req::<_, ()>(
                Method::DELETE,
                &format!(
                    "/api2/json/nodes/{}/qemu/{}?purge=1&destroy-unreferenced-disks=1",
                    node, vmid
                ),
                None,
            )
            .await?;
        if let Some(id) = rsp.data {
            Ok(TaskId {
                id,
                node: node.to_string(),
            })
        } else {
            op_fatal!("Delete of VM {} returned no task", vmid)
        }
    }

    async fn vm_status(&self, node: &str, vmid: u32) -> OpResult<VmStatusInfo> {
        let rsp: ResponseBase<VmCurrentStatus> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/status/current",
                node, vmid
            ))
            .await?;
        Ok(VmStatusInfo {
            state: match rsp.data.status {
                VmStatus::Running => VmPowerState::Running,
                VmStatus::Stopped => VmPowerState::Stopped,
            },
            uptime: rsp.data.uptime,
            cpu: rsp.data.cpu,
            mem: rsp.data.mem,
            max_mem: rsp.data.max_mem,
            net_in: rsp.data.net_in,
            net_out: rsp.data.net_out,
        })
    }

    async fn guest_ip(&self, node: &str, vmid: u32) -> OpResult<Option<Vec<GuestIpEntry>>> {
        // The agent is unreachable for the whole first boot, absence is normal
        let rsp: Result<ResponseBase<AgentInterfacesResponse>, _> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/agent/network-get-interfaces",
                node, vmid
            ))
            .await;
        let rsp = match rsp {
            Ok(r) => r,
            Err(e) => {
                log::debug!("Guest agent not ready for VM {}: {}", vmid, e);
                return Ok(None);
            }
        };

        let entries = filter_guest_addresses(rsp.data.result);
        if entries.is_empty() {
            Ok(None)
        } else {
            Ok(Some(entries))
        }
    }

    async fn vnc_proxy(&self, node: &str, vmid: u32) -> OpResult<VncProxyInfo> {
        let rsp: ResponseBase<VncProxyResponse> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu/{}/vncproxy", node, vmid),
                &VncProxyRequest { websocket: 1 },
            )
            .await?;
        Ok(VncProxyInfo {
            port: rsp.data.port,
            ticket: rsp.data.ticket,
            cert: rsp.data.cert,
            expires_in: VNC_TICKET_EXPIRES,
        })
    }

    async fn list_snapshots(&self, node: &str, vmid: u32) -> OpResult<Vec<SnapshotEntry>> {
        let rsp: ResponseBase<Vec<SnapshotResponse>> = self
            .api
            .get(&format!("/api2/json/nodes/{}/qemu/{}/snapshot", node, vmid))
            .await?;
        Ok(rsp
            .data
            .into_iter()
            .map(|s| SnapshotEntry {
                name: s.name,
                description: s.description,
                snaptime: s.snaptime,
                parent: s.parent,
            })
            .collect())
    }

    async fn create_snapshot(
        &self,
        node: &str,
        vmid: u32,
        name: &str,
        description: Option<&str>,
    ) -> OpResult<TaskId> {
        let rsp: ResponseBase<String> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu/{}/snapshot", node, vmid),
                &SnapshotCreateRequest {
                    snap_name: name.to_string(),
                    description: description.unwrap_or("").to_string(),
                },
            )
            .await?;
        Ok(TaskId {
            id: rsp.data,
            node: node.to_string(),
        })
    }

    async fn rollback_snapshot(&self, node: &str, vmid: u32, name: &str) -> OpResult<TaskId> {
        let rsp: ResponseBase<String> = self
            .api
            .post(
                &format!(
                    "/api2/json/nodes/{}/qemu/{}/snapshot/{}/rollback",
                    node, vmid, name
                ),
                (),
            )
            .await?;
        Ok(TaskId {
            id: rsp.data,
            node: node.to_string(),
        })
    }

    async fn delete_snapshot(&self, node: &str, vmid: u32, name: &str) -> OpResult<TaskId> {
        let rsp: ResponseBase<String> = self
            .api
            .req::<_, ()>(
                Method::DELETE,
                &format!(
                    "/api2/json/nodes/{}/qemu/{}/snapshot/{}",
                    node, vmid, name
                ),
                None,
            )
            .await?;
        Ok(TaskId {
            id: rsp.data,
            node: node.to_string(),
        })
    }

    async fn task_status(&self, task: &TaskId) -> OpResult<TaskStatus> {
        let rsp: ResponseBase<TaskStatusResponse> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/tasks/{}/status",
                task.node, task.id
            ))
            .await?;
        Ok(TaskStatus {
            state: if rsp.data.status == "stopped" {
                TaskState::Finished
            } else {
                TaskState::Running
            },
            exit_status: rsp.data.exit_status,
        })
    }

    async fn rrd_data(
        &self,
        node: &str,
        vmid: u32,
        timeframe: &str,
        cf: &str,
    ) -> OpResult<Vec<serde_json::Value>> {
        let rsp: ResponseBase<Vec<serde_json::Value>> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/rrddata?timeframe={}&cf={}",
                node, vmid, timeframe, cf
            ))
            .await?;
        Ok(rsp.data)
    }
}

#[derive(Deserialize)]
struct ResponseBase<T> {
    data: T,
}

#[derive(Deserialize)]
struct VersionResponse {
    version: String,
    release: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum NodeStatus {
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Deserialize)]
struct NodeResponse {
    #[serde(rename = "node")]
    name: String,
    status: NodeStatus,
    #[serde(rename = "maxcpu")]
    max_cpu: Option<u16>,
    #[serde(rename = "maxmem")]
    max_mem: Option<u64>,
    uptime: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct NodeStorageResponse {
    storage: String,
    total: Option<u64>,
    used: Option<u64>,
    shared: Option<u8>,
}

#[derive(Serialize)]
struct CloneRequest {
    #[serde(rename = "newid")]
    new_id: u32,
    name: String,
    full: u8,
}

#[derive(Serialize)]
struct ConfigRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    cores: Option<u16>,
    /// Memory in MiB
    #[serde(skip_serializing_if = "Option::is_none")]
    memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(rename = "onboot", skip_serializing_if = "Option::is_none")]
    on_boot: Option<u8>,
}

#[derive(Serialize)]
struct ResizeRequest {
    disk: String,
    size: String,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum VmStatus {
    Stopped,
    Running,
}

#[derive(Debug, Deserialize)]
struct VmCurrentStatus {
    status: VmStatus,
    uptime: Option<u64>,
    cpu: Option<f32>,
    mem: Option<u64>,
    #[serde(rename = "maxmem")]
    max_mem: Option<u64>,
    #[serde(rename = "netin")]
    net_in: Option<u64>,
    #[serde(rename = "netout")]
    net_out: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct AgentInterfacesResponse {
    #[serde(default)]
    result: Vec<AgentInterface>,
}

#[derive(Debug, Deserialize)]
struct AgentInterface {
    name: String,
    #[serde(rename = "hardware-address")]
    hardware_address: Option<String>,
    #[serde(rename = "ip-addresses", default)]
    ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Debug, Deserialize)]
struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
}

#[derive(Serialize)]
struct VncProxyRequest {
    websocket: u8,
}

#[derive(Debug, Deserialize)]
struct VncProxyResponse {
    #[serde(deserialize_with = "number_from_string")]
    port: u16,
    ticket: String,
    cert: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    name: String,
    description: Option<String>,
    snaptime: Option<u64>,
    parent: Option<String>,
}

#[derive(Serialize)]
struct SnapshotCreateRequest {
    #[serde(rename = "snapname")]
    snap_name: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    status: String,
    #[serde(rename = "exitstatus")]
    exit_status: Option<String>,
}

/// Proxmox returns some numeric fields as strings, accept both
fn number_from_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u16),
        String(String),
    }

    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Keep only routable guest IPv4 addresses: the loopback interface, 127/8 and
/// link-local 169.254/16 entries never reach callers.
fn filter_guest_addresses(interfaces: Vec<AgentInterface>) -> Vec<GuestIpEntry> {
    let mut entries = Vec::new();
    for iface in interfaces {
        if matches!(iface.name.as_str(), "lo" | "Loopback Pseudo-Interface 1") {
            continue;
        }
        let mac = iface.hardware_address.unwrap_or_default();
        for addr in iface.ip_addresses {
            if addr.ip_address_type != "ipv4" {
                continue;
            }
            let ip: std::net::Ipv4Addr = match addr.ip_address.parse() {
                Ok(ip) => ip,
                Err(_) => continue,
            };
            if ip.is_loopback() || ip.is_link_local() {
                continue;
            }
            entries.push(GuestIpEntry {
                ip,
                mac: mac.clone(),
            });
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, mac: &str, addrs: &[(&str, &str)]) -> AgentInterface {
        AgentInterface {
            name: name.to_string(),
            hardware_address: Some(mac.to_string()),
            ip_addresses: addrs
                .iter()
                .map(|(ip, kind)| AgentIpAddress {
                    ip_address: ip.to_string(),
                    ip_address_type: kind.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn guest_addresses_filter_loopback_and_link_local() {
        let entries = filter_guest_addresses(vec![
            iface("lo", "00:00:00:00:00:00", &[("127.0.0.1", "ipv4")]),
            iface(
                "eth0",
                "bc:24:11:aa:bb:cc",
                &[
                    ("127.0.0.1", "ipv4"),
                    ("169.254.12.7", "ipv4"),
                    ("10.10.7.42", "ipv4"),
                    ("fd00::1", "ipv6"),
                ],
            ),
        ]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].ip.to_string(), "10.10.7.42");
        assert_eq!(entries[0].mac, "bc:24:11:aa:bb:cc");
    }

    #[test]
    fn guest_addresses_empty_when_agent_reports_nothing_usable() {
        let entries = filter_guest_addresses(vec![iface(
            "eth0",
            "bc:24:11:aa:bb:cc",
            &[("169.254.0.9", "ipv4")],
        )]);
        assert!(entries.is_empty());
    }

    #[test]
    fn task_status_parses_terminal_states() {
        let finished = TaskStatus {
            state: TaskState::Finished,
            exit_status: Some("OK".to_string()),
        };
        assert!(finished.is_success());

        let failed = TaskStatus {
            state: TaskState::Finished,
            exit_status: Some("clone failed: no such volume".to_string()),
        };
        assert!(failed.is_finished());
        assert!(!failed.is_success());

        let running = TaskStatus {
            state: TaskState::Running,
            exit_status: None,
        };
        assert!(!running.is_finished());
    }
}

