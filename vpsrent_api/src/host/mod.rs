use crate::op_fatal;
use crate::retry::OpResult;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;
use uuid::Uuid;
use vpsrent_db::Cluster;

mod proxmox;

pub use proxmox::ProxmoxClient;

/// Opaque handle for an asynchronous hypervisor task, resolved by polling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskId {
    pub id: String,
    pub node: String,
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Finished,
}

#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    pub exit_status: Option<String>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.state == TaskState::Finished
    }

    pub fn is_success(&self) -> bool {
        self.is_finished() && self.exit_status.as_deref() == Some("OK")
    }
}

/// Power actions accepted on the HTTP surface, names are part of the wire contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Shutdown,
    Reboot,
    Reset,
    Suspend,
    Resume,
}

impl Display for PowerAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PowerAction::Start => "start",
            PowerAction::Stop => "stop",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Reboot => "reboot",
            PowerAction::Reset => "reset",
            PowerAction::Suspend => "suspend",
            PowerAction::Resume => "resume",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for PowerAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "start" => PowerAction::Start,
            "stop" => PowerAction::Stop,
            "shutdown" => PowerAction::Shutdown,
            "reboot" => PowerAction::Reboot,
            "reset" => PowerAction::Reset,
            "suspend" => PowerAction::Suspend,
            "resume" => PowerAction::Resume,
            v => anyhow::bail!("Invalid power action: {}", v),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmPowerState {
    Running,
    Stopped,
}

/// Live VM status as reported by the hypervisor
#[derive(Debug, Clone)]
pub struct VmStatusInfo {
    pub state: VmPowerState,
    pub uptime: Option<u64>,
    /// CPU usage fraction 0..1
    pub cpu: Option<f32>,
    pub mem: Option<u64>,
    pub max_mem: Option<u64>,
    pub net_in: Option<u64>,
    pub net_out: Option<u64>,
}

/// IPv4 address reported by the guest agent, loopback and link-local excluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestIpEntry {
    pub ip: Ipv4Addr,
    pub mac: String,
}

#[derive(Debug, Clone)]
pub struct VncProxyInfo {
    pub port: u16,
    pub ticket: String,
    pub cert: Option<String>,
    /// Seconds the ticket stays valid
    pub expires_in: u64,
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub name: String,
    pub description: Option<String>,
    pub snaptime: Option<u64>,
    pub parent: Option<String>,
}

impl SnapshotEntry {
    /// The hypervisor lists a synthetic "current" entry for the live state,
    /// it is not a real snapshot and never counts against plan caps.
    pub fn is_current(&self) -> bool {
        self.name == "current"
    }
}

#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub version: String,
    pub release: String,
}

#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    pub online: bool,
    pub max_cpu: Option<u16>,
    pub max_mem: Option<u64>,
    pub uptime: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub name: String,
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub shared: bool,
}

/// Post-clone parameterization applied before first boot
#[derive(Debug, Clone, Default)]
pub struct VmConfigPatch {
    pub cores: Option<u16>,
    pub memory_mb: Option<u64>,
    pub name: Option<String>,
    pub on_boot: Option<bool>,
}

/// Sole exit point to the hypervisor. All write operations submit a task and
/// return a [TaskId] immediately; callers that need completion poll
/// [task_status] (or use [wait_for_task]).
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn version(&self) -> OpResult<VersionInfo>;

    async fn list_nodes(&self) -> OpResult<Vec<NodeInfo>>;

    async fn list_storage(&self, node: &str) -> OpResult<Vec<StorageInfo>>;

    /// Reserve the next free vmid, serialized by the cluster itself
    async fn next_vmid(&self) -> OpResult<u32>;

    async fn clone_vm(
        &self,
        node: &str,
        template_vmid: u32,
        new_vmid: u32,
        name: &str,
    ) -> OpResult<TaskId>;

    async fn configure_vm(&self, node: &str, vmid: u32, patch: &VmConfigPatch) -> OpResult<()>;

    /// `size` uses the hypervisor's suffix format, eg. "80G"
    async fn resize_disk(&self, node: &str, vmid: u32, disk: &str, size: &str)
        -> OpResult<TaskId>;

    async fn power(&self, node: &str, vmid: u32, action: PowerAction) -> OpResult<TaskId>;

    /// Delete a VM. The VM must be stopped first, see [ensure_stopped].
    async fn delete_vm(&self, node: &str, vmid: u32) -> OpResult<TaskId>;

    async fn vm_status(&self, node: &str, vmid: u32) -> OpResult<VmStatusInfo>;

    /// Soft failure path: `None` while the guest agent is not ready
    async fn guest_ip(&self, node: &str, vmid: u32) -> OpResult<Option<Vec<GuestIpEntry>>>;

    async fn vnc_proxy(&self, node: &str, vmid: u32) -> OpResult<VncProxyInfo>;

    async fn list_snapshots(&self, node: &str, vmid: u32) -> OpResult<Vec<SnapshotEntry>>;

    async fn create_snapshot(
        &self,
        node: &str,
        vmid: u32,
        name: &str,
        description: Option<&str>,
    ) -> OpResult<TaskId>;

    async fn rollback_snapshot(&self, node: &str, vmid: u32, name: &str) -> OpResult<TaskId>;

    async fn delete_snapshot(&self, node: &str, vmid: u32, name: &str) -> OpResult<TaskId>;

    async fn task_status(&self, task: &TaskId) -> OpResult<TaskStatus>;

    /// Time-series pass-through, rows are returned as raw JSON objects
    async fn rrd_data(
        &self,
        node: &str,
        vmid: u32,
        timeframe: &str,
        cf: &str,
    ) -> OpResult<Vec<serde_json::Value>>;
}

/// Poll a task until it reaches a terminal state, with exponential backoff
pub async fn wait_for_task(
    client: &dyn HypervisorClient,
    task: &TaskId,
    timeout: Duration,
) -> OpResult<TaskStatus> {
    let start = std::time::Instant::now();
    let mut delay = Duration::from_millis(500);
    loop {
        if start.elapsed() > timeout {
            op_fatal!("Task {} timed out after {:?}", task.id, timeout);
        }
        let s = client.task_status(task).await?;
        if s.is_finished() {
            if s.is_success() {
                return Ok(s);
            }
            op_fatal!(
                "Task {} finished with error: {}",
                task.id,
                s.exit_status.as_deref().unwrap_or("no error message")
            );
        }
        sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(5));
    }
}

/// Stop a VM and poll until it actually reports `stopped`.
///
/// The stop task completing only means the command was accepted; the VM may
/// still be shutting down. Deleting a VM whose process is still live can leave
/// orphaned disks, so delete paths call this first and surface a hard failure
/// if the VM never stops, rather than forcing.
pub async fn ensure_stopped(
    client: &dyn HypervisorClient,
    node: &str,
    vmid: u32,
    attempts: u32,
    interval: Duration,
) -> OpResult<()> {
    for attempt in 1..=attempts {
        match client.vm_status(node, vmid).await {
            Ok(s) if s.state == VmPowerState::Stopped => return Ok(()),
            Ok(_) => {
                log::info!("Stopping VM {} (attempt {}/{})", vmid, attempt, attempts);
                if let Ok(task) = client.power(node, vmid, PowerAction::Stop).await {
                    // ignore task failures here, the status check decides
                    let _ = wait_for_task(client, &task, Duration::from_secs(60)).await;
                }
            }
            Err(e) => {
                log::warn!("Error polling VM {} status: {}", vmid, e);
            }
        }
        sleep(interval).await;
        if let Ok(s) = client.vm_status(node, vmid).await {
            if s.state == VmPowerState::Stopped {
                return Ok(());
            }
        }
    }
    op_fatal!("VM {} did not stop after {} attempts", vmid, attempts)
}

/// One logical connection per cluster, shared across concurrent callers.
pub struct HostRegistry {
    clients: Mutex<HashMap<Uuid, Arc<dyn HypervisorClient>>>,
}

impl Default for HostRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Registry pre-seeded with a client, used by tests to inject mocks
    pub fn with_client(cluster_id: Uuid, client: Arc<dyn HypervisorClient>) -> Self {
        let mut map: HashMap<Uuid, Arc<dyn HypervisorClient>> = HashMap::new();
        map.insert(cluster_id, client);
        Self {
            clients: Mutex::new(map),
        }
    }

    pub async fn client(&self, cluster: &Cluster) -> Result<Arc<dyn HypervisorClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(c) = clients.get(&cluster.id) {
            return Ok(c.clone());
        }
        let client: Arc<dyn HypervisorClient> = Arc::new(ProxmoxClient::new(
            &cluster.host,
            &cluster.api_token,
            !cluster.verify_tls,
        )?);
        clients.insert(cluster.id, client.clone());
        Ok(client)
    }
}
