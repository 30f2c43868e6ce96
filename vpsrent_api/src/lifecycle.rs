use crate::error::{ServiceError, ServiceResult};
use crate::host::{
    wait_for_task, HostRegistry, HypervisorClient, PowerAction, SnapshotEntry, VmStatusInfo,
};
use crate::settings::HypervisorConfig;
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use vpsrent_db::{
    Cluster, HypervisorVm, Node, PowerStatus, SnapshotStatus, User, VmSnapshot, VpsInstance,
    VpsRentDb, VpsStatus,
};

/// Per-VPS user-initiated operations, authenticated by ownership and gated on
/// the instance state machine.
pub struct VpsService {
    db: Arc<dyn VpsRentDb>,
    hosts: Arc<HostRegistry>,
    config: HypervisorConfig,
}

/// Everything needed to talk to the hypervisor about one VPS
struct VpsContext {
    instance: VpsInstance,
    vm: HypervisorVm,
    node: Node,
    cluster: Cluster,
    client: Arc<dyn HypervisorClient>,
}

/// Merged persisted + live view; the HTTP layer decides what to expose
#[derive(Debug, Clone)]
pub struct VpsInfo {
    pub instance: VpsInstance,
    pub vm: Option<HypervisorVm>,
    /// Live hypervisor view, absent when the VM is unreachable
    pub live: Option<LiveStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub status: String,
    pub uptime: Option<u64>,
    pub cpu: Option<f32>,
    pub mem: Option<u64>,
    pub max_mem: Option<u64>,
    pub net_in: Option<u64>,
    pub net_out: Option<u64>,
}

impl From<VmStatusInfo> for LiveStatus {
    fn from(s: VmStatusInfo) -> Self {
        LiveStatus {
            status: match s.state {
                crate::host::VmPowerState::Running => "running".to_string(),
                crate::host::VmPowerState::Stopped => "stopped".to_string(),
            },
            uptime: s.uptime,
            cpu: s.cpu,
            mem: s.mem,
            max_mem: s.max_mem,
            net_in: s.net_in,
            net_out: s.net_out,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VncAccess {
    pub vnc_url: String,
    /// Path on this service proxying the byte stream
    pub ws_path: String,
    pub vnc_port: u16,
    pub vnc_password: String,
    pub ticket: String,
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snaptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotList {
    pub snapshots: Vec<SnapshotInfo>,
    pub total: usize,
    pub max_snapshots: u32,
}

impl VpsService {
    pub fn new(
        db: Arc<dyn VpsRentDb>,
        hosts: Arc<HostRegistry>,
        config: HypervisorConfig,
    ) -> Self {
        Self { db, hosts, config }
    }

    async fn load_instance(&self, user: &User, vps_id: Uuid) -> ServiceResult<VpsInstance> {
        let instance = self.db.get_instance(vps_id).await.map_err(|e| {
            if e.is_not_found() {
                ServiceError::not_found("VPS instance not found")
            } else {
                ServiceError::from(e)
            }
        })?;
        if instance.user_id != user.id && !user.is_admin() {
            return Err(ServiceError::forbidden(
                "You don't have permission to access this VPS",
            ));
        }
        Ok(instance)
    }

    /// Full context for operations that talk to the hypervisor. Only active
    /// instances pass: terminal and still-creating instances are rejected, and
    /// suspended instances allow nothing but [info] (which takes the separate
    /// [load_instance] path) until payment resumes.
    async fn load(&self, user: &User, vps_id: Uuid) -> ServiceResult<VpsContext> {
        let instance = self.load_instance(user, vps_id).await?;
        if instance.status.is_terminal() {
            return Err(ServiceError::invalid_state(
                "VPS has been terminated or is in error state",
            ));
        }
        if instance.status == VpsStatus::Creating {
            return Err(ServiceError::invalid_state("VPS is still being created"));
        }
        if instance.status == VpsStatus::Suspended {
            return Err(ServiceError::PaymentRequired(
                "VPS is suspended due to non-payment".to_string(),
            ));
        }
        let vm_id = instance
            .vm_id
            .ok_or_else(|| ServiceError::invalid_state("VPS is not linked to a VM yet"))?;
        let vm = self.db.get_vm(vm_id).await?;
        let node = self.db.get_node(vm.node_id).await?;
        let cluster = self.db.get_cluster(vm.cluster_id).await?;
        let client = self
            .hosts
            .client(&cluster)
            .await
            .map_err(ServiceError::Internal)?;
        Ok(VpsContext {
            instance,
            vm,
            node,
            cluster,
            client,
        })
    }

    pub async fn list_my(&self, user: &User) -> ServiceResult<Vec<VpsInfo>> {
        let instances = self.db.list_user_instances(user.id).await?;
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances {
            let vm = match instance.vm_id {
                Some(id) => self.db.get_vm(id).await.ok(),
                None => None,
            };
            out.push(VpsInfo {
                instance,
                vm,
                live: None,
            });
        }
        Ok(out)
    }

    /// Merged view of the persisted VM row and live hypervisor status. Allowed
    /// in every non-terminal state; refreshes the cached power status and a
    /// missing IP as a side effect.
    pub async fn info(&self, user: &User, vps_id: Uuid) -> ServiceResult<VpsInfo> {
        let instance = self.load_instance(user, vps_id).await?;
        if instance.status.is_terminal() {
            return Err(ServiceError::invalid_state(
                "VPS has been terminated or is in error state",
            ));
        }
        let vm_id = match instance.vm_id {
            Some(id) => id,
            None => {
                return Ok(VpsInfo {
                    instance,
                    vm: None,
                    live: None,
                });
            }
        };
        let mut vm = self.db.get_vm(vm_id).await?;
        let node = self.db.get_node(vm.node_id).await?;
        let cluster = self.db.get_cluster(vm.cluster_id).await?;
        let client = self
            .hosts
            .client(&cluster)
            .await
            .map_err(ServiceError::Internal)?;

        let live = match client.vm_status(&node.name, vm.vmid).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("Failed to read live status of VM {}: {}", vm.vmid, e);
                None
            }
        };

        if let Some(s) = &live {
            let mirrored = match s.state {
                crate::host::VmPowerState::Running => PowerStatus::Running,
                crate::host::VmPowerState::Stopped => PowerStatus::Stopped,
            };
            let mut dirty = vm.power_status != mirrored;
            vm.power_status = mirrored;

            // the guest may have reported its address since provisioning
            if vm.ip_address.is_none() && mirrored == PowerStatus::Running {
                if let Ok(Some(entries)) = client.guest_ip(&node.name, vm.vmid).await {
                    if let Some(first) = entries.first() {
                        vm.ip_address = Some(first.ip.to_string());
                        vm.mac_address = Some(first.mac.clone());
                        dirty = true;
                    }
                }
            }
            if dirty {
                self.db.update_vm(&vm).await?;
            }
        }

        Ok(VpsInfo {
            instance,
            vm: Some(vm),
            live: live.map(LiveStatus::from),
        })
    }

    /// Forward a power action and refresh the cached power status
    pub async fn power(
        &self,
        user: &User,
        vps_id: Uuid,
        action: PowerAction,
    ) -> ServiceResult<String> {
        let ctx = self.load(user, vps_id).await?;

        let task = ctx
            .client
            .power(&ctx.node.name, ctx.vm.vmid, action)
            .await?;
        wait_for_task(ctx.client.as_ref(), &task, self.config.task_timeout()).await?;

        let mut vm = ctx.vm;
        vm.power_status = match action {
            PowerAction::Start | PowerAction::Resume | PowerAction::Reboot | PowerAction::Reset => {
                PowerStatus::Running
            }
            PowerAction::Stop | PowerAction::Shutdown => PowerStatus::Stopped,
            PowerAction::Suspend => PowerStatus::Suspended,
        };
        self.db.update_vm(&vm).await?;

        info!("VM {} {} requested by {}", vm.vmid, action, user.id);
        Ok(task.id)
    }

    /// Mint a short-lived VNC ticket; only active instances have consoles
    pub async fn vnc(&self, user: &User, vps_id: Uuid) -> ServiceResult<VncAccess> {
        let ctx = self.load(user, vps_id).await?;

        let proxy = ctx.client.vnc_proxy(&ctx.node.name, ctx.vm.vmid).await?;
        let host = reqwest::Url::parse(&ctx.cluster.host)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| ctx.cluster.host.clone());

        Ok(VncAccess {
            vnc_url: format!(
                "wss://{}:{}/?vncticket={}",
                host,
                proxy.port,
                urlencoding::encode(&proxy.ticket)
            ),
            ws_path: format!(
                "/vnc/ws?node={}&vmid={}&port={}&ticket={}",
                ctx.node.name,
                ctx.vm.vmid,
                proxy.port,
                urlencoding::encode(&proxy.ticket)
            ),
            vnc_port: proxy.port,
            vnc_password: ctx.vm.vnc_password.clone(),
            ticket: proxy.ticket,
            expires_in: proxy.expires_in,
        })
    }

    /// Snapshot list as the hypervisor sees it, synthetic "current" excluded
    pub async fn list_snapshots(&self, user: &User, vps_id: Uuid) -> ServiceResult<SnapshotList> {
        let ctx = self.load(user, vps_id).await?;
        let plan = self.db.get_plan(ctx.instance.plan_id).await?;
        let snapshots = self.real_snapshots(&ctx).await?;
        Ok(SnapshotList {
            total: snapshots.len(),
            snapshots: snapshots
                .into_iter()
                .map(|s| SnapshotInfo {
                    name: s.name,
                    description: s.description,
                    snaptime: s.snaptime,
                    parent: s.parent,
                })
                .collect(),
            max_snapshots: plan.max_snapshots,
        })
    }

    async fn real_snapshots(&self, ctx: &VpsContext) -> ServiceResult<Vec<SnapshotEntry>> {
        let snapshots = ctx
            .client
            .list_snapshots(&ctx.node.name, ctx.vm.vmid)
            .await?;
        Ok(snapshots.into_iter().filter(|s| !s.is_current()).collect())
    }

    /// Create a snapshot, enforcing the plan cap before the hypervisor is called
    pub async fn create_snapshot(
        &self,
        user: &User,
        vps_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> ServiceResult<String> {
        let ctx = self.load(user, vps_id).await?;
        if name.is_empty() || name == "current" {
            return Err(ServiceError::conflict("Invalid snapshot name"));
        }

        let plan = self.db.get_plan(ctx.instance.plan_id).await?;
        let existing = self.real_snapshots(&ctx).await?;
        if existing.len() as u32 >= plan.max_snapshots {
            return Err(ServiceError::LimitExceeded(
                "Snapshot limit reached for this VPS plan".to_string(),
            ));
        }
        if existing.iter().any(|s| s.name == name) {
            return Err(ServiceError::conflict(
                "Snapshot with this name already exists",
            ));
        }

        let task = ctx
            .client
            .create_snapshot(&ctx.node.name, ctx.vm.vmid, name, description)
            .await?;
        wait_for_task(ctx.client.as_ref(), &task, self.config.task_timeout()).await?;

        let snapshot = VmSnapshot {
            id: Uuid::new_v4(),
            vm_id: ctx.vm.id,
            name: name.to_string(),
            description: description.map(|d| d.to_string()),
            size_bytes: None,
            status: SnapshotStatus::Available,
            created: Utc::now(),
        };
        self.db.insert_snapshot(&snapshot).await?;

        info!("Snapshot '{}' created for VM {}", name, ctx.vm.vmid);
        Ok(task.id)
    }

    pub async fn rollback_snapshot(
        &self,
        user: &User,
        vps_id: Uuid,
        name: &str,
    ) -> ServiceResult<String> {
        let ctx = self.load(user, vps_id).await?;
        let existing = self.real_snapshots(&ctx).await?;
        if !existing.iter().any(|s| s.name == name) {
            return Err(ServiceError::not_found("Snapshot not found"));
        }

        let task = ctx
            .client
            .rollback_snapshot(&ctx.node.name, ctx.vm.vmid, name)
            .await?;
        wait_for_task(ctx.client.as_ref(), &task, self.config.task_timeout()).await?;
        info!("VM {} rolled back to snapshot '{}'", ctx.vm.vmid, name);
        Ok(task.id)
    }

    pub async fn delete_snapshot(
        &self,
        user: &User,
        vps_id: Uuid,
        name: &str,
    ) -> ServiceResult<String> {
        let ctx = self.load(user, vps_id).await?;
        let existing = self.real_snapshots(&ctx).await?;
        if !existing.iter().any(|s| s.name == name) {
            return Err(ServiceError::not_found("Snapshot not found"));
        }

        let task = ctx
            .client
            .delete_snapshot(&ctx.node.name, ctx.vm.vmid, name)
            .await?;
        wait_for_task(ctx.client.as_ref(), &task, self.config.task_timeout()).await?;

        if let Some(row) = self.db.get_snapshot_by_name(ctx.vm.id, name).await? {
            self.db.delete_snapshot(row.id).await?;
        }
        info!("Snapshot '{}' deleted for VM {}", name, ctx.vm.vmid);
        Ok(task.id)
    }

    /// Hypervisor time-series pass-through
    pub async fn rrd(
        &self,
        user: &User,
        vps_id: Uuid,
        timeframe: Option<&str>,
        cf: Option<&str>,
    ) -> ServiceResult<Vec<serde_json::Value>> {
        let ctx = self.load(user, vps_id).await?;
        Ok(ctx
            .client
            .rrd_data(
                &ctx.node.name,
                ctx.vm.vmid,
                timeframe.unwrap_or("hour"),
                cf.unwrap_or("AVERAGE"),
            )
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockDb, MockHypervisor};
    use crate::settings::mock_settings;

    async fn setup() -> (Arc<MockDb>, Arc<MockHypervisor>, VpsService, User, Uuid) {
        let db = Arc::new(MockDb::default());
        let hv = Arc::new(MockHypervisor::default());
        let user = db.add_user("owner@example.com").await;
        let (plan, template) = db.add_catalog().await;
        let (instance, _vm) = db
            .add_active_instance(&user, &plan, &template, hv.as_ref())
            .await;
        let hosts = Arc::new(HostRegistry::with_client(template.cluster_id, hv.clone()));
        let svc = VpsService::new(db.clone(), hosts, mock_settings().hypervisor);
        (db, hv, svc, user, instance.id)
    }

    #[tokio::test]
    async fn info_merges_live_state() {
        let (_db, _hv, svc, user, vps_id) = setup().await;
        let info = svc.info(&user, vps_id).await.unwrap();
        assert!(info.vm.is_some());
        assert!(info.live.is_some());
    }

    #[tokio::test]
    async fn other_users_are_forbidden() {
        let (db, _hv, svc, _user, vps_id) = setup().await;
        let stranger = db.add_user("stranger@example.com").await;
        let err = svc.info(&stranger, vps_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }

    #[tokio::test]
    async fn suspended_power_requires_payment() {
        let (db, _hv, svc, user, vps_id) = setup().await;
        let mut instance = db.get_instance(vps_id).await.unwrap();
        instance.status = VpsStatus::Suspended;
        db.update_instance(&instance).await.unwrap();

        let err = svc
            .power(&user, vps_id, PowerAction::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::PaymentRequired(_)));
    }

    #[tokio::test]
    async fn suspended_blocks_everything_except_info() {
        let (db, hv, svc, user, vps_id) = setup().await;
        svc.create_snapshot(&user, vps_id, "pre-suspend", None)
            .await
            .unwrap();
        let mut instance = db.get_instance(vps_id).await.unwrap();
        instance.status = VpsStatus::Suspended;
        db.update_instance(&instance).await.unwrap();

        assert!(matches!(
            svc.list_snapshots(&user, vps_id).await.unwrap_err(),
            ServiceError::PaymentRequired(_)
        ));
        assert!(matches!(
            svc.create_snapshot(&user, vps_id, "while-suspended", None)
                .await
                .unwrap_err(),
            ServiceError::PaymentRequired(_)
        ));
        assert!(matches!(
            svc.rollback_snapshot(&user, vps_id, "pre-suspend")
                .await
                .unwrap_err(),
            ServiceError::PaymentRequired(_)
        ));
        assert!(matches!(
            svc.delete_snapshot(&user, vps_id, "pre-suspend")
                .await
                .unwrap_err(),
            ServiceError::PaymentRequired(_)
        ));
        assert!(matches!(
            svc.rrd(&user, vps_id, None, None).await.unwrap_err(),
            ServiceError::PaymentRequired(_)
        ));
        // the hypervisor is never consulted for a suspended instance
        assert_eq!(hv.snapshot_create_calls().await, 1);

        // info stays available so the owner can see why the VPS is down
        let info = svc.info(&user, vps_id).await.unwrap();
        assert_eq!(info.instance.status, VpsStatus::Suspended);
    }

    #[tokio::test]
    async fn terminal_instances_reject_operations() {
        let (db, _hv, svc, user, vps_id) = setup().await;
        let mut instance = db.get_instance(vps_id).await.unwrap();
        instance.status = VpsStatus::Terminated;
        db.update_instance(&instance).await.unwrap();

        assert!(matches!(
            svc.info(&user, vps_id).await.unwrap_err(),
            ServiceError::InvalidState(_)
        ));
        assert!(matches!(
            svc.power(&user, vps_id, PowerAction::Start).await.unwrap_err(),
            ServiceError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn power_updates_cached_status() {
        let (db, _hv, svc, user, vps_id) = setup().await;
        svc.power(&user, vps_id, PowerAction::Stop).await.unwrap();
        let instance = db.get_instance(vps_id).await.unwrap();
        let vm = db.get_vm(instance.vm_id.unwrap()).await.unwrap();
        assert_eq!(vm.power_status, PowerStatus::Stopped);
    }

    #[tokio::test]
    async fn snapshot_cap_blocks_before_hypervisor_call() {
        let (_db, hv, svc, user, vps_id) = setup().await;
        // plan allows 3 snapshots
        for name in ["s1", "s2", "s3"] {
            svc.create_snapshot(&user, vps_id, name, None).await.unwrap();
        }
        let calls_before = hv.snapshot_create_calls().await;
        let err = svc
            .create_snapshot(&user, vps_id, "s4", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::LimitExceeded(_)));
        assert_eq!(hv.snapshot_create_calls().await, calls_before);
    }

    #[tokio::test]
    async fn duplicate_snapshot_name_conflicts() {
        let (_db, _hv, svc, user, vps_id) = setup().await;
        svc.create_snapshot(&user, vps_id, "daily", None).await.unwrap();
        let err = svc
            .create_snapshot(&user, vps_id, "daily", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[tokio::test]
    async fn snapshot_listing_excludes_current() {
        let (_db, _hv, svc, user, vps_id) = setup().await;
        svc.create_snapshot(&user, vps_id, "before-upgrade", None)
            .await
            .unwrap();
        let list = svc.list_snapshots(&user, vps_id).await.unwrap();
        assert_eq!(list.total, 1);
        assert!(list.snapshots.iter().all(|s| s.name != "current"));
        assert_eq!(list.max_snapshots, 3);
    }

    #[tokio::test]
    async fn vnc_requires_active_state() {
        let (db, _hv, svc, user, vps_id) = setup().await;
        let access = svc.vnc(&user, vps_id).await.unwrap();
        assert!(access.vnc_url.starts_with("wss://"));
        assert!(access.expires_in > 0);

        let mut instance = db.get_instance(vps_id).await.unwrap();
        instance.status = VpsStatus::Suspended;
        db.update_instance(&instance).await.unwrap();
        let err = svc.vnc(&user, vps_id).await.unwrap_err();
        assert!(matches!(err, ServiceError::PaymentRequired(_)));
    }
}
