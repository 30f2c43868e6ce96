use crate::error::{ServiceError, ServiceResult};
use crate::host::{
    ensure_stopped, wait_for_task, HostRegistry, HypervisorClient, PowerAction, VmConfigPatch,
};
use crate::retry::{retry_async, Pipeline, RetryPolicy};
use crate::settings::HypervisorConfig;
use anyhow::anyhow;
use chrono::{Days, Utc};
use log::{error, info, warn};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use uuid::Uuid;
use vpsrent_db::{
    HypervisorVm, Order, OrderItem, OrderStatus, PowerStatus, User, VpsInstance, VpsRentDb,
    VpsStatus,
};

/// Billing month, by design choice
const BILLING_MONTH_DAYS: u64 = 30;

/// Turns a paid order item into a running VM. At most one VPS ever exists per
/// order item; a second call returns the existing instance unchanged.
pub struct Provisioner {
    db: Arc<dyn VpsRentDb>,
    hosts: Arc<HostRegistry>,
    config: HypervisorConfig,
}

#[derive(Debug, Clone)]
pub struct ProvisionedVps {
    pub instance: VpsInstance,
    pub vm: Option<HypervisorVm>,
}

pub fn generate_password(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

struct BuildCtx {
    client: Arc<dyn HypervisorClient>,
    node: String,
    template_vmid: u32,
    vmid: u32,
    hostname: String,
    cores: u16,
    memory_mb: u64,
    disk_gb: u32,
    task_timeout: Duration,
    stop_attempts: u32,
    stop_interval: Duration,
}

impl Provisioner {
    pub fn new(
        db: Arc<dyn VpsRentDb>,
        hosts: Arc<HostRegistry>,
        config: HypervisorConfig,
    ) -> Self {
        Self { db, hosts, config }
    }

    /// The `setup VPS` entry point: provision every item of a paid order.
    pub async fn setup_order(
        &self,
        user: &User,
        order_number: &str,
    ) -> ServiceResult<(Order, Vec<ProvisionedVps>)> {
        let order = self
            .db
            .get_order_by_number(order_number)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    ServiceError::not_found("Order not found")
                } else {
                    ServiceError::from(e)
                }
            })?;
        if order.user_id != user.id && !user.is_admin() {
            return Err(ServiceError::forbidden(
                "You do not have permission to access this order",
            ));
        }
        if order.status != OrderStatus::Paid {
            return Err(ServiceError::invalid_state("Order has not been paid"));
        }

        let items = self.db.list_order_items(order.id).await?;
        let mut provisioned = Vec::with_capacity(items.len());
        for item in &items {
            provisioned.push(self.provision_item(&order, item).await?);
        }
        Ok((order, provisioned))
    }

    /// Provision one order item, compensating on failure. Steps after the
    /// vmid allocation that fail tear the allocated VM back down and leave the
    /// instance in `error`; only administrative intervention may retry it.
    pub async fn provision_item(
        &self,
        order: &Order,
        item: &OrderItem,
    ) -> ServiceResult<ProvisionedVps> {
        if let Some(existing) = self.db.get_instance_by_order_item(item.id).await? {
            return self.existing_result(existing).await;
        }

        let plan = self.db.get_plan(item.plan_id).await?;
        let template = self.db.get_template(item.template_id).await?;
        let cluster = self.db.get_cluster(template.cluster_id).await?;
        let node = self.db.get_node(template.node_id).await?;

        let alloc = self.db.node_allocation(node.id).await?;
        let cpu_cap = (node.cpu_total as f32 * node.cpu_overcommit) as u64;
        let mem_cap = (node.memory_gb_total as f32 * node.memory_overcommit) as u64;
        if alloc.cpu + plan.cpu as u64 > cpu_cap || alloc.memory_gb + plan.memory_gb as u64 > mem_cap
        {
            return Err(ServiceError::LimitExceeded(format!(
                "Node {} has no capacity left",
                node.name
            )));
        }

        let client = self
            .hosts
            .client(&cluster)
            .await
            .map_err(ServiceError::Internal)?;

        // Claim the order item. The unique index on order_item_id makes this
        // the at-most-once gate under concurrent setup calls.
        let mut instance = VpsInstance {
            id: Uuid::new_v4(),
            user_id: order.user_id,
            plan_id: plan.id,
            order_item_id: item.id,
            vm_id: None,
            status: VpsStatus::Creating,
            expires_at: Utc::now(),
            auto_renew: false,
            created: Utc::now(),
            updated: Utc::now(),
        };
        match self.db.insert_instance(&instance).await {
            Ok(()) => {}
            Err(e) if e.is_unique_violation() => {
                let existing = self
                    .db
                    .get_instance_by_order_item(item.id)
                    .await?
                    .ok_or_else(|| ServiceError::Internal(anyhow!("Instance vanished")))?;
                return self.existing_result(existing).await;
            }
            Err(e) => return Err(e.into()),
        }

        let vmid = match retry_async(RetryPolicy::default(), || client.next_vmid()).await {
            Ok(v) => v,
            Err(e) => {
                self.mark_error(&mut instance).await;
                return Err(self.correlated(e));
            }
        };

        let ctx = BuildCtx {
            client: client.clone(),
            node: node.name.clone(),
            template_vmid: template.base_vmid,
            vmid,
            hostname: item.hostname.clone(),
            cores: plan.cpu,
            memory_mb: plan.memory_gb as u64 * 1024,
            disk_gb: plan.disk_gb,
            task_timeout: self.config.task_timeout(),
            stop_attempts: self.config.stop_attempts,
            stop_interval: self.config.stop_interval(),
        };

        if let Err(e) = self.build_vm(ctx).await {
            // the pipeline already rolled the clone back, this covers leftovers
            self.compensate(client.as_ref(), &node.name, vmid).await;
            self.mark_error(&mut instance).await;
            return Err(self.correlated(e));
        }

        // Guest IP discovery is best-effort, absence after the window is not fatal
        let guest = self.poll_guest_ip(client.as_ref(), &node.name, vmid).await;

        let username = template
            .default_user
            .clone()
            .unwrap_or_else(|| "root".to_string());
        let vm = HypervisorVm {
            id: Uuid::new_v4(),
            cluster_id: cluster.id,
            node_id: node.id,
            template_id: template.id,
            vmid,
            hostname: item.hostname.clone(),
            ip_address: guest.as_ref().map(|g| g.0.clone()),
            mac_address: guest.as_ref().map(|g| g.1.clone()),
            username,
            password: generate_password(16),
            vnc_password: generate_password(12),
            power_status: PowerStatus::Running,
            created: Utc::now(),
        };

        instance.vm_id = Some(vm.id);
        instance.status = VpsStatus::Active;
        instance.expires_at = Utc::now()
            .checked_add_days(Days::new(BILLING_MONTH_DAYS * item.duration_months as u64))
            .unwrap_or_else(Utc::now);
        instance.updated = Utc::now();

        if let Err(e) = self.db.attach_vm_and_activate(&vm, &instance).await {
            self.compensate(client.as_ref(), &node.name, vmid).await;
            self.mark_error(&mut instance).await;
            return Err(self.correlated(e.into()));
        }

        info!(
            "Provisioned VPS {} (vmid {}) for order item {}",
            instance.id, vmid, item.id
        );
        Ok(ProvisionedVps {
            instance,
            vm: Some(vm),
        })
    }

    async fn existing_result(&self, instance: VpsInstance) -> ServiceResult<ProvisionedVps> {
        let vm = match instance.vm_id {
            Some(vm_id) => Some(self.db.get_vm(vm_id).await?),
            None => None,
        };
        Ok(ProvisionedVps { instance, vm })
    }

    /// Clone, parameterize, grow the disk and boot, rolling the clone back if
    /// any later step fails.
    async fn build_vm(&self, ctx: BuildCtx) -> Result<(), anyhow::Error> {
        Pipeline::new(ctx)
            .step_with_rollback(
                "clone_template",
                |ctx| {
                    Box::pin(async move {
                        let task = ctx
                            .client
                            .clone_vm(&ctx.node, ctx.template_vmid, ctx.vmid, &ctx.hostname)
                            .await?;
                        wait_for_task(ctx.client.as_ref(), &task, ctx.task_timeout).await?;
                        Ok(())
                    })
                },
                |ctx| {
                    Box::pin(async move {
                        info!("Rolling back: deleting VM {}", ctx.vmid);
                        // the start task may already have been submitted, delete
                        // only once the VM verifiably reports stopped
                        ensure_stopped(
                            ctx.client.as_ref(),
                            &ctx.node,
                            ctx.vmid,
                            ctx.stop_attempts,
                            ctx.stop_interval,
                        )
                        .await?;
                        let task = ctx.client.delete_vm(&ctx.node, ctx.vmid).await?;
                        wait_for_task(ctx.client.as_ref(), &task, ctx.task_timeout).await?;
                        Ok(())
                    })
                },
            )
            .step("configure", |ctx| {
                Box::pin(async move {
                    ctx.client
                        .configure_vm(
                            &ctx.node,
                            ctx.vmid,
                            &VmConfigPatch {
                                cores: Some(ctx.cores),
                                memory_mb: Some(ctx.memory_mb),
                                name: Some(ctx.hostname.clone()),
                                on_boot: Some(true),
                            },
                        )
                        .await?;
                    Ok(())
                })
            })
            .step("resize_disk", |ctx| {
                Box::pin(async move {
                    let task = ctx
                        .client
                        .resize_disk(&ctx.node, ctx.vmid, "scsi0", &format!("{}G", ctx.disk_gb))
                        .await?;
                    wait_for_task(ctx.client.as_ref(), &task, ctx.task_timeout).await?;
                    Ok(())
                })
            })
            .step("start", |ctx| {
                Box::pin(async move {
                    let task = ctx.client.power(&ctx.node, ctx.vmid, PowerAction::Start).await?;
                    wait_for_task(ctx.client.as_ref(), &task, ctx.task_timeout).await?;
                    Ok(())
                })
            })
            .execute()
            .await?;
        Ok(())
    }

    /// Wait for the guest agent to report a usable IPv4 address
    async fn poll_guest_ip(
        &self,
        client: &dyn HypervisorClient,
        node: &str,
        vmid: u32,
    ) -> Option<(String, String)> {
        for _ in 0..self.config.guest_ip_attempts {
            match client.guest_ip(node, vmid).await {
                Ok(Some(entries)) if !entries.is_empty() => {
                    let first = &entries[0];
                    return Some((first.ip.to_string(), first.mac.clone()));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Error polling guest IP for VM {}: {}", vmid, e);
                }
            }
            sleep(self.config.guest_ip_interval()).await;
        }
        info!("VM {} reported no IP within the polling window", vmid);
        None
    }

    /// Best-effort teardown of a partially provisioned VM
    async fn compensate(&self, client: &dyn HypervisorClient, node: &str, vmid: u32) {
        if client.vm_status(node, vmid).await.is_err() {
            info!("VM {} does not exist, skipping teardown", vmid);
            return;
        }
        if let Err(e) = ensure_stopped(
            client,
            node,
            vmid,
            self.config.stop_attempts,
            self.config.stop_interval(),
        )
        .await
        {
            warn!("Compensation: VM {} did not stop: {}", vmid, e);
        }
        match client.delete_vm(node, vmid).await {
            Ok(task) => {
                if let Err(e) = wait_for_task(client, &task, self.config.task_timeout()).await {
                    warn!("Compensation: delete of VM {} failed: {}", vmid, e);
                }
            }
            Err(e) => warn!("Compensation: could not delete VM {}: {}", vmid, e),
        }
    }

    async fn mark_error(&self, instance: &mut VpsInstance) {
        instance.status = VpsStatus::Error;
        instance.updated = Utc::now();
        if let Err(e) = self.db.update_instance(instance).await {
            error!("Failed to record error state for {}: {}", instance.id, e);
        }
    }

    fn correlated(&self, e: anyhow::Error) -> ServiceError {
        let correlation = Uuid::new_v4();
        error!("Provisioning failed ({}): {:#}", correlation, e);
        ServiceError::Internal(anyhow!("Provisioning failed, correlation id {}", correlation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockDb, MockHypervisor};
    use crate::settings::mock_settings;
    use vpsrent_db::OrderStatus;

    async fn setup(
        hypervisor: Arc<MockHypervisor>,
    ) -> (Arc<MockDb>, Provisioner, User, Order, OrderItem) {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("buyer@example.com").await;
        let (plan, template) = db.add_catalog().await;
        let (mut order, item) = db.add_paid_order_with_item(&user, &plan, &template).await;
        order.status = OrderStatus::Paid;
        db.update_order(&order).await.unwrap();

        let cluster_id = template.cluster_id;
        let hosts = Arc::new(HostRegistry::with_client(cluster_id, hypervisor));
        let provisioner = Provisioner::new(db.clone(), hosts, mock_settings().hypervisor);
        (db, provisioner, user, order, item)
    }

    #[tokio::test]
    async fn happy_path_provisions_active_instance() {
        let hv = Arc::new(MockHypervisor::default());
        hv.set_guest_ip("10.10.7.42", "bc:24:11:aa:bb:cc").await;
        let (db, provisioner, user, order, item) = setup(hv.clone()).await;

        let (_, results) = provisioner
            .setup_order(&user, &order.order_number)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        let vps = &results[0];
        assert_eq!(vps.instance.status, VpsStatus::Active);
        let vm = vps.vm.as_ref().unwrap();
        assert_eq!(vm.ip_address.as_deref(), Some("10.10.7.42"));
        assert!(!vm.password.is_empty());

        // expiry is duration_months x 30 days out
        let expected = Utc::now()
            .checked_add_days(Days::new(30 * item.duration_months as u64))
            .unwrap();
        let delta = (vps.instance.expires_at - expected).num_seconds().abs();
        assert!(delta < 10, "expires_at off by {}s", delta);

        assert_eq!(hv.clone_calls().await, 1);
        let stored = db.get_instance_by_order_item(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, VpsStatus::Active);
    }

    #[tokio::test]
    async fn second_setup_returns_same_instance() {
        let hv = Arc::new(MockHypervisor::default());
        hv.set_guest_ip("10.10.7.42", "bc:24:11:aa:bb:cc").await;
        let (_db, provisioner, user, order, _item) = setup(hv.clone()).await;

        let (_, first) = provisioner
            .setup_order(&user, &order.order_number)
            .await
            .unwrap();
        let (_, second) = provisioner
            .setup_order(&user, &order.order_number)
            .await
            .unwrap();

        assert_eq!(first[0].instance.id, second[0].instance.id);
        assert_eq!(hv.clone_calls().await, 1);
    }

    #[tokio::test]
    async fn unpaid_order_is_rejected() {
        let hv = Arc::new(MockHypervisor::default());
        let (db, provisioner, user, mut order, _item) = setup(hv).await;
        order.status = OrderStatus::Pending;
        db.update_order(&order).await.unwrap();

        let err = provisioner
            .setup_order(&user, &order.order_number)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn clone_failure_compensates_and_marks_error() {
        let hv = Arc::new(MockHypervisor::default());
        hv.fail_clone().await;
        let (db, provisioner, user, order, item) = setup(hv.clone()).await;

        let err = provisioner
            .setup_order(&user, &order.order_number)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));

        let instance = db.get_instance_by_order_item(item.id).await.unwrap().unwrap();
        assert_eq!(instance.status, VpsStatus::Error);
        assert!(instance.vm_id.is_none());
    }

    #[tokio::test]
    async fn late_step_failure_rolls_back_clone() {
        let hv = Arc::new(MockHypervisor::default());
        hv.fail_resize().await;
        let (db, provisioner, user, order, item) = setup(hv.clone()).await;

        let err = provisioner
            .setup_order(&user, &order.order_number)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));

        // the cloned VM was verifiably stopped and deleted again
        assert_eq!(hv.clone_calls().await, 1);
        assert_eq!(hv.delete_calls().await.len(), 1);
        let instance = db.get_instance_by_order_item(item.id).await.unwrap().unwrap();
        assert_eq!(instance.status, VpsStatus::Error);
        assert!(instance.vm_id.is_none());
    }

    #[tokio::test]
    async fn missing_guest_ip_still_activates() {
        let hv = Arc::new(MockHypervisor::default());
        // no guest IP scripted: agent never becomes ready
        let (_db, provisioner, user, order, _item) = setup(hv).await;

        let (_, results) = provisioner
            .setup_order(&user, &order.order_number)
            .await
            .unwrap();
        let vps = &results[0];
        assert_eq!(vps.instance.status, VpsStatus::Active);
        assert!(vps.vm.as_ref().unwrap().ip_address.is_none());
    }
}
