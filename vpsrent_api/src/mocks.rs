#![allow(unused)]
use crate::host::{
    GuestIpEntry, HypervisorClient, NodeInfo, PowerAction, SnapshotEntry, StorageInfo, TaskId,
    TaskState, TaskStatus, VersionInfo, VmConfigPatch, VmPowerState, VmStatusInfo, VncProxyInfo,
};
use crate::retry::{OpError, OpResult};
use async_trait::async_trait;
use chrono::{DateTime, Days, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vpsrent_db::{
    Cluster, DbError, DbResult, DiskType, HypervisorVm, Node, NodeAllocation, NodeStorage, Order,
    OrderItem, OrderStatus, PaymentTransaction, PlanCategory, PowerStatus, Promotion, UserPromotion,
    UserRole, VmSnapshot, VmTemplate, VpsInstance, VpsPlan, VpsRentDb, VpsStatus, User,
};

fn not_found() -> DbError {
    DbError::not_found()
}

/// In-memory database for tests
#[derive(Default)]
pub struct MockDb {
    pub users: Mutex<HashMap<Uuid, User>>,
    pub plans: Mutex<HashMap<Uuid, VpsPlan>>,
    pub templates: Mutex<HashMap<Uuid, VmTemplate>>,
    pub clusters: Mutex<HashMap<Uuid, Cluster>>,
    pub nodes: Mutex<HashMap<Uuid, Node>>,
    pub storages: Mutex<HashMap<Uuid, NodeStorage>>,
    pub orders: Mutex<HashMap<Uuid, Order>>,
    pub order_items: Mutex<HashMap<Uuid, OrderItem>>,
    pub payments: Mutex<HashMap<Uuid, PaymentTransaction>>,
    pub instances: Mutex<HashMap<Uuid, VpsInstance>>,
    pub vms: Mutex<HashMap<Uuid, HypervisorVm>>,
    pub snapshots: Mutex<HashMap<Uuid, VmSnapshot>>,
    pub promotions: Mutex<HashMap<Uuid, Promotion>>,
    pub user_promotions: Mutex<HashMap<Uuid, UserPromotion>>,
    next_vmid: Mutex<u32>,
}

impl MockDb {
    pub async fn add_user(&self, email: &str) -> User {
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: String::new(),
            role: UserRole::User,
            email_verified_at: Some(Utc::now()),
            verify_token: String::new(),
            reset_token: String::new(),
            created: Utc::now(),
        };
        self.users.lock().await.insert(user.id, user.clone());
        user
    }

    pub async fn add_admin(&self, email: &str) -> User {
        let mut user = self.add_user(email).await;
        user.role = UserRole::Admin;
        self.users.lock().await.insert(user.id, user.clone());
        user
    }

    /// One cluster, node, storage, plan and template
    pub async fn add_catalog(&self) -> (VpsPlan, VmTemplate) {
        let cluster = Cluster {
            id: Uuid::new_v4(),
            name: "mock-cluster".to_string(),
            host: "https://localhost:8006".to_string(),
            api_token: "mock@pve!token=mock".to_string(),
            verify_tls: false,
            enabled: true,
        };
        let node = Node {
            id: Uuid::new_v4(),
            cluster_id: cluster.id,
            name: "pve1".to_string(),
            cpu_total: 32,
            memory_gb_total: 128,
            cpu_overcommit: 2.0,
            memory_overcommit: 1.5,
            enabled: true,
        };
        let storage = NodeStorage {
            id: Uuid::new_v4(),
            node_id: node.id,
            name: "local-lvm".to_string(),
            shared: false,
            enabled: true,
        };
        let plan = VpsPlan {
            id: Uuid::new_v4(),
            name: "Standard 2".to_string(),
            category: PlanCategory::Standard,
            cpu: 2,
            memory_gb: 4,
            disk_gb: 80,
            disk_type: DiskType::SSD,
            bandwidth_mbps: 500,
            monthly_price: 150000,
            currency: "VND".to_string(),
            max_snapshots: 3,
            max_ips: 1,
            enabled: true,
            created: Utc::now(),
        };
        let template = VmTemplate {
            id: Uuid::new_v4(),
            name: "ubuntu-24.04".to_string(),
            cluster_id: cluster.id,
            node_id: node.id,
            storage_id: storage.id,
            base_vmid: 9000,
            os_family: "ubuntu".to_string(),
            os_version: "24.04".to_string(),
            cloud_init: true,
            default_user: Some("ubuntu".to_string()),
            enabled: true,
            created: Utc::now(),
        };
        self.clusters.lock().await.insert(cluster.id, cluster);
        self.nodes.lock().await.insert(node.id, node);
        self.storages.lock().await.insert(storage.id, storage);
        self.plans.lock().await.insert(plan.id, plan.clone());
        self.templates
            .lock()
            .await
            .insert(template.id, template.clone());
        (plan, template)
    }

    /// First plan and template previously added with [add_catalog]
    pub async fn catalog(&self) -> (VpsPlan, VmTemplate) {
        let plan = self
            .plans
            .lock()
            .await
            .values()
            .next()
            .cloned()
            .expect("catalog not seeded");
        let template = self
            .templates
            .lock()
            .await
            .values()
            .next()
            .cloned()
            .expect("catalog not seeded");
        (plan, template)
    }

    pub async fn add_pending_order(&self, user: &User, price: u64) -> Order {
        let order = Order {
            id: Uuid::new_v4(),
            order_number: crate::orders::generate_order_number(),
            user_id: user.id,
            price,
            status: OrderStatus::Pending,
            promotion_id: None,
            billing_phone: None,
            billing_address: None,
            created: Utc::now(),
            updated: Utc::now(),
        };
        self.orders.lock().await.insert(order.id, order.clone());
        order
    }

    pub async fn add_paid_order_with_item(
        &self,
        user: &User,
        plan: &VpsPlan,
        template: &VmTemplate,
    ) -> (Order, OrderItem) {
        let mut order = self.add_pending_order(user, plan.monthly_price).await;
        order.status = OrderStatus::Paid;
        self.orders.lock().await.insert(order.id, order.clone());
        let item = OrderItem {
            id: Uuid::new_v4(),
            order_id: order.id,
            plan_id: plan.id,
            template_id: template.id,
            hostname: "vps-test".to_string(),
            duration_months: 1,
            unit_price: plan.monthly_price,
            total_price: plan.monthly_price,
            configuration: "{}".to_string(),
            created: Utc::now(),
        };
        self.order_items.lock().await.insert(item.id, item.clone());
        (order, item)
    }

    pub async fn add_promotion(&self, promotion: Promotion) {
        self.promotions
            .lock()
            .await
            .insert(promotion.id, promotion);
    }

    pub async fn add_user_promotion(&self, promotion_id: Uuid, user_id: Uuid) {
        let up = UserPromotion {
            id: Uuid::new_v4(),
            user_id,
            promotion_id,
            order_id: Uuid::new_v4(),
            used_at: Utc::now(),
        };
        self.user_promotions.lock().await.insert(up.id, up);
    }

    /// Active instance with a running VM, registered on the mock hypervisor
    pub async fn add_active_instance(
        &self,
        user: &User,
        plan: &VpsPlan,
        template: &VmTemplate,
        hypervisor: &MockHypervisor,
    ) -> (VpsInstance, HypervisorVm) {
        let (_, item) = self.add_paid_order_with_item(user, plan, template).await;
        let vmid = {
            let mut next = self.next_vmid.lock().await;
            *next += 1;
            100 + *next
        };
        hypervisor.register_vm(vmid).await;
        let vm = HypervisorVm {
            id: Uuid::new_v4(),
            cluster_id: template.cluster_id,
            node_id: template.node_id,
            template_id: template.id,
            vmid,
            hostname: format!("vps-{}", vmid),
            ip_address: Some("10.0.0.2".to_string()),
            mac_address: Some("bc:24:11:00:00:01".to_string()),
            username: "ubuntu".to_string(),
            password: "mock-password".to_string(),
            vnc_password: "mock-vnc".to_string(),
            power_status: PowerStatus::Running,
            created: Utc::now(),
        };
        let instance = VpsInstance {
            id: Uuid::new_v4(),
            user_id: user.id,
            plan_id: plan.id,
            order_item_id: item.id,
            vm_id: Some(vm.id),
            status: VpsStatus::Active,
            expires_at: Utc::now().checked_add_days(Days::new(30)).unwrap(),
            auto_renew: false,
            created: Utc::now(),
            updated: Utc::now(),
        };
        self.vms.lock().await.insert(vm.id, vm.clone());
        self.instances
            .lock()
            .await
            .insert(instance.id, instance.clone());
        (instance, vm)
    }
}

#[async_trait]
impl VpsRentDb for MockDb {
    async fn migrate(&self) -> DbResult<()> {
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> DbResult<()> {
        let mut users = self.users.lock().await;
        if users.values().any(|u| u.email == user.email) {
            return Err(DbError::message("duplicate email"));
        }
        users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> DbResult<User> {
        self.users.lock().await.get(&id).cloned().ok_or_else(not_found)
    }

    async fn get_user_by_email(&self, email: &str) -> DbResult<User> {
        self.users
            .lock()
            .await
            .values()
            .find(|u| u.email == email)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn get_user_by_verify_token(&self, token: &str) -> DbResult<User> {
        self.users
            .lock()
            .await
            .values()
            .find(|u| !u.verify_token.is_empty() && u.verify_token == token)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn get_user_by_reset_token(&self, token: &str) -> DbResult<User> {
        self.users
            .lock()
            .await
            .values()
            .find(|u| !u.reset_token.is_empty() && u.reset_token == token)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn update_user(&self, user: &User) -> DbResult<()> {
        self.users.lock().await.insert(user.id, user.clone());
        Ok(())
    }

    async fn count_users(&self) -> DbResult<u64> {
        Ok(self.users.lock().await.len() as u64)
    }

    async fn get_plan(&self, id: Uuid) -> DbResult<VpsPlan> {
        self.plans.lock().await.get(&id).cloned().ok_or_else(not_found)
    }

    async fn list_plans(&self) -> DbResult<Vec<VpsPlan>> {
        let mut plans: Vec<_> = self
            .plans
            .lock()
            .await
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect();
        plans.sort_by_key(|p| p.monthly_price);
        Ok(plans)
    }

    async fn get_template(&self, id: Uuid) -> DbResult<VmTemplate> {
        self.templates
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn list_templates(&self) -> DbResult<Vec<VmTemplate>> {
        Ok(self
            .templates
            .lock()
            .await
            .values()
            .filter(|t| t.enabled)
            .cloned()
            .collect())
    }

    async fn get_cluster(&self, id: Uuid) -> DbResult<Cluster> {
        self.clusters
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn get_node(&self, id: Uuid) -> DbResult<Node> {
        self.nodes.lock().await.get(&id).cloned().ok_or_else(not_found)
    }

    async fn get_node_by_name(&self, name: &str) -> DbResult<Node> {
        self.nodes
            .lock()
            .await
            .values()
            .find(|n| n.name == name)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn get_storage(&self, id: Uuid) -> DbResult<NodeStorage> {
        self.storages
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn node_allocation(&self, node_id: Uuid) -> DbResult<NodeAllocation> {
        let instances = self.instances.lock().await;
        let vms = self.vms.lock().await;
        let plans = self.plans.lock().await;
        let mut alloc = NodeAllocation::default();
        for instance in instances.values() {
            if instance.status.is_terminal() {
                continue;
            }
            let Some(vm_id) = instance.vm_id else {
                continue;
            };
            let Some(vm) = vms.get(&vm_id) else {
                continue;
            };
            if vm.node_id != node_id {
                continue;
            }
            if let Some(plan) = plans.get(&instance.plan_id) {
                alloc.cpu += plan.cpu as u64;
                alloc.memory_gb += plan.memory_gb as u64;
                alloc.instances += 1;
            }
        }
        Ok(alloc)
    }

    async fn insert_order(&self, order: &Order) -> DbResult<()> {
        let mut orders = self.orders.lock().await;
        if orders
            .values()
            .any(|o| o.order_number == order.order_number)
        {
            return Err(DbError::message("duplicate order number"));
        }
        orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> DbResult<Order> {
        self.orders.lock().await.get(&id).cloned().ok_or_else(not_found)
    }

    async fn get_order_by_number(&self, order_number: &str) -> DbResult<Order> {
        self.orders
            .lock()
            .await
            .values()
            .find(|o| o.order_number == order_number)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn list_user_orders(&self, user_id: Uuid) -> DbResult<Vec<Order>> {
        let mut orders: Vec<_> = self
            .orders
            .lock()
            .await
            .values()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(orders)
    }

    async fn update_order(&self, order: &Order) -> DbResult<()> {
        self.orders.lock().await.insert(order.id, order.clone());
        Ok(())
    }

    async fn count_orders_by_status(&self, status: OrderStatus) -> DbResult<u64> {
        Ok(self
            .orders
            .lock()
            .await
            .values()
            .filter(|o| o.status == status)
            .count() as u64)
    }

    async fn insert_order_item(&self, item: &OrderItem) -> DbResult<()> {
        self.order_items.lock().await.insert(item.id, item.clone());
        Ok(())
    }

    async fn get_order_item(&self, id: Uuid) -> DbResult<OrderItem> {
        self.order_items
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn list_order_items(&self, order_id: Uuid) -> DbResult<Vec<OrderItem>> {
        Ok(self
            .order_items
            .lock()
            .await
            .values()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn insert_payment(&self, payment: &PaymentTransaction) -> DbResult<()> {
        self.payments
            .lock()
            .await
            .insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment_by_txn_id(&self, txn_id: &str) -> DbResult<PaymentTransaction> {
        self.payments
            .lock()
            .await
            .values()
            .find(|p| p.txn_id == txn_id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn update_payment(&self, payment: &PaymentTransaction) -> DbResult<()> {
        self.payments
            .lock()
            .await
            .insert(payment.id, payment.clone());
        Ok(())
    }

    async fn list_order_payments(&self, order_id: Uuid) -> DbResult<Vec<PaymentTransaction>> {
        let mut payments: Vec<_> = self
            .payments
            .lock()
            .await
            .values()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(payments)
    }

    async fn settle_payment(
        &self,
        payment: &PaymentTransaction,
        order: &Order,
        promo: Option<&UserPromotion>,
    ) -> DbResult<()> {
        self.update_payment(payment).await?;
        self.update_order(order).await?;
        if let Some(p) = promo {
            self.user_promotions.lock().await.insert(p.id, p.clone());
        }
        Ok(())
    }

    async fn total_revenue(&self) -> DbResult<u64> {
        Ok(self
            .payments
            .lock()
            .await
            .values()
            .filter(|p| p.status == vpsrent_db::PaymentStatus::Completed)
            .map(|p| p.amount)
            .sum())
    }

    async fn insert_instance(&self, instance: &VpsInstance) -> DbResult<()> {
        let mut instances = self.instances.lock().await;
        if instances
            .values()
            .any(|i| i.order_item_id == instance.order_item_id)
        {
            return Err(DbError::message("duplicate order item instance"));
        }
        instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> DbResult<VpsInstance> {
        self.instances
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(not_found)
    }

    async fn get_instance_by_order_item(
        &self,
        item_id: Uuid,
    ) -> DbResult<Option<VpsInstance>> {
        Ok(self
            .instances
            .lock()
            .await
            .values()
            .find(|i| i.order_item_id == item_id)
            .cloned())
    }

    async fn list_user_instances(&self, user_id: Uuid) -> DbResult<Vec<VpsInstance>> {
        let mut instances: Vec<_> = self
            .instances
            .lock()
            .await
            .values()
            .filter(|i| i.user_id == user_id && !i.status.is_terminal())
            .cloned()
            .collect();
        instances.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(instances)
    }

    async fn list_expired_active(&self, now: DateTime<Utc>) -> DbResult<Vec<VpsInstance>> {
        Ok(self
            .instances
            .lock()
            .await
            .values()
            .filter(|i| i.status == VpsStatus::Active && i.expires_at < now)
            .cloned()
            .collect())
    }

    async fn list_suspended_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<VpsInstance>> {
        Ok(self
            .instances
            .lock()
            .await
            .values()
            .filter(|i| i.status == VpsStatus::Suspended && i.expires_at < cutoff)
            .cloned()
            .collect())
    }

    async fn update_instance(&self, instance: &VpsInstance) -> DbResult<()> {
        self.instances
            .lock()
            .await
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn count_instances_by_status(&self, status: VpsStatus) -> DbResult<u64> {
        Ok(self
            .instances
            .lock()
            .await
            .values()
            .filter(|i| i.status == status)
            .count() as u64)
    }

    async fn attach_vm_and_activate(
        &self,
        vm: &HypervisorVm,
        instance: &VpsInstance,
    ) -> DbResult<()> {
        self.vms.lock().await.insert(vm.id, vm.clone());
        self.update_instance(instance).await
    }

    async fn get_vm(&self, id: Uuid) -> DbResult<HypervisorVm> {
        self.vms.lock().await.get(&id).cloned().ok_or_else(not_found)
    }

    async fn update_vm(&self, vm: &HypervisorVm) -> DbResult<()> {
        self.vms.lock().await.insert(vm.id, vm.clone());
        Ok(())
    }

    async fn delete_vm(&self, id: Uuid) -> DbResult<()> {
        self.vms.lock().await.remove(&id);
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &VmSnapshot) -> DbResult<()> {
        self.snapshots
            .lock()
            .await
            .insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn list_vm_snapshots(&self, vm_id: Uuid) -> DbResult<Vec<VmSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .await
            .values()
            .filter(|s| s.vm_id == vm_id)
            .cloned()
            .collect())
    }

    async fn get_snapshot_by_name(
        &self,
        vm_id: Uuid,
        name: &str,
    ) -> DbResult<Option<VmSnapshot>> {
        Ok(self
            .snapshots
            .lock()
            .await
            .values()
            .find(|s| s.vm_id == vm_id && s.name == name)
            .cloned())
    }

    async fn update_snapshot(&self, snapshot: &VmSnapshot) -> DbResult<()> {
        self.snapshots
            .lock()
            .await
            .insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn delete_snapshot(&self, id: Uuid) -> DbResult<()> {
        self.snapshots.lock().await.remove(&id);
        Ok(())
    }

    async fn get_promotion_by_code(&self, code: &str) -> DbResult<Option<Promotion>> {
        Ok(self
            .promotions
            .lock()
            .await
            .values()
            .find(|p| p.code == code)
            .cloned())
    }

    async fn count_promotion_usage(&self, promotion_id: Uuid) -> DbResult<u64> {
        Ok(self
            .user_promotions
            .lock()
            .await
            .values()
            .filter(|u| u.promotion_id == promotion_id)
            .count() as u64)
    }

    async fn count_user_promotion_usage(
        &self,
        promotion_id: Uuid,
        user_id: Uuid,
    ) -> DbResult<u64> {
        Ok(self
            .user_promotions
            .lock()
            .await
            .values()
            .filter(|u| u.promotion_id == promotion_id && u.user_id == user_id)
            .count() as u64)
    }
}

#[derive(Debug, Clone)]
struct MockVm {
    running: bool,
    snapshots: Vec<SnapshotEntry>,
}

#[derive(Debug, Default)]
struct MockState {
    next_vmid: u32,
    vms: HashMap<u32, MockVm>,
    guest_ip: Option<(String, String)>,
    fail_clone: bool,
    fail_resize: bool,
    fail_stop: HashSet<u32>,
    clone_calls: u32,
    snapshot_create_calls: u32,
    delete_calls: Vec<u32>,
    task_counter: u64,
}

/// Scripted hypervisor for tests. Tasks complete instantly and counters track
/// which operations were actually issued.
#[derive(Default)]
pub struct MockHypervisor {
    state: Mutex<MockState>,
}

impl MockHypervisor {
    pub async fn register_vm(&self, vmid: u32) {
        self.state.lock().await.vms.insert(
            vmid,
            MockVm {
                running: true,
                snapshots: Vec::new(),
            },
        );
    }

    pub async fn set_guest_ip(&self, ip: &str, mac: &str) {
        self.state.lock().await.guest_ip = Some((ip.to_string(), mac.to_string()));
    }

    pub async fn fail_clone(&self) {
        self.state.lock().await.fail_clone = true;
    }

    pub async fn fail_resize(&self) {
        self.state.lock().await.fail_resize = true;
    }

    /// Make stop requests for this vmid be accepted but never take effect
    pub async fn fail_stop(&self, vmid: u32) {
        self.state.lock().await.fail_stop.insert(vmid);
    }

    pub async fn clone_calls(&self) -> u32 {
        self.state.lock().await.clone_calls
    }

    pub async fn snapshot_create_calls(&self) -> u32 {
        self.state.lock().await.snapshot_create_calls
    }

    pub async fn delete_calls(&self) -> Vec<u32> {
        self.state.lock().await.delete_calls.clone()
    }

    pub async fn is_stopped(&self, vmid: u32) -> bool {
        self.state
            .lock()
            .await
            .vms
            .get(&vmid)
            .map(|vm| !vm.running)
            .unwrap_or(false)
    }

    fn task(state: &mut MockState, node: &str) -> TaskId {
        state.task_counter += 1;
        TaskId {
            id: format!("UPID:mock:{:08x}", state.task_counter),
            node: node.to_string(),
        }
    }
}

#[async_trait]
impl HypervisorClient for MockHypervisor {
    async fn version(&self) -> OpResult<VersionInfo> {
        Ok(VersionInfo {
            version: "8.2".to_string(),
            release: "mock".to_string(),
        })
    }

    async fn list_nodes(&self) -> OpResult<Vec<NodeInfo>> {
        Ok(vec![NodeInfo {
            name: "pve1".to_string(),
            online: true,
            max_cpu: Some(32),
            max_mem: Some(128 * 1024 * 1024 * 1024),
            uptime: Some(86400),
        }])
    }

    async fn list_storage(&self, _node: &str) -> OpResult<Vec<StorageInfo>> {
        Ok(vec![StorageInfo {
            name: "local-lvm".to_string(),
            total: Some(1 << 40),
            used: Some(1 << 38),
            shared: false,
        }])
    }

    async fn next_vmid(&self) -> OpResult<u32> {
        let mut state = self.state.lock().await;
        state.next_vmid += 1;
        Ok(100 + state.next_vmid)
    }

    async fn clone_vm(
        &self,
        node: &str,
        _template_vmid: u32,
        new_vmid: u32,
        _name: &str,
    ) -> OpResult<TaskId> {
        let mut state = self.state.lock().await;
        if state.fail_clone {
            return Err(OpError::Fatal(anyhow::anyhow!("mock clone failure")));
        }
        state.clone_calls += 1;
        state.vms.insert(
            new_vmid,
            MockVm {
                running: false,
                snapshots: Vec::new(),
            },
        );
        Ok(Self::task(&mut state, node))
    }

    async fn configure_vm(
        &self,
        _node: &str,
        vmid: u32,
        _patch: &VmConfigPatch,
    ) -> OpResult<()> {
        let state = self.state.lock().await;
        if !state.vms.contains_key(&vmid) {
            return Err(OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)));
        }
        Ok(())
    }

    async fn resize_disk(
        &self,
        node: &str,
        vmid: u32,
        _disk: &str,
        _size: &str,
    ) -> OpResult<TaskId> {
        let mut state = self.state.lock().await;
        if state.fail_resize {
            return Err(OpError::Fatal(anyhow::anyhow!("mock resize failure")));
        }
        if !state.vms.contains_key(&vmid) {
            return Err(OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)));
        }
        Ok(Self::task(&mut state, node))
    }

    async fn power(&self, node: &str, vmid: u32, action: PowerAction) -> OpResult<TaskId> {
        let mut state = self.state.lock().await;
        let blocked = state.fail_stop.contains(&vmid);
        let vm = state
            .vms
            .get_mut(&vmid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)))?;
        match action {
            PowerAction::Start | PowerAction::Resume | PowerAction::Reboot | PowerAction::Reset => {
                vm.running = true;
            }
            PowerAction::Stop | PowerAction::Shutdown => {
                if !blocked {
                    vm.running = false;
                }
            }
            PowerAction::Suspend => {}
        }
        Ok(Self::task(&mut state, node))
    }

    async fn delete_vm(&self, node: &str, vmid: u32) -> OpResult<TaskId> {
        let mut state = self.state.lock().await;
        if state.vms.remove(&vmid).is_none() {
            return Err(OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)));
        }
        state.delete_calls.push(vmid);
        Ok(Self::task(&mut state, node))
    }

    async fn vm_status(&self, _node: &str, vmid: u32) -> OpResult<VmStatusInfo> {
        let state = self.state.lock().await;
        let vm = state
            .vms
            .get(&vmid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)))?;
        Ok(VmStatusInfo {
            state: if vm.running {
                VmPowerState::Running
            } else {
                VmPowerState::Stopped
            },
            uptime: Some(if vm.running { 3600 } else { 0 }),
            cpu: Some(0.02),
            mem: Some(512 << 20),
            max_mem: Some(4 << 30),
            net_in: Some(1024),
            net_out: Some(2048),
        })
    }

    async fn guest_ip(&self, _node: &str, _vmid: u32) -> OpResult<Option<Vec<GuestIpEntry>>> {
        let state = self.state.lock().await;
        Ok(state.guest_ip.as_ref().map(|(ip, mac)| {
            vec![GuestIpEntry {
                ip: ip.parse().expect("mock ip is valid"),
                mac: mac.clone(),
            }]
        }))
    }

    async fn vnc_proxy(&self, _node: &str, vmid: u32) -> OpResult<VncProxyInfo> {
        let state = self.state.lock().await;
        if !state.vms.contains_key(&vmid) {
            return Err(OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)));
        }
        Ok(VncProxyInfo {
            port: 5900,
            ticket: "PVEVNC:MOCKTICKET".to_string(),
            cert: None,
            expires_in: 7200,
        })
    }

    async fn list_snapshots(&self, _node: &str, vmid: u32) -> OpResult<Vec<SnapshotEntry>> {
        let state = self.state.lock().await;
        let vm = state
            .vms
            .get(&vmid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)))?;
        let mut entries = vm.snapshots.clone();
        // the hypervisor always reports the synthetic live-state entry
        entries.push(SnapshotEntry {
            name: "current".to_string(),
            description: Some("You are here!".to_string()),
            snaptime: None,
            parent: entries.last().map(|s| s.name.clone()),
        });
        Ok(entries)
    }

    async fn create_snapshot(
        &self,
        node: &str,
        vmid: u32,
        name: &str,
        description: Option<&str>,
    ) -> OpResult<TaskId> {
        let mut state = self.state.lock().await;
        state.snapshot_create_calls += 1;
        let vm = state
            .vms
            .get_mut(&vmid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)))?;
        if vm.snapshots.iter().any(|s| s.name == name) {
            return Err(OpError::Fatal(anyhow::anyhow!(
                "Snapshot {} already exists",
                name
            )));
        }
        vm.snapshots.push(SnapshotEntry {
            name: name.to_string(),
            description: description.map(|d| d.to_string()),
            snaptime: Some(1_700_000_000),
            parent: None,
        });
        Ok(Self::task(&mut state, node))
    }

    async fn rollback_snapshot(&self, node: &str, vmid: u32, name: &str) -> OpResult<TaskId> {
        let mut state = self.state.lock().await;
        let vm = state
            .vms
            .get(&vmid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)))?;
        if !vm.snapshots.iter().any(|s| s.name == name) {
            return Err(OpError::Fatal(anyhow::anyhow!("Snapshot {} not found", name)));
        }
        Ok(Self::task(&mut state, node))
    }

    async fn delete_snapshot(&self, node: &str, vmid: u32, name: &str) -> OpResult<TaskId> {
        let mut state = self.state.lock().await;
        let vm = state
            .vms
            .get_mut(&vmid)
            .ok_or_else(|| OpError::Fatal(anyhow::anyhow!("VM {} not found", vmid)))?;
        let before = vm.snapshots.len();
        vm.snapshots.retain(|s| s.name != name);
        if vm.snapshots.len() == before {
            return Err(OpError::Fatal(anyhow::anyhow!("Snapshot {} not found", name)));
        }
        Ok(Self::task(&mut state, node))
    }

    async fn task_status(&self, _task: &TaskId) -> OpResult<TaskStatus> {
        Ok(TaskStatus {
            state: TaskState::Finished,
            exit_status: Some("OK".to_string()),
        })
    }

    async fn rrd_data(
        &self,
        _node: &str,
        _vmid: u32,
        _timeframe: &str,
        _cf: &str,
    ) -> OpResult<Vec<serde_json::Value>> {
        Ok(vec![
            serde_json::json!({"time": 1700000000, "cpu": 0.02, "mem": 536870912}),
            serde_json::json!({"time": 1700000060, "cpu": 0.03, "mem": 536870912}),
        ])
    }
}
