use crate::host::PowerAction;
use crate::lifecycle::{LiveStatus, VpsInfo};
use crate::provisioner::ProvisionedVps;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vpsrent_db::{Order, OrderItem, PaymentTransaction, VpsInstance, VpsPlan};

// -- auth

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    /// Seconds until the access token expires
    pub expires_in: u64,
}

#[derive(Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

// -- catalog

#[derive(Serialize)]
pub struct ApiPlan {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub cpu: u16,
    pub memory_gb: u32,
    pub disk_gb: u32,
    pub disk_type: String,
    pub bandwidth_mbps: u32,
    pub monthly_price: u64,
    pub currency: String,
    pub max_snapshots: u32,
    pub max_ips: u32,
}

impl From<VpsPlan> for ApiPlan {
    fn from(p: VpsPlan) -> Self {
        ApiPlan {
            id: p.id,
            name: p.name,
            category: format!("{:?}", p.category).to_lowercase(),
            cpu: p.cpu,
            memory_gb: p.memory_gb,
            disk_gb: p.disk_gb,
            disk_type: format!("{:?}", p.disk_type).to_lowercase(),
            bandwidth_mbps: p.bandwidth_mbps,
            monthly_price: p.monthly_price,
            currency: p.currency,
            max_snapshots: p.max_snapshots,
            max_ips: p.max_ips,
        }
    }
}

// -- orders

#[derive(Serialize)]
pub struct ApiOrderItem {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub template_id: Uuid,
    pub hostname: String,
    pub duration_months: u32,
    pub unit_price: u64,
    pub total_price: u64,
}

impl From<OrderItem> for ApiOrderItem {
    fn from(i: OrderItem) -> Self {
        ApiOrderItem {
            id: i.id,
            plan_id: i.plan_id,
            template_id: i.template_id,
            hostname: i.hostname,
            duration_months: i.duration_months,
            unit_price: i.unit_price,
            total_price: i.total_price,
        }
    }
}

#[derive(Serialize)]
pub struct ApiOrder {
    pub id: Uuid,
    pub order_number: String,
    pub price: u64,
    pub status: String,
    pub created: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<ApiOrderItem>,
}

impl ApiOrder {
    pub fn from(order: Order, items: Vec<OrderItem>) -> Self {
        ApiOrder {
            id: order.id,
            order_number: order.order_number,
            price: order.price,
            status: order.status.to_string(),
            created: order.created,
            items: items.into_iter().map(ApiOrderItem::from).collect(),
        }
    }
}

// -- payments

#[derive(Deserialize)]
pub struct PaymentRequest {
    pub order_number: String,
    pub return_url: Option<String>,
    pub bank_code: Option<String>,
}

#[derive(Serialize)]
pub struct ApiPayment {
    pub id: Uuid,
    pub txn_id: String,
    pub method: String,
    pub amount: u64,
    pub currency: String,
    pub status: String,
    pub created: DateTime<Utc>,
}

impl From<PaymentTransaction> for ApiPayment {
    fn from(p: PaymentTransaction) -> Self {
        ApiPayment {
            id: p.id,
            txn_id: p.txn_id,
            method: p.method.to_string(),
            amount: p.amount,
            currency: p.currency,
            status: format!("{:?}", p.status).to_lowercase(),
            created: p.created,
        }
    }
}

// -- vps

#[derive(Deserialize)]
pub struct VpsSetupRequest {
    pub order_number: String,
}

#[derive(Serialize)]
pub struct VpsCredentials {
    pub ip_address: String,
    pub username: String,
    pub password: String,
    pub ssh_port: u16,
}

#[derive(Serialize)]
pub struct VpsSetupItem {
    pub order_item_id: Uuid,
    pub vps_instance_id: Uuid,
    pub vmid: Option<u32>,
    pub hostname: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<VpsCredentials>,
}

impl From<ProvisionedVps> for VpsSetupItem {
    fn from(p: ProvisionedVps) -> Self {
        VpsSetupItem {
            order_item_id: p.instance.order_item_id,
            vps_instance_id: p.instance.id,
            vmid: p.vm.as_ref().map(|vm| vm.vmid),
            hostname: p.vm.as_ref().map(|vm| vm.hostname.clone()),
            status: p.instance.status.to_string(),
            credentials: p.vm.map(|vm| VpsCredentials {
                ip_address: vm.ip_address.unwrap_or_default(),
                username: vm.username,
                password: vm.password,
                ssh_port: 22,
            }),
        }
    }
}

#[derive(Serialize)]
pub struct VpsSetupResponse {
    pub success: bool,
    pub message: String,
    pub order_number: String,
    pub vps_list: Vec<VpsSetupItem>,
}

#[derive(Serialize)]
pub struct ApiVps {
    pub id: Uuid,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub auto_renew: bool,
    pub plan_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_status: Option<String>,
}

impl ApiVps {
    pub fn from_instance(instance: &VpsInstance) -> Self {
        ApiVps {
            id: instance.id,
            status: instance.status.to_string(),
            expires_at: instance.expires_at,
            auto_renew: instance.auto_renew,
            plan_id: instance.plan_id,
            hostname: None,
            ip_address: None,
            vmid: None,
            power_status: None,
        }
    }
}

impl From<&VpsInfo> for ApiVps {
    fn from(info: &VpsInfo) -> Self {
        let mut out = ApiVps::from_instance(&info.instance);
        if let Some(vm) = &info.vm {
            out.hostname = Some(vm.hostname.clone());
            out.ip_address = vm.ip_address.clone();
            out.vmid = Some(vm.vmid);
            out.power_status = Some(vm.power_status.to_string());
        }
        out
    }
}

#[derive(Serialize)]
pub struct ApiVpsDetail {
    #[serde(flatten)]
    pub vps: ApiVps,
    /// SSH login for the instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveStatus>,
}

impl From<VpsInfo> for ApiVpsDetail {
    fn from(info: VpsInfo) -> Self {
        let vps = ApiVps::from(&info);
        ApiVpsDetail {
            vps,
            username: info.vm.map(|vm| vm.username),
            live: info.live,
        }
    }
}

#[derive(Deserialize)]
pub struct PowerRequest {
    pub action: PowerAction,
}

#[derive(Serialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Deserialize)]
pub struct SnapshotCreateRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct SnapshotRestoreRequest {
    pub snapshot_name: String,
}

#[derive(Deserialize)]
pub struct RrdQuery {
    pub timeframe: Option<String>,
    pub cf: Option<String>,
}

// -- admin

#[derive(Serialize)]
pub struct DashboardStats {
    pub users: u64,
    pub orders_pending: u64,
    pub orders_paid: u64,
    pub orders_cancelled: u64,
    pub vps_active: u64,
    pub vps_suspended: u64,
    pub vps_terminated: u64,
    pub total_revenue: u64,
}
