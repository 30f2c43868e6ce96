use chrono::{DateTime, Utc};
use sqlx::FromRow;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum UserRole {
    #[default]
    User,
    Admin,
}

#[derive(FromRow, Clone, Debug, Default)]
/// Customers renting VPS instances
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// Salted password digest, `<salt-hex>$<digest-hex>`
    pub password_hash: String,
    pub role: UserRole,
    /// When the email address was verified, unverified users cannot order
    pub email_verified_at: Option<DateTime<Utc>>,
    /// One-shot token for email verification, empty when consumed
    pub verify_token: String,
    /// One-shot token for password reset, empty when consumed
    pub reset_token: String,
    pub created: DateTime<Utc>,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum PlanCategory {
    #[default]
    Basic,
    Standard,
    Premium,
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum DiskType {
    #[default]
    SSD,
    NVMe,
}

#[derive(FromRow, Clone, Debug, Default)]
/// Immutable catalog entry customers order from
pub struct VpsPlan {
    pub id: Uuid,
    pub name: String,
    pub category: PlanCategory,
    pub cpu: u16,
    /// RAM in GiB
    pub memory_gb: u32,
    /// Primary disk size in GiB
    pub disk_gb: u32,
    pub disk_type: DiskType,
    pub bandwidth_mbps: u32,
    /// Monthly price in the smallest unit of [currency]
    pub monthly_price: u64,
    pub currency: String,
    pub max_snapshots: u32,
    pub max_ips: u32,
    pub enabled: bool,
    pub created: DateTime<Utc>,
}

#[derive(FromRow, Clone, Debug, Default)]
/// A VM image on the hypervisor used as the clone source for new instances
pub struct VmTemplate {
    pub id: Uuid,
    pub name: String,
    pub cluster_id: Uuid,
    pub node_id: Uuid,
    pub storage_id: Uuid,
    /// vmid of the template VM on the hypervisor
    pub base_vmid: u32,
    pub os_family: String,
    pub os_version: String,
    pub cloud_init: bool,
    /// Default login user baked into the image
    pub default_user: Option<String>,
    pub enabled: bool,
    pub created: DateTime<Utc>,
}

#[derive(FromRow, Clone, Debug, Default)]
/// A hypervisor cluster endpoint
pub struct Cluster {
    pub id: Uuid,
    pub name: String,
    /// API endpoint, eg. https://pve1.example.com:8006
    pub host: String,
    /// API token used to authenticate, PVEAPIToken format
    pub api_token: String,
    /// Verify the TLS certificate of [host], self-signed clusters disable this
    pub verify_tls: bool,
    pub enabled: bool,
}

#[derive(FromRow, Clone, Debug, Default)]
pub struct Node {
    pub id: Uuid,
    pub cluster_id: Uuid,
    /// Node name as known to the hypervisor
    pub name: String,
    pub cpu_total: u32,
    /// Total memory in GiB
    pub memory_gb_total: u32,
    pub cpu_overcommit: f32,
    pub memory_overcommit: f32,
    pub enabled: bool,
}

#[derive(FromRow, Clone, Debug, Default)]
pub struct NodeStorage {
    pub id: Uuid,
    pub node_id: Uuid,
    /// Storage pool name on the hypervisor
    pub name: String,
    pub shared: bool,
    pub enabled: bool,
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    Pending,
    Paid,
    Cancelled,
}

impl Display for OrderStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "pending"),
            OrderStatus::Paid => write!(f, "paid"),
            OrderStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(FromRow, Clone, Debug, Default)]
pub struct Order {
    pub id: Uuid,
    /// Externally visible order number, `VPS-<base36 ms>-<rand6>`
    pub order_number: String,
    pub user_id: Uuid,
    /// Total price after discount, smallest currency unit
    pub price: u64,
    pub status: OrderStatus,
    /// Promotion applied at checkout, consumed when the order turns paid
    pub promotion_id: Option<Uuid>,
    pub billing_phone: Option<String>,
    pub billing_address: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(FromRow, Clone, Debug, Default)]
pub struct OrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub plan_id: Uuid,
    pub template_id: Uuid,
    pub hostname: String,
    pub duration_months: u32,
    pub unit_price: u64,
    pub total_price: u64,
    /// Snapshot of the plan resources at order time (JSON)
    pub configuration: String,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq, Hash)]
#[sqlx(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[default]
    MoMo,
    VnPay,
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PaymentMethod::MoMo => write!(f, "momo"),
            PaymentMethod::VnPay => write!(f, "vnpay"),
        }
    }
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

#[derive(FromRow, Clone, Debug, Default)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub order_id: Uuid,
    /// Gateway transaction reference, unique per attempt
    pub txn_id: String,
    pub method: PaymentMethod,
    pub amount: u64,
    pub currency: String,
    pub status: PaymentStatus,
    /// Raw gateway response body (JSON)
    pub gateway_response: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum VpsStatus {
    #[default]
    Creating,
    Active,
    Suspended,
    Terminated,
    Error,
}

impl VpsStatus {
    /// Terminal states admit no further transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, VpsStatus::Terminated | VpsStatus::Error)
    }
}

impl Display for VpsStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VpsStatus::Creating => write!(f, "creating"),
            VpsStatus::Active => write!(f, "active"),
            VpsStatus::Suspended => write!(f, "suspended"),
            VpsStatus::Terminated => write!(f, "terminated"),
            VpsStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(FromRow, Clone, Debug, Default)]
/// One rented VPS, linked 1:1 to the order item that bought it
pub struct VpsInstance {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub order_item_id: Uuid,
    /// Backing hypervisor VM, set once provisioning completes the clone
    pub vm_id: Option<Uuid>,
    pub status: VpsStatus,
    pub expires_at: DateTime<Utc>,
    pub auto_renew: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum PowerStatus {
    #[default]
    Stopped,
    Running,
    Suspended,
}

impl Display for PowerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerStatus::Stopped => write!(f, "stopped"),
            PowerStatus::Running => write!(f, "running"),
            PowerStatus::Suspended => write!(f, "suspended"),
        }
    }
}

#[derive(FromRow, Clone, Debug, Default)]
/// The hypervisor-side VM backing a [VpsInstance]
pub struct HypervisorVm {
    pub id: Uuid,
    pub cluster_id: Uuid,
    pub node_id: Uuid,
    pub template_id: Uuid,
    /// Numeric VM id, unique within the cluster
    pub vmid: u32,
    pub hostname: String,
    pub ip_address: Option<String>,
    pub mac_address: Option<String>,
    pub username: String,
    pub password: String,
    pub vnc_password: String,
    /// Mirror of the hypervisor power state, refreshed on power ops and reads
    pub power_status: PowerStatus,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub enum SnapshotStatus {
    #[default]
    Creating,
    Available,
    Deleting,
    Error,
}

#[derive(FromRow, Clone, Debug, Default)]
pub struct VmSnapshot {
    pub id: Uuid,
    pub vm_id: Uuid,
    /// Unique per VM, never the synthetic "current" entry
    pub name: String,
    pub description: Option<String>,
    pub size_bytes: Option<u64>,
    pub status: SnapshotStatus,
    pub created: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, sqlx::Type, Default, PartialEq, Eq)]
#[sqlx(rename_all = "snake_case")]
pub enum DiscountType {
    #[default]
    Percentage,
    FixedAmount,
}

#[derive(FromRow, Clone, Debug, Default)]
pub struct Promotion {
    pub id: Uuid,
    /// Uppercase coupon code
    pub code: String,
    pub discount_type: DiscountType,
    /// Percent (0-100) or fixed amount depending on [discount_type]
    pub discount_value: u64,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Total number of redemptions allowed across all users
    pub usage_limit: Option<u32>,
    pub per_user_limit: Option<u32>,
    pub created: DateTime<Utc>,
}

#[derive(FromRow, Clone, Debug, Default)]
/// Redemption record, written in the same transaction that marks the order paid
pub struct UserPromotion {
    pub id: Uuid,
    pub user_id: Uuid,
    pub promotion_id: Uuid,
    pub order_id: Uuid,
    pub used_at: DateTime<Utc>,
}

/// Resources already committed to instances on a node, used for capacity checks
#[derive(FromRow, Clone, Debug, Default)]
pub struct NodeAllocation {
    pub cpu: u64,
    pub memory_gb: u64,
    pub instances: u64,
}
