mod model;
mod mysql;

pub use model::*;
pub use mysql::*;

pub use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

impl DbError {
    pub fn message(msg: impl Into<String>) -> Self {
        DbError::Message(msg.into())
    }

    /// The canonical no-row error, shared with in-memory implementations
    pub fn not_found() -> Self {
        DbError::Sqlx(sqlx::Error::RowNotFound)
    }

    /// True when a lookup matched no row
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::Sqlx(sqlx::Error::RowNotFound))
    }

    /// True when an insert hit a unique constraint
    pub fn is_unique_violation(&self) -> bool {
        match self {
            DbError::Sqlx(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Persistence boundary of the control plane.
///
/// Implementations must be safe to call from many tasks concurrently,
/// every multi-row write method runs in a single transaction.
#[async_trait]
pub trait VpsRentDb: Send + Sync {
    /// Run schema migrations
    async fn migrate(&self) -> DbResult<()>;

    // -- users

    async fn insert_user(&self, user: &User) -> DbResult<()>;

    async fn get_user(&self, id: Uuid) -> DbResult<User>;

    async fn get_user_by_email(&self, email: &str) -> DbResult<User>;

    async fn get_user_by_verify_token(&self, token: &str) -> DbResult<User>;

    async fn get_user_by_reset_token(&self, token: &str) -> DbResult<User>;

    async fn update_user(&self, user: &User) -> DbResult<()>;

    async fn count_users(&self) -> DbResult<u64>;

    // -- catalog

    async fn get_plan(&self, id: Uuid) -> DbResult<VpsPlan>;

    async fn list_plans(&self) -> DbResult<Vec<VpsPlan>>;

    async fn get_template(&self, id: Uuid) -> DbResult<VmTemplate>;

    async fn list_templates(&self) -> DbResult<Vec<VmTemplate>>;

    // -- hypervisor inventory

    async fn get_cluster(&self, id: Uuid) -> DbResult<Cluster>;

    async fn get_node(&self, id: Uuid) -> DbResult<Node>;

    async fn get_node_by_name(&self, name: &str) -> DbResult<Node>;

    async fn get_storage(&self, id: Uuid) -> DbResult<NodeStorage>;

    /// Sum of plan resources of all live (creating/active/suspended) instances on a node
    async fn node_allocation(&self, node_id: Uuid) -> DbResult<NodeAllocation>;

    // -- orders

    async fn insert_order(&self, order: &Order) -> DbResult<()>;

    async fn get_order(&self, id: Uuid) -> DbResult<Order>;

    async fn get_order_by_number(&self, order_number: &str) -> DbResult<Order>;

    async fn list_user_orders(&self, user_id: Uuid) -> DbResult<Vec<Order>>;

    async fn update_order(&self, order: &Order) -> DbResult<()>;

    async fn count_orders_by_status(&self, status: OrderStatus) -> DbResult<u64>;

    async fn insert_order_item(&self, item: &OrderItem) -> DbResult<()>;

    async fn get_order_item(&self, id: Uuid) -> DbResult<OrderItem>;

    async fn list_order_items(&self, order_id: Uuid) -> DbResult<Vec<OrderItem>>;

    // -- payments

    async fn insert_payment(&self, payment: &PaymentTransaction) -> DbResult<()>;

    async fn get_payment_by_txn_id(&self, txn_id: &str) -> DbResult<PaymentTransaction>;

    async fn update_payment(&self, payment: &PaymentTransaction) -> DbResult<()>;

    async fn list_order_payments(&self, order_id: Uuid) -> DbResult<Vec<PaymentTransaction>>;

    /// Apply a verified gateway result: update the transaction, flip the order,
    /// and record the promotion redemption, all in one transaction.
    async fn settle_payment(
        &self,
        payment: &PaymentTransaction,
        order: &Order,
        promo: Option<&UserPromotion>,
    ) -> DbResult<()>;

    /// Sum of completed payment amounts
    async fn total_revenue(&self) -> DbResult<u64>;

    // -- vps instances

    async fn insert_instance(&self, instance: &VpsInstance) -> DbResult<()>;

    async fn get_instance(&self, id: Uuid) -> DbResult<VpsInstance>;

    async fn get_instance_by_order_item(&self, item_id: Uuid)
        -> DbResult<Option<VpsInstance>>;

    async fn list_user_instances(&self, user_id: Uuid) -> DbResult<Vec<VpsInstance>>;

    /// Instances with `status = active` and `expires_at < now`
    async fn list_expired_active(&self, now: DateTime<Utc>) -> DbResult<Vec<VpsInstance>>;

    /// Instances with `status = suspended` and `expires_at < cutoff`
    async fn list_suspended_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<VpsInstance>>;

    async fn update_instance(&self, instance: &VpsInstance) -> DbResult<()>;

    async fn count_instances_by_status(&self, status: VpsStatus) -> DbResult<u64>;

    /// Insert the hypervisor VM row and link + activate its instance in one transaction
    async fn attach_vm_and_activate(
        &self,
        vm: &HypervisorVm,
        instance: &VpsInstance,
    ) -> DbResult<()>;

    // -- hypervisor vms

    async fn get_vm(&self, id: Uuid) -> DbResult<HypervisorVm>;

    async fn update_vm(&self, vm: &HypervisorVm) -> DbResult<()>;

    async fn delete_vm(&self, id: Uuid) -> DbResult<()>;

    // -- snapshots

    async fn insert_snapshot(&self, snapshot: &VmSnapshot) -> DbResult<()>;

    async fn list_vm_snapshots(&self, vm_id: Uuid) -> DbResult<Vec<VmSnapshot>>;

    async fn get_snapshot_by_name(&self, vm_id: Uuid, name: &str)
        -> DbResult<Option<VmSnapshot>>;

    async fn update_snapshot(&self, snapshot: &VmSnapshot) -> DbResult<()>;

    async fn delete_snapshot(&self, id: Uuid) -> DbResult<()>;

    // -- promotions

    async fn get_promotion_by_code(&self, code: &str) -> DbResult<Option<Promotion>>;

    async fn count_promotion_usage(&self, promotion_id: Uuid) -> DbResult<u64>;

    async fn count_user_promotion_usage(
        &self,
        promotion_id: Uuid,
        user_id: Uuid,
    ) -> DbResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(DbError::not_found().is_not_found());
        assert!(!DbError::message("boom").is_not_found());
        assert!(!DbError::message("boom").is_unique_violation());
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(VpsStatus::Terminated.is_terminal());
        assert!(VpsStatus::Error.is_terminal());
        assert!(!VpsStatus::Active.is_terminal());
        assert!(!VpsStatus::Suspended.is_terminal());
        assert!(!VpsStatus::Creating.is_terminal());
    }

    #[test]
    fn status_display_matches_wire_values() {
        assert_eq!(OrderStatus::Pending.to_string(), "pending");
        assert_eq!(OrderStatus::Paid.to_string(), "paid");
        assert_eq!(OrderStatus::Cancelled.to_string(), "cancelled");
        assert_eq!(PaymentMethod::MoMo.to_string(), "momo");
        assert_eq!(PaymentMethod::VnPay.to_string(), "vnpay");
        assert_eq!(VpsStatus::Suspended.to_string(), "suspended");
        assert_eq!(PowerStatus::Running.to_string(), "running");
    }
}
