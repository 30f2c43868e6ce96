use crate::{
    Cluster, DbResult, HypervisorVm, Node, NodeAllocation, NodeStorage, Order, OrderItem,
    OrderStatus, PaymentTransaction, Promotion, UserPromotion, VmSnapshot, VmTemplate, VpsInstance,
    VpsPlan, VpsRentDb, VpsStatus, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct VpsRentDbMysql {
    db: MySqlPool,
}

impl VpsRentDbMysql {
    pub async fn new(conn: &str) -> DbResult<Self> {
        let db = MySqlPool::connect(conn).await?;
        Ok(Self { db })
    }
}

#[async_trait]
impl VpsRentDb for VpsRentDbMysql {
    async fn migrate(&self) -> DbResult<()> {
        sqlx::migrate!().run(&self.db).await?;
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> DbResult<()> {
        sqlx::query(
            "insert into users(id,email,password_hash,role,email_verified_at,verify_token,reset_token,created) values(?,?,?,?,?,?,?,?)",
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role)
        .bind(user.email_verified_at)
        .bind(&user.verify_token)
        .bind(&user.reset_token)
        .bind(user.created)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> DbResult<User> {
        Ok(sqlx::query_as("select * from users where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn get_user_by_email(&self, email: &str) -> DbResult<User> {
        Ok(sqlx::query_as("select * from users where email=?")
            .bind(email)
            .fetch_one(&self.db)
            .await?)
    }

    async fn get_user_by_verify_token(&self, token: &str) -> DbResult<User> {
        Ok(
            sqlx::query_as("select * from users where verify_token=? and verify_token != ''")
                .bind(token)
                .fetch_one(&self.db)
                .await?,
        )
    }

    async fn get_user_by_reset_token(&self, token: &str) -> DbResult<User> {
        Ok(
            sqlx::query_as("select * from users where reset_token=? and reset_token != ''")
                .bind(token)
                .fetch_one(&self.db)
                .await?,
        )
    }

    async fn update_user(&self, user: &User) -> DbResult<()> {
        sqlx::query(
            "update users set email=?,password_hash=?,role=?,email_verified_at=?,verify_token=?,reset_token=? where id=?",
        )
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role)
        .bind(user.email_verified_at)
        .bind(&user.verify_token)
        .bind(&user.reset_token)
        .bind(user.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn count_users(&self) -> DbResult<u64> {
        let row = sqlx::query("select count(*) from users")
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    async fn get_plan(&self, id: Uuid) -> DbResult<VpsPlan> {
        Ok(sqlx::query_as("select * from vps_plan where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn list_plans(&self) -> DbResult<Vec<VpsPlan>> {
        Ok(
            sqlx::query_as("select * from vps_plan where enabled=1 order by monthly_price")
                .fetch_all(&self.db)
                .await?,
        )
    }

    async fn get_template(&self, id: Uuid) -> DbResult<VmTemplate> {
        Ok(sqlx::query_as("select * from vm_template where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn list_templates(&self) -> DbResult<Vec<VmTemplate>> {
        Ok(sqlx::query_as("select * from vm_template where enabled=1")
            .fetch_all(&self.db)
            .await?)
    }

    async fn get_cluster(&self, id: Uuid) -> DbResult<Cluster> {
        Ok(sqlx::query_as("select * from cluster where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn get_node(&self, id: Uuid) -> DbResult<Node> {
        Ok(sqlx::query_as("select * from node where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn get_node_by_name(&self, name: &str) -> DbResult<Node> {
        Ok(sqlx::query_as("select * from node where name=?")
            .bind(name)
            .fetch_one(&self.db)
            .await?)
    }

    async fn get_storage(&self, id: Uuid) -> DbResult<NodeStorage> {
        Ok(sqlx::query_as("select * from node_storage where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn node_allocation(&self, node_id: Uuid) -> DbResult<NodeAllocation> {
        Ok(sqlx::query_as(
            "select cast(coalesce(sum(p.cpu),0) as unsigned) as cpu, \
             cast(coalesce(sum(p.memory_gb),0) as unsigned) as memory_gb, \
             cast(count(*) as unsigned) as instances \
             from vps_instance i \
             join vps_plan p on p.id = i.plan_id \
             join hypervisor_vm v on v.id = i.vm_id \
             where v.node_id = ? and i.status in ('creating','active','suspended')",
        )
        .bind(node_id)
        .fetch_one(&self.db)
        .await?)
    }

    async fn insert_order(&self, order: &Order) -> DbResult<()> {
        sqlx::query(
            "insert into orders(id,order_number,user_id,price,status,promotion_id,billing_phone,billing_address,created,updated) values(?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(order.id)
        .bind(&order.order_number)
        .bind(order.user_id)
        .bind(order.price)
        .bind(order.status)
        .bind(order.promotion_id)
        .bind(&order.billing_phone)
        .bind(&order.billing_address)
        .bind(order.created)
        .bind(order.updated)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> DbResult<Order> {
        Ok(sqlx::query_as("select * from orders where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn get_order_by_number(&self, order_number: &str) -> DbResult<Order> {
        Ok(sqlx::query_as("select * from orders where order_number=?")
            .bind(order_number)
            .fetch_one(&self.db)
            .await?)
    }

    async fn list_user_orders(&self, user_id: Uuid) -> DbResult<Vec<Order>> {
        Ok(
            sqlx::query_as("select * from orders where user_id=? order by created desc")
                .bind(user_id)
                .fetch_all(&self.db)
                .await?,
        )
    }

    async fn update_order(&self, order: &Order) -> DbResult<()> {
        sqlx::query(
            "update orders set price=?,status=?,promotion_id=?,billing_phone=?,billing_address=?,updated=? where id=?",
        )
        .bind(order.price)
        .bind(order.status)
        .bind(order.promotion_id)
        .bind(&order.billing_phone)
        .bind(&order.billing_address)
        .bind(order.updated)
        .bind(order.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn count_orders_by_status(&self, status: OrderStatus) -> DbResult<u64> {
        let row = sqlx::query("select count(*) from orders where status=?")
            .bind(status)
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    async fn insert_order_item(&self, item: &OrderItem) -> DbResult<()> {
        sqlx::query(
            "insert into order_item(id,order_id,plan_id,template_id,hostname,duration_months,unit_price,total_price,configuration,created) values(?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(item.id)
        .bind(item.order_id)
        .bind(item.plan_id)
        .bind(item.template_id)
        .bind(&item.hostname)
        .bind(item.duration_months)
        .bind(item.unit_price)
        .bind(item.total_price)
        .bind(&item.configuration)
        .bind(item.created)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_order_item(&self, id: Uuid) -> DbResult<OrderItem> {
        Ok(sqlx::query_as("select * from order_item where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn list_order_items(&self, order_id: Uuid) -> DbResult<Vec<OrderItem>> {
        Ok(sqlx::query_as("select * from order_item where order_id=?")
            .bind(order_id)
            .fetch_all(&self.db)
            .await?)
    }

    async fn insert_payment(&self, payment: &PaymentTransaction) -> DbResult<()> {
        sqlx::query(
            "insert into payment_transaction(id,order_id,txn_id,method,amount,currency,status,gateway_response,created,updated) values(?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(payment.id)
        .bind(payment.order_id)
        .bind(&payment.txn_id)
        .bind(payment.method)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.status)
        .bind(&payment.gateway_response)
        .bind(payment.created)
        .bind(payment.updated)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_payment_by_txn_id(&self, txn_id: &str) -> DbResult<PaymentTransaction> {
        Ok(
            sqlx::query_as("select * from payment_transaction where txn_id=?")
                .bind(txn_id)
                .fetch_one(&self.db)
                .await?,
        )
    }

    async fn update_payment(&self, payment: &PaymentTransaction) -> DbResult<()> {
        sqlx::query(
            "update payment_transaction set txn_id=?,status=?,gateway_response=?,updated=? where id=?",
        )
        .bind(&payment.txn_id)
        .bind(payment.status)
        .bind(&payment.gateway_response)
        .bind(payment.updated)
        .bind(payment.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_order_payments(&self, order_id: Uuid) -> DbResult<Vec<PaymentTransaction>> {
        Ok(
            sqlx::query_as(
                "select * from payment_transaction where order_id=? order by created desc",
            )
            .bind(order_id)
            .fetch_all(&self.db)
            .await?,
        )
    }

    async fn settle_payment(
        &self,
        payment: &PaymentTransaction,
        order: &Order,
        promo: Option<&UserPromotion>,
    ) -> DbResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "update payment_transaction set status=?,gateway_response=?,updated=? where id=?",
        )
        .bind(payment.status)
        .bind(&payment.gateway_response)
        .bind(payment.updated)
        .bind(payment.id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("update orders set status=?,updated=? where id=?")
            .bind(order.status)
            .bind(order.updated)
            .bind(order.id)
            .execute(&mut *tx)
            .await?;
        if let Some(p) = promo {
            sqlx::query(
                "insert into user_promotion(id,user_id,promotion_id,order_id,used_at) values(?,?,?,?,?)",
            )
            .bind(p.id)
            .bind(p.user_id)
            .bind(p.promotion_id)
            .bind(p.order_id)
            .bind(p.used_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn total_revenue(&self) -> DbResult<u64> {
        let row = sqlx::query(
            "select cast(coalesce(sum(amount),0) as unsigned) from payment_transaction where status='completed'",
        )
        .fetch_one(&self.db)
        .await?;
        Ok(row.try_get::<u64, _>(0)?)
    }

    async fn insert_instance(&self, instance: &VpsInstance) -> DbResult<()> {
        sqlx::query(
            "insert into vps_instance(id,user_id,plan_id,order_item_id,vm_id,status,expires_at,auto_renew,created,updated) values(?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(instance.id)
        .bind(instance.user_id)
        .bind(instance.plan_id)
        .bind(instance.order_item_id)
        .bind(instance.vm_id)
        .bind(instance.status)
        .bind(instance.expires_at)
        .bind(instance.auto_renew)
        .bind(instance.created)
        .bind(instance.updated)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> DbResult<VpsInstance> {
        Ok(sqlx::query_as("select * from vps_instance where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn get_instance_by_order_item(
        &self,
        item_id: Uuid,
    ) -> DbResult<Option<VpsInstance>> {
        Ok(
            sqlx::query_as("select * from vps_instance where order_item_id=?")
                .bind(item_id)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn list_user_instances(&self, user_id: Uuid) -> DbResult<Vec<VpsInstance>> {
        Ok(sqlx::query_as(
            "select * from vps_instance where user_id=? and status not in ('terminated','error') order by created desc",
        )
        .bind(user_id)
        .fetch_all(&self.db)
        .await?)
    }

    async fn list_expired_active(&self, now: DateTime<Utc>) -> DbResult<Vec<VpsInstance>> {
        Ok(sqlx::query_as(
            "select * from vps_instance where status='active' and expires_at < ?",
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?)
    }

    async fn list_suspended_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> DbResult<Vec<VpsInstance>> {
        Ok(sqlx::query_as(
            "select * from vps_instance where status='suspended' and expires_at < ?",
        )
        .bind(cutoff)
        .fetch_all(&self.db)
        .await?)
    }

    async fn update_instance(&self, instance: &VpsInstance) -> DbResult<()> {
        sqlx::query(
            "update vps_instance set vm_id=?,status=?,expires_at=?,auto_renew=?,updated=? where id=?",
        )
        .bind(instance.vm_id)
        .bind(instance.status)
        .bind(instance.expires_at)
        .bind(instance.auto_renew)
        .bind(instance.updated)
        .bind(instance.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn count_instances_by_status(&self, status: VpsStatus) -> DbResult<u64> {
        let row = sqlx::query("select count(*) from vps_instance where status=?")
            .bind(status)
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    async fn attach_vm_and_activate(
        &self,
        vm: &HypervisorVm,
        instance: &VpsInstance,
    ) -> DbResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "insert into hypervisor_vm(id,cluster_id,node_id,template_id,vmid,hostname,ip_address,mac_address,username,password,vnc_password,power_status,created) values(?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(vm.id)
        .bind(vm.cluster_id)
        .bind(vm.node_id)
        .bind(vm.template_id)
        .bind(vm.vmid)
        .bind(&vm.hostname)
        .bind(&vm.ip_address)
        .bind(&vm.mac_address)
        .bind(&vm.username)
        .bind(&vm.password)
        .bind(&vm.vnc_password)
        .bind(vm.power_status)
        .bind(vm.created)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "update vps_instance set vm_id=?,status=?,expires_at=?,updated=? where id=?",
        )
        .bind(instance.vm_id)
        .bind(instance.status)
        .bind(instance.expires_at)
        .bind(instance.updated)
        .bind(instance.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_vm(&self, id: Uuid) -> DbResult<HypervisorVm> {
        Ok(sqlx::query_as("select * from hypervisor_vm where id=?")
            .bind(id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn update_vm(&self, vm: &HypervisorVm) -> DbResult<()> {
        sqlx::query(
            "update hypervisor_vm set ip_address=?,mac_address=?,power_status=? where id=?",
        )
        .bind(&vm.ip_address)
        .bind(&vm.mac_address)
        .bind(vm.power_status)
        .bind(vm.id)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_vm(&self, id: Uuid) -> DbResult<()> {
        sqlx::query("delete from hypervisor_vm where id=?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn insert_snapshot(&self, snapshot: &VmSnapshot) -> DbResult<()> {
        sqlx::query(
            "insert into vm_snapshot(id,vm_id,name,description,size_bytes,status,created) values(?,?,?,?,?,?,?)",
        )
        .bind(snapshot.id)
        .bind(snapshot.vm_id)
        .bind(&snapshot.name)
        .bind(&snapshot.description)
        .bind(snapshot.size_bytes)
        .bind(snapshot.status)
        .bind(snapshot.created)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn list_vm_snapshots(&self, vm_id: Uuid) -> DbResult<Vec<VmSnapshot>> {
        Ok(
            sqlx::query_as("select * from vm_snapshot where vm_id=? order by created")
                .bind(vm_id)
                .fetch_all(&self.db)
                .await?,
        )
    }

    async fn get_snapshot_by_name(
        &self,
        vm_id: Uuid,
        name: &str,
    ) -> DbResult<Option<VmSnapshot>> {
        Ok(
            sqlx::query_as("select * from vm_snapshot where vm_id=? and name=?")
                .bind(vm_id)
                .bind(name)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    async fn update_snapshot(&self, snapshot: &VmSnapshot) -> DbResult<()> {
        sqlx::query("update vm_snapshot set description=?,size_bytes=?,status=? where id=?")
            .bind(&snapshot.description)
            .bind(snapshot.size_bytes)
            .bind(snapshot.status)
            .bind(snapshot.id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn delete_snapshot(&self, id: Uuid) -> DbResult<()> {
        sqlx::query("delete from vm_snapshot where id=?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn get_promotion_by_code(&self, code: &str) -> DbResult<Option<Promotion>> {
        Ok(sqlx::query_as("select * from promotion where code=?")
            .bind(code)
            .fetch_optional(&self.db)
            .await?)
    }

    async fn count_promotion_usage(&self, promotion_id: Uuid) -> DbResult<u64> {
        let row = sqlx::query("select count(*) from user_promotion where promotion_id=?")
            .bind(promotion_id)
            .fetch_one(&self.db)
            .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }

    async fn count_user_promotion_usage(
        &self,
        promotion_id: Uuid,
        user_id: Uuid,
    ) -> DbResult<u64> {
        let row =
            sqlx::query("select count(*) from user_promotion where promotion_id=? and user_id=?")
                .bind(promotion_id)
                .bind(user_id)
                .fetch_one(&self.db)
                .await?;
        Ok(row.try_get::<i64, _>(0)? as u64)
    }
}
