use crate::error::{ServiceError, ServiceResult};
use chrono::Utc;
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use vpsrent_db::{Order, OrderItem, OrderStatus, Promotion, User, VpsRentDb};

const ORDER_NUMBER_ATTEMPTS: u32 = 5;

/// Order creation and the pending -> paid | cancelled state machine.
pub struct OrderService {
    db: Arc<dyn VpsRentDb>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrderItem {
    pub plan_id: Uuid,
    pub template_id: Uuid,
    pub hostname: String,
    pub duration_months: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewOrder {
    pub items: Vec<NewOrderItem>,
    pub promotion_code: Option<String>,
    pub billing_phone: Option<String>,
    pub billing_address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionQuote {
    pub code: String,
    pub discount_amount: u64,
    pub final_amount: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CanRepay {
    pub can_repay: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
}

/// `VPS-<base36 millis>-<rand6>`. Millis give per-host monotonicity, the
/// random suffix guards cross-host collisions.
pub fn generate_order_number() -> String {
    let ms = Utc::now().timestamp_millis().max(0) as u64;
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| {
            const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
            CHARS[rng.random_range(0..CHARS.len())] as char
        })
        .collect();
    format!("VPS-{}-{}", base36(ms), suffix)
}

fn base36(mut v: u64) -> String {
    const DIGITS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if v == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while v > 0 {
        out.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    out.reverse();
    String::from_utf8(out).expect("base36 digits are ascii")
}

impl OrderService {
    pub fn new(db: Arc<dyn VpsRentDb>) -> Self {
        Self { db }
    }

    /// Validate a promotion against existence, window and usage caps, and
    /// quote the discount for the given cart total.
    pub async fn validate_promotion(
        &self,
        user_id: Uuid,
        code: &str,
        cart_total: u64,
    ) -> ServiceResult<(Promotion, u64)> {
        let promotion = self
            .db
            .get_promotion_by_code(&code.to_uppercase())
            .await?
            .ok_or_else(|| ServiceError::not_found("Promotion code not found"))?;

        let now = Utc::now();
        if let Some(starts) = promotion.starts_at {
            if starts > now {
                return Err(ServiceError::invalid_state("This promotion is not yet active"));
            }
        }
        if let Some(ends) = promotion.ends_at {
            if ends < now {
                return Err(ServiceError::invalid_state("This promotion has expired"));
            }
        }
        if let Some(limit) = promotion.usage_limit {
            if self.db.count_promotion_usage(promotion.id).await? >= limit as u64 {
                return Err(ServiceError::LimitExceeded(
                    "This promotion has reached its usage limit".to_string(),
                ));
            }
        }
        if let Some(limit) = promotion.per_user_limit {
            if self
                .db
                .count_user_promotion_usage(promotion.id, user_id)
                .await?
                >= limit as u64
            {
                return Err(ServiceError::LimitExceeded(
                    "You have reached the usage limit for this promotion".to_string(),
                ));
            }
        }

        let discount = discount_for(&promotion, cart_total);
        Ok((promotion, discount))
    }

    /// Create a pending order from checkout items. Prices snapshot the plan at
    /// order time; the promotion is only quoted here and consumed when the
    /// order turns paid.
    pub async fn create_order(
        &self,
        user: &User,
        req: NewOrder,
    ) -> ServiceResult<(Order, Vec<OrderItem>)> {
        if user.email_verified_at.is_none() {
            return Err(ServiceError::forbidden(
                "Verify your email address before ordering",
            ));
        }
        if req.items.is_empty() {
            return Err(ServiceError::invalid_state("Cart is empty"));
        }

        let mut items = Vec::with_capacity(req.items.len());
        let mut cart_total = 0u64;
        for item in &req.items {
            if item.duration_months == 0 {
                return Err(ServiceError::invalid_state("Duration must be at least one month"));
            }
            let plan = self.db.get_plan(item.plan_id).await?;
            if !plan.enabled {
                return Err(ServiceError::invalid_state("Plan is not available"));
            }
            let template = self.db.get_template(item.template_id).await?;
            if !template.enabled {
                return Err(ServiceError::invalid_state("Template is not available"));
            }
            let unit_price = plan.monthly_price;
            let total_price = unit_price * item.duration_months as u64;
            cart_total += total_price;
            items.push(OrderItem {
                id: Uuid::new_v4(),
                order_id: Uuid::nil(), // filled below
                plan_id: plan.id,
                template_id: template.id,
                hostname: item.hostname.clone(),
                duration_months: item.duration_months,
                unit_price,
                total_price,
                configuration: serde_json::to_string(&serde_json::json!({
                    "cpu": plan.cpu,
                    "memory_gb": plan.memory_gb,
                    "disk_gb": plan.disk_gb,
                    "bandwidth_mbps": plan.bandwidth_mbps,
                }))
                .unwrap_or_default(),
                created: Utc::now(),
            });
        }

        let (promotion_id, discount) = match &req.promotion_code {
            Some(code) if !code.is_empty() => {
                let (promotion, discount) =
                    self.validate_promotion(user.id, code, cart_total).await?;
                (Some(promotion.id), discount)
            }
            _ => (None, 0),
        };

        let mut order = Order {
            id: Uuid::new_v4(),
            order_number: String::new(),
            user_id: user.id,
            price: cart_total.saturating_sub(discount),
            status: OrderStatus::Pending,
            promotion_id,
            billing_phone: req.billing_phone,
            billing_address: req.billing_address,
            created: Utc::now(),
            updated: Utc::now(),
        };

        // collisions are rare, regenerate and retry on the unique index
        let mut inserted = false;
        for _ in 0..ORDER_NUMBER_ATTEMPTS {
            order.order_number = generate_order_number();
            match self.db.insert_order(&order).await {
                Ok(()) => {
                    inserted = true;
                    break;
                }
                Err(e) if e.is_unique_violation() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if !inserted {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "Could not allocate a unique order number"
            )));
        }

        for item in items.iter_mut() {
            item.order_id = order.id;
            self.db.insert_order_item(item).await?;
        }

        info!(
            "Created order {} for user {} ({} items, total {})",
            order.order_number,
            user.id,
            items.len(),
            order.price
        );
        Ok((order, items))
    }

    pub async fn get_user_order(&self, user: &User, order_id: Uuid) -> ServiceResult<Order> {
        let order = self.db.get_order(order_id).await?;
        if order.user_id != user.id && !user.is_admin() {
            return Err(ServiceError::forbidden(
                "You do not have permission to access this order",
            ));
        }
        Ok(order)
    }

    pub async fn list_orders(&self, user: &User) -> ServiceResult<Vec<Order>> {
        Ok(self.db.list_user_orders(user.id).await?)
    }

    /// Admin-only. `paid` orders never go back to `pending`; `cancelled`
    /// orders reject all further payment attempts.
    pub async fn cancel_order(&self, admin: &User, order_id: Uuid) -> ServiceResult<Order> {
        if !admin.is_admin() {
            return Err(ServiceError::forbidden("Admin role required"));
        }
        let mut order = self.db.get_order(order_id).await?;
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::invalid_state(format!(
                "Cannot cancel an order in state {}",
                order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        order.updated = Utc::now();
        self.db.update_order(&order).await?;
        info!("Order {} cancelled", order.order_number);
        Ok(order)
    }

    /// A pending order can be repaid while none of its items have a VPS yet
    pub async fn can_repay(&self, user: &User, order_id: Uuid) -> ServiceResult<CanRepay> {
        let order = self.get_user_order(user, order_id).await?;

        if order.status != OrderStatus::Pending {
            return Ok(CanRepay {
                can_repay: false,
                reason: Some("Order is not in a payable state".to_string()),
                order_number: None,
                amount: None,
            });
        }
        for item in self.db.list_order_items(order.id).await? {
            if self.db.get_instance_by_order_item(item.id).await?.is_some() {
                return Ok(CanRepay {
                    can_repay: false,
                    reason: Some("VPS service has already been provided".to_string()),
                    order_number: None,
                    amount: None,
                });
            }
        }
        Ok(CanRepay {
            can_repay: true,
            reason: None,
            order_number: Some(order.order_number),
            amount: Some(order.price),
        })
    }
}

fn discount_for(promotion: &Promotion, cart_total: u64) -> u64 {
    use vpsrent_db::DiscountType;
    let discount = match promotion.discount_type {
        DiscountType::Percentage => cart_total * promotion.discount_value / 100,
        DiscountType::FixedAmount => promotion.discount_value.min(cart_total),
    };
    discount.min(cart_total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockDb;
    use chrono::Days;
    use vpsrent_db::DiscountType;

    fn promo(discount_type: DiscountType, value: u64) -> Promotion {
        Promotion {
            id: Uuid::new_v4(),
            code: "SAVE".to_string(),
            discount_type,
            discount_value: value,
            ..Default::default()
        }
    }

    #[test]
    fn order_number_format() {
        let n = generate_order_number();
        let parts: Vec<&str> = n.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "VPS");
        assert!(parts[1].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(parts[2].len(), 6);
        assert!(
            parts[2]
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn base36_roundtrip() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "Z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(36 * 36 + 1), "101");
    }

    #[test]
    fn percentage_discount_math() {
        let p = promo(DiscountType::Percentage, 10);
        assert_eq!(discount_for(&p, 150000), 15000);
    }

    #[test]
    fn fixed_discount_caps_at_cart_total() {
        let p = promo(DiscountType::FixedAmount, 200000);
        assert_eq!(discount_for(&p, 150000), 150000);
    }

    #[tokio::test]
    async fn create_order_snapshots_plan_prices() {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("a@example.com").await;
        let (plan, template) = db.add_catalog().await;
        let svc = OrderService::new(db.clone());

        let (order, items) = svc
            .create_order(
                &user,
                NewOrder {
                    items: vec![NewOrderItem {
                        plan_id: plan.id,
                        template_id: template.id,
                        hostname: "web01".to_string(),
                        duration_months: 3,
                    }],
                    promotion_code: None,
                    billing_phone: None,
                    billing_address: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.price, plan.monthly_price * 3);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].unit_price, plan.monthly_price);
        assert!(order.order_number.starts_with("VPS-"));
    }

    #[tokio::test]
    async fn expired_promotion_is_rejected() {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("a@example.com").await;
        let mut p = promo(DiscountType::Percentage, 10);
        p.ends_at = Some(Utc::now().checked_sub_days(Days::new(1)).unwrap());
        db.add_promotion(p).await;
        let svc = OrderService::new(db);

        let err = svc
            .validate_promotion(user.id, "SAVE", 100000)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn per_user_cap_is_enforced() {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("a@example.com").await;
        let mut p = promo(DiscountType::Percentage, 10);
        p.per_user_limit = Some(1);
        db.add_promotion(p.clone()).await;
        db.add_user_promotion(p.id, user.id).await;
        let svc = OrderService::new(db);

        let err = svc
            .validate_promotion(user.id, "SAVE", 100000)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::LimitExceeded(_)));
    }

    #[tokio::test]
    async fn cancelled_orders_cannot_repay() {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("a@example.com").await;
        let mut order = db.add_pending_order(&user, 50000).await;
        order.status = OrderStatus::Cancelled;
        db.update_order(&order).await.unwrap();
        let svc = OrderService::new(db);

        let result = svc.can_repay(&user, order.id).await.unwrap();
        assert!(!result.can_repay);
        assert_eq!(
            result.reason.as_deref(),
            Some("Order is not in a payable state")
        );
    }
}
