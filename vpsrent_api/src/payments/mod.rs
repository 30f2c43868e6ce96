use crate::error::{ServiceError, ServiceResult};
use crate::retry::OpError;
use crate::settings::Settings;
use anyhow::anyhow;
use chrono::Utc;
use hmac::{Hmac, Mac};
use log::{info, warn};
use serde::{Deserialize, Deserializer};
use sha2::{Sha256, Sha512};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;
use vpsrent_db::{
    Order, OrderStatus, PaymentMethod, PaymentStatus, PaymentTransaction, User, UserPromotion,
    VpsRentDb,
};

mod momo;
mod vnpay;

pub use momo::{MoMoCallback, MoMoGateway};
pub use vnpay::{VnPayGateway, VnPayVerification};

pub fn hmac_sha256_hex(secret: &str, data: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub fn hmac_sha512_hex(secret: &str, data: &str) -> String {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Gateways deliver numbers as JSON numbers on IPN but strings on return URLs
pub fn de_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(u64),
        String(String),
    }
    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

pub fn de_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(i64),
        String(String),
    }
    match NumOrString::deserialize(deserializer)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::String(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Result of a create-payment call handed back to the HTTP layer
#[derive(Debug, Clone, serde::Serialize)]
pub struct PaymentInfo {
    pub payment_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deeplink: Option<String>,
    pub txn_id: String,
    pub payment_id: Uuid,
}

/// Result of callback verification handed back to the HTTP layer
#[derive(Debug, Clone, serde::Serialize)]
pub struct CallbackResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallbackResult {
    fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            success: None,
            txn_id: None,
            amount: None,
            message: None,
            error: Some(error.into()),
        }
    }
}

/// Construct, sign, dispatch and verify gateway messages, and own every
/// `PaymentTransaction` state change.
pub struct PaymentService {
    db: Arc<dyn VpsRentDb>,
    momo: Option<MoMoGateway>,
    vnpay: Option<VnPayGateway>,
    /// Advisory lock serializing callback application so replays are idempotent
    callback_lock: Mutex<()>,
}

impl PaymentService {
    pub fn new(db: Arc<dyn VpsRentDb>, settings: &Settings) -> anyhow::Result<Self> {
        let momo = match &settings.momo {
            Some(c) => Some(MoMoGateway::new(c.clone())?),
            None => None,
        };
        let vnpay = settings.vnpay.clone().map(VnPayGateway::new);
        Ok(Self {
            db,
            momo,
            vnpay,
            callback_lock: Mutex::new(()),
        })
    }

    /// Pending and nothing provisioned yet: the one-shot repayment guard
    async fn assert_payable(&self, order: &Order) -> ServiceResult<()> {
        if order.status != OrderStatus::Pending {
            return Err(ServiceError::invalid_state("Order is not in a payable state"));
        }
        for item in self.db.list_order_items(order.id).await? {
            if self.db.get_instance_by_order_item(item.id).await?.is_some() {
                return Err(ServiceError::invalid_state(
                    "VPS service has already been provided",
                ));
            }
        }
        Ok(())
    }

    async fn load_user_order(&self, user: &User, order_number: &str) -> ServiceResult<Order> {
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
        if order.user_id != user.id {
            return Err(ServiceError::forbidden(
                "You do not have permission to pay for this order",
            ));
        }
        Ok(order)
    }

    /// Record the pending transaction. On repay the existing row for this
    /// order+method is updated in place instead of inserting a second one.
    async fn upsert_pending(
        &self,
        order: &Order,
        method: PaymentMethod,
        txn_id: &str,
        raw_response: &str,
    ) -> ServiceResult<PaymentTransaction> {
        let existing = self
            .db
            .list_order_payments(order.id)
            .await?
            .into_iter()
            .find(|p| p.method == method && p.status == PaymentStatus::Pending);

        if let Some(mut payment) = existing {
            payment.txn_id = txn_id.to_string();
            payment.gateway_response = raw_response.to_string();
            payment.updated = Utc::now();
            self.db.update_payment(&payment).await?;
            return Ok(payment);
        }

        let payment = PaymentTransaction {
            id: Uuid::new_v4(),
            order_id: order.id,
            txn_id: txn_id.to_string(),
            method,
            amount: order.price,
            currency: "VND".to_string(),
            status: PaymentStatus::Pending,
            gateway_response: raw_response.to_string(),
            created: Utc::now(),
            updated: Utc::now(),
        };
        self.db.insert_payment(&payment).await?;
        Ok(payment)
    }

    pub async fn create_momo_payment(
        &self,
        user: &User,
        order_number: &str,
        return_url: Option<&str>,
    ) -> ServiceResult<PaymentInfo> {
        let gw = self
            .momo
            .as_ref()
            .ok_or_else(|| ServiceError::Upstream("MoMo gateway not configured".to_string()))?;
        let order = self.load_user_order(user, order_number).await?;
        self.assert_payable(&order).await?;

        let result = match gw.create_payment(&order, return_url).await {
            Ok(r) => r,
            Err(OpError::Transient(e)) => return Err(ServiceError::Upstream(e.to_string())),
            Err(OpError::Fatal(e)) => return Err(ServiceError::Internal(e)),
        };

        if result.response.result_code != 0 {
            return Err(ServiceError::invalid_state(format!(
                "MoMo payment creation failed: {}",
                result.response.message
            )));
        }

        let payment = self
            .upsert_pending(&order, PaymentMethod::MoMo, &result.txn_id, &result.raw_response)
            .await?;

        info!(
            "Created MoMo payment {} for order {}",
            result.txn_id, order.order_number
        );
        Ok(PaymentInfo {
            payment_url: result.response.pay_url.unwrap_or_default(),
            qr_code_url: result.response.qr_code_url,
            deeplink: result.response.deeplink,
            txn_id: result.txn_id,
            payment_id: payment.id,
        })
    }

    pub async fn create_vnpay_payment(
        &self,
        user: &User,
        order_number: &str,
        client_ip: &str,
        return_url: Option<&str>,
        bank_code: Option<&str>,
    ) -> ServiceResult<PaymentInfo> {
        let gw = self
            .vnpay
            .as_ref()
            .ok_or_else(|| ServiceError::Upstream("VNPay gateway not configured".to_string()))?;
        let order = self.load_user_order(user, order_number).await?;
        self.assert_payable(&order).await?;

        let result = gw.build_payment_url(&order, client_ip, return_url, bank_code, Utc::now());
        let payment = self
            .upsert_pending(&order, PaymentMethod::VnPay, &result.txn_id, "{}")
            .await?;

        info!(
            "Created VNPay payment {} for order {}",
            result.txn_id, order.order_number
        );
        Ok(PaymentInfo {
            payment_url: result.payment_url,
            qr_code_url: None,
            deeplink: None,
            txn_id: result.txn_id,
            payment_id: payment.id,
        })
    }

    pub async fn verify_momo_callback(&self, cb: MoMoCallback) -> ServiceResult<CallbackResult> {
        let gw = self
            .momo
            .as_ref()
            .ok_or_else(|| ServiceError::Upstream("MoMo gateway not configured".to_string()))?;

        if !gw.verify_callback_signature(&cb) {
            warn!("MoMo signature verification failed for {}", cb.order_id);
            return Ok(CallbackResult::invalid("Invalid signature"));
        }

        let raw = serde_json::to_string(&cb).map_err(|e| ServiceError::Internal(anyhow!(e)))?;
        self.apply_verified_callback(
            &cb.order_id,
            cb.result_code == 0,
            cb.amount,
            Some(cb.message.clone()),
            &raw,
        )
        .await
    }

    pub async fn verify_vnpay_return(
        &self,
        params: &HashMap<String, String>,
    ) -> ServiceResult<CallbackResult> {
        let gw = self
            .vnpay
            .as_ref()
            .ok_or_else(|| ServiceError::Upstream("VNPay gateway not configured".to_string()))?;

        let v = gw.verify_return(params);
        if !v.valid {
            warn!("VNPay signature verification failed");
            return Ok(CallbackResult::invalid("Invalid signature"));
        }
        let txn_id = match &v.txn_id {
            Some(t) => t.clone(),
            None => return Ok(CallbackResult::invalid("Missing vnp_TxnRef")),
        };

        let raw = serde_json::to_string(params).map_err(|e| ServiceError::Internal(anyhow!(e)))?;
        self.apply_verified_callback(&txn_id, v.success, v.amount.unwrap_or(0), Some(v.message), &raw)
            .await
    }

    /// Apply a signature-verified gateway result. Serialized by the advisory
    /// lock; replaying a callback is observable only as a repeated response.
    async fn apply_verified_callback(
        &self,
        txn_id: &str,
        success: bool,
        amount: u64,
        message: Option<String>,
        raw_response: &str,
    ) -> ServiceResult<CallbackResult> {
        let _guard = self.callback_lock.lock().await;

        let mut payment = match self.db.get_payment_by_txn_id(txn_id).await {
            Ok(p) => p,
            Err(e) if e.is_not_found() => {
                return Ok(CallbackResult::invalid("Payment transaction not found"));
            }
            Err(e) => return Err(e.into()),
        };

        // Replay: state already applied once, return the same answer
        if payment.status != PaymentStatus::Pending {
            return Ok(CallbackResult {
                valid: true,
                success: Some(payment.status == PaymentStatus::Completed),
                txn_id: Some(txn_id.to_string()),
                amount: Some(payment.amount),
                message,
                error: None,
            });
        }

        payment.gateway_response = raw_response.to_string();
        payment.updated = Utc::now();

        if success {
            payment.status = PaymentStatus::Completed;

            let mut order = self.db.get_order(payment.order_id).await?;
            let promo = if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Paid;
                order.updated = Utc::now();
                order.promotion_id.map(|promotion_id| UserPromotion {
                    id: Uuid::new_v4(),
                    user_id: order.user_id,
                    promotion_id,
                    order_id: order.id,
                    used_at: Utc::now(),
                })
            } else {
                warn!(
                    "Completed payment {} for order {} in state {}",
                    txn_id, order.order_number, order.status
                );
                None
            };
            self.db
                .settle_payment(&payment, &order, promo.as_ref())
                .await?;
            info!("Payment {} completed, order {} paid", txn_id, order.order_number);
        } else {
            payment.status = PaymentStatus::Failed;
            self.db.update_payment(&payment).await?;
            info!("Payment {} failed", txn_id);
        }

        Ok(CallbackResult {
            valid: true,
            success: Some(success),
            txn_id: Some(txn_id.to_string()),
            amount: Some(amount),
            message,
            error: None,
        })
    }

    /// Payments recorded against an order, newest first
    pub async fn order_payments(
        &self,
        user: &User,
        order_id: Uuid,
    ) -> ServiceResult<Vec<PaymentTransaction>> {
        let order = self.db.get_order(order_id).await?;
        if order.user_id != user.id && !user.is_admin() {
            return Err(ServiceError::forbidden(
                "You do not have permission to access this order",
            ));
        }
        Ok(self.db.list_order_payments(order.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockDb;
    use crate::settings::mock_settings;
    use vpsrent_db::{DiscountType, Promotion};

    async fn setup() -> (Arc<MockDb>, PaymentService, User, Order) {
        let db = Arc::new(MockDb::default());
        let user = db.add_user("buyer@example.com").await;
        let order = db.add_pending_order(&user, 150000).await;
        let svc = PaymentService::new(db.clone(), &mock_settings()).unwrap();
        (db, svc, user, order)
    }

    fn signed_momo_callback(order: &Order, txn_id: &str, result_code: i64) -> MoMoCallback {
        let config = mock_settings().momo.unwrap();
        let mut cb = MoMoCallback {
            partner_code: config.partner_code.clone(),
            order_id: txn_id.to_string(),
            request_id: "REQ_1".to_string(),
            amount: order.price,
            order_info: format!("Pay for order #{}", order.order_number),
            order_type: "momo_wallet".to_string(),
            trans_id: 42,
            result_code,
            message: if result_code == 0 {
                "Successful.".to_string()
            } else {
                "Declined".to_string()
            },
            pay_type: "qr".to_string(),
            response_time: 1700000040,
            extra_data: String::new(),
            signature: String::new(),
        };
        cb.signature = MoMoGateway::sign_callback(&config, &cb);
        cb
    }

    #[tokio::test]
    async fn paid_order_rejects_new_payment() {
        let (db, svc, user, mut order) = setup().await;
        order.status = OrderStatus::Paid;
        db.update_order(&order).await.unwrap();

        let err = svc
            .create_vnpay_payment(&user, &order.order_number, "127.0.0.1", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn vnpay_create_persists_pending_transaction() {
        let (db, svc, user, order) = setup().await;
        let info = svc
            .create_vnpay_payment(&user, &order.order_number, "127.0.0.1", None, None)
            .await
            .unwrap();
        assert!(info.payment_url.contains("vnp_SecureHash="));

        let payment = db.get_payment_by_txn_id(&info.txn_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.amount, order.price);
    }

    #[tokio::test]
    async fn momo_callback_settles_order_once() {
        let (db, svc, user, order) = setup().await;
        // seed a pending transaction as the create path would
        let txn_id = "VPS_TEST_1";
        svc.upsert_pending(&order, PaymentMethod::MoMo, txn_id, "{}")
            .await
            .unwrap();

        let cb = signed_momo_callback(&order, txn_id, 0);
        let first = svc.verify_momo_callback(cb.clone()).await.unwrap();
        assert!(first.valid);
        assert_eq!(first.success, Some(true));

        let order = db.get_order(order.id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        let payment = db.get_payment_by_txn_id(txn_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);

        // replay: same answer, no further state change
        let second = svc.verify_momo_callback(cb).await.unwrap();
        assert!(second.valid);
        assert_eq!(second.success, Some(true));
        assert_eq!(
            db.get_order(order.id).await.unwrap().status,
            OrderStatus::Paid
        );
        let _ = user;
    }

    #[tokio::test]
    async fn momo_callback_failure_marks_payment_failed() {
        let (db, svc, _user, order) = setup().await;
        let txn_id = "VPS_TEST_2";
        svc.upsert_pending(&order, PaymentMethod::MoMo, txn_id, "{}")
            .await
            .unwrap();

        let cb = signed_momo_callback(&order, txn_id, 1006);
        let result = svc.verify_momo_callback(cb).await.unwrap();
        assert!(result.valid);
        assert_eq!(result.success, Some(false));

        assert_eq!(
            db.get_order(order.id).await.unwrap().status,
            OrderStatus::Pending
        );
        assert_eq!(
            db.get_payment_by_txn_id(txn_id).await.unwrap().status,
            PaymentStatus::Failed
        );
    }

    #[tokio::test]
    async fn invalid_signature_touches_nothing() {
        let (db, svc, _user, order) = setup().await;
        let txn_id = "VPS_TEST_3";
        svc.upsert_pending(&order, PaymentMethod::MoMo, txn_id, "{}")
            .await
            .unwrap();

        let mut cb = signed_momo_callback(&order, txn_id, 0);
        cb.amount += 1;
        let result = svc.verify_momo_callback(cb).await.unwrap();
        assert!(!result.valid);
        assert_eq!(
            db.get_payment_by_txn_id(txn_id).await.unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn settling_consumes_promotion() {
        let (db, svc, user, mut order) = setup().await;
        let promo = Promotion {
            id: Uuid::new_v4(),
            code: "WELCOME10".to_string(),
            discount_type: DiscountType::Percentage,
            discount_value: 10,
            ..Default::default()
        };
        db.add_promotion(promo.clone()).await;
        order.promotion_id = Some(promo.id);
        db.update_order(&order).await.unwrap();

        let txn_id = "VPS_TEST_4";
        svc.upsert_pending(&order, PaymentMethod::MoMo, txn_id, "{}")
            .await
            .unwrap();
        let cb = signed_momo_callback(&order, txn_id, 0);
        svc.verify_momo_callback(cb.clone()).await.unwrap();

        assert_eq!(db.count_promotion_usage(promo.id).await.unwrap(), 1);
        assert_eq!(
            db.count_user_promotion_usage(promo.id, user.id).await.unwrap(),
            1
        );

        // replay must not double-consume
        svc.verify_momo_callback(cb).await.unwrap();
        assert_eq!(db.count_promotion_usage(promo.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn repay_updates_transaction_in_place() {
        let (db, svc, user, order) = setup().await;
        let first = svc
            .create_vnpay_payment(&user, &order.order_number, "127.0.0.1", None, None)
            .await
            .unwrap();
        let second = svc
            .create_vnpay_payment(&user, &order.order_number, "127.0.0.1", None, None)
            .await
            .unwrap();

        assert_eq!(first.payment_id, second.payment_id);
        assert_eq!(db.list_order_payments(order.id).await.unwrap().len(), 1);
        let _ = second;
    }
}
