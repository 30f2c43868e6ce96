//! Gateway M driver (MoMo v2 API).
//!
//! Requests are signed with HMAC-SHA256 over a concatenated key=value string
//! in a fixed field order (NOT sorted). The callback is verified against a
//! parallel fixed-order string built from the *response* fields. Both strings
//! must match the gateway byte-for-byte.

use crate::json_api::JsonApi;
use crate::payments::{de_i64, de_u64, hmac_sha256_hex};
use crate::retry::OpError;
use crate::settings::MoMoConfig;
use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use vpsrent_db::Order;

#[derive(Clone)]
pub struct MoMoGateway {
    config: MoMoConfig,
    api: JsonApi,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct MoMoCreateRequest {
    partner_code: String,
    partner_name: String,
    store_id: String,
    request_id: String,
    amount: u64,
    order_id: String,
    order_info: String,
    redirect_url: String,
    ipn_url: String,
    lang: String,
    extra_data: String,
    request_type: String,
    signature: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoMoCreateResponse {
    #[serde(deserialize_with = "de_i64")]
    pub result_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub pay_url: Option<String>,
    #[serde(default)]
    pub qr_code_url: Option<String>,
    #[serde(default)]
    pub deeplink: Option<String>,
}

/// Outcome of a create call, before any persistence
#[derive(Debug, Clone)]
pub struct MoMoCreateResult {
    pub txn_id: String,
    pub request_id: String,
    pub response: MoMoCreateResponse,
    pub raw_response: String,
}

/// Fields delivered on both the IPN body and the return-URL query string
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoMoCallback {
    pub partner_code: String,
    pub order_id: String,
    pub request_id: String,
    #[serde(deserialize_with = "de_u64")]
    pub amount: u64,
    #[serde(default)]
    pub order_info: String,
    #[serde(default)]
    pub order_type: String,
    #[serde(default, deserialize_with = "de_i64")]
    pub trans_id: i64,
    #[serde(deserialize_with = "de_i64")]
    pub result_code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub pay_type: String,
    #[serde(default, deserialize_with = "de_i64")]
    pub response_time: i64,
    #[serde(default)]
    pub extra_data: String,
    #[serde(default)]
    pub signature: String,
}

impl MoMoGateway {
    pub fn new(config: MoMoConfig) -> Result<Self> {
        let api = JsonApi::new(&config.endpoint)?;
        Ok(Self { config, api })
    }

    /// Request signature, fixed field order per the gateway contract
    pub fn sign_create(
        config: &MoMoConfig,
        amount: u64,
        extra_data: &str,
        ipn_url: &str,
        order_id: &str,
        order_info: &str,
        redirect_url: &str,
        request_id: &str,
    ) -> String {
        let raw = format!(
            "accessKey={}&amount={}&extraData={}&ipnUrl={}&orderId={}&orderInfo={}&partnerCode={}&redirectUrl={}&requestId={}&requestType=payWithMethod",
            config.access_key,
            amount,
            extra_data,
            ipn_url,
            order_id,
            order_info,
            config.partner_code,
            redirect_url,
            request_id,
        );
        hmac_sha256_hex(&config.secret_key, &raw)
    }

    /// Expected callback signature, built from the response fields
    pub fn sign_callback(config: &MoMoConfig, cb: &MoMoCallback) -> String {
        let raw = format!(
            "accessKey={}&amount={}&extraData={}&message={}&orderId={}&orderInfo={}&orderType={}&partnerCode={}&payType={}&requestId={}&responseTime={}&resultCode={}&transId={}",
            config.access_key,
            cb.amount,
            cb.extra_data,
            cb.message,
            cb.order_id,
            cb.order_info,
            cb.order_type,
            cb.partner_code,
            cb.pay_type,
            cb.request_id,
            cb.response_time,
            cb.result_code,
            cb.trans_id,
        );
        hmac_sha256_hex(&config.secret_key, &raw)
    }

    pub fn verify_callback_signature(&self, cb: &MoMoCallback) -> bool {
        Self::sign_callback(&self.config, cb).eq_ignore_ascii_case(&cb.signature)
    }

    /// Submit a create-payment request to the gateway
    pub async fn create_payment(
        &self,
        order: &Order,
        return_url: Option<&str>,
    ) -> Result<MoMoCreateResult, OpError> {
        let ts = Utc::now().timestamp();
        let request_id = format!("REQ_{}_{}", order.id.simple(), ts);
        let txn_id = format!("VPS_{}_{}", order.order_number, ts);
        let order_info = format!("Pay for order #{}", order.order_number);
        let redirect_url = return_url.unwrap_or(&self.config.return_url).to_string();
        let ipn_url = self.config.notify_url.clone();

        let signature = Self::sign_create(
            &self.config,
            order.price,
            "",
            &ipn_url,
            &txn_id,
            &order_info,
            &redirect_url,
            &request_id,
        );

        let req = MoMoCreateRequest {
            partner_code: self.config.partner_code.clone(),
            partner_name: "VPS Rental".to_string(),
            store_id: "VPSRentalStore".to_string(),
            request_id: request_id.clone(),
            amount: order.price,
            order_id: txn_id.clone(),
            order_info,
            redirect_url,
            ipn_url,
            lang: "vi".to_string(),
            extra_data: String::new(),
            request_type: "payWithMethod".to_string(),
            signature,
        };

        let rsp: MoMoCreateResponse = self.api.post("", &req).await?;
        let raw_response = serde_json::to_string(&serde_json::json!({
            "resultCode": rsp.result_code,
            "message": rsp.message,
            "payUrl": rsp.pay_url,
        }))
        .unwrap_or_default();

        Ok(MoMoCreateResult {
            txn_id,
            request_id,
            response: rsp,
            raw_response,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::mock_settings;

    fn mock_callback() -> MoMoCallback {
        MoMoCallback {
            partner_code: "MOMOTEST".to_string(),
            order_id: "VPS_VPS-ABC123-XYZ789_1700000000".to_string(),
            request_id: "REQ_1_1700000000".to_string(),
            amount: 150000,
            order_info: "Pay for order #VPS-ABC123-XYZ789".to_string(),
            order_type: "momo_wallet".to_string(),
            trans_id: 4088878653,
            result_code: 0,
            message: "Successful.".to_string(),
            pay_type: "qr".to_string(),
            response_time: 1700000040,
            extra_data: String::new(),
            signature: String::new(),
        }
    }

    #[test]
    fn callback_roundtrip_verifies() {
        let settings = mock_settings();
        let config = settings.momo.unwrap();
        let gw = MoMoGateway::new(config.clone()).unwrap();

        let mut cb = mock_callback();
        cb.signature = MoMoGateway::sign_callback(&config, &cb);
        assert!(gw.verify_callback_signature(&cb));

        // case of the hex digest must not matter
        cb.signature = cb.signature.to_uppercase();
        assert!(gw.verify_callback_signature(&cb));
    }

    #[test]
    fn tampered_amount_fails_verification() {
        let settings = mock_settings();
        let config = settings.momo.unwrap();
        let gw = MoMoGateway::new(config.clone()).unwrap();

        let mut cb = mock_callback();
        cb.signature = MoMoGateway::sign_callback(&config, &cb);
        cb.amount += 1;
        assert!(!gw.verify_callback_signature(&cb));
    }

    #[test]
    fn create_signature_uses_fixed_field_order() {
        let settings = mock_settings();
        let config = settings.momo.unwrap();

        let a = MoMoGateway::sign_create(
            &config, 150000, "", "http://ipn", "ORDER1", "info", "http://ret", "REQ1",
        );
        let b = MoMoGateway::sign_create(
            &config, 150000, "", "http://ipn", "ORDER1", "info", "http://ret", "REQ1",
        );
        // deterministic for identical inputs
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        // any field change moves the digest
        let c = MoMoGateway::sign_create(
            &config, 150001, "", "http://ipn", "ORDER1", "info", "http://ret", "REQ1",
        );
        assert_ne!(a, c);
    }

    #[test]
    fn callback_parses_numbers_from_strings() {
        // return-URL delivery carries everything as strings
        let cb: MoMoCallback = serde_json::from_value(serde_json::json!({
            "partnerCode": "MOMOTEST",
            "orderId": "VPS_X_1",
            "requestId": "REQ_1",
            "amount": "150000",
            "resultCode": "0",
            "transId": "123",
            "responseTime": "1700000040",
            "message": "Successful.",
            "signature": "ab"
        }))
        .unwrap();
        assert_eq!(cb.amount, 150000);
        assert_eq!(cb.result_code, 0);
        assert_eq!(cb.trans_id, 123);
    }
}
