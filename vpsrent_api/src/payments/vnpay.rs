//! Gateway V driver (VNPay 2.1.0).
//!
//! Signing: collect every `vnp_*` field except the signature itself, sort by
//! key ascending, URL-encode values with `+` for space, join as `k=v` pairs
//! with `&`, HMAC-SHA512 over the result, lowercase hex. Amounts are sent as
//! VND x 100 and divided back on verification.

use crate::payments::hmac_sha512_hex;
use crate::settings::VnPayConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use vpsrent_db::Order;

#[derive(Clone)]
pub struct VnPayGateway {
    config: VnPayConfig,
}

#[derive(Debug, Clone)]
pub struct VnPayCreateResult {
    pub payment_url: String,
    pub txn_id: String,
}

#[derive(Debug, Clone)]
pub struct VnPayVerification {
    pub valid: bool,
    pub success: bool,
    pub txn_id: Option<String>,
    /// VND, already divided by 100
    pub amount: Option<u64>,
    pub response_code: Option<String>,
    pub message: String,
}

/// Python's `quote_plus`: percent-encode, then spaces become `+`
fn quote_plus(v: &str) -> String {
    urlencoding::encode(v).replace("%20", "+")
}

/// Sorted, encoded `k=v&...` string both sides sign
pub fn signing_payload(params: &HashMap<String, String>) -> String {
    let mut sorted: Vec<(&String, &String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, quote_plus(v)))
        .collect::<Vec<_>>()
        .join("&")
}

impl VnPayGateway {
    pub fn new(config: VnPayConfig) -> Self {
        Self { config }
    }

    pub fn sign(&self, params: &HashMap<String, String>) -> String {
        hmac_sha512_hex(&self.config.hash_secret, &signing_payload(params))
    }

    /// Build the redirect URL the user is sent to. No gateway round-trip is
    /// needed, the payment page is driven entirely by the signed query string.
    pub fn build_payment_url(
        &self,
        order: &Order,
        client_ip: &str,
        return_url: Option<&str>,
        bank_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> VnPayCreateResult {
        let txn_id = format!("VPS{}{}", order.order_number, now.timestamp());
        // VNPay wants the amount multiplied by 100
        let amount = order.price * 100;

        let mut params: HashMap<String, String> = HashMap::from([
            ("vnp_Version".to_string(), "2.1.0".to_string()),
            ("vnp_Command".to_string(), "pay".to_string()),
            ("vnp_TmnCode".to_string(), self.config.tmn_code.clone()),
            ("vnp_Amount".to_string(), amount.to_string()),
            ("vnp_CurrCode".to_string(), "VND".to_string()),
            ("vnp_TxnRef".to_string(), txn_id.clone()),
            (
                "vnp_OrderInfo".to_string(),
                format!("Pay for order #{}", order.order_number),
            ),
            ("vnp_OrderType".to_string(), "other".to_string()),
            ("vnp_Locale".to_string(), "vn".to_string()),
            (
                "vnp_ReturnUrl".to_string(),
                return_url.unwrap_or(&self.config.return_url).to_string(),
            ),
            (
                "vnp_CreateDate".to_string(),
                now.format("%Y%m%d%H%M%S").to_string(),
            ),
            ("vnp_IpAddr".to_string(), client_ip.to_string()),
        ]);
        if let Some(bank) = bank_code {
            params.insert("vnp_BankCode".to_string(), bank.to_string());
        }

        let signature = self.sign(&params);
        let query = signing_payload(&params);
        let payment_url = format!(
            "{}?{}&vnp_SecureHash={}",
            self.config.url, query, signature
        );

        VnPayCreateResult {
            payment_url,
            txn_id,
        }
    }

    /// Verify a return-URL / IPN parameter set. Signature mismatch leaves all
    /// state untouched upstream, this function only judges the parameters.
    pub fn verify_return(&self, params: &HashMap<String, String>) -> VnPayVerification {
        let mut params = params.clone();
        let received = params.remove("vnp_SecureHash").unwrap_or_default();
        params.remove("vnp_SecureHashType");

        let expected = self.sign(&params);
        if !expected.eq_ignore_ascii_case(&received) {
            return VnPayVerification {
                valid: false,
                success: false,
                txn_id: None,
                amount: None,
                response_code: None,
                message: "Invalid signature".to_string(),
            };
        }

        let response_code = params.get("vnp_ResponseCode").cloned();
        let success = response_code.as_deref() == Some("00");
        let amount = params
            .get("vnp_Amount")
            .and_then(|a| a.parse::<u64>().ok())
            .map(|a| a / 100);

        VnPayVerification {
            valid: true,
            success,
            txn_id: params.get("vnp_TxnRef").cloned(),
            amount,
            response_code: response_code.clone(),
            message: response_message(response_code.as_deref()),
        }
    }
}

/// Subset of the gateway's published response-code table
fn response_message(code: Option<&str>) -> String {
    match code {
        Some("00") => "Transaction successful".to_string(),
        Some("07") => "Money deducted, transaction suspected of fraud".to_string(),
        Some("09") => "Card/account not registered for InternetBanking".to_string(),
        Some("11") => "Payment window expired".to_string(),
        Some("12") => "Card/account is locked".to_string(),
        Some("24") => "Customer cancelled the transaction".to_string(),
        Some("51") => "Insufficient account balance".to_string(),
        Some("65") => "Daily transaction limit exceeded".to_string(),
        Some("75") => "Issuing bank under maintenance".to_string(),
        Some("99") => "Unknown error".to_string(),
        Some(other) => format!("Error code: {}", other),
        None => "Missing response code".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::mock_settings;
    use chrono::TimeZone;
    use vpsrent_db::Order;

    fn gateway() -> VnPayGateway {
        VnPayGateway::new(mock_settings().vnpay.unwrap())
    }

    fn return_params(gw: &VnPayGateway, amount: u64, code: &str) -> HashMap<String, String> {
        let mut params: HashMap<String, String> = HashMap::from([
            ("vnp_Amount".to_string(), (amount * 100).to_string()),
            ("vnp_BankCode".to_string(), "NCB".to_string()),
            ("vnp_ResponseCode".to_string(), code.to_string()),
            ("vnp_TmnCode".to_string(), "VNPTEST".to_string()),
            ("vnp_TransactionNo".to_string(), "14217884".to_string()),
            (
                "vnp_TxnRef".to_string(),
                "VPSVPS-ABC123-XYZ7891700000000".to_string(),
            ),
            (
                "vnp_OrderInfo".to_string(),
                "Pay for order #VPS-ABC123-XYZ789".to_string(),
            ),
        ]);
        let sig = gw.sign(&params);
        params.insert("vnp_SecureHash".to_string(), sig);
        params
    }

    #[test]
    fn return_roundtrip_verifies() {
        let gw = gateway();
        let params = return_params(&gw, 150000, "00");
        let v = gw.verify_return(&params);
        assert!(v.valid);
        assert!(v.success);
        assert_eq!(v.amount, Some(150000));
        assert_eq!(v.txn_id.as_deref(), Some("VPSVPS-ABC123-XYZ7891700000000"));
    }

    #[test]
    fn signature_is_order_independent() {
        // the payload sorts keys, insertion order must not matter
        let gw = gateway();
        let mut a = HashMap::new();
        a.insert("vnp_Amount".to_string(), "100".to_string());
        a.insert("vnp_TxnRef".to_string(), "X".to_string());
        let mut b = HashMap::new();
        b.insert("vnp_TxnRef".to_string(), "X".to_string());
        b.insert("vnp_Amount".to_string(), "100".to_string());
        assert_eq!(gw.sign(&a), gw.sign(&b));
    }

    #[test]
    fn tampered_amount_is_rejected() {
        let gw = gateway();
        let mut params = return_params(&gw, 150000, "00");
        params.insert("vnp_Amount".to_string(), "99900".to_string());
        let v = gw.verify_return(&params);
        assert!(!v.valid);
    }

    #[test]
    fn failed_response_code_is_valid_but_unsuccessful() {
        let gw = gateway();
        let params = return_params(&gw, 150000, "24");
        let v = gw.verify_return(&params);
        assert!(v.valid);
        assert!(!v.success);
    }

    #[test]
    fn quote_plus_encodes_spaces_as_plus() {
        assert_eq!(quote_plus("Pay for order #1"), "Pay+for+order+%231");
        assert_eq!(quote_plus("a/b"), "a%2Fb");
    }

    #[test]
    fn payment_url_carries_doubled_amount() {
        let gw = gateway();
        let order = Order {
            order_number: "VPS-ABC-DEF".to_string(),
            price: 150000,
            ..Default::default()
        };
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let result = gw.build_payment_url(&order, "203.0.113.9", None, None, now);
        assert!(result.payment_url.contains("vnp_Amount=15000000"));
        assert!(result.payment_url.contains("vnp_SecureHash="));
        assert!(result.txn_id.starts_with("VPSVPS-ABC-DEF"));
    }
}
