use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Listen address for the http server
    pub listen: Option<String>,

    /// MYSQL connection string
    pub db: String,

    /// Public URL mapping to this service
    pub public_url: String,

    /// Token signing and password hashing
    pub auth: AuthConfig,

    /// Tuning for hypervisor task polling and retries
    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    /// Expiration sweep tuning
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Gateway M credentials
    pub momo: Option<MoMoConfig>,

    /// Gateway V credentials
    pub vnpay: Option<VnPayConfig>,

    /// SMTP settings for sending notification emails
    pub smtp: Option<SmtpConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthConfig {
    /// HMAC secret for access/refresh tokens
    pub secret_key: String,
    #[serde(default = "default_access_ttl")]
    pub access_ttl_minutes: u64,
    #[serde(default = "default_refresh_ttl")]
    pub refresh_ttl_days: u64,
    /// Name of the HTTP-only refresh cookie
    #[serde(default = "default_refresh_cookie")]
    pub refresh_cookie: String,
}

fn default_access_ttl() -> u64 {
    15
}

fn default_refresh_ttl() -> u64 {
    14
}

fn default_refresh_cookie() -> String {
    "refresh_token".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct HypervisorConfig {
    /// Upper bound on waiting for any single hypervisor task
    pub task_timeout_secs: u64,
    /// Stop attempts before a delete is abandoned
    pub stop_attempts: u32,
    pub stop_interval_secs: u64,
    /// Guest agent IP polling window after first boot
    pub guest_ip_attempts: u32,
    pub guest_ip_interval_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: 300,
            stop_attempts: 10,
            stop_interval_secs: 30,
            guest_ip_attempts: 30,
            guest_ip_interval_secs: 10,
        }
    }
}

impl HypervisorConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn stop_interval(&self) -> Duration {
        Duration::from_secs(self.stop_interval_secs)
    }

    pub fn guest_ip_interval(&self) -> Duration {
        Duration::from_secs(self.guest_ip_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Minutes between expiration sweeps
    pub sweep_interval_minutes: u64,
    /// Hours a suspended VPS survives before termination
    pub grace_period_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_minutes: 5,
            grace_period_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MoMoConfig {
    pub partner_code: String,
    pub access_key: String,
    pub secret_key: String,
    /// Gateway create-payment endpoint
    pub endpoint: String,
    pub return_url: String,
    pub notify_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VnPayConfig {
    pub tmn_code: String,
    pub hash_secret: String,
    /// Gateway payment page URL
    pub url: String,
    pub return_url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SmtpConfig {
    /// Email server host
    pub server: String,
    /// From header to use, otherwise empty
    pub from: Option<String>,
    pub username: String,
    pub password: String,
}

impl Settings {
    /// Load from a YAML file with `VPSRENT__` env overrides
    pub fn load(path: &str) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("VPSRENT").separator("__"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

#[cfg(test)]
pub fn mock_settings() -> Settings {
    Settings {
        listen: None,
        db: String::new(),
        public_url: "http://localhost:8000".to_string(),
        auth: AuthConfig {
            secret_key: "test-secret".to_string(),
            access_ttl_minutes: 15,
            refresh_ttl_days: 14,
            refresh_cookie: "refresh_token".to_string(),
        },
        hypervisor: HypervisorConfig {
            task_timeout_secs: 5,
            stop_attempts: 2,
            stop_interval_secs: 0,
            guest_ip_attempts: 2,
            guest_ip_interval_secs: 0,
        },
        scheduler: SchedulerConfig {
            sweep_interval_minutes: 5,
            grace_period_hours: 24,
        },
        momo: Some(MoMoConfig {
            partner_code: "MOMOTEST".to_string(),
            access_key: "access".to_string(),
            secret_key: "secret".to_string(),
            endpoint: "https://test-payment.momo.vn/v2/gateway/api/create".to_string(),
            return_url: "http://localhost:8000/payments/momo/return".to_string(),
            notify_url: "http://localhost:8000/payments/momo/notify".to_string(),
        }),
        vnpay: Some(VnPayConfig {
            tmn_code: "VNPTEST".to_string(),
            hash_secret: "vnpay-secret".to_string(),
            url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string(),
            return_url: "http://localhost:8000/payments/vnpay/return".to_string(),
        }),
        smtp: None,
    }
}
