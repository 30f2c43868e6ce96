pub mod model;
mod routes;
mod vnc;

pub use routes::routes as main_router;

use crate::auth::AuthService;
use crate::error::ServiceError;
use crate::host::HostRegistry;
use crate::lifecycle::VpsService;
use crate::orders::OrderService;
use crate::payments::PaymentService;
use crate::provisioner::Provisioner;
use crate::settings::Settings;
use crate::worker::WorkJob;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use vpsrent_db::{User, VpsRentDb};

#[derive(Clone)]
pub struct RouterState {
    pub db: Arc<dyn VpsRentDb>,
    pub settings: Settings,
    pub auth: Arc<AuthService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub provisioner: Arc<Provisioner>,
    pub vps: Arc<VpsService>,
    pub hosts: Arc<HostRegistry>,
    pub work_tx: UnboundedSender<WorkJob>,
}

pub type ApiResult<T> = Result<Json<ApiData<T>>, ApiError>;

#[derive(Serialize)]
pub struct ApiData<T: Serialize> {
    pub data: T,
}

impl<T: Serialize> ApiData<T> {
    pub fn ok(data: T) -> ApiResult<T> {
        Ok(Json(ApiData { data }))
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        let (status, message) = match e {
            ServiceError::Unauthenticated(m) => (StatusCode::UNAUTHORIZED, m),
            ServiceError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            ServiceError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ServiceError::Conflict(m) => (StatusCode::BAD_REQUEST, m),
            ServiceError::InvalidState(m) => (StatusCode::BAD_REQUEST, m),
            ServiceError::PaymentRequired(m) => (StatusCode::PAYMENT_REQUIRED, m),
            ServiceError::LimitExceeded(m) => (StatusCode::BAD_REQUEST, m),
            ServiceError::Upstream(m) => (StatusCode::BAD_GATEWAY, m),
            ServiceError::Internal(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        ApiError { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "message": self.message })),
        )
            .into_response()
    }
}

/// Authenticated request, resolved from the `Authorization: Bearer` header
pub struct AuthUser(pub User);

impl FromRequestParts<RouterState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &RouterState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Missing bearer token"))?;
        let user = state.auth.authenticate(&token).await?;
        Ok(AuthUser(user))
    }
}

/// Authenticated request that additionally requires the admin role
pub struct AdminUser(pub User);

impl FromRequestParts<RouterState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &RouterState,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(user) = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(ApiError::new(StatusCode::FORBIDDEN, "Admin role required"));
        }
        Ok(AdminUser(user))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|t| t.to_string())
}

/// Read a named cookie from the request headers
pub fn cookie_value(parts: &axum::http::HeaderMap, name: &str) -> Option<String> {
    let cookies = parts.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|c| {
        let (k, v) = c.trim().split_once('=')?;
        if k == name {
            Some(v.to_string())
        } else {
            None
        }
    })
}

/// First hop of X-Forwarded-For, falling back to localhost
pub fn client_ip(headers: &axum::http::HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string())
}
