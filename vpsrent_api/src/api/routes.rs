use crate::api::model::*;
use crate::api::vnc::vnc_ws_handler;
use crate::api::{client_ip, cookie_value, AdminUser, ApiData, ApiError, ApiResult, AuthUser, RouterState};
use crate::orders::{CanRepay, NewOrder};
use crate::payments::{CallbackResult, MoMoCallback, PaymentInfo};
use crate::worker::WorkJob;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use log::error;
use std::collections::HashMap;
use uuid::Uuid;

pub fn routes() -> Router<RouterState> {
    Router::new()
        // auth
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/verify-email", post(verify_email))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/refresh-token", post(refresh_token))
        .route("/auth/logout", post(logout))
        // catalog
        .route("/plans", get(list_plans))
        .route("/plans/{id}", get(get_plan))
        // orders
        .route("/orders", get(list_orders).post(create_order))
        .route("/orders/{id}", get(get_order))
        // promotions
        .route("/promotions/validate", post(validate_promotion))
        // payments
        .route("/payments/order/{id}/can-repay", get(can_repay))
        .route("/payments/momo/create", post(momo_create))
        .route("/payments/momo/repay", post(momo_create))
        .route("/payments/momo/return", get(momo_return))
        .route("/payments/momo/notify", post(momo_notify))
        .route("/payments/vnpay/create", post(vnpay_create))
        .route("/payments/vnpay/repay", post(vnpay_create))
        .route("/payments/vnpay/return", get(vnpay_return))
        .route("/payments/vnpay/ipn", post(vnpay_ipn))
        // vps
        .route("/vps/setup", post(vps_setup))
        .route("/vps/my-vps", get(my_vps))
        .route("/vps/{id}/info", get(vps_info))
        .route("/vps/{id}/rrd", get(vps_rrd))
        .route("/vps/{id}/power", post(vps_power))
        .route("/vps/{id}/vnc", get(vps_vnc))
        .route(
            "/vps/{id}/snapshots",
            get(list_snapshots).post(create_snapshot),
        )
        .route("/vps/{id}/snapshots/restore", post(restore_snapshot))
        .route("/vps/{id}/snapshots/{name}", axum::routing::delete(delete_snapshot))
        // admin
        .route("/admin/dashboard/stats", get(dashboard_stats))
        .route("/admin/dashboard/analytics", get(dashboard_analytics))
        .route("/admin/orders/{id}/cancel", post(cancel_order))
        // VNC byte proxy
        .route("/vnc/ws", any(vnc_ws_handler))
}

// -- auth

async fn register(
    State(state): State<RouterState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<serde_json::Value> {
    let user = state.auth.register(&req.email, &req.password).await?;
    let verify_url = format!(
        "{}/auth/verify-email?token={}",
        state.settings.public_url, user.verify_token
    );
    if let Err(e) = state.work_tx.send(WorkJob::SendNotification {
        user_id: user.id,
        title: "Verify your email address".to_string(),
        message: format!("Welcome! Confirm your email address: {}", verify_url),
    }) {
        error!("Failed to queue verification email: {}", e);
    }
    ApiData::ok(serde_json::json!({
        "message": "Account created, check your inbox for a verification link"
    }))
}

async fn login(
    State(state): State<RouterState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (_user, access, refresh) = state.auth.login(&req.email, &req.password).await?;
    let cookie = format!(
        "{}={}; HttpOnly; Path=/; Max-Age={}; SameSite=Lax",
        state.auth.refresh_cookie_name(),
        refresh,
        state.auth.refresh_ttl_days() * 86400
    );
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(ApiData {
            data: TokenResponse {
                access_token: access,
                token_type: "Bearer".to_string(),
                expires_in: 15 * 60,
            },
        }),
    ))
}

async fn verify_email(
    State(state): State<RouterState>,
    Json(req): Json<VerifyEmailRequest>,
) -> ApiResult<serde_json::Value> {
    state.auth.verify_email(&req.token).await?;
    ApiData::ok(serde_json::json!({ "message": "Email verified" }))
}

async fn forgot_password(
    State(state): State<RouterState>,
    Json(req): Json<ForgotPasswordRequest>,
) -> ApiResult<serde_json::Value> {
    if let Some((user, token)) = state.auth.forgot_password(&req.email).await? {
        let reset_url = format!(
            "{}/auth/reset-password?token={}",
            state.settings.public_url, token
        );
        if let Err(e) = state.work_tx.send(WorkJob::SendNotification {
            user_id: user.id,
            title: "Password reset".to_string(),
            message: format!("Reset your password: {}", reset_url),
        }) {
            error!("Failed to queue reset email: {}", e);
        }
    }
    // identical answer whether or not the email exists
    ApiData::ok(serde_json::json!({
        "message": "If that address is registered, a reset link is on its way"
    }))
}

async fn reset_password(
    State(state): State<RouterState>,
    Json(req): Json<ResetPasswordRequest>,
) -> ApiResult<serde_json::Value> {
    state.auth.reset_password(&req.token, &req.password).await?;
    ApiData::ok(serde_json::json!({ "message": "Password updated" }))
}

async fn refresh_token(
    State(state): State<RouterState>,
    headers: HeaderMap,
) -> ApiResult<TokenResponse> {
    let refresh = cookie_value(&headers, state.auth.refresh_cookie_name())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Missing refresh cookie"))?;
    let (_user, access) = state.auth.refresh(&refresh).await?;
    ApiData::ok(TokenResponse {
        access_token: access,
        token_type: "Bearer".to_string(),
        expires_in: 15 * 60,
    })
}

async fn logout(State(state): State<RouterState>) -> impl IntoResponse {
    let cookie = format!(
        "{}=; HttpOnly; Path=/; Max-Age=0; SameSite=Lax",
        state.auth.refresh_cookie_name()
    );
    (
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "message": "Logged out" })),
    )
}

// -- catalog

async fn list_plans(State(state): State<RouterState>) -> ApiResult<Vec<ApiPlan>> {
    let plans = state.db.list_plans().await.map_err(|e| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    ApiData::ok(plans.into_iter().map(ApiPlan::from).collect())
}

async fn get_plan(
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ApiPlan> {
    let plan = state
        .db
        .get_plan(id)
        .await
        .map_err(|_| ApiError::new(StatusCode::NOT_FOUND, "Plan not found"))?;
    ApiData::ok(plan.into())
}

// -- orders

async fn create_order(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Json(req): Json<NewOrder>,
) -> ApiResult<ApiOrder> {
    let (order, items) = state.orders.create_order(&user, req).await?;
    ApiData::ok(ApiOrder::from(order, items))
}

async fn list_orders(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
) -> ApiResult<Vec<ApiOrder>> {
    let orders = state.orders.list_orders(&user).await?;
    let mut out = Vec::with_capacity(orders.len());
    for order in orders {
        let items = state
            .db
            .list_order_items(order.id)
            .await
            .unwrap_or_default();
        out.push(ApiOrder::from(order, items));
    }
    ApiData::ok(out)
}

async fn get_order(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ApiOrder> {
    let order = state.orders.get_user_order(&user, id).await?;
    let items = state
        .db
        .list_order_items(order.id)
        .await
        .unwrap_or_default();
    ApiData::ok(ApiOrder::from(order, items))
}

// -- promotions

#[derive(serde::Deserialize)]
struct PromotionValidateRequest {
    code: String,
    cart_total: u64,
}

async fn validate_promotion(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Json(req): Json<PromotionValidateRequest>,
) -> ApiResult<crate::orders::PromotionQuote> {
    let (promotion, discount) = state
        .orders
        .validate_promotion(user.id, &req.code, req.cart_total)
        .await?;
    ApiData::ok(crate::orders::PromotionQuote {
        code: promotion.code,
        discount_amount: discount,
        final_amount: req.cart_total.saturating_sub(discount),
    })
}

// -- payments

async fn can_repay(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
) -> ApiResult<CanRepay> {
    ApiData::ok(state.orders.can_repay(&user, id).await?)
}

async fn momo_create(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Json(req): Json<PaymentRequest>,
) -> ApiResult<PaymentInfo> {
    let info = state
        .payments
        .create_momo_payment(&user, &req.order_number, req.return_url.as_deref())
        .await?;
    ApiData::ok(info)
}

async fn momo_return(
    State(state): State<RouterState>,
    Query(cb): Query<MoMoCallback>,
) -> ApiResult<CallbackResult> {
    ApiData::ok(state.payments.verify_momo_callback(cb).await?)
}

/// IPN answer contract: resultCode 0 means received, anything else rejected
async fn momo_notify(
    State(state): State<RouterState>,
    Json(cb): Json<MoMoCallback>,
) -> Json<serde_json::Value> {
    match state.payments.verify_momo_callback(cb).await {
        Ok(result) if result.valid => Json(serde_json::json!({
            "resultCode": 0,
            "message": "Received",
        })),
        Ok(result) => Json(serde_json::json!({
            "resultCode": 1,
            "message": result.error.unwrap_or_else(|| "Verification failed".to_string()),
        })),
        Err(e) => {
            error!("MoMo IPN processing error: {}", e);
            Json(serde_json::json!({
                "resultCode": 1,
                "message": "An error occurred while processing the notification",
            }))
        }
    }
}

async fn vnpay_create(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    headers: HeaderMap,
    Json(req): Json<PaymentRequest>,
) -> ApiResult<PaymentInfo> {
    let ip = client_ip(&headers);
    let info = state
        .payments
        .create_vnpay_payment(
            &user,
            &req.order_number,
            &ip,
            req.return_url.as_deref(),
            req.bank_code.as_deref(),
        )
        .await?;
    ApiData::ok(info)
}

async fn vnpay_return(
    State(state): State<RouterState>,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<CallbackResult> {
    ApiData::ok(state.payments.verify_vnpay_return(&params).await?)
}

/// IPN answer contract: RspCode 00 confirm, 97 invalid signature, 99 error
async fn vnpay_ipn(
    State(state): State<RouterState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<serde_json::Value> {
    match state.payments.verify_vnpay_return(&params).await {
        Ok(result) if result.valid && result.success == Some(true) => Json(serde_json::json!({
            "RspCode": "00",
            "Message": "Confirm Success",
        })),
        Ok(result) => Json(serde_json::json!({
            "RspCode": "97",
            "Message": result.error.unwrap_or_else(|| "Invalid signature".to_string()),
        })),
        Err(e) => {
            error!("VNPay IPN processing error: {}", e);
            Json(serde_json::json!({
                "RspCode": "99",
                "Message": "An error occurred while processing the notification",
            }))
        }
    }
}

// -- vps

async fn vps_setup(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Json(req): Json<VpsSetupRequest>,
) -> ApiResult<VpsSetupResponse> {
    // Run detached: a client disconnect must not abort the hypervisor work,
    // provisioning either commits or compensates regardless.
    let provisioner = state.provisioner.clone();
    let order_number = req.order_number.clone();
    let (order, provisioned) = tokio::spawn(async move {
        provisioner.setup_order(&user, &order_number).await
    })
    .await
    .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))??;
    ApiData::ok(VpsSetupResponse {
        success: true,
        message: format!("{} VPS provisioned", provisioned.len()),
        order_number: order.order_number,
        vps_list: provisioned.into_iter().map(VpsSetupItem::from).collect(),
    })
}

async fn my_vps(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
) -> ApiResult<Vec<ApiVps>> {
    let list = state.vps.list_my(&user).await?;
    ApiData::ok(list.iter().map(ApiVps::from).collect())
}

async fn vps_info(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ApiVpsDetail> {
    let info = state.vps.info(&user, id).await?;
    ApiData::ok(info.into())
}

async fn vps_rrd(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
    Query(q): Query<RrdQuery>,
) -> ApiResult<Vec<serde_json::Value>> {
    let data = state
        .vps
        .rrd(&user, id, q.timeframe.as_deref(), q.cf.as_deref())
        .await?;
    ApiData::ok(data)
}

async fn vps_power(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
    Json(req): Json<PowerRequest>,
) -> ApiResult<OperationResponse> {
    let task_id = state.vps.power(&user, id, req.action).await?;
    ApiData::ok(OperationResponse {
        success: true,
        message: format!("Power action {} completed", req.action),
        task_id: Some(task_id),
    })
}

async fn vps_vnc(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::lifecycle::VncAccess> {
    ApiData::ok(state.vps.vnc(&user, id).await?)
}

async fn list_snapshots(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
) -> ApiResult<crate::lifecycle::SnapshotList> {
    ApiData::ok(state.vps.list_snapshots(&user, id).await?)
}

async fn create_snapshot(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SnapshotCreateRequest>,
) -> ApiResult<OperationResponse> {
    let task_id = state
        .vps
        .create_snapshot(&user, id, &req.name, req.description.as_deref())
        .await?;
    ApiData::ok(OperationResponse {
        success: true,
        message: format!("Snapshot '{}' created", req.name),
        task_id: Some(task_id),
    })
}

async fn restore_snapshot(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
    Json(req): Json<SnapshotRestoreRequest>,
) -> ApiResult<OperationResponse> {
    let task_id = state
        .vps
        .rollback_snapshot(&user, id, &req.snapshot_name)
        .await?;
    ApiData::ok(OperationResponse {
        success: true,
        message: format!("Rollback to '{}' completed", req.snapshot_name),
        task_id: Some(task_id),
    })
}

async fn delete_snapshot(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path((id, name)): Path<(Uuid, String)>,
) -> ApiResult<OperationResponse> {
    let task_id = state.vps.delete_snapshot(&user, id, &name).await?;
    ApiData::ok(OperationResponse {
        success: true,
        message: format!("Snapshot '{}' deleted", name),
        task_id: Some(task_id),
    })
}

// -- admin

async fn dashboard_stats(
    AdminUser(_admin): AdminUser,
    State(state): State<RouterState>,
) -> ApiResult<DashboardStats> {
    use vpsrent_db::{OrderStatus, VpsStatus};
    let stats = DashboardStats {
        users: state.db.count_users().await.map_err(internal)?,
        orders_pending: state
            .db
            .count_orders_by_status(OrderStatus::Pending)
            .await
            .map_err(internal)?,
        orders_paid: state
            .db
            .count_orders_by_status(OrderStatus::Paid)
            .await
            .map_err(internal)?,
        orders_cancelled: state
            .db
            .count_orders_by_status(OrderStatus::Cancelled)
            .await
            .map_err(internal)?,
        vps_active: state
            .db
            .count_instances_by_status(VpsStatus::Active)
            .await
            .map_err(internal)?,
        vps_suspended: state
            .db
            .count_instances_by_status(VpsStatus::Suspended)
            .await
            .map_err(internal)?,
        vps_terminated: state
            .db
            .count_instances_by_status(VpsStatus::Terminated)
            .await
            .map_err(internal)?,
        total_revenue: state.db.total_revenue().await.map_err(internal)?,
    };
    ApiData::ok(stats)
}

async fn dashboard_analytics(
    AdminUser(_admin): AdminUser,
    State(state): State<RouterState>,
) -> ApiResult<serde_json::Value> {
    use vpsrent_db::VpsStatus;
    let creating = state
        .db
        .count_instances_by_status(VpsStatus::Creating)
        .await
        .map_err(internal)?;
    let active = state
        .db
        .count_instances_by_status(VpsStatus::Active)
        .await
        .map_err(internal)?;
    let suspended = state
        .db
        .count_instances_by_status(VpsStatus::Suspended)
        .await
        .map_err(internal)?;
    let error = state
        .db
        .count_instances_by_status(VpsStatus::Error)
        .await
        .map_err(internal)?;
    ApiData::ok(serde_json::json!({
        "vps_by_status": {
            "creating": creating,
            "active": active,
            "suspended": suspended,
            "error": error,
        },
        "total_revenue": state.db.total_revenue().await.map_err(internal)?,
    }))
}

async fn cancel_order(
    AuthUser(user): AuthUser,
    State(state): State<RouterState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ApiOrder> {
    let order = state.orders.cancel_order(&user, id).await?;
    ApiData::ok(ApiOrder::from(order, vec![]))
}

fn internal(e: vpsrent_db::DbError) -> ApiError {
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
