use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, warn};

use crate::config::Config;
use crate::error::{ApiError, ApiErrorWithMeta, E_BAD_FILTER, E_UNAUTHORIZED, ledger_error};
use crate::ledger::Ledger;
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::types::{
    Approval, AuditReport, Investment, NewPaymentRequest, NewUser, PaymentRequest, StatusFilter,
    UserAccount,
};

/// Header carrying the admin token.
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// The application state.
#[derive(Clone)]
pub struct AppState {
    /// The ledger, shared by all handlers and used one request at a time.
    pub ledger: Arc<Mutex<Ledger>>,
    /// The application configuration.
    pub config: Config,
}

impl AppState {
    pub fn new(ledger: Ledger, config: Config) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(ledger)),
            config,
        }
    }
}

/// Query parameters for listing payment requests.
#[derive(Deserialize)]
pub struct ListRequestsQuery {
    /// `pending`, `approved`, `rejected` or `all`. Defaults to `pending`.
    pub status: Option<String>,
}

/// Query parameters for listing a user's investments.
#[derive(Deserialize)]
pub struct InvestmentsQuery {
    /// Only investments that are active and unexpired now.
    #[serde(default)]
    pub active: bool,
}

/// The response for a user's balance.
#[derive(Serialize)]
pub struct BalanceResponse {
    /// The ID of the user.
    pub user_id: String,
    /// The user's balance.
    pub balance: Decimal,
}

pub fn init_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/payment-requests", get(list_requests_handler))
        .route("/payment-requests/{id}", get(get_request_handler))
        .route("/payment-requests/{id}/approve", post(approve_handler))
        .route("/payment-requests/{id}/reject", post(reject_handler))
        .route("/audit", get(audit_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/users", post(register_user_handler))
        .route("/users/{user_id}/balance", get(get_balance_handler))
        .route("/users/{user_id}/investments", get(list_investments_handler))
        .route("/payment-requests", post(submit_request_handler))
        .nest("/admin", admin)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn require_admin(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiErrorWithMeta> {
    let expected = st.config.admin_token.as_str();
    let authorized = !expected.is_empty()
        && req
            .headers()
            .get(ADMIN_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|token| token == expected);

    if !authorized {
        warn!(request_id = %meta.request_id, path = %req.uri().path(), "admin request rejected");
        return Err(ApiError::Unauthorized("admin token required".into())
            .with_meta(meta)
            .with_code(E_UNAUTHORIZED));
    }
    Ok(next.run(req).await)
}

async fn register_user_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<NewUser>,
) -> Result<ApiOk<UserAccount>, ApiErrorWithMeta> {
    let mut ledger = st.ledger.lock().await;
    let user = ledger
        .register_user(req)
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;

    Ok(ApiOk::created("user registered", user, meta))
}

async fn get_balance_handler(
    State(st): State<AppState>,
    Path(user_id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<BalanceResponse>, ApiErrorWithMeta> {
    let mut ledger = st.ledger.lock().await;
    ledger
        .refresh()
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;
    let balance = ledger
        .balance(&user_id)
        .map_err(|e| ledger_error(e, meta.clone()))?;

    Ok(ApiOk::ok(
        "balance fetched",
        BalanceResponse { user_id, balance },
        meta,
    ))
}

async fn list_investments_handler(
    State(st): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<InvestmentsQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<Investment>>, ApiErrorWithMeta> {
    let mut ledger = st.ledger.lock().await;
    ledger
        .refresh()
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;
    ledger
        .get_user(&user_id)
        .map_err(|e| ledger_error(e, meta.clone()))?;

    let investments = if query.active {
        ledger.active_investments_for(&user_id, Utc::now())
    } else {
        ledger.investments_for(&user_id)
    };
    Ok(ApiOk::list("investments fetched", investments, meta))
}

async fn submit_request_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Json(req): Json<NewPaymentRequest>,
) -> Result<ApiOk<PaymentRequest>, ApiErrorWithMeta> {
    let mut ledger = st.ledger.lock().await;
    let request = ledger
        .submit_request(req)
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;

    Ok(ApiOk::created("payment request submitted", request, meta))
}

async fn list_requests_handler(
    State(st): State<AppState>,
    Query(query): Query<ListRequestsQuery>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Vec<PaymentRequest>>, ApiErrorWithMeta> {
    let filter: StatusFilter = query
        .status
        .as_deref()
        .unwrap_or("pending")
        .parse::<StatusFilter>()
        .map_err(|e| {
            ApiError::BadRequest(e)
                .with_meta(meta.clone())
                .with_code(E_BAD_FILTER)
        })?;

    let mut ledger = st.ledger.lock().await;
    ledger
        .refresh()
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;
    Ok(ApiOk::list(
        "payment requests fetched",
        ledger.list_requests(filter),
        meta,
    ))
}

async fn get_request_handler(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PaymentRequest>, ApiErrorWithMeta> {
    let mut ledger = st.ledger.lock().await;
    ledger
        .refresh()
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;
    let request = ledger
        .get_request(&id)
        .map_err(|e| ledger_error(e, meta.clone()))?
        .clone();

    Ok(ApiOk::ok("payment request fetched", request, meta))
}

async fn approve_handler(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<Approval>, ApiErrorWithMeta> {
    let mut ledger = st.ledger.lock().await;
    let approval = ledger
        .approve(&id)
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;

    Ok(ApiOk::ok("payment request approved", approval, meta))
}

async fn reject_handler(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<PaymentRequest>, ApiErrorWithMeta> {
    let mut ledger = st.ledger.lock().await;
    let request = ledger
        .reject(&id)
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;

    Ok(ApiOk::ok("payment request rejected", request, meta))
}

async fn audit_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
) -> Result<ApiOk<AuditReport>, ApiErrorWithMeta> {
    let mut ledger = st.ledger.lock().await;
    ledger
        .refresh()
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;
    let report = ledger.audit();
    if !report.is_clean() {
        warn!(violations = report.violations.len(), "ledger audit found violations");
    }
    Ok(ApiOk::ok("ledger audited", report, meta))
}
