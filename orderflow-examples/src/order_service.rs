//! # Order service over HTTP
//!
//! Maps the order placement orchestrator and the order ledger onto a small
//! REST API:
//!
//! | Method   | Path                           | Purpose                           |
//! |----------|--------------------------------|-----------------------------------|
//! | `POST`   | `/orders`                      | place an order                    |
//! | `GET`    | `/orders`                      | list orders, newest first         |
//! | `GET`    | `/orders/stats`                | aggregate statistics              |
//! | `GET`    | `/orders/user/{user_id}`       | one user's orders                 |
//! | `GET`    | `/orders/{id}`                 | one order                         |
//! | `PATCH`  | `/orders/{id}/status`          | move an order along its lifecycle |
//! | `POST`   | `/discount-codes`              | create a discount code            |
//! | `GET`    | `/discount-codes`              | list codes, optionally active only|
//! | `POST`   | `/discount-codes/preview`      | price a code without redeeming it |
//! | `GET`    | `/discount-codes/{code}`       | one code                          |
//! | `PUT`    | `/discount-codes/{code}`       | change a code                     |
//! | `DELETE` | `/discount-codes/{code}`       | deactivate a code                 |
//! | `GET`    | `/discount-codes/{code}/usage` | usage statistics for a code       |
//! | `GET`    | `/health`                      | ledger and exchange health        |
//!
//! Placement failures keep the status chosen by
//! [`PlacementError::http_status`]. Every error body is an [`ErrorResponse`],
//! including malformed paths, queries and JSON bodies.
//!
//! Deleting a discount code only switches it off: its redemptions stay part
//! of the usage statistics.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::Json,
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use orderflow::{
    evaluate, CollaboratorError, DiscountCode, DiscountCodeId, DiscountCodeUpdate,
    DiscountEvaluation, DiscountKind, DiscountUsage, LedgerError, Money, NewDiscountCode, Order,
    OrderId, OrderLedger, OrderPlacement, OrderQuery, OrderRequestBody, OrderStats, OrderStatus,
    Page, PageRequest, Pagination, PlaceOrderRequest, PlacementError, PromoCode, Promotions,
    Timestamp, UserId, ValidationError,
};
use orderflow_memory::{FanoutExchange, InMemoryPromotions, PromotionsAdminError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    placement: Arc<OrderPlacement>,
    ledger: Arc<dyn OrderLedger>,
    exchange: FanoutExchange,
    promotions: InMemoryPromotions,
}

impl AppState {
    /// Builds the state from an orchestrator and the exchange it publishes to.
    ///
    /// Queries go to the same ledger the orchestrator writes. `promotions`
    /// should be the store the orchestrator's promotions collaborator reads.
    pub fn new(
        placement: OrderPlacement,
        exchange: FanoutExchange,
        promotions: InMemoryPromotions,
    ) -> Self {
        let ledger = Arc::clone(&placement.collaborators().ledger);
        Self {
            placement: Arc::new(placement),
            ledger,
            exchange,
            promotions,
        }
    }
}

/// Body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human readable reason.
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn bad_request(error: &ValidationError) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, error)
}

fn placement_failure(failure: &PlacementError) -> ApiError {
    let status =
        StatusCode::from_u16(failure.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    api_error(status, failure)
}

fn path_rejected(rejection: &PathRejection) -> ApiError {
    api_error(rejection.status(), rejection.body_text())
}

fn query_rejected(rejection: &QueryRejection) -> ApiError {
    api_error(rejection.status(), rejection.body_text())
}

fn json_rejected(rejection: &JsonRejection) -> ApiError {
    api_error(rejection.status(), rejection.body_text())
}

fn admin_failure(failure: &PromotionsAdminError) -> ApiError {
    match failure {
        PromotionsAdminError::DuplicateCode(_) => api_error(StatusCode::CONFLICT, failure),
        PromotionsAdminError::NotFound(_) => api_error(StatusCode::NOT_FOUND, failure),
        PromotionsAdminError::Invalid(e) => bad_request(e),
    }
}

fn promotions_unavailable(failure: &CollaboratorError) -> ApiError {
    error!(error = %failure, "[http.promotions] collaborator failure");
    api_error(StatusCode::BAD_GATEWAY, failure)
}

fn promo_code(raw: String) -> Result<PromoCode, ApiError> {
    PromoCode::try_new(raw).map_err(|e| bad_request(&ValidationError::field("code", e)))
}

fn code_not_found(code: &PromoCode) -> ApiError {
    admin_failure(&PromotionsAdminError::NotFound(code.clone()))
}

fn ledger_failure(failure: &LedgerError) -> ApiError {
    let status = match failure {
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::DuplicateIdempotencyKey { .. } | LedgerError::InvalidTransition { .. } => {
            StatusCode::CONFLICT
        }
        LedgerError::InvariantViolated(_) => StatusCode::BAD_REQUEST,
        LedgerError::StoreFailure { .. } => {
            error!(error = %failure, "[http.ledger] store failure");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, failure)
}

/// Query parameters of `GET /orders`.
#[derive(Debug, Default, Deserialize)]
pub struct ListOrdersParams {
    /// 1-based page number.
    pub page: Option<u32>,
    /// Page size.
    pub limit: Option<u32>,
    /// Status filter, case-insensitive.
    pub status: Option<String>,
    /// Owner filter.
    pub user_id: Option<String>,
}

/// Query parameters of `GET /orders/user/{user_id}`.
#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    /// 1-based page number.
    pub page: Option<u32>,
    /// Page size.
    pub limit: Option<u32>,
}

/// Body of `PATCH /orders/{id}/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Target status, case-insensitive.
    pub status: String,
}

/// Query parameters of `GET /discount-codes`.
#[derive(Debug, Default, Deserialize)]
pub struct ListCodesParams {
    /// 1-based page number.
    pub page: Option<u32>,
    /// Page size.
    pub limit: Option<u32>,
    /// Only codes switched on (`true`) or off (`false`).
    pub active: Option<bool>,
}

/// Body of `POST /discount-codes/preview`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PreviewRequest {
    /// Code the customer typed.
    pub code: String,
    /// Customer the code would be redeemed for.
    pub user_id: String,
    /// Cart subtotal before discount.
    pub subtotal: Money,
}

/// Answer of `POST /discount-codes/preview`.
///
/// A rejected code is still a 200 with `valid: false`; the message says why.
#[derive(Debug, Serialize, Deserialize)]
pub struct DiscountPreview {
    /// Whether the code would apply.
    pub valid: bool,
    /// Confirmation or rejection reason.
    pub message: String,
    /// Code record that would be redeemed.
    pub code_id: Option<DiscountCodeId>,
    /// Percentage or fixed.
    pub kind: Option<DiscountKind>,
    /// Discount amount, zero when rejected.
    pub discount: Money,
    /// Subtotal minus the discount.
    pub new_total: Money,
}

/// Body of `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthReport {
    /// `healthy` or `unhealthy`.
    pub status: String,
    /// `up`, or the ledger failure.
    pub ledger: String,
    /// `open` or `closed`.
    pub exchange: String,
}

/// `POST /orders`
///
/// Answers 201 with the new order, or 200 with the existing order when the
/// idempotency key was already used by the same user.
#[instrument(name = "http.create_order", skip_all)]
pub async fn create_order(
    State(state): State<AppState>,
    body: Result<Json<OrderRequestBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let Json(body) = body.map_err(|e| json_rejected(&e))?;
    let request = PlaceOrderRequest::try_from(body).map_err(|e| {
        warn!(error = %e, "[http.create_order] rejected malformed request");
        bad_request(&e)
    })?;

    let receipt = state
        .placement
        .place(request)
        .await
        .map_err(|e| placement_failure(&e))?;

    let status = if receipt.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    info!(order_id = %receipt.order.id, status = %status, "[http.create_order] answered");
    Ok((status, Json(receipt.order)))
}

/// `GET /orders`
pub async fn list_orders(
    State(state): State<AppState>,
    params: Result<Query<ListOrdersParams>, QueryRejection>,
) -> Result<Json<Page<Order>>, ApiError> {
    let Query(params) = params.map_err(|e| query_rejected(&e))?;
    let status = params
        .status
        .as_deref()
        .filter(|status| !status.trim().is_empty())
        .map(str::parse::<OrderStatus>)
        .transpose()
        .map_err(|e| bad_request(&e))?;
    let user_id = params
        .user_id
        .filter(|user_id| !user_id.trim().is_empty())
        .map(|user_id| {
            UserId::try_new(user_id).map_err(|e| bad_request(&ValidationError::field("user_id", e)))
        })
        .transpose()?;

    let query = OrderQuery {
        status,
        user_id,
        page: PageRequest::for_orders(params.page, params.limit),
    };
    let page = state
        .ledger
        .list(&query)
        .await
        .map_err(|e| ledger_failure(&e))?;
    Ok(Json(page))
}

/// `GET /orders/user/{user_id}`
pub async fn list_user_orders(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    params: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<Page<Order>>, ApiError> {
    let Query(params) = params.map_err(|e| query_rejected(&e))?;
    let user_id = UserId::try_new(user_id)
        .map_err(|e| bad_request(&ValidationError::field("user_id", e)))?;
    let query = OrderQuery {
        status: None,
        user_id: Some(user_id),
        page: PageRequest::for_user(params.page, params.limit),
    };
    let page = state
        .ledger
        .list(&query)
        .await
        .map_err(|e| ledger_failure(&e))?;
    Ok(Json(page))
}

/// `GET /orders/stats`
pub async fn order_stats(State(state): State<AppState>) -> Result<Json<OrderStats>, ApiError> {
    let today = Utc::now().date_naive();
    let stats = state
        .ledger
        .stats(today)
        .await
        .map_err(|e| ledger_failure(&e))?;
    Ok(Json(stats))
}

/// `GET /orders/{id}`
pub async fn get_order(
    State(state): State<AppState>,
    order_id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<Order>, ApiError> {
    let Path(order_id) = order_id.map_err(|e| path_rejected(&e))?;
    let order = state
        .ledger
        .get(OrderId::new(order_id))
        .await
        .map_err(|e| ledger_failure(&e))?;
    Ok(Json(order))
}

/// `PATCH /orders/{id}/status`
#[instrument(name = "http.update_status", skip_all)]
pub async fn update_status(
    State(state): State<AppState>,
    order_id: Result<Path<Uuid>, PathRejection>,
    update: Result<Json<StatusUpdate>, JsonRejection>,
) -> Result<Json<Order>, ApiError> {
    let Path(order_id) = order_id.map_err(|e| path_rejected(&e))?;
    let Json(update) = update.map_err(|e| json_rejected(&e))?;
    let status = update
        .status
        .parse::<OrderStatus>()
        .map_err(|e| bad_request(&e))?;
    let order = state
        .ledger
        .update_status(OrderId::new(order_id), status)
        .await
        .map_err(|e| {
            warn!(error = %e, "[http.update_status] refused");
            ledger_failure(&e)
        })?;
    info!(order_id = %order.id, status = %order.status, "[http.update_status] order moved");
    Ok(Json(order))
}

/// `POST /discount-codes`
#[instrument(name = "http.create_discount_code", skip_all)]
pub async fn create_discount_code(
    State(state): State<AppState>,
    new: Result<Json<NewDiscountCode>, JsonRejection>,
) -> Result<(StatusCode, Json<DiscountCode>), ApiError> {
    let Json(new) = new.map_err(|e| json_rejected(&e))?;
    let code = state
        .promotions
        .create_code(new)
        .map_err(|e| admin_failure(&e))?;
    info!(code = %code.code(), "[http.create_discount_code] created");
    Ok((StatusCode::CREATED, Json(code)))
}

/// `GET /discount-codes`
///
/// Codes are ordered by code string and paged like the order listing.
pub async fn list_discount_codes(
    State(state): State<AppState>,
    params: Result<Query<ListCodesParams>, QueryRejection>,
) -> Result<Json<Page<DiscountCode>>, ApiError> {
    let Query(params) = params.map_err(|e| query_rejected(&e))?;
    let page = PageRequest::for_orders(params.page, params.limit);
    let matching: Vec<DiscountCode> = state
        .promotions
        .codes()
        .into_iter()
        .filter(|code| params.active.map_or(true, |active| code.is_active() == active))
        .collect();

    let total_items = u64::try_from(matching.len()).unwrap_or(u64::MAX);
    let items = matching
        .into_iter()
        .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
        .take(usize::try_from(page.size()).unwrap_or(usize::MAX))
        .collect();
    Ok(Json(Page {
        items,
        pagination: Pagination::new(page, total_items),
    }))
}

/// `POST /discount-codes/preview`
///
/// Evaluates a code against a cart the way checkout would, without
/// redeeming it.
#[instrument(name = "http.preview_discount", skip_all)]
pub async fn preview_discount(
    State(state): State<AppState>,
    body: Result<Json<PreviewRequest>, JsonRejection>,
) -> Result<Json<DiscountPreview>, ApiError> {
    let Json(body) = body.map_err(|e| json_rejected(&e))?;
    let code = promo_code(body.code)?;
    let user_id = UserId::try_new(body.user_id)
        .map_err(|e| bad_request(&ValidationError::field("user_id", e)))?;

    let record = state
        .promotions
        .find_code(&code)
        .await
        .map_err(|e| promotions_unavailable(&e))?;
    let redemptions = match &record {
        Some(record) => state
            .promotions
            .redemptions(&user_id, record.id())
            .await
            .map_err(|e| promotions_unavailable(&e))?,
        None => Vec::new(),
    };

    let preview = match evaluate(
        record.as_ref(),
        &user_id,
        body.subtotal,
        &redemptions,
        Timestamp::now(),
    ) {
        DiscountEvaluation::Applied(applied) => DiscountPreview {
            valid: true,
            message: format!("{} applied", applied.code),
            code_id: Some(applied.code_id),
            kind: Some(applied.kind),
            discount: applied.amount,
            new_total: body
                .subtotal
                .checked_sub(applied.amount)
                .map_err(|e| bad_request(&e))?,
        },
        DiscountEvaluation::Rejected(rejection) => {
            info!(code = %code, reason = %rejection, "[http.preview_discount] code would be rejected");
            DiscountPreview {
                valid: false,
                message: rejection.to_string(),
                code_id: None,
                kind: None,
                discount: Money::ZERO,
                new_total: body.subtotal,
            }
        }
    };
    Ok(Json(preview))
}

/// `GET /discount-codes/{code}`
pub async fn get_discount_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<DiscountCode>, ApiError> {
    let code = promo_code(code)?;
    state
        .promotions
        .code(&code)
        .map(Json)
        .ok_or_else(|| code_not_found(&code))
}

/// `PUT /discount-codes/{code}`
///
/// Changes the description, limit, end of window or active flag. Pending
/// checkouts that evaluated the old version retry their redemption.
#[instrument(name = "http.update_discount_code", skip_all, fields(code = %code))]
pub async fn update_discount_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
    update: Result<Json<DiscountCodeUpdate>, JsonRejection>,
) -> Result<Json<DiscountCode>, ApiError> {
    let Json(update) = update.map_err(|e| json_rejected(&e))?;
    let code = promo_code(code)?;
    let updated = state
        .promotions
        .update_code(&code, update)
        .map_err(|e| {
            warn!(error = %e, "[http.update_discount_code] refused");
            admin_failure(&e)
        })?;
    info!(version = updated.version(), "[http.update_discount_code] updated");
    Ok(Json(updated))
}

/// `DELETE /discount-codes/{code}`
///
/// Switches the code off and answers with the deactivated record.
#[instrument(name = "http.deactivate_discount_code", skip_all, fields(code = %code))]
pub async fn deactivate_discount_code(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<DiscountCode>, ApiError> {
    let code = promo_code(code)?;
    let deactivated = state
        .promotions
        .set_active(&code, false)
        .ok_or_else(|| code_not_found(&code))?;
    info!("[http.deactivate_discount_code] code switched off");
    Ok(Json(deactivated))
}

/// `GET /discount-codes/{code}/usage`
pub async fn discount_code_usage(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<DiscountUsage>, ApiError> {
    let code = promo_code(code)?;
    state
        .promotions
        .usage(&code)
        .map(Json)
        .ok_or_else(|| code_not_found(&code))
}

/// `GET /health`
///
/// 200 when the ledger answers and the exchange is open, 503 otherwise.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let ledger = match state.ledger.ping().await {
        Ok(()) => None,
        Err(e) => {
            warn!(error = %e, "[http.health] ledger unreachable");
            Some(e.to_string())
        }
    };
    let exchange_open = !state.exchange.is_closed();
    let healthy = ledger.is_none() && exchange_open;

    let report = HealthReport {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        ledger: ledger.unwrap_or_else(|| "up".to_string()),
        exchange: if exchange_open { "open" } else { "closed" }.to_string(),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Builds the router.
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/stats", get(order_stats))
        .route("/orders/user/{user_id}", get(list_user_orders))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/status", patch(update_status))
        .route(
            "/discount-codes",
            post(create_discount_code).get(list_discount_codes),
        )
        .route("/discount-codes/preview", post(preview_discount))
        .route(
            "/discount-codes/{code}",
            get(get_discount_code)
                .put(update_discount_code)
                .delete(deactivate_discount_code),
        )
        .route("/discount-codes/{code}/usage", get(discount_code_usage))
        .route("/health", get(health))
        .with_state(state)
}
