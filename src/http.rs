//! HTTP surface.
//!
//! Thin axum handlers over the settlement core. Every store call runs on the
//! blocking pool; the request context comes from the `X-Franchise-Id` and
//! `X-Actor-Id` headers and is passed explicitly into each operation.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::bookings::{self, NewBooking, NewProduct};
use crate::db::DbState;
use crate::diagnostics;
use crate::error::{SettlementError, SettlementResult};
use crate::inventory;
use crate::invoice_renderer::InvoiceRenderer;
use crate::models::{ArchiveReason, RequestContext};
use crate::notify::Notifier;
use crate::returns::{self, RecordReturn};
use crate::settlement::{self, FinalizeRequest};

pub const FRANCHISE_HEADER: &str = "x-franchise-id";
pub const ACTOR_HEADER: &str = "x-actor-id";

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbState>,
    pub renderer: Arc<dyn InvoiceRenderer>,
    pub notifier: Arc<dyn Notifier>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/settlements/:booking_id", post(finalize_settlement).get(get_settlement))
        .route(
            "/settlements/:booking_id/preview",
            get(preview_settlement).post(preview_settlement_with_body),
        )
        .route("/products", post(create_product))
        .route("/bookings", post(create_booking))
        .route("/bookings/:booking_id/deliver", post(deliver_booking))
        .route("/bookings/:booking_id/returns", get(get_returns).post(record_return))
        .route("/archive", get(list_archive).post(archive_units))
        .route("/archive/:entry_id/restore", post(restore_archive))
        .route("/laundry/:batch_id/complete", post(complete_laundry))
        .route("/products/:product_id/stock", get(product_stock))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ApiError {
    Settlement(SettlementError),
    MissingHeader(&'static str),
    Internal(String),
}

impl From<SettlementError> for ApiError {
    fn from(e: SettlementError) -> Self {
        Self::Settlement(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, details) = match self {
            ApiError::MissingHeader(name) => (
                StatusCode::BAD_REQUEST,
                "MISSING_HEADER",
                format!("Missing required header: {name}"),
                None,
            ),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message, None)
            }
            ApiError::Settlement(e) => {
                let status = match &e {
                    SettlementError::Validation(_) => StatusCode::BAD_REQUEST,
                    SettlementError::NotFound(_) => StatusCode::NOT_FOUND,
                    SettlementError::Conflict(_) => StatusCode::CONFLICT,
                    SettlementError::PartialWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    SettlementError::Dependency(_) => StatusCode::SERVICE_UNAVAILABLE,
                };
                let details = match &e {
                    SettlementError::PartialWrite(p) => serde_json::to_value(p).ok(),
                    _ => None,
                };
                (status, e.code(), e.to_string(), details)
            }
        };

        if status.is_server_error() {
            error!(status = status.as_u16(), code, error = %message, "request failed");
        } else {
            debug!(status = status.as_u16(), code, error = %message, "request rejected");
        }

        let mut body = json!({
            "success": false,
            "error": message,
            "message": message,
            "errorCode": code,
        });
        if let Some(details) = details {
            body["details"] = details;
        }
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Extractors
// ---------------------------------------------------------------------------

/// Franchise and actor taken from request headers.
pub struct Tenant(pub RequestContext);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let franchise_id = header(FRANCHISE_HEADER).ok_or(ApiError::MissingHeader("X-Franchise-Id"))?;
        Ok(Tenant(RequestContext::new(franchise_id, header(ACTOR_HEADER))))
    }
}

/// Run a store operation on the blocking pool.
async fn blocking<T, F>(state: &AppState, op: F) -> Result<T, ApiError>
where
    F: FnOnce(&DbState) -> SettlementResult<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || op(&db))
        .await
        .map_err(|e| ApiError::Internal(format!("worker task failed: {e}")))?
        .map_err(ApiError::from)
}

fn ok(mut body: Value) -> Json<Value> {
    body["success"] = Value::Bool(true);
    Json(body)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store = blocking(&state, diagnostics::get_system_health).await?;
    let mut body = diagnostics::get_about_info();
    body["store"] = store;
    Ok(ok(body))
}

async fn finalize_settlement(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    Tenant(ctx): Tenant,
    Json(request): Json<FinalizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = booking_id.clone();
    let outcome = blocking(&state, move |db| settlement::finalize(db, &ctx, &id, &request)).await?;

    let AppState { db, renderer, notifier } = state;
    tokio::spawn(async move {
        if let Err(e) = settlement::run_post_commit(db, renderer.as_ref(), notifier, &booking_id).await {
            warn!(booking_id = %booking_id, error = %e, "post-commit steps failed, will resume on restart");
        }
    });

    Ok(ok(json!({
        "invoiceNumber": outcome.invoice_number,
        "invoiceId": outcome.invoice_id,
        "settlementId": outcome.settlement_id,
        "laundryBatchId": outcome.laundry_batch_id,
        "routed": outcome.routed,
        "totals": outcome.totals,
    })))
}

async fn get_settlement(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    Tenant(ctx): Tenant,
) -> Result<Json<Value>, ApiError> {
    let view = blocking(&state, move |db| settlement::get_settlement(db, &ctx, &booking_id)).await?;
    Ok(ok(json!({
        "settlement": view.settlement,
        "invoice": view.invoice,
        "transactions": view.transactions,
        "sagaStep": view.saga_step,
    })))
}

async fn preview_settlement(
    state: State<AppState>,
    path: Path<String>,
    tenant: Tenant,
) -> Result<Json<Value>, ApiError> {
    preview_settlement_with_body(state, path, tenant, Json(FinalizeRequest::default())).await
}

async fn preview_settlement_with_body(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    Tenant(ctx): Tenant,
    Json(request): Json<FinalizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let preview = blocking(&state, move |db| settlement::preview(db, &ctx, &booking_id, &request)).await?;
    Ok(ok(json!({ "preview": preview })))
}

async fn create_product(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Json(product): Json<NewProduct>,
) -> Result<Json<Value>, ApiError> {
    let product_id = blocking(&state, move |db| bookings::create_product(db, &ctx, &product)).await?;
    Ok(ok(json!({ "productId": product_id })))
}

async fn create_booking(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Json(booking): Json<NewBooking>,
) -> Result<Json<Value>, ApiError> {
    let booking = blocking(&state, move |db| bookings::create_booking(db, &ctx, &booking)).await?;
    Ok(ok(json!({ "booking": booking })))
}

async fn deliver_booking(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    Tenant(ctx): Tenant,
) -> Result<Json<Value>, ApiError> {
    let snapshot = blocking(&state, move |db| bookings::mark_delivered(db, &ctx, &booking_id)).await?;
    Ok(ok(json!({ "booking": snapshot.booking, "items": snapshot.items })))
}

async fn get_returns(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    Tenant(ctx): Tenant,
) -> Result<Json<Value>, ApiError> {
    let summary = blocking(&state, move |db| returns::return_totals(db, &ctx, &booking_id)).await?;
    Ok(ok(json!({ "returns": summary })))
}

async fn record_return(
    State(state): State<AppState>,
    Path(booking_id): Path<String>,
    Tenant(ctx): Tenant,
    Json(request): Json<RecordReturn>,
) -> Result<Json<Value>, ApiError> {
    let event = blocking(&state, move |db| returns::record_return(db, &ctx, &booking_id, &request)).await?;
    Ok(ok(json!({ "returnEvent": event })))
}

async fn list_archive(State(state): State<AppState>, Tenant(ctx): Tenant) -> Result<Json<Value>, ApiError> {
    let entries = blocking(&state, move |db| inventory::list_archive(db, &ctx)).await?;
    Ok(ok(json!({ "entries": entries })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveRequest {
    product_id: String,
    #[serde(default = "one")]
    quantity: u32,
    reason: ArchiveReason,
    #[serde(default)]
    notes: Option<String>,
}

fn one() -> u32 {
    1
}

async fn archive_units(
    State(state): State<AppState>,
    Tenant(ctx): Tenant,
    Json(request): Json<ArchiveRequest>,
) -> Result<Json<Value>, ApiError> {
    let entry = blocking(&state, move |db| {
        inventory::archive_units(
            db,
            &ctx,
            &request.product_id,
            request.quantity,
            request.reason,
            request.notes.as_deref(),
        )
    })
    .await?;
    Ok(ok(json!({ "entry": entry })))
}

#[derive(Debug, Default, Deserialize)]
struct RestoreRequest {
    #[serde(default)]
    quantity: Option<u32>,
}

async fn restore_archive(
    State(state): State<AppState>,
    Path(entry_id): Path<String>,
    Tenant(ctx): Tenant,
    Json(request): Json<RestoreRequest>,
) -> Result<Json<Value>, ApiError> {
    let entry = blocking(&state, move |db| {
        inventory::restore_archive_entry(db, &ctx, &entry_id, request.quantity)
    })
    .await?;
    Ok(ok(json!({ "entry": entry })))
}

async fn complete_laundry(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
    Tenant(ctx): Tenant,
) -> Result<Json<Value>, ApiError> {
    let batch = blocking(&state, move |db| inventory::complete_laundry_batch(db, &ctx, &batch_id)).await?;
    Ok(ok(json!({ "batch": batch })))
}

async fn product_stock(
    State(state): State<AppState>,
    Path(product_id): Path<String>,
    Tenant(ctx): Tenant,
) -> Result<Json<Value>, ApiError> {
    let stock = blocking(&state, move |db| inventory::stock_snapshot(db, &ctx, &product_id)).await?;
    Ok(ok(json!({ "stock": stock })))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookings::{create_booking, create_product, mark_delivered, NewBooking, NewBookingItem, NewProduct};
    use crate::db::test_state;
    use crate::invoice_renderer::{RenderError, SettlementDocument};
    use crate::models::{BookingKind, Customer};
    use crate::notify::DisabledNotifier;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use rust_decimal_macros::dec;
    use tower::ServiceExt;

    struct StubRenderer;

    #[async_trait]
    impl InvoiceRenderer for StubRenderer {
        async fn render(&self, doc: &SettlementDocument) -> Result<String, RenderError> {
            Ok(format!("memory://{}", doc.invoice_number))
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("f1", Some("desk".into()))
    }

    /// One product, one delivered booking of three units.
    fn setup() -> (AppState, String, String) {
        let db = test_state();
        let product_id = create_product(
            &db,
            &ctx(),
            &NewProduct {
                id: None,
                name: "Sherwani".into(),
                product_code: None,
                rental_price: dec!(1200),
                damage_fee: Some(dec!(400)),
                lost_fee: None,
                total_owned: 10,
            },
        )
        .unwrap();
        let booking = create_booking(
            &db,
            &ctx(),
            &NewBooking {
                booking_number: None,
                kind: BookingKind::Rental {
                    deposit_amount: dec!(2000),
                    event_date: None,
                    delivery_date: None,
                    return_date: None,
                },
                customer: Customer { id: None, name: "Ravi".into(), phone: None },
                items: vec![NewBookingItem { product_id, quantity: 3, unit_price: None }],
                paid_amount: dec!(0),
            },
        )
        .unwrap();
        let snap = mark_delivered(&db, &ctx(), &booking.id).unwrap();
        let item_id = snap.items[0].id.clone();
        let state = AppState {
            db: Arc::new(db),
            renderer: Arc::new(StubRenderer),
            notifier: Arc::new(DisabledNotifier),
        };
        (state, booking.id, item_id)
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(FRANCHISE_HEADER, "f1")
            .header(ACTOR_HEADER, "desk");
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(state: &AppState, req: Request<Body>) -> (StatusCode, Value) {
        let resp = router(state.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_missing_franchise_header_is_bad_request() {
        let (state, booking_id, _) = setup();
        let req = Request::builder()
            .uri(format!("/settlements/{booking_id}"))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["errorCode"], "MISSING_HEADER");
    }

    #[tokio::test]
    async fn test_finalize_then_conflict() {
        let (state, booking_id, item_id) = setup();
        let payload = json!({
            "lines": [{ "bookingItemId": item_id, "fresh": 1, "used": 1, "damaged": 1 }],
            "payment": { "method": "upi" },
        });

        let (status, body) = send(
            &state,
            request("POST", &format!("/settlements/{booking_id}"), Some(payload.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["success"], true);
        assert!(body["invoiceNumber"].as_str().unwrap().starts_with("SETTLE-"));
        assert_eq!(body["totals"]["feeTotal"], "400");
        assert_eq!(body["totals"]["refundDue"], "1600");

        let (status, body) = send(
            &state,
            request("POST", &format!("/settlements/{booking_id}"), Some(payload)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["errorCode"], "ALREADY_SETTLED");

        let (status, body) = send(&state, request("GET", &format!("/settlements/{booking_id}"), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settlement"]["paymentMethod"], "upi");
        assert_eq!(body["invoice"]["status"], "sent");
    }

    #[tokio::test]
    async fn test_quantity_mismatch_is_bad_request() {
        let (state, booking_id, item_id) = setup();
        let payload = json!({ "lines": [{ "bookingItemId": item_id, "fresh": 2 }] });
        let (status, body) = send(
            &state,
            request("POST", &format!("/settlements/{booking_id}"), Some(payload)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorCode"], "QUANTITY_MISMATCH");
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_returns_then_preview() {
        let (state, booking_id, item_id) = setup();
        let payload = json!({ "lines": [{ "bookingItemId": item_id, "qty_fresh": 2, "qty_lost": 1 }] });
        let (status, body) = send(
            &state,
            request("POST", &format!("/bookings/{booking_id}/returns"), Some(payload)),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");

        let (_, body) = send(&state, request("GET", &format!("/bookings/{booking_id}/returns"), None)).await;
        assert_eq!(body["returns"]["allBalanced"], true);

        let (status, body) = send(
            &state,
            request("GET", &format!("/settlements/{booking_id}/preview"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["preview"]["totals"]["feeTotal"], "1200");
    }

    #[tokio::test]
    async fn test_unknown_booking_is_not_found() {
        let (state, _, _) = setup();
        let (status, body) = send(&state, request("GET", "/settlements/nope/preview", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["errorCode"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_product_booking_and_delivery_routes() {
        let state = AppState {
            db: Arc::new(test_state()),
            renderer: Arc::new(StubRenderer),
            notifier: Arc::new(DisabledNotifier),
        };

        let (status, body) = send(
            &state,
            request(
                "POST",
                "/products",
                Some(json!({ "name": "Lehenga", "rentalPrice": "900", "lostFee": "3000", "totalOwned": 4 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let product_id = body["productId"].as_str().unwrap().to_string();

        let (status, body) = send(
            &state,
            request(
                "POST",
                "/bookings",
                Some(json!({
                    "kind": "rental",
                    "deposit_amount": "1500",
                    "customer": { "name": "Meera" },
                    "items": [{ "productId": product_id, "quantity": 3 }],
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["booking"]["bookingNumber"].as_str().unwrap().starts_with("BK-"));
        assert_eq!(body["booking"]["totalAmount"], "2700");
        let booking_id = body["booking"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(&state, request("POST", &format!("/bookings/{booking_id}/deliver"), None)).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["items"][0]["deliveredQuantity"], 3);

        let (_, body) = send(&state, request("GET", &format!("/products/{product_id}/stock"), None)).await;
        assert_eq!(body["stock"]["available"], 1);
        assert_eq!(body["stock"]["booked"], 3);

        // Delivering twice is refused.
        let (status, body) = send(&state, request("POST", &format!("/bookings/{booking_id}/deliver"), None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_booking_without_items_is_bad_request() {
        let (state, _, _) = setup();
        let (status, body) = send(
            &state,
            request(
                "POST",
                "/bookings",
                Some(json!({ "kind": "direct_sale", "customer": { "name": "Meera" }, "items": [] })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["errorCode"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_archive_and_restore_routes() {
        let (state, _, _) = setup();
        let (_, body) = send(
            &state,
            request("POST", "/products", Some(json!({ "id": "veil", "name": "Veil", "rentalPrice": "150", "totalOwned": 5 }))),
        )
        .await;
        assert_eq!(body["productId"], "veil");

        let (status, body) = send(
            &state,
            request(
                "POST",
                "/archive",
                Some(json!({ "productId": "veil", "quantity": 2, "reason": "discontinued", "notes": "old season" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["entry"]["reason"], "discontinued");
        assert_eq!(body["entry"]["originalPrice"], "150");
        let entry_id = body["entry"]["id"].as_str().unwrap().to_string();

        let (status, body) = send(
            &state,
            request("POST", "/archive", Some(json!({ "productId": "veil", "quantity": 9, "reason": "damaged" }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);

        let (_, body) = send(&state, request("GET", "/archive", None)).await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 1);

        let (status, _) = send(
            &state,
            request("POST", &format!("/archive/{entry_id}/restore"), Some(json!({}))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&state, request("GET", "/products/veil/stock", None)).await;
        assert_eq!(body["stock"]["available"], 5);
        assert_eq!(body["stock"]["archived"], 0);
    }

    #[tokio::test]
    async fn test_health_reports_build_and_store() {
        let (state, _, _) = setup();
        let (status, body) = send(&state, request("GET", "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["store"]["schemaVersion"], 5);
    }
}
