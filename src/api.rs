use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Path, State},
    http::HeaderMap,
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use crate::affiliates::{AffiliateService, Application, ApplicationResult};
use crate::attribution::AttributionService;
use crate::auth::{AdminAuthorizer, Admin, Identity, client_ip};
use crate::diagnostics::DiagnosticSink;
use crate::error::{
    ApiError, ApiErrorWithMeta, E_PAYLOAD_INVALID, affiliate_error, ledger_error, payout_error,
    reconcile_error,
};
use crate::ledger::LedgerStore;
use crate::notify::Notifier;
use crate::payouts::{PayoutOrchestrator, PayoutRun};
use crate::processor::PaymentProcessor;
use crate::reconcile::{Applied, PollReport, Reconciler};
use crate::responses::{ApiOk, RequestMeta, meta_middleware};
use crate::settlement::{Recalculation, StatsRecalculator};
use crate::signature::WebhookVerifiers;
use crate::storefront::DiscountProvisioner;
use crate::types::{Affiliate, PayoutMethod, PayoutStatus, Referral, ReviewItem};
use crate::webhooks::{disbursement, storefront, subscription};

/// Outbound third-party capabilities.
#[derive(Clone)]
pub struct Capabilities {
    pub processor: Arc<dyn PaymentProcessor>,
    pub notifier: Arc<dyn Notifier>,
    pub provisioner: Arc<dyn DiscountProvisioner>,
}

/// Runtime settings the handlers need.
#[derive(Clone)]
pub struct Settings {
    pub verifiers: WebhookVerifiers,
    pub admins: AdminAuthorizer,
    pub min_payout: Decimal,
    pub customer_discount: Decimal,
}

/// The application state.
#[derive(Clone)]
pub struct AppState {
    pub verifiers: WebhookVerifiers,
    pub admins: AdminAuthorizer,
    pub diagnostics: DiagnosticSink,
    pub attribution: AttributionService,
    pub affiliates: AffiliateService,
    pub payouts: PayoutOrchestrator,
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    /// Wires every service over one ledger.
    pub fn new(ledger: Arc<dyn LedgerStore>, caps: Capabilities, settings: Settings) -> Self {
        let diagnostics = DiagnosticSink::new(ledger.clone());
        let recalculator = StatsRecalculator::new(ledger.clone(), caps.notifier.clone());
        Self {
            verifiers: settings.verifiers,
            admins: settings.admins,
            attribution: AttributionService::new(
                ledger.clone(),
                caps.notifier.clone(),
                recalculator.clone(),
                diagnostics.clone(),
            ),
            affiliates: AffiliateService::new(
                ledger.clone(),
                caps.notifier.clone(),
                caps.provisioner,
                recalculator.clone(),
                diagnostics.clone(),
                settings.customer_discount,
            ),
            payouts: PayoutOrchestrator::new(
                ledger.clone(),
                caps.processor.clone(),
                diagnostics.clone(),
                settings.min_payout,
            ),
            reconciler: Arc::new(Reconciler::new(
                ledger,
                caps.processor,
                caps.notifier,
                recalculator,
                diagnostics.clone(),
            )),
            diagnostics,
        }
    }
}

/// Body of `POST /affiliates`.
#[derive(Deserialize)]
pub struct ApplyRequest {
    /// Falls back to the identity provider's email.
    pub email: Option<String>,
    /// Where electronic payouts go; defaults to the account email.
    pub payout_email: Option<String>,
}

/// Body of `POST /admin/payouts`.
#[derive(Deserialize)]
pub struct CreatePayoutsRequest {
    pub affiliate_ids: Vec<Uuid>,
    pub method: PayoutMethod,
}

/// Body of `POST /admin/payouts/{id}/override`.
#[derive(Deserialize)]
pub struct OverrideRequest {
    pub status: PayoutStatus,
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct ResolvedResponse {
    pub resolved: Uuid,
}

pub fn init_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/webhooks/storefront/orders-paid", post(storefront::orders_paid_handler))
        .route("/webhooks/storefront/refunds", post(storefront::refunds_handler))
        .route("/webhooks/subscriptions/charges-paid", post(subscription::charges_paid_handler))
        .route(
            "/webhooks/subscriptions/charges-refunded",
            post(subscription::charges_refunded_handler),
        )
        .route("/webhooks/disbursements", post(disbursement::disbursements_handler))
        .route("/affiliates", post(apply_handler))
        .route("/affiliates/me", get(me_handler))
        .route("/admin/affiliates/{id}/approve", post(approve_affiliate_handler))
        .route("/admin/affiliates/{id}/reject", post(reject_affiliate_handler))
        .route("/admin/affiliates/{id}/recalculate", post(recalculate_handler))
        .route("/admin/referrals/{id}/approve", post(approve_referral_handler))
        .route("/admin/referrals/{id}/reject", post(reject_referral_handler))
        .route("/admin/payouts", post(create_payouts_handler))
        .route("/admin/payouts/{id}/override", post(override_payout_handler))
        .route("/admin/reconcile", post(reconcile_handler))
        .route("/admin/review-queue", get(review_queue_handler))
        .route("/admin/review-queue/{id}/resolve", post(resolve_review_handler))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(middleware::from_fn(meta_middleware))
}

async fn apply_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    identity: Identity,
    headers: HeaderMap,
    Json(req): Json<ApplyRequest>,
) -> Result<ApiOk<ApplicationResult>, ApiErrorWithMeta> {
    let Some(email) = req.email.or(identity.email) else {
        return Err(ApiError::BadRequest("email is required".into())
            .with_meta(meta)
            .with_code(E_PAYLOAD_INVALID));
    };
    let application = Application {
        auth_subject: identity.subject,
        email,
        payout_email: req.payout_email,
        signup_ip: client_ip(&headers),
    };

    let result = st
        .affiliates
        .apply(&application, Utc::now())
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;

    Ok(ApiOk::created("application received", result, meta))
}

async fn me_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    identity: Identity,
) -> Result<ApiOk<Affiliate>, ApiErrorWithMeta> {
    let affiliate = st
        .affiliates
        .find_by_subject(&identity.subject)
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;
    Ok(ApiOk::ok("affiliate fetched", affiliate, meta))
}

async fn approve_affiliate_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
) -> Result<ApiOk<Affiliate>, ApiErrorWithMeta> {
    let affiliate = st
        .affiliates
        .approve(id, Utc::now())
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;
    Ok(ApiOk::ok("affiliate approved", affiliate, meta))
}

async fn reject_affiliate_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
) -> Result<ApiOk<Affiliate>, ApiErrorWithMeta> {
    let affiliate = st
        .affiliates
        .reject(id, Utc::now())
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;
    Ok(ApiOk::ok("affiliate rejected", affiliate, meta))
}

async fn recalculate_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
) -> Result<ApiOk<Recalculation>, ApiErrorWithMeta> {
    let recalculation = st
        .affiliates
        .recalculate(id, Utc::now())
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;
    Ok(ApiOk::ok("stats recalculated", recalculation, meta))
}

async fn approve_referral_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
) -> Result<ApiOk<Referral>, ApiErrorWithMeta> {
    let referral = st
        .affiliates
        .approve_referral(id, Utc::now())
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;
    Ok(ApiOk::ok("referral approved", referral, meta))
}

async fn reject_referral_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
) -> Result<ApiOk<Referral>, ApiErrorWithMeta> {
    let referral = st
        .affiliates
        .reject_referral(id, Utc::now())
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;
    Ok(ApiOk::ok("referral rejected", referral, meta))
}

async fn create_payouts_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
    Json(req): Json<CreatePayoutsRequest>,
) -> Result<ApiOk<PayoutRun>, ApiErrorWithMeta> {
    let run = st
        .payouts
        .run(&req.affiliate_ids, req.method, Utc::now())
        .await
        .map_err(|e| payout_error(e, meta.clone()))?;
    Ok(ApiOk::created("payouts created", run, meta))
}

async fn override_payout_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
    Json(req): Json<OverrideRequest>,
) -> Result<ApiOk<Applied>, ApiErrorWithMeta> {
    let applied = st
        .reconciler
        .override_payout(id, req.status, req.reason, Utc::now())
        .await
        .map_err(|e| reconcile_error(e, meta.clone()))?;
    Ok(ApiOk::ok("payout override applied", applied, meta))
}

async fn reconcile_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
) -> Result<ApiOk<PollReport>, ApiErrorWithMeta> {
    let report = st
        .reconciler
        .poll_once(Utc::now())
        .await
        .map_err(|e| ledger_error(e, meta.clone()))?;
    Ok(ApiOk::ok("reconciliation pass complete", report, meta))
}

async fn review_queue_handler(
    State(st): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
) -> Result<ApiOk<Vec<ReviewItem>>, ApiErrorWithMeta> {
    let items = st
        .affiliates
        .review_queue()
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;
    Ok(ApiOk::ok("review queue fetched", items, meta))
}

async fn resolve_review_handler(
    State(st): State<AppState>,
    Path(id): Path<Uuid>,
    Extension(meta): Extension<RequestMeta>,
    _admin: Admin,
) -> Result<ApiOk<ResolvedResponse>, ApiErrorWithMeta> {
    st.affiliates
        .resolve_review_item(id)
        .await
        .map_err(|e| affiliate_error(e, meta.clone()))?;
    Ok(ApiOk::ok("review item resolved", ResolvedResponse { resolved: id }, meta))
}
