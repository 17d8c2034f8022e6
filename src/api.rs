//! HTTP surface over the marketplace engine.
//!
//! The caller's address travels in the `x-caller` header. Amounts in request
//! bodies may be JSON integers or decimal strings; secrets and commitment
//! hashes are hex.

use crate::{
    access::Role,
    commitment::{parse_hash, Commitment},
    error::MarketError,
    event::EventRecord,
    market::{Marketplace, ValidationOutcome},
    model::{Address, Amount, Offer, OfferId, OfferState},
};
use axum::{
    async_trait,
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, Request, State,
    },
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;

pub const CALLER_HEADER: &str = "x-caller";

#[derive(Clone)]
pub struct AppState {
    pub market: Arc<Marketplace>,
}

pub fn router(market: Arc<Marketplace>) -> Router {
    Router::new()
        .route("/offers", post(create_offer).get(list_offers))
        .route("/offers/:offer_id", get(get_offer))
        .route("/offers/:offer_id/cancel", post(cancel_offer))
        .route("/offers/:offer_id/validate-creation", post(validate_creation))
        .route("/offers/:offer_id/purchase", post(purchase_offer))
        .route("/offers/:offer_id/validate-delivery", post(validate_delivery))
        .route("/offers/:offer_id/refund", post(refund_offer))
        .route("/commitments", post(commit_to_purchase))
        .route("/commitments/:address", get(get_commitment))
        .route("/pause", post(pause))
        .route("/unpause", post(unpause))
        .route("/roles/grant", post(grant_role))
        .route("/roles/revoke", post(revoke_role))
        .route("/events", get(list_events))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { market })
}

#[derive(Debug)]
pub enum ApiError {
    MissingCaller,
    NotFound(String),
    /// Body, query or path that failed to parse.
    Rejected {
        status: StatusCode,
        kind: &'static str,
        message: String,
    },
    Market(MarketError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            kind: "invalid_body",
            message: rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            kind: "invalid_query",
            message: rejection.body_text(),
        }
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::Rejected {
            status: rejection.status(),
            kind: "invalid_path",
            message: rejection.body_text(),
        }
    }
}

impl From<MarketError> for ApiError {
    fn from(err: MarketError) -> Self {
        ApiError::Market(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingCaller => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Rejected { status, .. } => *status,
            ApiError::Market(err) => match err {
                MarketError::InputValidation(_) | MarketError::Serialization(_) => StatusCode::BAD_REQUEST,
                MarketError::Unauthorized(_) => StatusCode::FORBIDDEN,
                MarketError::OfferNotFound(_) => StatusCode::NOT_FOUND,
                MarketError::StateMismatch { .. }
                | MarketError::DeadlineExceeded { .. }
                | MarketError::DeadlineNotReached { .. } => StatusCode::CONFLICT,
                MarketError::PaymentMismatch { .. } | MarketError::CommitmentMismatch(_) => {
                    StatusCode::UNPROCESSABLE_ENTITY
                }
                MarketError::Paused => StatusCode::LOCKED,
                MarketError::ExternalDependencyFailure { .. } => StatusCode::BAD_GATEWAY,
                MarketError::Config(_) | MarketError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::MissingCaller => "missing_caller",
            ApiError::NotFound(_) => "not_found",
            ApiError::Rejected { kind, .. } => *kind,
            ApiError::Market(err) => err.kind(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::MissingCaller => format!("Missing {} header", CALLER_HEADER),
            ApiError::NotFound(what) => format!("{} not found", what),
            ApiError::Rejected { message, .. } => message.clone(),
            ApiError::Market(err) => err.to_string(),
        };
        warn!("Request rejected with {}: {}", status, message);

        let body = ErrorBody {
            error: message,
            kind: self.kind(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn caller(headers: &HeaderMap) -> ApiResult<Address> {
    let value = headers
        .get(CALLER_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::MissingCaller)?;
    Address::parse(value).map_err(|_| ApiError::MissingCaller)
}

/// `Json` whose rejection renders as an `ApiError`.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    T: Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    T: Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

pub struct ApiPath<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for ApiPath<T>
where
    Path<T>: FromRequestParts<S, Rejection = PathRejection>,
    T: Send,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

mod amount {
    use crate::model::Amount;
    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(u64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(Amount::from(value)),
            Repr::Text(value) => value
                .trim()
                .parse()
                .map_err(|e| de::Error::custom(format!("invalid amount {:?}: {}", value, e))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateOfferRequest {
    pub quantity: u64,
    #[serde(deserialize_with = "amount::deserialize")]
    pub price_per_unit: Amount,
    pub energy_type: String,
}

#[derive(Debug, Deserialize)]
pub struct ValidateCreationRequest {
    pub approved: bool,
    #[serde(default)]
    pub metadata_ref: String,
}

#[derive(Debug, Deserialize)]
pub struct CommitRequest {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub secret: String,
    #[serde(deserialize_with = "amount::deserialize")]
    pub payment: Amount,
}

#[derive(Debug, Deserialize)]
pub struct ValidateDeliveryRequest {
    pub approved: bool,
}

#[derive(Debug, Deserialize)]
pub struct RoleRequest {
    pub role: String,
    pub account: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OfferQuery {
    pub producer: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventQuery {
    #[serde(default)]
    pub since: u64,
}

#[derive(Debug, Serialize)]
pub struct RefundResponse {
    pub offer_id: OfferId,
    pub refunded: Amount,
}

#[derive(Debug, Serialize)]
pub struct RoleResponse {
    pub role: Role,
    pub account: Address,
    pub changed: bool,
}

async fn create_offer(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<CreateOfferRequest>,
) -> ApiResult<(StatusCode, Json<Offer>)> {
    let producer = caller(&headers)?;
    let offer_id =
        state
            .market
            .create_offer(&producer, request.quantity, request.price_per_unit, &request.energy_type)?;
    Ok((StatusCode::CREATED, Json(state.market.offer(offer_id)?)))
}

async fn get_offer(State(state): State<AppState>, ApiPath(offer_id): ApiPath<u64>) -> ApiResult<Json<Offer>> {
    Ok(Json(state.market.offer(OfferId(offer_id))?))
}

async fn list_offers(State(state): State<AppState>, ApiQuery(query): ApiQuery<OfferQuery>) -> ApiResult<Json<Vec<Offer>>> {
    let wanted_state = query.state.as_deref().map(str::parse::<OfferState>).transpose()?;
    let mut offers = match query.producer.as_deref() {
        Some(producer) => state.market.offers_by_producer(&Address::parse(producer)?),
        None => state.market.offers(),
    };
    if let Some(wanted) = wanted_state {
        offers.retain(|offer| offer.state == wanted);
    }
    Ok(Json(offers))
}

async fn cancel_offer(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(offer_id): ApiPath<u64>,
) -> ApiResult<Json<Offer>> {
    let producer = caller(&headers)?;
    let offer_id = OfferId(offer_id);
    state.market.cancel_unvalidated_offer(&producer, offer_id)?;
    Ok(Json(state.market.offer(offer_id)?))
}

async fn validate_creation(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(offer_id): ApiPath<u64>,
    ApiJson(request): ApiJson<ValidateCreationRequest>,
) -> ApiResult<Json<Offer>> {
    let oracle = caller(&headers)?;
    let offer_id = OfferId(offer_id);
    state
        .market
        .validate_offer_creation(&oracle, offer_id, request.approved, &request.metadata_ref)?;
    Ok(Json(state.market.offer(offer_id)?))
}

async fn commit_to_purchase(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<CommitRequest>,
) -> ApiResult<(StatusCode, Json<Commitment>)> {
    let consumer = caller(&headers)?;
    let hash = parse_hash(&request.hash)?;
    state.market.commit_to_purchase(&consumer, hash)?;
    let commitment = state
        .market
        .commitment_of(&consumer)
        .ok_or_else(|| ApiError::NotFound(format!("Commitment of {}", consumer)))?;
    Ok((StatusCode::CREATED, Json(commitment)))
}

async fn get_commitment(State(state): State<AppState>, ApiPath(address): ApiPath<String>) -> ApiResult<Json<Commitment>> {
    let consumer = Address::parse(&address)?;
    state
        .market
        .commitment_of(&consumer)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Commitment of {}", consumer)))
}

async fn purchase_offer(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(offer_id): ApiPath<u64>,
    ApiJson(request): ApiJson<PurchaseRequest>,
) -> ApiResult<Json<Offer>> {
    let consumer = caller(&headers)?;
    let offer_id = OfferId(offer_id);
    let secret = request.secret.trim();
    let secret = hex::decode(secret.strip_prefix("0x").unwrap_or(secret)).map_err(MarketError::from)?;
    state.market.purchase_offer(&consumer, offer_id, &secret, request.payment)?;
    Ok(Json(state.market.offer(offer_id)?))
}

async fn validate_delivery(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(offer_id): ApiPath<u64>,
    ApiJson(request): ApiJson<ValidateDeliveryRequest>,
) -> ApiResult<Json<ValidationOutcome>> {
    let oracle = caller(&headers)?;
    let outcome = state
        .market
        .validate_and_distribute(&oracle, OfferId(offer_id), request.approved)?;
    Ok(Json(outcome))
}

async fn refund_offer(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiPath(offer_id): ApiPath<u64>,
) -> ApiResult<Json<RefundResponse>> {
    let caller = caller(&headers)?;
    let offer_id = OfferId(offer_id);
    let refunded = state.market.refund_expired(&caller, offer_id)?;
    Ok(Json(RefundResponse { offer_id, refunded }))
}

async fn pause(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    let pauser = caller(&headers)?;
    state.market.pause(&pauser)?;
    Ok(Json(serde_json::json!({ "paused": true })))
}

async fn unpause(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<serde_json::Value>> {
    let pauser = caller(&headers)?;
    state.market.unpause(&pauser)?;
    Ok(Json(serde_json::json!({ "paused": false })))
}

async fn grant_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<RoleRequest>,
) -> ApiResult<Json<RoleResponse>> {
    let admin = caller(&headers)?;
    let role: Role = request.role.parse()?;
    let account = Address::parse(&request.account)?;
    let changed = state.market.grant_role(&admin, role, &account)?;
    Ok(Json(RoleResponse { role, account, changed }))
}

async fn revoke_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(request): ApiJson<RoleRequest>,
) -> ApiResult<Json<RoleResponse>> {
    let admin = caller(&headers)?;
    let role: Role = request.role.parse()?;
    let account = Address::parse(&request.account)?;
    let changed = state.market.revoke_role(&admin, role, &account)?;
    Ok(Json(RoleResponse { role, account, changed }))
}

async fn list_events(State(state): State<AppState>, ApiQuery(query): ApiQuery<EventQuery>) -> Json<Vec<EventRecord>> {
    Json(state.market.events_since(query.since))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "energy-escrow",
        "paused": state.market.is_paused(),
        "offers": state.market.offers().len(),
    }))
}
