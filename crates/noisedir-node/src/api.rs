//! HTTP API: the axum router exposing the directory's public and
//! verification-callback routes, translating engine/query/ledger results
//! into HTTP status codes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post, put},
    Json, Router,
};
use phonenumber::country::Id as CountryId;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use noisedir_crypto::envelope::{envelope_open, EnvelopeError};
use noisedir_crypto::keypair::{encode_key, KeyPair};

use crate::authorization::AuthorizationGateway;
use crate::config::ServerConfig;
use crate::directory::Field;
use crate::engine::{
    check_replay_window, Action, ConfirmOutcome, EngineError, IdentityTriplet, ReviewState,
    UpdateEngine, UpdateItem, UpdateOutcome, UpdateRequest,
};
use crate::query::{QueryEngine, QueryPair};
use crate::verification::{EmailTransport, SmsTransport, UrlBuilder, VerificationDispatcher};

const ENVELOPE_CONTENT_TYPE: &str = "application/vnd.qabel.noisebox+json";

pub struct ApiState {
    pub config: Arc<ServerConfig>,
    pub keypair: Arc<KeyPair>,
    pub engine: Arc<UpdateEngine>,
    pub query_engine: Arc<QueryEngine>,
    pub email_transport: Arc<dyn EmailTransport>,
    pub sms_transport: Arc<dyn SmsTransport>,
    pub url_builder: Arc<dyn UrlBuilder>,
    pub auth_gateway: Option<Arc<AuthorizationGateway>>,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the epoch")
        .as_secs() as i64
}

/// Maps an `Accept-Language` header to a fallback country for phone-number
/// parsing (`de-de` falls back to `+49`, `en-us` to `+1`, and so on).
fn locale_country(headers: &HeaderMap) -> CountryId {
    let raw = headers
        .get("accept-language")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("de-DE");
    let primary = raw.split(',').next().unwrap_or("de-DE");
    let region = primary.split(['-', '_']).nth(1).unwrap_or(primary);
    match region.to_ascii_uppercase().as_str() {
        "US" => CountryId::US,
        "GB" => CountryId::GB,
        "FR" => CountryId::FR,
        "AT" => CountryId::AT,
        "CH" => CountryId::CH,
        _ => CountryId::DE,
    }
}

pub fn create_router(state: Arc<ApiState>) -> Router {
    let api = Router::new()
        .route("/api/v0/", get(api_index))
        .route("/api/v0/key/", get(get_server_key))
        .route("/api/v0/search/", get(search_get).post(search_post))
        .route("/api/v0/update/", put(update))
        .route("/api/v0/status/", post(status))
        .route("/api/v0/delete-identity/", post(delete_identity))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_authorization));

    Router::new()
        .merge(api)
        .route("/verify/:id/:action/", get(verify_confirm_deny))
        .route("/verify/:id/", get(verify_review).post(verify_review_post))
        .with_state(state)
}

async fn require_authorization(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(gateway) = &state.auth_gateway else {
        return next.run(req).await;
    };

    let header_value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match gateway.authorize(header_value).await {
        Ok(()) => next.run(req).await,
        Err(e) => {
            warn!(error = %e, "authorization failed");
            (StatusCode::FORBIDDEN, "authorization failed").into_response()
        }
    }
}

async fn api_index() -> Json<HashMap<&'static str, &'static str>> {
    let mut map = HashMap::new();
    map.insert("key", "/api/v0/key/");
    map.insert("search", "/api/v0/search/");
    map.insert("update", "/api/v0/update/");
    map.insert("status", "/api/v0/status/");
    map.insert("delete-identity", "/api/v0/delete-identity/");
    Json(map)
}

#[derive(Serialize)]
struct KeyResponse {
    public_key: String,
}

async fn get_server_key(State(state): State<Arc<ApiState>>) -> Json<KeyResponse> {
    Json(KeyResponse {
        public_key: encode_key(&state.keypair.public()),
    })
}

#[derive(Serialize)]
struct MatchJson {
    field: String,
    value: String,
}

#[derive(Serialize)]
struct IdentityJson {
    public_key: String,
    alias: String,
    drop_url: String,
    matches: Vec<MatchJson>,
}

#[derive(Serialize)]
struct SearchResponse {
    identities: Vec<IdentityJson>,
}

fn search_error_response(e: crate::query::QueryError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, e.to_string()).into_response()
}

async fn run_search(state: &ApiState, pairs: Vec<QueryPair>, country: CountryId) -> Response {
    match state.query_engine.search(&pairs, country).await {
        Ok(results) => {
            let identities = results
                .into_iter()
                .map(|(identity, matches)| IdentityJson {
                    public_key: identity.public_key,
                    alias: identity.alias,
                    drop_url: identity.drop_url,
                    matches: matches
                        .into_iter()
                        .map(|m| MatchJson {
                            field: m.field.as_str().to_string(),
                            value: m.value,
                        })
                        .collect(),
                })
                .collect();
            Json(SearchResponse { identities }).into_response()
        }
        Err(e) => search_error_response(e),
    }
}

async fn search_get(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    let pairs: Vec<(String, String)> = match query {
        Some(q) => match serde_urlencoded::from_str(&q) {
            Ok(p) => p,
            Err(_) => return (StatusCode::BAD_REQUEST, "invalid query string").into_response(),
        },
        None => Vec::new(),
    };
    let pairs = pairs
        .into_iter()
        .map(|(field, value)| QueryPair { field, value })
        .collect();
    run_search(&state, pairs, locale_country(&headers)).await
}

#[derive(Deserialize)]
struct SearchPostPair {
    field: String,
    value: String,
}

#[derive(Deserialize)]
struct SearchPostBody {
    query: Vec<SearchPostPair>,
}

async fn search_post(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(body): Json<SearchPostBody>,
) -> Response {
    let pairs = body
        .query
        .into_iter()
        .map(|p| QueryPair {
            field: p.field,
            value: p.value,
        })
        .collect();
    run_search(&state, pairs, locale_country(&headers)).await
}

#[derive(Deserialize)]
struct WireIdentity {
    public_key: String,
    alias: String,
    drop_url: String,
}

#[derive(Deserialize)]
struct WireItem {
    action: String,
    field: String,
    value: String,
}

#[derive(Deserialize)]
struct WireUpdateRequest {
    identity: WireIdentity,
    items: Vec<WireItem>,
}

fn scrub_items(
    items: Vec<WireItem>,
    config: &ServerConfig,
    country: CountryId,
) -> Result<Vec<UpdateItem>, EngineError> {
    let policy = config.country_policy();
    items
        .into_iter()
        .map(|item| {
            let action = match item.action.as_str() {
                "create" => Action::Create,
                "delete" => Action::Delete,
                other => {
                    return Err(EngineError::Malformed(format!("unknown action: {other}")))
                }
            };
            let field = Field::parse(&item.field)
                .ok_or_else(|| EngineError::Malformed(format!("unknown field: {}", item.field)))?;
            let value = match field {
                Field::Email => item.value,
                Field::Phone => crate::engine::scrub_phone(&item.value, country, &policy)?,
            };
            Ok(UpdateItem { action, field, value })
        })
        .collect()
}

fn engine_error_response(e: EngineError) -> Response {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, e.to_string()).into_response()
}

async fn update(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let is_envelope = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with(ENVELOPE_CONTENT_TYPE))
        .unwrap_or(false);

    let country = locale_country(&headers);

    let (wire, public_key_verified) = if is_envelope {
        let (sender_pub, plaintext) = match envelope_open(state.keypair.secret(), &body) {
            Ok(v) => v,
            Err(EnvelopeError) => {
                warn!(server_key = %encode_key(&state.keypair.public()), "envelope failed to open");
                return (StatusCode::BAD_REQUEST, "could not decrypt envelope").into_response();
            }
        };
        let wire: WireUpdateRequest = match serde_json::from_str(&plaintext) {
            Ok(w) => w,
            Err(_) => return (StatusCode::BAD_REQUEST, "malformed request body").into_response(),
        };
        if wire.identity.public_key != encode_key(&sender_pub) {
            return (StatusCode::FORBIDDEN, "envelope sender key does not match identity").into_response();
        }
        (wire, true)
    } else {
        let wire: WireUpdateRequest = match serde_json::from_slice(&body) {
            Ok(w) => w,
            Err(_) => return (StatusCode::BAD_REQUEST, "malformed request body").into_response(),
        };
        (wire, false)
    };

    let items = match scrub_items(wire.items, &state.config, country) {
        Ok(items) => items,
        Err(e) => return engine_error_response(e),
    };

    let request = UpdateRequest {
        identity: IdentityTriplet {
            public_key: wire.identity.public_key,
            alias: wire.identity.alias,
            drop_url: wire.identity.drop_url,
        },
        items,
        public_key_verified,
    };

    let dispatcher = VerificationDispatcher {
        email: &*state.email_transport,
        sms: &*state.sms_transport,
        url_builder: &*state.url_builder,
        from_email: &state.config.default_from_email,
        from_phone: &state.config.sendsms_default_from_phone,
    };

    match state
        .engine
        .submit(request, Some(&dispatcher), state.config.shallow_verification, now())
        .await
    {
        Ok(UpdateOutcome::Committed) => StatusCode::NO_CONTENT.into_response(),
        Ok(UpdateOutcome::Accepted { pending_id }) => {
            info!(pending_id, "update request accepted");
            StatusCode::ACCEPTED.into_response()
        }
        Err(e) => engine_error_response(e),
    }
}

#[derive(Deserialize)]
struct ControlEnvelopeBody {
    api: String,
    timestamp: i64,
}

async fn open_control_envelope(
    state: &ApiState,
    body: &[u8],
    expected_api: &str,
) -> Result<[u8; 32], Response> {
    let (sender_pub, plaintext) = envelope_open(state.keypair.secret(), body).map_err(|_| {
        (StatusCode::BAD_REQUEST, "could not decrypt envelope").into_response()
    })?;

    let control: ControlEnvelopeBody = serde_json::from_str(&plaintext)
        .map_err(|_| (StatusCode::BAD_REQUEST, "malformed control message").into_response())?;

    if control.api != expected_api {
        return Err((StatusCode::BAD_REQUEST, "unexpected api field").into_response());
    }

    check_replay_window(control.timestamp, now())
        .map_err(|e| engine_error_response(e))?;

    Ok(sender_pub)
}

#[derive(Serialize)]
struct StatusEntryJson {
    field: String,
    value: String,
    status: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    public_key: String,
    alias: String,
    drop_url: String,
    entries: Vec<StatusEntryJson>,
}

async fn status(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let sender_pub = match open_control_envelope(&state, &body, "status").await {
        Ok(pk) => pk,
        Err(resp) => return resp,
    };

    match state.engine.status(&encode_key(&sender_pub)).await {
        Ok(status) => {
            let entries = status
                .entries
                .into_iter()
                .map(|e| StatusEntryJson {
                    field: e.field.as_str().to_string(),
                    value: e.value,
                    status: match e.status {
                        crate::engine::EntryStatus::Confirmed => "confirmed",
                        crate::engine::EntryStatus::Unconfirmed => "unconfirmed",
                        crate::engine::EntryStatus::DeletionPending => "deletion-pending",
                    },
                })
                .collect();
            Json(StatusResponse {
                public_key: status.public_key,
                alias: status.alias,
                drop_url: status.drop_url,
                entries,
            })
            .into_response()
        }
        Err(e) => engine_error_response(e),
    }
}

async fn delete_identity(State(state): State<Arc<ApiState>>, body: Bytes) -> Response {
    let sender_pub = match open_control_envelope(&state, &body, "delete-identity").await {
        Ok(pk) => pk,
        Err(resp) => return resp,
    };

    match state.engine.delete_identity(&encode_key(&sender_pub)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(error = %e, "delete-identity failed");
            engine_error_response(e)
        }
    }
}

fn verify_page(title: &str, body: &str) -> Html<String> {
    Html(format!(
        "<!doctype html><html><head><title>{title}</title></head><body><h1>{title}</h1><p>{body}</p></body></html>"
    ))
}

async fn verify_confirm_deny(
    State(state): State<Arc<ApiState>>,
    Path((id, action)): Path<(String, String)>,
) -> Response {
    let result = match action.as_str() {
        "confirm" => state.engine.confirm(&id, now()).await,
        "deny" => state.engine.deny(&id, now()).await,
        _ => return (StatusCode::NOT_FOUND, "unknown action").into_response(),
    };

    match result {
        Ok(ConfirmOutcome::StillPending) => {
            verify_page("Thank you", "Your confirmation has been recorded; waiting on other pending confirmations.").into_response()
        }
        Ok(ConfirmOutcome::CommittedRequest) => {
            verify_page("Thank you", "Your directory change has been applied.").into_response()
        }
        Ok(ConfirmOutcome::Denied) => {
            verify_page("Request denied", "The requested change has been discarded.").into_response()
        }
        Ok(ConfirmOutcome::Expired) => {
            verify_page("Request expired", "This request is no longer valid; please submit it again.").into_response()
        }
        Ok(ConfirmOutcome::AlreadyResolved(state)) => {
            verify_page("Already resolved", &format!("This verification was already {state}.")).into_response()
        }
        Err(EngineError::NotFound) => (StatusCode::NOT_FOUND, "unknown verification id").into_response(),
        Err(e) => engine_error_response(e),
    }
}

async fn verify_review(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.engine.review(&id).await {
        Ok(ReviewState::Pending(field, value)) => verify_page(
            "Confirm directory change",
            &format!("A change to your {field} entry ({value}) is awaiting your confirmation."),
        )
        .into_response(),
        Ok(ReviewState::Done(outcome)) => {
            verify_page("Verification result", &format!("This verification was {outcome}.")).into_response()
        }
        Err(EngineError::NotFound) => (StatusCode::NOT_FOUND, "unknown verification id").into_response(),
        Err(e) => engine_error_response(e),
    }
}

#[derive(Deserialize)]
struct VerifyForm {
    action: String,
}

async fn verify_review_post(
    State(_state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    axum::extract::Form(form): axum::extract::Form<VerifyForm>,
) -> Response {
    match form.action.as_str() {
        "confirm" => Redirect::to(&format!("/verify/{id}/confirm/")).into_response(),
        "deny" => Redirect::to(&format!("/verify/{id}/deny/")).into_response(),
        _ => (StatusCode::BAD_REQUEST, "unknown form action").into_response(),
    }
}
