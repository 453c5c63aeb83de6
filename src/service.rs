use crate::error::RegistryError;
use crate::sources::SourceRegistry;
use crate::store::{PriceEntry, PriceFilter, PriceStore};
use crate::types::SourceDescriptor;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SourceRegistry>,
    pub store: Arc<PriceStore>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct PriceResponse {
    pub source: String,
    pub base: String,
    pub base_real: String,
    pub quote: String,
    pub quote_real: String,
    pub price: f64,
    #[serde(rename = "lastUpdatedReal")]
    pub last_updated_real: String,
    #[serde(rename = "lastUpdatedWander")]
    pub last_updated_wander: String,
}

impl From<&PriceEntry> for PriceResponse {
    fn from(entry: &PriceEntry) -> Self {
        let cfg = &entry.config;
        Self {
            source: cfg.source.clone(),
            base: cfg.display_base().to_string(),
            base_real: cfg.base.clone(),
            quote: cfg.display_quote().to_string(),
            quote_real: cfg.quote.clone(),
            // factor is applied when the price is fetched
            price: entry.info.price,
            last_updated_real: entry
                .info
                .last_updated_real
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            last_updated_wander: entry
                .info
                .last_updated_wander
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PricesResponse {
    pub prices: Vec<PriceResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: bool,
}

#[derive(Debug, Default, Deserialize)]
struct PricesQuery {
    source: Option<String>,
    base: Option<String>,
    quote: Option<String>,
    wander: Option<String>,
}

enum ApiError {
    BadRequest(String),
    NotFound(RegistryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(e) => (StatusCode::NOT_FOUND, e.to_string()),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/prices", get(prices_get))
        .route("/sources", get(sources_get))
        .route("/sources/:name", get(source_get))
        .route("/status", get(status_get))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(listen = %addr, "Listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

/// `1`, `t`, `true` and their false counterparts, in the usual casings.
fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}

async fn prices_get(
    State(state): State<AppState>,
    Query(query): Query<PricesQuery>,
) -> Result<Json<PricesResponse>, ApiError> {
    debug!(?query, "GET /prices");
    let wander = match query.wander.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            parse_bool(raw)
                .ok_or_else(|| ApiError::BadRequest("failed to parse wander as boolean".into()))?,
        ),
    };
    let filter = PriceFilter {
        source: query.source,
        base: query.base,
        quote: query.quote,
        wander,
    };

    let mut prices: Vec<PriceResponse> = state
        .store
        .snapshot(&filter)
        .iter()
        .map(PriceResponse::from)
        .collect();
    prices.sort_by(|a, b| {
        (&a.source, &a.base_real, &a.quote_real).cmp(&(&b.source, &b.base_real, &b.quote_real))
    });
    Ok(Json(PricesResponse { prices }))
}

async fn sources_get(State(state): State<AppState>) -> Json<Vec<SourceDescriptor>> {
    Json(state.registry.list_sources())
}

async fn source_get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SourceDescriptor>, ApiError> {
    state
        .registry
        .get_source(&name)
        .map(|s| Json(s.clone()))
        .map_err(ApiError::NotFound)
}

async fn status_get() -> Json<StatusResponse> {
    Json(StatusResponse { status: true })
}
