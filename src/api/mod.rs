// ============================================================================
// HTTP API
// ============================================================================
// REST surface of the gateway, mounted at `<base_path>/api/v1`:
// - info, bulk, catalog, library, providers and series endpoints
// - JSON bodies only, errors rendered as `{"message": ...}`
// - request loop detection through the requestor header
// ============================================================================

pub mod bulk;
pub mod catalog;
pub mod info;
pub mod library;
pub mod series;

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::catalog::Catalog;
use crate::config::GatewayConfig;
use crate::error::{
    ConnectorError, ErrorKind, FacetteError, PatternError, StorageError, TemplateError, TimeRangeError,
};
use crate::points::PointsEngine;
use crate::poller::Poller;
use crate::storage::Store;
use crate::{API_PREFIX, REQUESTOR_HEADER};

const NO_CACHE: &str = "no-cache, no-store, must-revalidate";

// ----------------------------------------------------------------------------
// Shared state
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub store: Arc<Store>,
    pub catalog: Arc<Catalog>,
    pub poller: Arc<Poller>,
    pub points: Arc<PointsEngine>,
    pub instance_id: Arc<str>,
}

impl AppState {
    pub fn new(config: GatewayConfig, store: Arc<Store>, poller: Arc<Poller>, instance_id: &str) -> Self {
        let catalog = poller.catalog().clone();
        let points = Arc::new(PointsEngine::new(
            store.clone(),
            catalog.clone(),
            config.defaults.time_range.clone(),
            config.defaults.sample,
        ));

        Self {
            config: Arc::new(config),
            store,
            catalog,
            poller,
            points,
            instance_id: Arc::from(instance_id),
        }
    }

    /// Mount point of the versioned API.
    pub fn prefix(&self) -> String {
        format!("{}{}", self.config.http.base_path.trim_end_matches('/'), API_PREFIX)
    }

    /// Reject writes on read-only instances.
    pub fn check_writable(&self) -> Result<(), ApiError> {
        if self.config.http.read_only {
            return Err(ApiError::new(ErrorKind::ReadOnly));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Router
// ----------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/", get(info::info).options(info::options))
        .route("/version", get(info::info))
        .route("/bulk", post(bulk::execute))
        .merge(catalog::routes())
        .merge(library::routes())
        .merge(series::routes())
        .fallback(unknown_endpoint)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(middleware::from_fn_with_state(state.clone(), check_requestor));

    Router::new()
        .nest(&state.prefix(), api)
        .fallback(unknown_endpoint)
        .with_state(state)
        .layer(SetResponseHeaderLayer::overriding(
            CACHE_CONTROL,
            HeaderValue::from_static(NO_CACHE),
        ))
        .layer(TraceLayer::new_for_http())
}

async fn unknown_endpoint() -> ApiError {
    ApiError::new(ErrorKind::UnknownEndpoint)
}

async fn method_not_allowed() -> ApiError {
    ApiError::new(ErrorKind::MethodNotAllowed)
}

async fn check_requestor(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let requestor = request
        .headers()
        .get(REQUESTOR_HEADER)
        .and_then(|v| v.to_str().ok());

    if requestor == Some(&*state.instance_id) {
        warn!(target: "facette::api", uri = %request.uri(), "Request loop detected, rejecting");
        return ApiError::new(ErrorKind::RequestLoop).into_response();
    }

    next.run(request).await
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Error returned by handlers, rendered as `{"message": ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiError {
    kind: ErrorKind,
}

impl ApiError {
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<FacetteError> for ApiError {
    fn from(e: FacetteError) -> Self {
        let kind = e.kind();
        if kind == ErrorKind::Unhandled {
            error!(target: "facette::api", category = e.category(), error = %e, "Unhandled error");
        } else {
            debug!(target: "facette::api", error = %e, "Request failed");
        }
        Self { kind }
    }
}

macro_rules! impl_from_error {
    ($($error:ty),+) => {
        $(impl From<$error> for ApiError {
            fn from(e: $error) -> Self {
                FacetteError::from(e).into()
            }
        })+
    };
}

impl_from_error!(StorageError, ConnectorError, TemplateError, TimeRangeError, PatternError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "message": self.kind.message() }))).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ----------------------------------------------------------------------------
// Extractors
// ----------------------------------------------------------------------------

/// JSON body requiring an `application/json` content type.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().eq_ignore_ascii_case("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(ApiError::new(ErrorKind::UnsupportedMediaType));
        }

        let body = Bytes::from_request(request, state)
            .await
            .map_err(|_| ApiError::new(ErrorKind::InvalidJson))?;

        serde_json::from_slice(&body).map(JsonBody).map_err(|e| {
            debug!(target: "facette::api", error = %e, "Unable to decode request body");
            ApiError::new(ErrorKind::InvalidJson)
        })
    }
}

/// Query string parameters.
#[derive(Debug, Clone, Default)]
pub struct Params(HashMap<String, String>);

impl<S> FromRequestParts<S> for Params
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(params)| Params(params))
            .map_err(|_| ApiError::new(ErrorKind::InvalidParameter))
    }
}

impl Params {
    /// Non-empty value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1" | "true" | "yes" | "on"))
    }

    pub fn usize(&self, key: &str) -> ApiResult<Option<usize>> {
        self.get(key)
            .map(|v| v.parse().map_err(|_| ApiError::new(ErrorKind::InvalidParameter)))
            .transpose()
    }

    /// Comma-separated values of `key`.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::Method;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::connector::testing::MemoryConnector;
    use crate::connector::{Connector, ConnectorContext};
    use crate::storage::Provider;

    /// State backed by a memory store and connectors serving `connector`.
    pub fn state_with(config: GatewayConfig, connector: Arc<MemoryConnector>) -> AppState {
        let poller = Poller::new(Arc::new(Catalog::new()), "test-instance", Duration::from_secs(1))
            .with_factory(Arc::new(move |_: &Provider, _: &ConnectorContext| {
                Ok::<_, ConnectorError>(connector.clone() as Arc<dyn Connector>)
            }));
        AppState::new(config, Arc::new(Store::memory()), Arc::new(poller), "test-instance")
    }

    pub fn state() -> AppState {
        state_with(GatewayConfig::default(), Arc::new(MemoryConnector::new("memory")))
    }

    pub struct TestResponse {
        pub status: StatusCode,
        pub headers: axum::http::HeaderMap,
        pub body: Value,
    }

    pub async fn call(state: &AppState, method: Method, uri: &str, body: Option<Value>) -> TestResponse {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();

        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        TestResponse { status, headers, body }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{call, state};
    use super::*;
    use axum::body::Body;
    use axum::http::Method;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_unknown_endpoint() {
        let response = call(&state(), Method::GET, "/api/v1/unknown/path", None).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.body, json!({"message": "unknown endpoint"}));
        assert_eq!(response.headers[CACHE_CONTROL], NO_CACHE);

        let outside = call(&state(), Method::GET, "/elsewhere", None).await;
        assert_eq!(outside.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_loop() {
        let state = state();
        let request = axum::http::Request::builder()
            .uri("/api/v1/catalog")
            .header(REQUESTOR_HEADER, "test-instance")
            .body(Body::empty())
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let request = axum::http::Request::builder()
            .uri("/api/v1/catalog")
            .header(REQUESTOR_HEADER, "other-instance")
            .body(Body::empty())
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_content_type_required() {
        let state = state();
        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/v1/series/expand")
            .header(CONTENT_TYPE, "text/plain")
            .body(Body::from("[]"))
            .unwrap();
        let response = router(state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let request = axum::http::Request::builder()
            .method(Method::POST)
            .uri("/api/v1/series/expand")
            .header(CONTENT_TYPE, "application/json; charset=utf-8")
            .body(Body::from("{not json"))
            .unwrap();
        let response = router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_base_path() {
        let mut config = GatewayConfig::default();
        config.http.base_path = "/facette/".into();
        let state = super::testing::state_with(
            config,
            Arc::new(crate::connector::testing::MemoryConnector::new("memory")),
        );

        let response = call(&state, Method::GET, "/facette/api/v1/catalog", None).await;
        assert_eq!(response.status, StatusCode::OK);
        let response = call(&state, Method::GET, "/api/v1/catalog", None).await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_params() {
        let params = Params(HashMap::from([
            ("limit".to_string(), "10".to_string()),
            ("offset".to_string(), "x".to_string()),
            ("fields".to_string(), "id, name,".to_string()),
            ("expand".to_string(), "1".to_string()),
        ]));

        assert_eq!(params.usize("limit").unwrap(), Some(10));
        assert!(params.usize("offset").is_err());
        assert_eq!(params.usize("missing").unwrap(), None);
        assert_eq!(params.list("fields"), vec!["id", "name"]);
        assert!(params.flag("expand"));
        assert!(!params.flag("missing"));
    }
}
