// ============================================================================
// INFO ENDPOINTS
// ============================================================================
// Instance information endpoints.
// ============================================================================

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;
use crate::connector::CONNECTORS;
use crate::{BUILD_DATE, VERSION};

#[derive(Debug, Serialize)]
pub struct Info {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_date: Option<&'static str>,
    pub connectors: Vec<&'static str>,
    pub read_only: bool,
}

pub async fn info(State(state): State<AppState>) -> Json<Info> {
    let expose = state.config.http.expose_version;

    Json(Info {
        version: expose.then_some(VERSION),
        build_date: expose.then_some(BUILD_DATE),
        connectors: CONNECTORS.to_vec(),
        read_only: state.config.http.read_only,
    })
}

pub async fn options(State(state): State<AppState>) -> Json<Info> {
    Json(Info {
        version: None,
        build_date: None,
        connectors: CONNECTORS.to_vec(),
        read_only: state.config.http.read_only,
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{call, state, state_with};
    use crate::config::GatewayConfig;
    use crate::connector::testing::MemoryConnector;
    use axum::http::{Method, StatusCode};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_info() {
        let response = call(&state(), Method::GET, "/api/v1", None).await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body["version"], json!(crate::VERSION));
        assert_eq!(
            response.body["connectors"],
            json!(["facette", "graphite", "influxdb", "kairosdb"])
        );
        assert_eq!(response.body["read_only"], json!(false));
    }

    #[tokio::test]
    async fn test_hidden_version() {
        let mut config = GatewayConfig::default();
        config.http.expose_version = false;
        config.http.read_only = true;
        let state = state_with(config, Arc::new(MemoryConnector::new("memory")));

        let response = call(&state, Method::GET, "/api/v1/version", None).await;
        assert!(response.body.get("version").is_none());
        assert_eq!(response.body["read_only"], json!(true));

        let response = call(&state, Method::OPTIONS, "/api/v1", None).await;
        assert_eq!(response.status, StatusCode::OK);
        assert!(response.body.get("build_date").is_none());
    }
}
