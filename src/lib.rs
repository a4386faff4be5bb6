//! # Facette Gateway
//!
//! A time-series visualization gateway. It federates pull-only metrics
//! back-ends behind a uniform `origin → source → metric` catalog, stores
//! user-authored graphs and collections, and resolves graph definitions into
//! point queries that are normalized, combined and summarized on the fly.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              FACETTE GATEWAY                                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  PROVIDER WORKERS → CONNECTOR.refresh → FILTER CHAIN → CATALOG              │
//! │  API → LIBRARY → GRAPH/SERIES EXPANDERS → CONNECTOR.points → NORMALIZER     │
//! │      → OPERATORS → SUMMARIZER → RESPONSE                                    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The gateway never stores samples: every point is fetched from the upstream
//! that owns the requested metric at request time.

pub mod api;
pub mod catalog;
pub mod config;
pub mod connector;
pub mod error;
pub mod expand;
pub mod logging;
pub mod pattern;
pub mod points;
pub mod poller;
pub mod series;
pub mod server;
pub mod storage;
pub mod template;
pub mod timerange;

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Gateway version, follows semantic versioning
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "facette";
pub const FULL_NAME: &str = "Facette time-series gateway";

/// Build date reported by the info endpoint, overridable at compile time.
pub const BUILD_DATE: &str = match option_env!("FACETTE_BUILD_DATE") {
    Some(date) => date,
    None => "unknown",
};

/// HTTP API version prefix
pub const API_PREFIX: &str = "/api/v1";

/// Header carrying the identifier of the instance that issued a request
pub const REQUESTOR_HEADER: &str = "x-facette-requestor";

/// Header required by delete-all requests
pub const CONFIRM_HEADER: &str = "x-confirm-action";

/// Header reporting the total number of records of a paginated listing
pub const TOTAL_RECORDS_HEADER: &str = "x-total-records";

/// Prefix designating a source or metric group in a series definition
pub const GROUP_PREFIX: &str = "group:";

pub use config::GatewayConfig;
pub use error::{ErrorKind, FacetteError, FacetteResult};
