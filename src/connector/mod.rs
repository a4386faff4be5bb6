// ============================================================================
// CONNECTORS
// ============================================================================
// Drivers for the upstream back-ends a provider can point at. A connector:
// - pushes the `(origin, source, metric)` records it knows about on refresh
// - answers points queries for series expressed in upstream (original) names
// ============================================================================

pub mod facette;
pub mod graphite;
pub mod influxdb;
pub mod kairosdb;
mod pattern;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::catalog::Record;
use crate::error::{ConnectorError, ConnectorResult};
use crate::series::Series;

pub use pattern::SeriesPattern;

/// Free-form attribute and settings maps.
pub type Attributes = Map<String, Value>;

/// Supported connector kinds.
pub const CONNECTORS: [&str; 4] = ["facette", "graphite", "influxdb", "kairosdb"];

// ----------------------------------------------------------------------------
// Queries
// ----------------------------------------------------------------------------

/// One series requested from a connector, named as the upstream knows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySeries {
    pub name: String,
    pub origin: String,
    pub source: String,
    pub metric: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PointsQuery {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub sample: usize,
    pub series: Vec<QuerySeries>,
}

impl PointsQuery {
    /// Duration of one sample step, never shorter than one millisecond.
    pub fn step(&self) -> chrono::Duration {
        let span = self.end.signed_duration_since(self.start).num_milliseconds();
        let sample = i64::try_from(self.sample.max(1)).unwrap_or(i64::MAX);
        chrono::Duration::milliseconds((span / sample).max(1))
    }
}

// ----------------------------------------------------------------------------
// Connector trait
// ----------------------------------------------------------------------------

#[async_trait]
pub trait Connector: Send + Sync {
    /// Provider-scoped name, also used as the origin by most drivers.
    fn name(&self) -> &str;

    /// Connector kind (`graphite`, `influxdb`, ...)
    fn kind(&self) -> &'static str;

    /// Push every known record to `output`. The sender belongs to the caller.
    async fn refresh(&self, output: &mpsc::Sender<Record>) -> ConnectorResult<()>;

    /// Fetch points. The result is indexed like `query.series`; series the
    /// upstream has no data for are left empty.
    async fn points(&self, query: &PointsQuery) -> ConnectorResult<Vec<Series>>;
}

/// Process-wide values every connector may need.
#[derive(Debug, Clone)]
pub struct ConnectorContext {
    pub provider: String,
    pub instance_id: String,
    pub default_timeout: Duration,
}

impl ConnectorContext {
    pub fn new(provider: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            instance_id: instance_id.into(),
            default_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Instantiate a connector from its kind and provider settings.
pub fn new_connector(
    kind: &str,
    context: &ConnectorContext,
    settings: &Attributes,
) -> ConnectorResult<Arc<dyn Connector>> {
    let settings = Settings::new(settings);

    let connector: Arc<dyn Connector> = match kind {
        "facette" => Arc::new(facette::FacetteConnector::new(context, &settings)?),
        "graphite" => Arc::new(graphite::GraphiteConnector::new(context, &settings)?),
        "influxdb" => Arc::new(influxdb::InfluxDbConnector::new(context, &settings)?),
        "kairosdb" => Arc::new(kairosdb::KairosDbConnector::new(context, &settings)?),
        other => {
            return Err(ConnectorError::Unsupported {
                kind: other.to_string(),
            })
        }
    };

    Ok(connector)
}

pub fn is_supported(kind: &str) -> bool {
    CONNECTORS.contains(&kind)
}

// ----------------------------------------------------------------------------
// Shared helpers
// ----------------------------------------------------------------------------

/// Typed accessors over a provider settings map.
pub(crate) struct Settings<'a> {
    map: &'a Attributes,
}

impl<'a> Settings<'a> {
    pub(crate) fn new(map: &'a Attributes) -> Self {
        Self { map }
    }

    pub(crate) fn has(&self, key: &str) -> bool {
        self.map.get(key).map(|v| !v.is_null()).unwrap_or(false)
    }

    pub(crate) fn optional_string(&self, key: &str) -> ConnectorResult<Option<String>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected a string")),
        }
    }

    /// Required, non-empty string setting.
    pub(crate) fn string(&self, key: &str) -> ConnectorResult<String> {
        match self.optional_string(key)? {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ConnectorError::missing_setting(key)),
        }
    }

    pub(crate) fn bool(&self, key: &str, default: bool) -> ConnectorResult<bool> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(Value::Bool(b)) => Ok(*b),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected a boolean")),
        }
    }

    pub(crate) fn u64(&self, key: &str, default: u64) -> ConnectorResult<u64> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(default),
            Some(value) => value
                .as_u64()
                .ok_or_else(|| ConnectorError::invalid_setting(key, "expected a positive integer")),
        }
    }

    pub(crate) fn string_list(&self, key: &str, default: &[&str]) -> ConnectorResult<Vec<String>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(default.iter().map(|s| s.to_string()).collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(str::to_string)
                        .ok_or_else(|| ConnectorError::invalid_setting(key, "expected a list of strings"))
                })
                .collect(),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected a list of strings")),
        }
    }

    pub(crate) fn map(&self, key: &str) -> ConnectorResult<Option<&'a Attributes>> {
        match self.map.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(ConnectorError::invalid_setting(key, "expected an object")),
        }
    }

    /// Upstream base URL without trailing slash.
    pub(crate) fn url(&self) -> ConnectorResult<String> {
        let url = self.string("url")?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConnectorError::invalid_setting("url", "expected an http(s) URL"));
        }
        Ok(url.trim_end_matches('/').to_string())
    }
}

/// HTTP client honoring the provider `timeout` and `allow_insecure_tls` settings.
pub(crate) fn http_client(
    context: &ConnectorContext,
    settings: &Settings<'_>,
) -> ConnectorResult<reqwest::Client> {
    let timeout = settings.u64("timeout", context.default_timeout.as_secs())?;
    let insecure = settings.bool("allow_insecure_tls", false)?;

    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout.max(1)))
        .danger_accept_invalid_certs(insecure)
        .user_agent(format!("{}/{}", crate::NAME, crate::VERSION))
        .build()
        .map_err(|e| ConnectorError::invalid_setting("url", e.to_string()))
}

/// Send a JSON-decoded request, mapping transport, status and decoding errors.
pub(crate) async fn fetch_json<T: serde::de::DeserializeOwned>(
    connector: &str,
    request: reqwest::RequestBuilder,
) -> ConnectorResult<T> {
    let response = request
        .send()
        .await
        .map_err(|e| ConnectorError::request(connector, e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ConnectorError::invalid_response(
            connector,
            format!("got HTTP status code {}", status),
        ));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| ConnectorError::invalid_response(connector, e))
}

pub(crate) async fn emit(output: &mpsc::Sender<Record>, record: Record) -> ConnectorResult<()> {
    output
        .send(record)
        .await
        .map_err(|_| ConnectorError::OutputClosed)
}

// ----------------------------------------------------------------------------
// In-memory connector for tests
// ----------------------------------------------------------------------------

#[cfg(test)]
pub mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::catalog::ProviderHandle;
    use crate::series::Point;

    /// Connector serving canned records and points.
    pub struct MemoryConnector {
        name: String,
        records: Mutex<Vec<Record>>,
        points: Mutex<HashMap<(String, String), Vec<Point>>>,
        pub refresh_delay: Mutex<Option<Duration>>,
        pub fail_refresh: Mutex<bool>,
        pub fail_points: Mutex<bool>,
        pub refresh_count: AtomicUsize,
        pub queries: Mutex<Vec<PointsQuery>>,
    }

    impl MemoryConnector {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                records: Mutex::new(Vec::new()),
                points: Mutex::new(HashMap::new()),
                refresh_delay: Mutex::new(None),
                fail_refresh: Mutex::new(false),
                fail_points: Mutex::new(false),
                refresh_count: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            }
        }

        pub fn with_records(self, records: Vec<Record>) -> Self {
            *self.records.lock() = records;
            self
        }

        pub fn set_records(&self, records: Vec<Record>) {
            *self.records.lock() = records;
        }

        pub fn with_points(self, source: &str, metric: &str, points: Vec<Point>) -> Self {
            self.points
                .lock()
                .insert((source.to_string(), metric.to_string()), points);
            self
        }

        pub fn refreshes(&self) -> usize {
            self.refresh_count.load(Ordering::SeqCst)
        }

        pub fn handle(self: Arc<Self>, id: &str, priority: i32) -> Arc<ProviderHandle> {
            Arc::new(ProviderHandle::new(id, id, priority, self))
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> &'static str {
            "memory"
        }

        async fn refresh(&self, output: &mpsc::Sender<Record>) -> ConnectorResult<()> {
            self.refresh_count.fetch_add(1, Ordering::SeqCst);
            let delay = *self.refresh_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if *self.fail_refresh.lock() {
                return Err(ConnectorError::request(&self.name, "upstream unavailable"));
            }

            let records = self.records.lock().clone();
            for record in records {
                emit(output, record).await?;
            }
            Ok(())
        }

        async fn points(&self, query: &PointsQuery) -> ConnectorResult<Vec<Series>> {
            self.queries.lock().push(query.clone());
            if *self.fail_points.lock() {
                return Err(ConnectorError::request(&self.name, "upstream unavailable"));
            }

            let points = self.points.lock();
            Ok(query
                .series
                .iter()
                .map(|s| {
                    let data = points
                        .get(&(s.source.clone(), s.metric.clone()))
                        .cloned()
                        .unwrap_or_default();
                    Series::new(s.name.clone(), data)
                })
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => Attributes::new(),
        }
    }

    #[test]
    fn test_unsupported_connector() {
        let context = ConnectorContext::new("p", "instance");
        let err = new_connector("rrd", &context, &Attributes::new()).err().unwrap();
        assert!(matches!(err, ConnectorError::Unsupported { ref kind } if kind == "rrd"));
        assert!(is_supported("graphite"));
        assert!(!is_supported("rrd"));
    }

    #[test]
    fn test_missing_setting() {
        let context = ConnectorContext::new("p", "instance");
        let err = new_connector("facette", &context, &Attributes::new()).err().unwrap();
        assert!(matches!(err, ConnectorError::MissingSetting { ref setting } if setting == "url"));
    }

    #[test]
    fn test_settings_accessors() {
        let map = settings(json!({
            "url": "http://localhost:8080/",
            "timeout": 5,
            "flag": true,
            "list": ["a", "b"],
            "bad": 3,
        }));
        let settings = Settings::new(&map);

        assert_eq!(settings.url().unwrap(), "http://localhost:8080");
        assert_eq!(settings.u64("timeout", 10).unwrap(), 5);
        assert_eq!(settings.u64("missing", 10).unwrap(), 10);
        assert!(settings.bool("flag", false).unwrap());
        assert_eq!(settings.string_list("list", &[]).unwrap(), vec!["a", "b"]);
        assert_eq!(settings.string_list("none", &["x"]).unwrap(), vec!["x"]);
        assert!(settings.optional_string("bad").is_err());
        assert!(settings.map("list").is_err());
    }

    #[test]
    fn test_query_step() {
        let start = Utc::now();
        let query = PointsQuery {
            start,
            end: start + chrono::Duration::seconds(3600),
            sample: 360,
            series: Vec::new(),
        };
        assert_eq!(query.step(), chrono::Duration::seconds(10));

        let huge = PointsQuery {
            sample: 1usize << 32,
            ..query.clone()
        };
        assert_eq!(huge.step(), chrono::Duration::milliseconds(1));

        let empty = PointsQuery { sample: 0, ..query };
        assert_eq!(empty.step(), chrono::Duration::seconds(3600));
    }
}
