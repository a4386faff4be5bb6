// ============================================================================
// GRAPHITE CONNECTOR
// ============================================================================
// Graphite render API driver.
// ============================================================================

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{
    emit, fetch_json, http_client, Connector, ConnectorContext, PointsQuery, SeriesPattern, Settings,
};
use crate::catalog::Record;
use crate::error::{ConnectorError, ConnectorResult};
use crate::series::{Point, Series};

/// Record attribute holding the full Graphite series path.
const TARGET_ATTRIBUTE: &str = "target";

#[derive(Debug, Deserialize)]
struct RenderSeries {
    target: String,
    #[serde(default)]
    datapoints: Vec<(Option<f64>, Option<f64>)>,
}

pub struct GraphiteConnector {
    name: String,
    url: String,
    pattern: SeriesPattern,
    client: reqwest::Client,
}

impl GraphiteConnector {
    pub(crate) fn new(context: &ConnectorContext, settings: &Settings<'_>) -> ConnectorResult<Self> {
        let url = settings.url()?;
        let pattern = SeriesPattern::new(&settings.string("pattern")?)?;

        Ok(Self {
            name: context.provider.clone(),
            url,
            pattern,
            client: http_client(context, settings)?,
        })
    }

    fn record(&self, series: &str) -> Option<Record> {
        let (source, metric) = self.pattern.split(series)?;
        let mut attributes = super::Attributes::new();
        attributes.insert(TARGET_ATTRIBUTE.into(), Value::String(series.to_string()));
        Some(Record::new(self.name.clone(), source, metric).with_attributes(attributes))
    }
}

fn target_of(series: &super::QuerySeries) -> ConnectorResult<&str> {
    series
        .attributes
        .get(TARGET_ATTRIBUTE)
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::InvalidAttribute {
            attribute: TARGET_ATTRIBUTE.to_string(),
        })
}

/// Render API query string for `query`, with times relative to `now`.
fn render_params(
    query: &PointsQuery,
    now: DateTime<Utc>,
) -> ConnectorResult<Vec<(&'static str, String)>> {
    if query.series.is_empty() {
        return Err(ConnectorError::EmptyQuery);
    }

    let mut params = vec![("format", "json".to_string())];
    for series in &query.series {
        params.push(("target", target_of(series)?.to_string()));
    }
    let from = now.signed_duration_since(query.start).num_seconds().max(0);
    params.push(("from", format!("-{}s", from)));

    // Graphite rejects `until` values in the future
    if query.end < now {
        let until = now.signed_duration_since(query.end).num_seconds();
        params.push(("until", format!("-{}s", until)));
    }

    Ok(params)
}

/// Match render results back to the requested series by target.
fn align(query: &PointsQuery, results: Vec<RenderSeries>) -> Vec<Series> {
    let mut by_target: HashMap<String, Vec<Point>> = results
        .into_iter()
        .map(|result| {
            let points = result
                .datapoints
                .into_iter()
                .filter_map(|(value, time)| Point::from_unix(time? as i64, value.unwrap_or(f64::NAN)))
                .collect();
            (result.target, points)
        })
        .collect();

    query
        .series
        .iter()
        .map(|series| {
            let points = target_of(series)
                .ok()
                .and_then(|target| by_target.remove(target))
                .unwrap_or_default();
            Series::new(series.name.clone(), points)
        })
        .collect()
}

#[async_trait]
impl Connector for GraphiteConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "graphite"
    }

    async fn refresh(&self, output: &mpsc::Sender<Record>) -> ConnectorResult<()> {
        let index: Vec<String> = fetch_json(
            &self.name,
            self.client.get(format!("{}/metrics/index.json", self.url)),
        )
        .await?;

        debug!(target: "facette::connector::graphite", provider = %self.name, series = index.len(), "Fetched metrics index");

        for series in &index {
            match self.record(series) {
                Some(record) => emit(output, record).await?,
                None => {
                    trace!(target: "facette::connector::graphite", provider = %self.name, series = %series, "Series does not match pattern")
                }
            }
        }

        Ok(())
    }

    async fn points(&self, query: &PointsQuery) -> ConnectorResult<Vec<Series>> {
        let params = render_params(query, Utc::now())?;
        let results: Vec<RenderSeries> = fetch_json(
            &self.name,
            self.client.get(format!("{}/render", self.url)).query(&params),
        )
        .await?;

        Ok(align(query, results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Attributes, QuerySeries};
    use chrono::TimeZone;
    use serde_json::json;

    fn connector() -> GraphiteConnector {
        let settings: Attributes = serde_json::from_value(json!({
            "url": "http://graphite.example.net/",
            "pattern": r"(?P<source>[^\.]+)\.(?P<metric>.+)",
        }))
        .unwrap();
        GraphiteConnector::new(&ConnectorContext::new("graphite", "test"), &Settings::new(&settings)).unwrap()
    }

    fn query(targets: &[&str]) -> PointsQuery {
        PointsQuery {
            start: Utc.timestamp_opt(1_000, 0).unwrap(),
            end: Utc.timestamp_opt(2_000, 0).unwrap(),
            sample: 10,
            series: targets
                .iter()
                .enumerate()
                .map(|(i, t)| {
                    let mut attributes = Attributes::new();
                    attributes.insert(TARGET_ATTRIBUTE.into(), json!(t));
                    QuerySeries {
                        name: format!("series{}", i),
                        attributes,
                        ..Default::default()
                    }
                })
                .collect(),
        }
    }

    #[test]
    fn test_record_from_index() {
        let connector = connector();
        assert_eq!(connector.url, "http://graphite.example.net");

        let record = connector.record("host1.cpu.idle").unwrap();
        assert_eq!(record.origin, "graphite");
        assert_eq!(record.source, "host1");
        assert_eq!(record.metric, "cpu.idle");
        assert_eq!(record.attributes[TARGET_ATTRIBUTE], json!("host1.cpu.idle"));
        assert!(connector.record("nodots").is_none());
    }

    #[test]
    fn test_pattern_is_required() {
        let settings: Attributes = serde_json::from_value(json!({"url": "http://localhost"})).unwrap();
        let result = GraphiteConnector::new(&ConnectorContext::new("g", "t"), &Settings::new(&settings));
        assert!(matches!(result, Err(ConnectorError::MissingSetting { .. })));
    }

    #[test]
    fn test_render_params() {
        let now = Utc.timestamp_opt(2_500, 0).unwrap();
        let params = render_params(&query(&["a.b", "c.d"]), now).unwrap();
        assert_eq!(
            params,
            vec![
                ("format", "json".to_string()),
                ("target", "a.b".to_string()),
                ("target", "c.d".to_string()),
                ("from", "-1500s".to_string()),
                ("until", "-500s".to_string()),
            ]
        );

        let now = Utc.timestamp_opt(2_000, 0).unwrap();
        let params = render_params(&query(&["a.b"]), now).unwrap();
        assert!(params.iter().all(|(k, _)| *k != "until"));

        assert!(matches!(render_params(&query(&[]), now), Err(ConnectorError::EmptyQuery)));
    }

    #[test]
    fn test_align_by_target() {
        let results: Vec<RenderSeries> = serde_json::from_value(json!([
            {"target": "c.d", "datapoints": [[1.0, 1000], [null, 1010]]},
            {"target": "a.b", "datapoints": [[5.0, 1000]]},
        ]))
        .unwrap();

        let series = align(&query(&["a.b", "c.d", "e.f"]), results);
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].points[0].value, 5.0);
        assert_eq!(series[1].points.len(), 2);
        assert!(series[1].points[1].value.is_nan());
        assert!(series[2].points.is_empty());
        assert_eq!(series[2].name, "series2");
    }
}
