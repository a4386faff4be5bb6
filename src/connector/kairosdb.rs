// ============================================================================
// KAIROSDB CONNECTOR
// ============================================================================
// KairosDB driver. Each metric is exposed once per configured aggregator and
// per value of its source tags.
// ============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    emit, fetch_json, http_client, Attributes, Connector, ConnectorContext, PointsQuery, QuerySeries,
    Settings,
};
use crate::catalog::Record;
use crate::error::{ConnectorError, ConnectorResult};
use crate::series::{Point, Series};

const METRIC_NAMES_PATH: &str = "/api/v1/metricnames";
const METRIC_TAGS_PATH: &str = "/api/v1/datapoints/query/tags";
const DATAPOINTS_PATH: &str = "/api/v1/datapoints/query";

const DEFAULT_SOURCE_TAGS: [&str; 3] = ["host", "server", "device"];
const DEFAULT_AGGREGATORS: [&str; 3] = ["avg", "max", "min"];

// ----------------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct Sampling {
    value: i64,
    unit: &'static str,
}

#[derive(Debug, Serialize)]
struct QueryAggregator<'a> {
    name: &'a str,
    sampling: Sampling,
}

#[derive(Debug, Serialize)]
struct QueryMetric<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    tags: BTreeMap<&'a str, Vec<&'a str>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    aggregators: Vec<QueryAggregator<'a>>,
}

#[derive(Debug, Serialize)]
struct DatapointsQuery<'a> {
    start_absolute: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_absolute: Option<i64>,
    metrics: Vec<QueryMetric<'a>>,
}

#[derive(Debug, Deserialize)]
struct MetricNamesResponse {
    #[serde(default)]
    results: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseResult {
    #[serde(default)]
    name: String,
    #[serde(default)]
    tags: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    values: Vec<(f64, Option<f64>)>,
}

#[derive(Debug, Default, Deserialize)]
struct ResponseQuery {
    #[serde(default)]
    results: Vec<ResponseResult>,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    queries: Vec<ResponseQuery>,
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

pub struct KairosDbConnector {
    name: String,
    url: String,
    source_tags: Vec<String>,
    aggregators: Vec<String>,
    client: reqwest::Client,
}

impl KairosDbConnector {
    pub(crate) fn new(context: &ConnectorContext, settings: &Settings<'_>) -> ConnectorResult<Self> {
        Ok(Self {
            name: context.provider.clone(),
            url: settings.url()?,
            source_tags: settings.string_list("source_tags", &DEFAULT_SOURCE_TAGS)?,
            aggregators: settings.string_list("aggregators", &DEFAULT_AGGREGATORS)?,
            client: http_client(context, settings)?,
        })
    }

    /// Catalog records of one tags query result.
    fn records(&self, result: &ResponseResult) -> Vec<Record> {
        let mut records = Vec::new();

        for key in &self.source_tags {
            let Some(values) = result.tags.get(key) else {
                continue;
            };

            for value in values {
                for aggregator in &self.aggregators {
                    let mut attributes = Attributes::new();
                    attributes.insert("name".into(), json!(result.name));
                    attributes.insert("aggregator".into(), json!(aggregator));
                    attributes.insert("tag".into(), json!([key, value]));

                    records.push(
                        Record::new(
                            self.name.clone(),
                            value.clone(),
                            format!("{}/{}", result.name, aggregator),
                        )
                        .with_attributes(attributes),
                    );
                }
            }
        }

        records
    }
}

struct SeriesAttributes<'a> {
    name: &'a str,
    aggregator: &'a str,
    tag: (&'a str, &'a str),
}

fn series_attributes(series: &QuerySeries) -> ConnectorResult<SeriesAttributes<'_>> {
    let string = |key: &str| {
        series
            .attributes
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| ConnectorError::InvalidAttribute {
                attribute: key.to_string(),
            })
    };

    let tag = match series.attributes.get("tag").and_then(Value::as_array) {
        Some(pair) if pair.len() == 2 => match (pair[0].as_str(), pair[1].as_str()) {
            (Some(key), Some(value)) => (key, value),
            _ => return Err(ConnectorError::InvalidAttribute { attribute: "tag".into() }),
        },
        _ => return Err(ConnectorError::InvalidAttribute { attribute: "tag".into() }),
    };

    Ok(SeriesAttributes {
        name: string("name")?,
        aggregator: string("aggregator")?,
        tag,
    })
}

fn datapoints_query(query: &PointsQuery) -> ConnectorResult<DatapointsQuery<'_>> {
    if query.series.is_empty() {
        return Err(ConnectorError::EmptyQuery);
    }

    let sampling = query.step().num_milliseconds().max(1);
    let mut metrics = Vec::with_capacity(query.series.len());

    for series in &query.series {
        let attributes = series_attributes(series)?;
        metrics.push(QueryMetric {
            name: attributes.name,
            tags: BTreeMap::from([(attributes.tag.0, vec![attributes.tag.1])]),
            aggregators: vec![QueryAggregator {
                name: attributes.aggregator,
                sampling: Sampling {
                    value: sampling,
                    unit: "milliseconds",
                },
            }],
        });
    }

    Ok(DatapointsQuery {
        start_absolute: query.start.timestamp_millis(),
        end_absolute: Some(query.end.timestamp_millis()),
        metrics,
    })
}

fn align(query: &PointsQuery, response: Response) -> Vec<Series> {
    let mut queries = response.queries.into_iter();

    query
        .series
        .iter()
        .map(|series| {
            let points = queries
                .next()
                .and_then(|q| q.results.into_iter().next())
                .unwrap_or_default()
                .values
                .into_iter()
                .filter_map(|(ms, value)| {
                    let time = chrono::DateTime::from_timestamp_millis(ms as i64)?;
                    Some(Point::new(time, value.unwrap_or(f64::NAN)))
                })
                .collect();
            Series::new(series.name.clone(), points)
        })
        .collect()
}

#[async_trait]
impl Connector for KairosDbConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "kairosdb"
    }

    async fn refresh(&self, output: &mpsc::Sender<Record>) -> ConnectorResult<()> {
        let names: MetricNamesResponse = fetch_json(
            &self.name,
            self.client.get(format!("{}{}", self.url, METRIC_NAMES_PATH)),
        )
        .await?;

        if names.results.is_empty() {
            return Ok(());
        }

        let request = DatapointsQuery {
            start_absolute: 0,
            end_absolute: None,
            metrics: names
                .results
                .iter()
                .map(|name| QueryMetric {
                    name: name.as_str(),
                    tags: BTreeMap::new(),
                    aggregators: Vec::new(),
                })
                .collect(),
        };

        let response: Response = fetch_json(
            &self.name,
            self.client
                .post(format!("{}{}", self.url, METRIC_TAGS_PATH))
                .json(&request),
        )
        .await?;

        debug!(target: "facette::connector::kairosdb", provider = %self.name, metrics = names.results.len(), "Fetched metric tags");

        for result in response.queries.iter().flat_map(|q| q.results.iter()) {
            for record in self.records(result) {
                emit(output, record).await?;
            }
        }
        Ok(())
    }

    async fn points(&self, query: &PointsQuery) -> ConnectorResult<Vec<Series>> {
        let request = datapoints_query(query)?;
        let response: Response = fetch_json(
            &self.name,
            self.client
                .post(format!("{}{}", self.url, DATAPOINTS_PATH))
                .json(&request),
        )
        .await?;

        Ok(align(query, response))
    }
}
