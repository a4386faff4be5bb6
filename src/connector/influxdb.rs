// ============================================================================
// INFLUXDB CONNECTOR
// ============================================================================
// InfluxDB (1.x query API) driver.
//
// Measurements are split into sources and metrics either with a named-group
// pattern applied to the measurement name, or with a `mapping` combining the
// measurement name and tag values. Every numeric field becomes a metric.
// ============================================================================

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    emit, fetch_json, http_client, Attributes, Connector, ConnectorContext, PointsQuery, QuerySeries,
    SeriesPattern, Settings,
};
use crate::catalog::Record;
use crate::error::{ConnectorError, ConnectorResult};
use crate::series::{Point, Series};

const SAMPLE_ROWS_QUERY: &str = "select * from /.*/ limit 1";
const SHOW_SERIES_QUERY: &str = "show series";

/// Key of the `terms` entry holding the measurement name.
const MEASUREMENT_TERM: &str = "";

// ----------------------------------------------------------------------------
// Wire types
// ----------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ResultSeries {
    #[serde(default)]
    name: String,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct StatementResult {
    #[serde(default)]
    series: Vec<ResultSeries>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    error: Option<String>,
}

// ----------------------------------------------------------------------------
// Mapping
// ----------------------------------------------------------------------------

enum Mapping {
    Pattern(SeriesPattern),
    Columns { source: Vec<String>, metric: Vec<String> },
}

/// Resolve a mapping item against a parsed `show series` key. `name` is the
/// measurement, `column:<tag>` a tag value. Returns `(term, value)`.
fn map_key(columns: &BTreeMap<String, String>, item: &str) -> Option<(String, String)> {
    if item == "name" {
        return columns
            .get("name")
            .map(|value| (MEASUREMENT_TERM.to_string(), value.clone()));
    }

    let tag = item.strip_prefix("column:")?;
    columns
        .get(tag)
        .map(|value| (tag.to_string(), value.clone()))
}

/// Split a `show series` key (`measurement,tag1=value1,tag2=value2`).
fn parse_series_key(key: &str) -> BTreeMap<String, String> {
    let mut parts = key.split(',');
    let mut columns = BTreeMap::new();

    if let Some(name) = parts.next() {
        columns.insert("name".to_string(), name.to_string());
    }
    for part in parts {
        if let Some((tag, value)) = part.split_once('=') {
            columns.insert(tag.to_string(), value.to_string());
        }
    }

    columns
}

/// Numeric field names of each measurement, from one sample row.
fn numeric_columns(result: StatementResult) -> BTreeMap<String, Vec<String>> {
    let mut columns = BTreeMap::new();

    for series in result.series {
        let Some(row) = series.values.first() else {
            continue;
        };

        let numeric: Vec<String> = series
            .columns
            .iter()
            .zip(row)
            .filter(|(name, value)| name.as_str() != "time" && value.is_number())
            .map(|(name, _)| name.clone())
            .collect();

        columns.insert(series.name, numeric);
    }

    columns
}

pub fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

pub fn quote_string(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn record_attributes(column: &str, terms: &BTreeMap<String, String>) -> Attributes {
    let mut attributes = Attributes::new();
    attributes.insert("column".into(), json!(column));
    attributes.insert("terms".into(), json!(terms));
    attributes
}

/// One select statement for a catalog series.
fn statement(series: &QuerySeries, start: i64, end: i64) -> ConnectorResult<String> {
    let column = series
        .attributes
        .get("column")
        .and_then(Value::as_str)
        .ok_or_else(|| ConnectorError::InvalidAttribute { attribute: "column".into() })?;
    let terms = series
        .attributes
        .get("terms")
        .and_then(Value::as_object)
        .ok_or_else(|| ConnectorError::InvalidAttribute { attribute: "terms".into() })?;

    let mut measurement = None;
    let mut conditions = Vec::new();
    for (term, value) in terms {
        let value = value
            .as_str()
            .ok_or_else(|| ConnectorError::InvalidAttribute { attribute: "terms".into() })?;
        if term == MEASUREMENT_TERM {
            measurement = Some(value);
        } else {
            conditions.push(format!("{} = {}", quote_ident(term), quote_string(value)));
        }
    }
    let measurement =
        measurement.ok_or_else(|| ConnectorError::InvalidAttribute { attribute: "terms".into() })?;

    conditions.push(format!("time > {}s and time < {}s", start, end));

    Ok(format!(
        "select {}, time from {} where {} order by asc",
        quote_ident(column),
        quote_ident(measurement),
        conditions.join(" and ")
    ))
}

fn result_points(result: StatementResult) -> Vec<Point> {
    let mut points = Vec::new();

    for series in result.series {
        let time_index = series.columns.iter().position(|c| c == "time").unwrap_or(0);
        let value_index = if time_index == 0 { 1 } else { 0 };

        for row in &series.values {
            let Some(time) = row.get(time_index).and_then(Value::as_f64) else {
                continue;
            };
            let value = row.get(value_index).and_then(Value::as_f64).unwrap_or(f64::NAN);
            if let Some(point) = Point::from_unix(time as i64, value) {
                points.push(point);
            }
        }
    }

    points
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

pub struct InfluxDbConnector {
    name: String,
    url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    mapping: Mapping,
    glue: String,
    client: reqwest::Client,
}

impl InfluxDbConnector {
    pub(crate) fn new(context: &ConnectorContext, settings: &Settings<'_>) -> ConnectorResult<Self> {
        let url = settings.url()?;
        let database = settings.string("database")?;

        let pattern = settings.optional_string("pattern")?.filter(|p| !p.is_empty());
        let mapping = settings.map("mapping")?;

        let (mapping, glue) = match (pattern, mapping) {
            (Some(_), Some(_)) => {
                return Err(ConnectorError::invalid_setting(
                    "mapping",
                    "either \"pattern\" or \"mapping\" is allowed, not both",
                ))
            }
            (None, None) => return Err(ConnectorError::missing_setting("pattern")),
            (Some(pattern), None) => (Mapping::Pattern(SeriesPattern::new(&pattern)?), ".".to_string()),
            (None, Some(map)) => {
                let map = Settings::new(map);
                let glue = map
                    .optional_string("glue")?
                    .filter(|g| !g.is_empty())
                    .unwrap_or_else(|| ".".to_string());
                let mapping = Mapping::Columns {
                    source: map.string_list("source", &[])?,
                    metric: map.string_list("metric", &[])?,
                };
                (mapping, glue)
            }
        };

        Ok(Self {
            name: context.provider.clone(),
            url,
            database,
            username: settings.optional_string("username")?.filter(|u| !u.is_empty()),
            password: settings.optional_string("password")?,
            mapping,
            glue,
            client: http_client(context, settings)?,
        })
    }

    async fn query(&self, statement: &str, epoch: bool) -> ConnectorResult<Vec<StatementResult>> {
        let mut params = vec![("db", self.database.as_str()), ("q", statement)];
        if epoch {
            params.push(("epoch", "s"));
        }

        let mut request = self
            .client
            .get(format!("{}/query", self.url))
            .query(&params);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_ref());
        }

        let response: QueryResponse = fetch_json(&self.name, request).await?;
        if let Some(error) = response.error {
            return Err(ConnectorError::invalid_response(&self.name, error));
        }
        Ok(response.results)
    }

    /// Run a statement expected to produce exactly one result.
    async fn query_single(&self, statement: &str) -> ConnectorResult<StatementResult> {
        let mut results = self.query(statement, false).await?;
        if results.len() != 1 {
            return Err(ConnectorError::invalid_response(
                &self.name,
                format!("expected 1 result but got {}", results.len()),
            ));
        }

        let result = results.remove(0);
        if let Some(error) = result.error {
            return Err(ConnectorError::invalid_response(&self.name, error));
        }
        Ok(result)
    }

    fn pattern_records(
        &self,
        pattern: &SeriesPattern,
        columns: &BTreeMap<String, Vec<String>>,
    ) -> Vec<Record> {
        let mut records = Vec::new();

        for (measurement, fields) in columns {
            let Some((source, metric)) = pattern.split(measurement) else {
                trace!(target: "facette::connector::influxdb", provider = %self.name, measurement = %measurement, "Measurement does not match pattern");
                continue;
            };

            let terms = BTreeMap::from([(MEASUREMENT_TERM.to_string(), measurement.clone())]);
            for field in fields {
                records.push(
                    Record::new(
                        self.name.clone(),
                        source.clone(),
                        format!("{}{}{}", metric, self.glue, field),
                    )
                    .with_attributes(record_attributes(field, &terms)),
                );
            }
        }

        records
    }

    fn mapping_records(
        &self,
        source_items: &[String],
        metric_items: &[String],
        columns: &BTreeMap<String, Vec<String>>,
        series: StatementResult,
    ) -> Vec<Record> {
        let mut records = Vec::new();

        let keys = series
            .series
            .into_iter()
            .flat_map(|s| s.values)
            .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string));

        for key in keys {
            let series_columns = parse_series_key(&key);
            let mut terms = BTreeMap::new();

            let mut join = |items: &[String]| {
                let mut parts = Vec::new();
                for item in items {
                    if let Some((term, value)) = map_key(&series_columns, item) {
                        parts.push(value.clone());
                        terms.insert(term, value);
                    }
                }
                parts.join(&self.glue)
            };

            let source = join(source_items);
            let metric = join(metric_items);

            let measurement = series_columns.get("name").cloned().unwrap_or_default();
            terms.insert(MEASUREMENT_TERM.to_string(), measurement.clone());

            for field in columns.get(&measurement).into_iter().flatten() {
                records.push(
                    Record::new(
                        self.name.clone(),
                        source.clone(),
                        format!("{}{}{}", metric, self.glue, field),
                    )
                    .with_attributes(record_attributes(field, &terms)),
                );
            }
        }

        records
    }
}

#[async_trait]
impl Connector for InfluxDbConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "influxdb"
    }

    async fn refresh(&self, output: &mpsc::Sender<Record>) -> ConnectorResult<()> {
        let columns = numeric_columns(self.query_single(SAMPLE_ROWS_QUERY).await?);
        debug!(target: "facette::connector::influxdb", provider = %self.name, measurements = columns.len(), "Fetched sample rows");

        let records = match &self.mapping {
            Mapping::Pattern(pattern) => self.pattern_records(pattern, &columns),
            Mapping::Columns { source, metric } => {
                let series = self.query_single(SHOW_SERIES_QUERY).await?;
                self.mapping_records(source, metric, &columns, series)
            }
        };

        for record in records {
            emit(output, record).await?;
        }
        Ok(())
    }

    async fn points(&self, query: &PointsQuery) -> ConnectorResult<Vec<Series>> {
        if query.series.is_empty() {
            return Err(ConnectorError::EmptyQuery);
        }

        let (start, end) = (query.start.timestamp(), query.end.timestamp());
        let statements = query
            .series
            .iter()
            .map(|s| statement(s, start, end))
            .collect::<ConnectorResult<Vec<_>>>()?;

        let mut results = self.query(&statements.join("; "), true).await?.into_iter();

        Ok(query
            .series
            .iter()
            .map(|series| {
                let points = match results.next() {
                    Some(StatementResult { error: Some(error), .. }) => {
                        warn!(target: "facette::connector::influxdb", provider = %self.name, series = %series.name, error = %error, "Statement failed");
                        Vec::new()
                    }
                    Some(result) => result_points(result),
                    None => Vec::new(),
                };
                Series::new(series.name.clone(), points)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn connector(settings: Value) -> ConnectorResult<InfluxDbConnector> {
        let settings: Attributes = serde_json::from_value(settings).unwrap();
        InfluxDbConnector::new(&ConnectorContext::new("influx", "test"), &Settings::new(&settings))
    }

    fn sample_rows() -> BTreeMap<String, Vec<String>> {
        let result: StatementResult = serde_json::from_value(json!({
            "series": [
                {"name": "cpu", "columns": ["time", "host", "idle", "user"], "values": [["2016-01-01T00:00:00Z", "web1", 90.5, 4]]},
                {"name": "empty", "columns": ["time", "value"], "values": []},
            ]
        }))
        .unwrap();
        numeric_columns(result)
    }

    #[test]
    fn test_settings_validation() {
        assert!(matches!(
            connector(json!({"url": "http://influx:8086", "database": "db"})),
            Err(ConnectorError::MissingSetting { .. })
        ));
        assert!(matches!(
            connector(json!({"url": "http://influx:8086", "database": "db", "pattern": "(?P<source>.+)\\.(?P<metric>.+)", "mapping": {}})),
            Err(ConnectorError::InvalidSetting { .. })
        ));
        assert!(matches!(
            connector(json!({"url": "http://influx:8086", "pattern": "(?P<source>.+)\\.(?P<metric>.+)"})),
            Err(ConnectorError::MissingSetting { ref setting }) if setting == "database"
        ));
    }

    #[test]
    fn test_numeric_columns() {
        let columns = sample_rows();
        assert_eq!(columns["cpu"], vec!["idle", "user"]);
        assert!(!columns.contains_key("empty"));
    }

    #[test]
    fn test_pattern_records() {
        let connector = connector(json!({
            "url": "http://influx:8086",
            "database": "db",
            "pattern": "^(?P<source>[^.]+)\\.(?P<metric>.+)$",
        }))
        .unwrap();

        let columns = BTreeMap::from([("web1.cpu".to_string(), vec!["idle".to_string()])]);
        let Mapping::Pattern(pattern) = &connector.mapping else {
            panic!("expected pattern mapping");
        };
        let records = connector.pattern_records(pattern, &columns);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, "web1");
        assert_eq!(records[0].metric, "cpu.idle");
        assert_eq!(records[0].attributes["terms"], json!({"": "web1.cpu"}));
    }

    #[test]
    fn test_mapping_records() {
        let connector = connector(json!({
            "url": "http://influx:8086",
            "database": "db",
            "mapping": {"source": ["column:host"], "metric": ["name", "column:cpu"], "glue": "/"},
        }))
        .unwrap();

        let series: StatementResult = serde_json::from_value(json!({
            "series": [{"columns": ["key"], "values": [["cpu,cpu=cpu0,host=web1"]]}]
        }))
        .unwrap();

        let Mapping::Columns { source, metric } = &connector.mapping else {
            panic!("expected column mapping");
        };
        let records = connector.mapping_records(source, metric, &sample_rows(), series);

        let names: Vec<(String, String)> = records
            .iter()
            .map(|r| (r.source.clone(), r.metric.clone()))
            .collect();
        assert_eq!(
            names,
            vec![
                ("web1".to_string(), "cpu/cpu0/idle".to_string()),
                ("web1".to_string(), "cpu/cpu0/user".to_string()),
            ]
        );
        assert_eq!(
            records[0].attributes["terms"],
            json!({"": "cpu", "cpu": "cpu0", "host": "web1"})
        );
        assert_eq!(records[1].attributes["column"], json!("user"));
    }

    #[test]
    fn test_statement() {
        let mut attributes = Attributes::new();
        attributes.insert("column".into(), json!("idle"));
        attributes.insert("terms".into(), json!({"": "cpu", "host": "web'1"}));
        let series = QuerySeries {
            attributes,
            ..Default::default()
        };

        assert_eq!(
            statement(&series, 100, 200).unwrap(),
            "select \"idle\", time from \"cpu\" where \"host\" = 'web\\'1' and time > 100s and time < 200s order by asc"
        );
        assert!(statement(&QuerySeries::default(), 0, 1).is_err());
    }

    #[test]
    fn test_result_points() {
        let result: StatementResult = serde_json::from_value(json!({
            "series": [{"name": "cpu", "columns": ["time", "idle"], "values": [[100, 1.5], [110, null]]}]
        }))
        .unwrap();

        let points = result_points(result);
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].time.timestamp(), 100);
        assert_eq!(points[0].value, 1.5);
        assert!(points[1].value.is_nan());
    }

    #[test]
    fn test_parse_series_key() {
        let columns = parse_series_key("cpu,host=web1,region=eu");
        assert_eq!(columns["name"], "cpu");
        assert_eq!(columns["host"], "web1");
        assert_eq!(map_key(&columns, "name"), Some(("".to_string(), "cpu".to_string())));
        assert_eq!(map_key(&columns, "column:region"), Some(("region".to_string(), "eu".to_string())));
        assert_eq!(map_key(&columns, "column:missing"), None);
        assert_eq!(map_key(&columns, "host"), None);
    }
}
