// ============================================================================
// SERIES NAME PATTERNS
// ============================================================================
// Named-group patterns splitting upstream series names into source and metric.
// ============================================================================

use regex::Regex;

use crate::error::{ConnectorError, ConnectorResult};

const SOURCE_GROUP: &str = "source";
const METRIC_GROUP: &str = "metric";

/// A regular expression with exactly the `source` and `metric` named groups.
#[derive(Debug, Clone)]
pub struct SeriesPattern {
    regex: Regex,
}

impl SeriesPattern {
    pub fn new(pattern: &str) -> ConnectorResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| ConnectorError::invalid_setting("pattern", e.to_string()))?;

        let mut has_source = false;
        let mut has_metric = false;
        for name in regex.capture_names().flatten() {
            match name {
                SOURCE_GROUP => has_source = true,
                METRIC_GROUP => has_metric = true,
                other => {
                    return Err(ConnectorError::invalid_setting(
                        "pattern",
                        format!("invalid {:?} pattern keyword", other),
                    ))
                }
            }
        }

        if !has_source {
            return Err(ConnectorError::invalid_setting("pattern", "missing source group"));
        }
        if !has_metric {
            return Err(ConnectorError::invalid_setting("pattern", "missing metric group"));
        }

        Ok(Self { regex })
    }

    /// Split `input` into `(source, metric)`, `None` when it does not match.
    pub fn split(&self, input: &str) -> Option<(String, String)> {
        let captures = self.regex.captures(input)?;
        let source = captures.name(SOURCE_GROUP)?.as_str();
        let metric = captures.name(METRIC_GROUP)?.as_str();
        Some((source.to_string(), metric.to_string()))
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}
