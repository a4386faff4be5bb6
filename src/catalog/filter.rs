// ============================================================================
// FILTER CHAIN
// ============================================================================
// Per-provider record filtering.
//
// Rules run in order on every record produced by a connector refresh. A
// `sieve` rule drops records whose target does not match, `discard` drops
// the ones that match and `rewrite` replaces the matched text with `into`
// (capture group references such as `$1` are expanded).
// ============================================================================

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::Record;

/// A filter rule as stored with its provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFilter {
    pub action: String,
    #[serde(default)]
    pub target: String,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub into: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Rewrite,
    Discard,
    Sieve,
}

impl Action {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rewrite" => Some(Action::Rewrite),
            "discard" => Some(Action::Discard),
            "sieve" => Some(Action::Sieve),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Any,
    Origin,
    Source,
    Metric,
}

impl Target {
    /// Parse a target name, an empty one meaning `any`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "any" => Some(Target::Any),
            "origin" => Some(Target::Origin),
            "source" => Some(Target::Source),
            "metric" => Some(Target::Metric),
            _ => None,
        }
    }

    fn covers(&self, field: Target) -> bool {
        *self == Target::Any || *self == field
    }
}

/// A compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    pub action: Action,
    pub target: Target,
    pub pattern: Regex,
    pub into: String,
}

impl Rule {
    pub fn new(action: Action, target: Target, pattern: &str, into: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            action,
            target,
            pattern: Regex::new(pattern)?,
            into: into.to_string(),
        })
    }

    /// Returns `false` when the record must be dropped.
    fn apply_to(&self, value: &mut String) -> bool {
        let matched = self.pattern.is_match(value);
        match self.action {
            Action::Sieve => matched,
            Action::Discard => !matched,
            Action::Rewrite => {
                if matched {
                    *value = self.pattern.replace_all(value, self.into.as_str()).into_owned();
                }
                true
            }
        }
    }
}

/// Run `rules` over a record. `None` means the record was filtered out.
pub fn apply(rules: &[Rule], mut record: Record) -> Option<Record> {
    for rule in rules {
        for field in [Target::Origin, Target::Source, Target::Metric] {
            if !rule.target.covers(field) {
                continue;
            }

            let value = match field {
                Target::Origin => &mut record.origin,
                Target::Source => &mut record.source,
                _ => &mut record.metric,
            };

            if !rule.apply_to(value) {
                trace!(
                    target: "facette::catalog",
                    pattern = %rule.pattern,
                    %record,
                    "Record filtered out"
                );
                return None;
            }
        }
    }

    Some(record)
}

/// Compiled filter chain of one provider.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    rules: Vec<Rule>,
}

impl FilterChain {
    /// Compile the provider filters. Rules with an unknown action or target,
    /// or an invalid pattern, are logged and skipped.
    pub fn new(provider: &str, filters: &[ProviderFilter]) -> Self {
        let mut rules = Vec::with_capacity(filters.len());

        for filter in filters {
            let Some(action) = Action::parse(&filter.action) else {
                warn!(target: "facette::catalog", provider, action = %filter.action, "Unknown filter action, discarding rule");
                continue;
            };
            let Some(target) = Target::parse(&filter.target) else {
                warn!(target: "facette::catalog", provider, target = %filter.target, "Unknown filter target, discarding rule");
                continue;
            };

            match Rule::new(action, target, &filter.pattern, &filter.into) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    warn!(target: "facette::catalog", provider, pattern = %filter.pattern, error = %e, "Invalid filter pattern, discarding rule");
                }
            }
        }

        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, record: Record) -> Option<Record> {
        apply(&self.rules, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn filter(action: &str, target: &str, pattern: &str, into: &str) -> ProviderFilter {
        ProviderFilter {
            action: action.into(),
            target: target.into(),
            pattern: pattern.into(),
            into: into.into(),
        }
    }

    fn input_records() -> Vec<Record> {
        let metrics = [
            "interface-eth0.if_octets.rx",
            "interface-eth0.if_octets.tx",
            "interface-eth0.if_packets.rx",
            "interface-eth0.if_packets.tx",
            "load.load.shortterm",
            "load.load.midterm",
            "load.load.longterm",
        ];
        ["host1.example.net", "host2.example.net"]
            .iter()
            .flat_map(|host| metrics.iter().map(move |m| Record::new("collectd", *host, *m)))
            .collect()
    }

    fn run(chain: &FilterChain, records: Vec<Record>) -> Vec<Record> {
        records.into_iter().filter_map(|r| chain.apply(r)).collect()
    }

    #[test]
    fn test_rewrite() {
        let chain = FilterChain::new(
            "test",
            &[
                filter("rewrite", "source", "\\.", "_"),
                filter("rewrite", "metric", "^interface-(.+)\\.if_(.+)\\.(.+)$", "net.$1.$2.$3"),
            ],
        );

        let result = chain
            .apply(Record::new("collectd", "host1.example.net", "interface-eth0.if_octets.rx"))
            .unwrap();

        assert_eq!(result.origin, "collectd");
        assert_eq!(result.source, "host1_example_net");
        assert_eq!(result.metric, "net.eth0.octets.rx");
        assert_eq!(result.original_source, "host1.example.net");
        assert_eq!(result.original_metric, "interface-eth0.if_octets.rx");
    }

    #[test]
    fn test_sieve_discard_rewrite() {
        let chain = FilterChain::new(
            "test",
            &[
                filter("sieve", "source", "host1\\.example\\.net", ""),
                filter("discard", "metric", "interface", ""),
                filter("rewrite", "metric", "load\\.load", "load"),
            ],
        );

        let input = input_records();
        assert_eq!(input.len(), 14);

        let result: Vec<(String, String)> = run(&chain, input)
            .into_iter()
            .map(|r| (r.source, r.metric))
            .collect();

        assert_eq!(
            result,
            vec![
                ("host1.example.net".to_string(), "load.shortterm".to_string()),
                ("host1.example.net".to_string(), "load.midterm".to_string()),
                ("host1.example.net".to_string(), "load.longterm".to_string()),
            ]
        );
    }

    #[test]
    fn test_any_target() {
        let chain = FilterChain::new("test", &[filter("discard", "", "^host2", "")]);
        let result = run(&chain, input_records());
        assert_eq!(result.len(), 7);
        assert!(result.iter().all(|r| r.source == "host1.example.net"));
    }

    #[test]
    fn test_invalid_rules_are_dropped() {
        let chain = FilterChain::new(
            "test",
            &[
                filter("explode", "metric", "x", ""),
                filter("discard", "host", "x", ""),
                filter("discard", "metric", "(unclosed", ""),
                filter("discard", "metric", "ok", ""),
            ],
        );
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_empty_chain_forwards() {
        let chain = FilterChain::default();
        let record = Record::new("o", "s", "m");
        assert_eq!(chain.apply(record.clone()), Some(record));
    }

    #[test]
    fn test_filter_is_idempotent_once_canonical() {
        let chain = FilterChain::new(
            "test",
            &[
                filter("rewrite", "source", "\\.", "_"),
                filter("rewrite", "metric", "^interface-(.+)\\.if_(.+)\\.(.+)$", "net.$1.$2.$3"),
                filter("discard", "metric", "^load\\.load\\.mid", ""),
            ],
        );

        for record in input_records() {
            let once = chain.apply(record);
            let twice = once.clone().and_then(|r| chain.apply(r));
            assert_eq!(once, twice);
        }
    }
}
