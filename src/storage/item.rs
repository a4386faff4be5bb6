// ============================================================================
// LIBRARY ITEMS
// ============================================================================
// Library item types.
// ============================================================================

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::ProviderFilter;
use crate::connector::Attributes;
use crate::series::{Consolidation, Operator};

static NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[a-z0-9](?:[a-z0-9\-_\.]*[a-z0-9])?$").expect("valid item name regex")
});

/// Whether `value` is usable as an item name or alias.
pub fn is_valid_name(value: &str) -> bool {
    NAME_REGEX.is_match(value)
}

// ----------------------------------------------------------------------------
// Item types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Collections,
    Graphs,
    SourceGroups,
    MetricGroups,
    Providers,
}

impl ItemType {
    /// Types exposed under `/library`.
    pub const LIBRARY: [ItemType; 4] = [
        ItemType::Collections,
        ItemType::Graphs,
        ItemType::SourceGroups,
        ItemType::MetricGroups,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Collections => "collections",
            ItemType::Graphs => "graphs",
            ItemType::SourceGroups => "sourcegroups",
            ItemType::MetricGroups => "metricgroups",
            ItemType::Providers => "providers",
        }
    }

    /// Whether items of this type may carry an alias.
    pub fn has_alias(&self) -> bool {
        matches!(self, ItemType::Collections | ItemType::Graphs | ItemType::Providers)
    }

    /// Whether items of this type can be templates or template instances.
    pub fn has_template(&self) -> bool {
        matches!(self, ItemType::Collections | ItemType::Graphs)
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "collections" => Ok(ItemType::Collections),
            "graphs" => Ok(ItemType::Graphs),
            "sourcegroups" => Ok(ItemType::SourceGroups),
            "metricgroups" => Ok(ItemType::MetricGroups),
            "providers" => Ok(ItemType::Providers),
            _ => Err(()),
        }
    }
}

// ----------------------------------------------------------------------------
// Common fields
// ----------------------------------------------------------------------------

/// Fields shared by every persistent item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub modified: DateTime<Utc>,
}

impl Item {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn has_created(&self) -> bool {
        self.created.timestamp() != 0
    }
}

// ----------------------------------------------------------------------------
// Providers
// ----------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(flatten)]
    pub item: Item,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default)]
    pub connector: String,
    #[serde(default)]
    pub settings: Attributes,
    #[serde(default)]
    pub filters: Vec<ProviderFilter>,
    /// Seconds between automatic refreshes, 0 disabling them.
    #[serde(default)]
    pub refresh_interval: u64,
    /// Owner rank of catalog entries shared with other providers; may be negative.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for Provider {
    fn default() -> Self {
        Self {
            item: Item::default(),
            alias: None,
            connector: String::new(),
            settings: Attributes::new(),
            filters: Vec::new(),
            refresh_interval: 0,
            priority: 0,
            enabled: true,
        }
    }
}

// ----------------------------------------------------------------------------
// Groups
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceGroup {
    #[serde(flatten)]
    pub item: Item,
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricGroup {
    #[serde(flatten)]
    pub item: Item,
    #[serde(default)]
    pub patterns: Vec<String>,
}

// ----------------------------------------------------------------------------
// Graphs
// ----------------------------------------------------------------------------

/// One series of a graph group. `source` and `metric` may reference groups
/// with the `group:<id>` syntax.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesEntry {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub metric: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl SeriesEntry {
    pub fn new(
        name: impl Into<String>,
        origin: impl Into<String>,
        source: impl Into<String>,
        metric: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            origin: origin.into(),
            source: source.into(),
            metric: metric.into(),
            options: Map::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.origin.is_empty() && !self.source.is_empty() && !self.metric.is_empty()
    }
}

impl fmt::Display for SeriesEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{name: {:?}, origin: {:?}, source: {:?}, metric: {:?}}}",
            self.name, self.origin, self.source, self.metric
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesGroup {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub consolidate: Consolidation,
    #[serde(default)]
    pub series: Vec<SeriesEntry>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(flatten)]
    pub item: Item,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<SeriesGroup>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub template: bool,
}

impl Graph {
    pub fn is_linked(&self) -> bool {
        self.link.as_deref().map(|l| !l.is_empty()).unwrap_or(false)
    }

    pub fn title(&self) -> Option<&str> {
        self.options.get("title").and_then(Value::as_str)
    }
}

// ----------------------------------------------------------------------------
// Collections
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionEntry {
    pub graph: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(flatten)]
    pub item: Item,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entries: Vec<CollectionEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attributes: Attributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub template: bool,
}

impl Collection {
    pub fn is_linked(&self) -> bool {
        self.link.as_deref().map(|l| !l.is_empty()).unwrap_or(false)
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent.as_deref().filter(|p| !p.is_empty())
    }

    pub fn title(&self) -> Option<&str> {
        self.options
            .get("title")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("graph1", true)]
    #[case("host.example-net_1", true)]
    #[case("A", true)]
    #[case("", false)]
    #[case("-leading", false)]
    #[case("trailing.", false)]
    #[case("with space", false)]
    #[case("invalid!", false)]
    fn test_name_validation(#[case] input: &str, #[case] expected: bool) {
        assert_eq!(is_valid_name(input), expected);
    }

    #[test]
    fn test_item_type_round_trip() {
        for kind in ItemType::LIBRARY {
            assert_eq!(kind.as_str().parse::<ItemType>(), Ok(kind));
        }
        assert!("unknown".parse::<ItemType>().is_err());
        assert!(ItemType::Graphs.has_alias());
        assert!(ItemType::Providers.has_alias());
        assert!(!ItemType::SourceGroups.has_alias());
        assert!(!ItemType::Providers.has_template());
    }

    #[test]
    fn test_provider_defaults() {
        let provider: Provider = serde_json::from_value(json!({
            "name": "graphite",
            "connector": "graphite",
            "settings": {"url": "http://localhost"},
        }))
        .unwrap();

        assert!(provider.enabled);
        assert_eq!(provider.refresh_interval, 0);
        assert!(provider.filters.is_empty());
        assert!(!provider.item.has_created());
    }

    #[test]
    fn test_graph_json_shape() {
        let graph = Graph {
            item: Item::named("graph1"),
            groups: vec![SeriesGroup {
                name: "group0".into(),
                operator: Operator::Sum,
                series: vec![SeriesEntry::new("s", "o", "group:abc", "m")],
                ..Default::default()
            }],
            ..Default::default()
        };

        let value = serde_json::to_value(&graph).unwrap();
        assert_eq!(value["name"], json!("graph1"));
        assert_eq!(value["groups"][0]["operator"], json!("sum"));
        assert_eq!(value["groups"][0]["consolidate"], json!("average"));
        assert_eq!(value["template"], json!(false));
        assert!(value.get("link").is_none());
        assert!(value.get("alias").is_none());

        let back: Graph = serde_json::from_value(value).unwrap();
        assert_eq!(back, graph);
    }

    #[test]
    fn test_collection_parent() {
        let mut collection = Collection::default();
        assert_eq!(collection.parent_id(), None);
        collection.parent = Some(String::new());
        assert_eq!(collection.parent_id(), None);
        collection.parent = Some("abc".into());
        assert_eq!(collection.parent_id(), Some("abc"));
    }
}
