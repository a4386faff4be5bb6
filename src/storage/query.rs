// ============================================================================
// LIST QUERIES
// ============================================================================
// Listing helpers: field filters, sorting and paging over stored items.
// ============================================================================

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::item::{Item, ItemType};
use crate::error::{StorageError, StorageResult};
use crate::pattern::Pattern;

/// Columns an item can be fetched by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    Alias,
    Name,
}

/// Filters, sort order and page of a list request.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    filters: Vec<(String, Pattern)>,
    sort: Vec<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only keep items whose `field` matches `pattern` (literal, `glob:` or `regexp:`).
    pub fn filter(mut self, field: &str, pattern: &str) -> StorageResult<Self> {
        let pattern = Pattern::parse(pattern).map_err(|e| StorageError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        self.filters.push((field.to_string(), pattern));
        Ok(self)
    }

    /// Sort fields, `-field` meaning descending.
    pub fn sort<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sort = fields
            .into_iter()
            .map(Into::into)
            .filter(|f| !f.is_empty())
            .collect();
        self
    }

    pub fn page(mut self, offset: usize, limit: Option<usize>) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }

    fn matches(&self, value: &Value) -> bool {
        self.filters.iter().all(|(field, pattern)| {
            let field = value.get(field.as_str()).map(scalar).unwrap_or_default();
            pattern.matches(&field)
        })
    }

    /// Filter, sort and page `items`. Returns the page and the number of
    /// items matching the filters.
    pub fn apply<T: Serialize>(&self, items: Vec<T>, columns: &[&str]) -> StorageResult<(Vec<T>, usize)> {
        for field in &self.sort {
            let column = field.trim_start_matches('-');
            if !columns.contains(&column) {
                return Err(StorageError::UnknownColumn {
                    column: column.to_string(),
                });
            }
        }

        let mut rows = Vec::with_capacity(items.len());
        for item in items {
            let value = serde_json::to_value(&item)?;
            if self.matches(&value) {
                rows.push((value, item));
            }
        }

        if !self.sort.is_empty() {
            rows.sort_by(|(a, _), (b, _)| self.compare(a, b));
        }

        let total = rows.len();
        let page = rows
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .map(|(_, item)| item)
            .collect();

        Ok((page, total))
    }

    fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for field in &self.sort {
            let (column, descending) = match field.strip_prefix('-') {
                Some(column) => (column, true),
                None => (field.as_str(), false),
            };

            let ordering = compare_values(a.get(column), b.get(column));
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// String form of a JSON scalar used for pattern matching.
fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None | Some(Value::Null), None | Some(Value::Null)) => Ordering::Equal,
        (None | Some(Value::Null), _) => Ordering::Less,
        (_, None | Some(Value::Null)) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .unwrap_or_default()
            .total_cmp(&y.as_f64().unwrap_or_default()),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => scalar(x).to_lowercase().cmp(&scalar(y).to_lowercase()),
    }
}

/// Type-tagged view of an item returned by searches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchItem {
    #[serde(rename = "type")]
    pub kind: ItemType,
    #[serde(flatten)]
    pub item: Item,
}

/// Columns every item type shares.
pub const ITEM_COLUMNS: [&str; 5] = ["id", "name", "description", "created", "modified"];

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Row {
        name: String,
        rank: u32,
        template: bool,
    }

    fn rows() -> Vec<Row> {
        [("beta", 2, false), ("Alpha", 3, true), ("gamma", 1, false), ("alpha2", 3, false)]
            .into_iter()
            .map(|(name, rank, template)| Row {
                name: name.to_string(),
                rank,
                template,
            })
            .collect()
    }

    fn names(rows: &[Row]) -> Vec<&str> {
        rows.iter().map(|r| r.name.as_str()).collect()
    }

    const COLUMNS: [&str; 3] = ["name", "rank", "template"];

    #[test]
    fn test_sort() {
        let (page, total) = ListQuery::new().sort(["name"]).apply(rows(), &COLUMNS).unwrap();
        assert_eq!(total, 4);
        assert_eq!(names(&page), vec!["Alpha", "alpha2", "beta", "gamma"]);

        let (page, _) = ListQuery::new().sort(["-rank", "name"]).apply(rows(), &COLUMNS).unwrap();
        assert_eq!(names(&page), vec!["Alpha", "alpha2", "beta", "gamma"]);

        let (page, _) = ListQuery::new().sort(["rank"]).apply(rows(), &COLUMNS).unwrap();
        assert_eq!(names(&page)[0], "gamma");
    }

    #[test]
    fn test_unknown_sort_column() {
        let result = ListQuery::new().sort(["-size"]).apply(rows(), &COLUMNS);
        assert!(matches!(result, Err(StorageError::UnknownColumn { ref column }) if column == "size"));
    }

    #[test]
    fn test_filters() {
        let query = ListQuery::new().filter("name", "glob:a*").unwrap();
        let (page, total) = query.apply(rows(), &COLUMNS).unwrap();
        assert_eq!(total, 2);
        assert_eq!(names(&page), vec!["Alpha", "alpha2"]);

        let query = ListQuery::new().filter("template", "true").unwrap();
        let (page, _) = query.apply(rows(), &COLUMNS).unwrap();
        assert_eq!(names(&page), vec!["Alpha"]);

        assert!(ListQuery::new().filter("name", "regexp:(").is_err());
    }

    #[test]
    fn test_paging_keeps_total() {
        let query = ListQuery::new().sort(["name"]).page(1, Some(2));
        let (page, total) = query.apply(rows(), &COLUMNS).unwrap();
        assert_eq!(total, 4);
        assert_eq!(names(&page), vec!["alpha2", "beta"]);
    }

    #[test]
    fn test_search_item_shape() {
        let item = SearchItem {
            kind: ItemType::SourceGroups,
            item: Item::named("group1"),
        };
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["type"], json!("sourcegroups"));
        assert_eq!(value["name"], json!("group1"));
    }
}
