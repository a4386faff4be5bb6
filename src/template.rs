// ============================================================================
// TEMPLATES
// ============================================================================
// `{{ .key }}` placeholder substitution for template graphs and collections.
//
// Substitution is a plain render: no logic, no defaults, an unknown key
// renders as an empty string.
// ============================================================================

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::error::TemplateError;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Attribute map used to render placeholders.
pub type Attributes = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    Key(&'a str),
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn segments(text: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
    let mut result = Vec::new();
    let mut rest = text;
    let mut offset = 0;

    while let Some(start) = rest.find(OPEN) {
        if start > 0 {
            result.push(Segment::Text(&rest[..start]));
        }

        let body = &rest[start + OPEN.len()..];
        let end = body.find(CLOSE).ok_or(TemplateError::Unterminated {
            offset: offset + start,
        })?;

        let action = body[..end].trim();
        let key = action
            .strip_prefix('.')
            .filter(|key| is_identifier(key))
            .ok_or_else(|| TemplateError::InvalidAction {
                action: action.to_string(),
            })?;
        result.push(Segment::Key(key));

        let consumed = start + OPEN.len() + end + CLOSE.len();
        offset += consumed;
        rest = &rest[consumed..];
    }

    if !rest.is_empty() {
        result.push(Segment::Text(rest));
    }

    Ok(result)
}

/// Return the sorted unique placeholder keys found in `text`.
pub fn parse(text: &str) -> Result<Vec<String>, TemplateError> {
    let keys: BTreeSet<&str> = segments(text)?
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Key(key) => Some(key),
            Segment::Text(_) => None,
        })
        .collect();

    Ok(keys.into_iter().map(str::to_string).collect())
}

/// Render `text`, replacing each placeholder with its attribute value.
pub fn render(text: &str, attrs: &Attributes) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());

    for segment in segments(text)? {
        match segment {
            Segment::Text(value) => out.push_str(value),
            Segment::Key(key) => match attrs.get(key) {
                None | Some(Value::Null) => {}
                Some(Value::String(value)) => out.push_str(value),
                Some(other) => out.push_str(&other.to_string()),
            },
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn attrs(value: Value) -> Attributes {
        match value {
            Value::Object(map) => map,
            _ => Attributes::new(),
        }
    }

    #[test]
    fn test_parse_keys() {
        assert_eq!(
            parse("{{ .source }} - {{.metric}} ({{ .source }})").unwrap(),
            vec!["metric".to_string(), "source".to_string()]
        );
        assert!(parse("no placeholder").unwrap().is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse("a {{ .a }").unwrap_err(),
            TemplateError::Unterminated { offset: 2 }
        );
        assert!(matches!(
            parse("{{ b }}").unwrap_err(),
            TemplateError::InvalidAction { .. }
        ));
        assert!(parse("{{ .a.b }}").is_err());
        assert!(parse("{{ . }}").is_err());
    }

    #[test]
    fn test_render() {
        let attributes = attrs(json!({"host": "web1", "port": 8080, "up": true, "none": null}));

        assert_eq!(
            render("{{ .host }}:{{ .port }} {{ .up }}", &attributes).unwrap(),
            "web1:8080 true"
        );
        assert_eq!(render("[{{ .none }}{{ .missing }}]", &attributes).unwrap(), "[]");
    }

    #[test]
    fn test_render_is_idempotent() {
        let attributes = attrs(json!({"a": "x"}));
        let once = render("{{ .a }}-{{ .b }}", &attributes).unwrap();
        let twice = render(&once, &attributes).unwrap();
        assert_eq!(once, twice);
        assert!(parse(&twice).unwrap().is_empty());
    }
}
