// ============================================================================
// NAME PATTERNS
// ============================================================================
// Name matching used by catalog searches, library filters and groups.
//
// A pattern is either a literal string, a `glob:`-prefixed shell pattern
// (case-insensitive, `/` has no special meaning) or a `regexp:`-prefixed
// regular expression that must match the whole name.
// ============================================================================

use std::fmt;

use glob::MatchOptions;
use regex::Regex;

use crate::error::PatternError;

pub const GLOB_PREFIX: &str = "glob:";
pub const REGEXP_PREFIX: &str = "regexp:";

const GLOB_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// A compiled match pattern.
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Glob(glob::Pattern),
    Regexp { source: String, regex: Regex },
}

impl Pattern {
    /// Compile a pattern from its stored form.
    pub fn parse(input: &str) -> Result<Self, PatternError> {
        if let Some(glob) = input.strip_prefix(GLOB_PREFIX) {
            let compiled = glob::Pattern::new(glob).map_err(|e| PatternError::InvalidGlob {
                pattern: input.to_string(),
                message: e.to_string(),
            })?;
            return Ok(Pattern::Glob(compiled));
        }

        if let Some(expr) = input.strip_prefix(REGEXP_PREFIX) {
            let regex = Regex::new(&format!("^(?:{})$", expr)).map_err(|e| {
                PatternError::InvalidRegexp {
                    pattern: input.to_string(),
                    message: e.to_string(),
                }
            })?;
            return Ok(Pattern::Regexp {
                source: expr.to_string(),
                regex,
            });
        }

        Ok(Pattern::Literal(input.to_string()))
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Literal(value) => value == name,
            Pattern::Glob(glob) => glob.matches_with(name, GLOB_OPTIONS),
            Pattern::Regexp { regex, .. } => regex.is_match(name),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Pattern::Literal(_))
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Literal(value) => f.write_str(value),
            Pattern::Glob(glob) => write!(f, "{}{}", GLOB_PREFIX, glob.as_str()),
            Pattern::Regexp { source, .. } => write!(f, "{}{}", REGEXP_PREFIX, source),
        }
    }
}

/// One-shot match; an invalid pattern matches nothing.
pub fn matches(pattern: &str, name: &str) -> bool {
    Pattern::parse(pattern).map(|p| p.matches(name)).unwrap_or(false)
}

/// Check that a stored pattern compiles.
pub fn validate(pattern: &str) -> Result<(), PatternError> {
    Pattern::parse(pattern).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("host1", "host1", true)]
    #[case("host1", "HOST1", false)]
    #[case("glob:host*", "host1.example.net", true)]
    #[case("glob:HOST?", "host1", true)]
    #[case("glob:database*/test", "database1/test", true)]
    #[case("glob:*", "a/b/c", true)]
    #[case("glob:source[12]", "source3", false)]
    #[case("regexp:host\\d", "host1", true)]
    #[case("regexp:host", "host1", false)]
    #[case("regexp:^load\\.", "load.shortterm", false)]
    #[case("regexp:^load\\..+$", "load.shortterm", true)]
    fn test_match(#[case] pattern: &str, #[case] name: &str, #[case] expected: bool) {
        assert_eq!(matches(pattern, name), expected);
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(validate("regexp:(unclosed").is_err());
        assert!(validate("glob:[a-").is_err());
        assert!(!matches("regexp:(unclosed", "(unclosed"));
        assert!(validate("plain[").is_ok());
    }

    #[test]
    fn test_display_keeps_prefix() {
        for input in ["name", "glob:a*", "regexp:a.+"] {
            assert_eq!(Pattern::parse(input).unwrap().to_string(), input);
        }
    }

    proptest! {
        #[test]
        fn prop_escaped_regexp_matches_itself(name in "\\PC{1,24}") {
            let pattern = format!("{}^{}$", REGEXP_PREFIX, regex::escape(&name));
            prop_assert!(matches(&pattern, &name));
        }

        #[test]
        fn prop_glob_matches_itself(name in "[a-zA-Z0-9/._ -]{1,24}") {
            let pattern = format!("{}{}", GLOB_PREFIX, name);
            prop_assert!(matches(&pattern, &name));
        }

        #[test]
        fn prop_literal_is_equality(a in "[a-z]{1,6}", b in "[a-z]{1,6}") {
            prop_assert_eq!(matches(&a, &b), a == b);
        }
    }
}
