use crate::error::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Matcher for endpoint-specific rate limit overrides.
///
/// Serialized as `{"literal": "..."}` or `{"regex": "..."}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PatternRepr", into = "PatternRepr")]
pub enum EndpointPattern {
    /// Matches any target containing this substring.
    Literal(String),
    /// Matches any target the expression finds a match in.
    Regex(Regex),
}

impl EndpointPattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::Literal(text.into())
    }

    pub fn regex(expr: &str) -> Result<Self, ConfigError> {
        Regex::new(expr).map(Self::Regex).map_err(|e| ConfigError::InvalidPattern {
            pattern: expr.to_string(),
            reason: e.to_string(),
        })
    }

    /// Whether `target` (usually a URL) falls under this pattern.
    pub fn matches(&self, target: &str) -> bool {
        match self {
            Self::Literal(text) => target.contains(text.as_str()),
            Self::Regex(re) => re.is_match(target),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Literal(text) => text,
            Self::Regex(re) => re.as_str(),
        }
    }
}

impl PartialEq for EndpointPattern {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Literal(a), Self::Literal(b)) => a == b,
            (Self::Regex(a), Self::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl fmt::Display for EndpointPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(text) => write!(f, "{text}"),
            Self::Regex(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PatternRepr {
    Literal(String),
    Regex(String),
}

impl TryFrom<PatternRepr> for EndpointPattern {
    type Error = ConfigError;

    fn try_from(repr: PatternRepr) -> Result<Self, Self::Error> {
        match repr {
            PatternRepr::Literal(text) => Ok(Self::Literal(text)),
            PatternRepr::Regex(expr) => Self::regex(&expr),
        }
    }
}

impl From<EndpointPattern> for PatternRepr {
    fn from(pattern: EndpointPattern) -> Self {
        match pattern {
            EndpointPattern::Literal(text) => PatternRepr::Literal(text),
            EndpointPattern::Regex(re) => PatternRepr::Regex(re.as_str().to_string()),
        }
    }
}
