// SQL text assembly for rendered query subtrees.

use std::fmt;

/// Accumulates SQL tokens and joins them with single spaces.
///
/// Per-chunk SQL strings are produced by rendering a BoolTerm DAG into one of
/// these, so whitespace in the output is normalized regardless of the
/// spelling of the input query.
#[derive(Debug, Clone, Default)]
pub struct QueryTemplate {
    tokens: Vec<String>,
}

impl QueryTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, token: impl Into<String>) {
        let token = token.into();
        if !token.is_empty() {
            self.tokens.push(token);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn sql(&self) -> String {
        self.tokens.join(" ")
    }
}

impl fmt::Display for QueryTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}
