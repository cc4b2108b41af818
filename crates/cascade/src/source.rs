use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Location tag carried by every expression record and surfaced in errors.
///
/// The front end produces these; the engine never sees source text, only
/// labels and positions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceRef {
    pub label: Arc<str>,
    pub line: u32,
    pub column: u32,
}

impl SourceRef {
    pub fn new(label: &str, line: u32, column: u32) -> Self {
        Self {
            label: Arc::from(label),
            line,
            column,
        }
    }

    pub fn unknown() -> Self {
        Self::default()
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = if self.label.is_empty() {
            "<input>"
        } else {
            &self.label
        };
        write!(f, "{label}:{}:{}", self.line, self.column)
    }
}
