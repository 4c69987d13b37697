//! Database configuration.

use serde::{Deserialize, Serialize};

/// Options for one [`Database`](crate::database::Database).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Display name used in log output and graph renderings.
    pub name: String,
    /// Run [`verify_consistency`](crate::database::Database::verify_consistency)
    /// after every reconciliation batch. Slow; meant for tests and debugging.
    pub verify_on_realize: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            name: "unit".to_string(),
            verify_on_realize: false,
        }
    }
}

impl DatabaseConfig {
    pub fn named(name: &str) -> Self {
        DatabaseConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }
}
