//! Program identity and persisted session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Case-insensitive name of a tracked program.
///
/// Normalised to lowercase on construction so that `Firefox`, `firefox`
/// and `FIREFOX` all address the same session and catalog row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProgramName(String);

impl ProgramName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(name.as_ref().trim().to_lowercase())
    }

    /// Derives a program name from an executable name as reported by the OS.
    ///
    /// Strips a trailing `.exe` so Windows and Unix processes share one key.
    pub fn from_process_name(process_name: &str) -> Self {
        let lower = process_name.trim().to_lowercase();
        match lower.strip_suffix(".exe") {
            Some(stem) => Self(stem.to_string()),
            None => Self(lower),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ProgramName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ProgramName {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ProgramName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<ProgramName> for String {
    fn from(name: ProgramName) -> Self {
        name.0
    }
}

impl AsRef<str> for ProgramName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Persisted Records
// ============================================================================

/// A row of the durable program catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramRecord {
    pub name: ProgramName,
    pub category: Option<String>,
    pub project: Option<String>,
    /// Cumulative seconds across all committed sessions
    pub lifetime_seconds: i64,
}

impl ProgramRecord {
    pub fn new(name: impl Into<ProgramName>) -> Self {
        Self {
            name: name.into(),
            category: None,
            project: None,
            lifetime_seconds: 0,
        }
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }
}

/// An open session marker, one per program while at least one instance runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSession {
    pub program: ProgramName,
    pub started_at: DateTime<Utc>,
}

/// A committed session. Written once, never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub program: ProgramName,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl SessionRecord {
    /// Builds the history row for a session closing at `ended_at`.
    ///
    /// Clock skew can put `ended_at` before `started_at`; the duration is
    /// clamped to zero rather than recorded as negative time.
    pub fn closing(program: ProgramName, started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Self {
        let duration_seconds = ended_at
            .signed_duration_since(started_at)
            .num_seconds()
            .max(0);
        Self {
            program,
            started_at,
            ended_at,
            duration_seconds,
        }
    }
}
