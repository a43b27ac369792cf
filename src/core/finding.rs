//! Findings: categorized facts discovered by tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::task::TaskId;
use crate::rlog_debug;

/// Category a finding is filed under.
///
/// The set is closed; every task type declares which categories it
/// may write (see [`crate::core::TaskType::produces`]).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A hostname belonging to the target.
    Host,
    /// A resolved network address for a host.
    Address,
    /// An open port, keyed `host:port`.
    Port,
    /// A reachable web service, keyed by base URL.
    Web,
    /// A TLS certificate observed on a port.
    Certificate,
    /// A detected technology on a web service.
    Technology,
    /// A discovered path or endpoint on a web service.
    Endpoint,
    /// A potential vulnerability.
    Vulnerability,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Category::Host,
        Category::Address,
        Category::Port,
        Category::Web,
        Category::Certificate,
        Category::Technology,
        Category::Endpoint,
        Category::Vulnerability,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Host => "host",
            Category::Address => "address",
            Category::Port => "port",
            Category::Web => "web",
            Category::Certificate => "certificate",
            Category::Technology => "technology",
            Category::Endpoint => "endpoint",
            Category::Vulnerability => "vulnerability",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown category: {}", s))
    }
}

/// Severity of a vulnerability finding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Info,
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Read the `severity` field of a finding value, ignoring case.
    ///
    /// Missing or unrecognised values count as `Info`.
    pub fn of(value: &Value) -> Self {
        let Some(raw) = value.get("severity").and_then(Value::as_str) else {
            return Severity::Info;
        };
        raw.parse().unwrap_or_else(|e| {
            rlog_debug!("{}; treating as info", e);
            Severity::Info
        })
    }

    /// High and critical issues trigger escalation.
    pub fn is_severe(&self) -> bool {
        *self >= Severity::High
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Severity::ALL
            .into_iter()
            .find(|v| v.as_str() == normalized)
            .ok_or_else(|| format!("unknown severity: {}", s))
    }
}

/// A finding as returned by a task runner, before it is attributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindingDraft {
    pub category: Category,
    pub key: String,
    pub value: Value,
}

impl FindingDraft {
    pub fn new(category: Category, key: impl Into<String>, value: Value) -> Self {
        Self {
            category,
            key: key.into(),
            value,
        }
    }
}

/// One discovered fact, attributed to the task that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    /// Identifies the fact within its category (e.g. a hostname).
    pub key: String,
    pub value: Value,
    pub produced_by: TaskId,
    pub discovered_at: DateTime<Utc>,
}

impl Finding {
    pub fn from_draft(draft: FindingDraft, produced_by: TaskId) -> Self {
        Self {
            category: draft.category,
            key: draft.key,
            value: draft.value,
            produced_by,
            discovered_at: Utc::now(),
        }
    }

    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.value.get(field).and_then(Value::as_str)
    }

    pub fn u64_field(&self, field: &str) -> Option<u64> {
        self.value.get(field).and_then(Value::as_u64)
    }
}
