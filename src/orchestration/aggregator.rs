//! Read-side summaries of the shared context.
//!
//! Aggregation only reads current findings, whose queries are ordered by
//! key, and builds everything into ordered maps and sorted lists. Running
//! it twice over the same snapshot therefore yields identical output.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use url::Url;

use crate::core::{Category, Finding, SharedContext, Severity, Target};
use crate::util::join_preview;
use crate::Result;

/// Preview entries kept per category by default.
pub const DEFAULT_PREVIEW_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub count: usize,
    /// First keys in sorted order.
    pub preview: Vec<String>,
    pub truncated: bool,
}

/// Cross-category observations, each a sorted list of hosts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlations {
    /// Hosts serving plain HTTP with no HTTPS counterpart.
    pub web_without_tls: Vec<String>,
    /// Discovered hosts with no resolved address.
    pub unresolved_hosts: Vec<String>,
    /// Hosts with open ports but no web service.
    pub exposed_without_web: Vec<String>,
    /// Hosts with at least one high or critical vulnerability.
    pub vulnerable_hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub categories: BTreeMap<Category, CategorySummary>,
    pub severity_counts: BTreeMap<Severity, usize>,
    pub correlations: Correlations,
    pub total_findings: usize,
}

impl AggregateReport {
    /// Canonical JSON rendering.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn count(&self, category: Category) -> usize {
        self.categories.get(&category).map_or(0, |c| c.count)
    }

    /// High plus critical vulnerabilities.
    pub fn severe_count(&self) -> usize {
        self.severity_counts
            .iter()
            .filter(|(severity, _)| severity.is_severe())
            .map(|(_, count)| count)
            .sum()
    }

    /// One-paragraph plain-text summary.
    pub fn summary(&self) -> String {
        let counts = Category::ALL
            .iter()
            .filter(|c| self.count(**c) > 0)
            .map(|c| format!("{} {}", self.count(*c), c));
        let mut out = format!("{} findings", self.total_findings);
        let counts = join_preview(counts, Category::ALL.len());
        if !counts.is_empty() {
            out.push_str(&format!(" ({})", counts));
        }
        let severe = self.severe_count();
        if severe > 0 {
            out.push_str(&format!(
                "; {} high/critical on {}",
                severe,
                join_preview(&self.correlations.vulnerable_hosts, 5)
            ));
        }
        if !self.correlations.web_without_tls.is_empty() {
            out.push_str(&format!(
                "; plain HTTP only: {}",
                join_preview(&self.correlations.web_without_tls, 5)
            ));
        }
        out
    }
}

/// Builds [`AggregateReport`]s.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    preview_limit: usize,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_LIMIT)
    }
}

impl ResultAggregator {
    pub fn new(preview_limit: usize) -> Self {
        Self { preview_limit }
    }

    pub fn aggregate(&self, context: &SharedContext) -> AggregateReport {
        let mut categories = BTreeMap::new();
        let mut total_findings = 0;
        for category in Category::ALL {
            let keys = context.keys(category);
            total_findings += keys.len();
            categories.insert(
                category,
                CategorySummary {
                    count: keys.len(),
                    truncated: keys.len() > self.preview_limit,
                    preview: keys.into_iter().take(self.preview_limit).collect(),
                },
            );
        }

        let vulnerabilities = context.query(Category::Vulnerability);
        let mut severity_counts = BTreeMap::new();
        for finding in &vulnerabilities {
            *severity_counts.entry(Severity::of(&finding.value)).or_insert(0) += 1;
        }

        AggregateReport {
            categories,
            severity_counts,
            correlations: correlate(context, &vulnerabilities),
            total_findings,
        }
    }
}

/// Host a finding is about: its `host` field, else the host part of its key.
fn host_of(finding: &Finding) -> Option<String> {
    if let Some(host) = finding.str_field("host") {
        return Some(host.to_ascii_lowercase());
    }
    if let Some(url) = finding.str_field("url") {
        return Target::parse(url).ok().map(|t| t.host().to_string());
    }
    Target::parse(&finding.key).ok().map(|t| t.host().to_string())
}

/// Scheme of a web finding: its `scheme` field, else the scheme of its key.
fn scheme_of(finding: &Finding) -> Option<String> {
    finding
        .str_field("scheme")
        .map(str::to_ascii_lowercase)
        .or_else(|| Url::parse(&finding.key).ok().map(|u| u.scheme().to_string()))
}

fn correlate(context: &SharedContext, vulnerabilities: &[Finding]) -> Correlations {
    let web = context.query(Category::Web);
    let mut plain = BTreeSet::new();
    let mut tls = BTreeSet::new();
    let mut web_hosts = BTreeSet::new();
    for finding in &web {
        let Some(host) = host_of(finding) else {
            continue;
        };
        match scheme_of(finding).as_deref() {
            Some("https") => {
                tls.insert(host.clone());
            }
            Some("http") => {
                plain.insert(host.clone());
            }
            _ => {}
        }
        web_hosts.insert(host);
    }

    let resolved: BTreeSet<String> = context
        .keys(Category::Address)
        .into_iter()
        .map(|k| k.to_ascii_lowercase())
        .collect();
    let unresolved_hosts = context
        .keys(Category::Host)
        .into_iter()
        .filter(|h| !resolved.contains(&h.to_ascii_lowercase()))
        .collect();

    let exposed: BTreeSet<String> = context
        .query(Category::Port)
        .iter()
        .filter_map(host_of)
        .filter(|h| !web_hosts.contains(h))
        .collect();

    let vulnerable: BTreeSet<String> = vulnerabilities
        .iter()
        .filter(|f| Severity::of(&f.value).is_severe())
        .filter_map(host_of)
        .collect();

    Correlations {
        web_without_tls: plain.difference(&tls).cloned().collect(),
        unresolved_hosts,
        exposed_without_web: exposed.into_iter().collect(),
        vulnerable_hosts: vulnerable.into_iter().collect(),
    }
}
