use std::collections::BTreeSet;

use serde_json::json;

use super::{on_empty, EmptyPolicy, ParameterStrategy, StrategyOutcome};
use crate::core::{Category, Finding, SharedContext, Target, TaskType};

const WEB_PORTS: [u64; 8] = [80, 443, 3000, 5000, 8000, 8008, 8080, 8443];
const TLS_PORTS: [u64; 6] = [443, 465, 636, 993, 995, 8443];

/// Content discovery over more URLs than this runs after everything else.
const WIDE_CONTENT_URLS: usize = 20;

fn service_mentions(finding: &Finding, needles: &[&str]) -> bool {
    finding
        .str_field("service")
        .map(|service| {
            let service = service.to_ascii_lowercase();
            needles.iter().any(|n| service.contains(n))
        })
        .unwrap_or(false)
}

fn port_targets<F>(context: &SharedContext, matches: F) -> Vec<String>
where
    F: Fn(&Finding) -> bool,
{
    context
        .query_where(Category::Port, matches)
        .into_iter()
        .map(|f| f.key)
        .collect()
}

pub struct HttpProbeStrategy;

impl ParameterStrategy for HttpProbeStrategy {
    fn task_type(&self) -> TaskType {
        TaskType::HttpProbe
    }

    fn empty_policy(&self) -> EmptyPolicy {
        EmptyPolicy::Skip
    }

    fn build(&self, context: &SharedContext, _target: &Target) -> StrategyOutcome {
        if !context.has(Category::Port) {
            return on_empty(self.empty_policy(), "port", unreachable_degrade);
        }
        let targets = port_targets(context, |f| {
            f.u64_field("port").is_some_and(|p| WEB_PORTS.contains(&p))
                || service_mentions(f, &["http"])
        });
        if targets.is_empty() {
            return StrategyOutcome::skip("open ports found, none look web-capable");
        }
        let reasoning = format!("checking {} web-capable ports", targets.len());
        StrategyOutcome::run(
            json!({ "targets": targets, "follow_redirects": true }),
            reasoning,
        )
    }
}

pub struct TlsInspectionStrategy;

impl ParameterStrategy for TlsInspectionStrategy {
    fn task_type(&self) -> TaskType {
        TaskType::TlsInspection
    }

    fn empty_policy(&self) -> EmptyPolicy {
        EmptyPolicy::Skip
    }

    fn build(&self, context: &SharedContext, _target: &Target) -> StrategyOutcome {
        if !context.has(Category::Port) {
            return on_empty(self.empty_policy(), "port", unreachable_degrade);
        }
        let targets = port_targets(context, |f| {
            f.u64_field("port").is_some_and(|p| TLS_PORTS.contains(&p))
                || service_mentions(f, &["ssl", "tls", "https"])
        });
        if targets.is_empty() {
            return StrategyOutcome::skip("open ports found, none speak TLS");
        }
        let reasoning = format!("inspecting certificates on {} ports", targets.len());
        StrategyOutcome::run(json!({ "targets": targets }), reasoning)
    }
}

pub struct TechFingerprintStrategy;

impl ParameterStrategy for TechFingerprintStrategy {
    fn task_type(&self) -> TaskType {
        TaskType::TechFingerprint
    }

    fn empty_policy(&self) -> EmptyPolicy {
        EmptyPolicy::Skip
    }

    fn build(&self, context: &SharedContext, _target: &Target) -> StrategyOutcome {
        let urls = context.keys(Category::Web);
        if urls.is_empty() {
            return on_empty(self.empty_policy(), "web", unreachable_degrade);
        }
        let reasoning = format!("fingerprinting {} web services", urls.len());
        StrategyOutcome::run(json!({ "urls": urls }), reasoning)
    }
}

pub struct ContentDiscoveryStrategy;

impl ParameterStrategy for ContentDiscoveryStrategy {
    fn task_type(&self) -> TaskType {
        TaskType::ContentDiscovery
    }

    fn empty_policy(&self) -> EmptyPolicy {
        EmptyPolicy::Degrade
    }

    fn build(&self, context: &SharedContext, target: &Target) -> StrategyOutcome {
        let urls = context.keys(Category::Web);
        if urls.is_empty() {
            return on_empty(self.empty_policy(), "web", || {
                let url = target.base_url();
                StrategyOutcome::run(
                    json!({ "urls": [url.clone()], "wordlist": "common", "max_depth": 1 }),
                    format!("no web services found; crawling {} directly", url),
                )
            });
        }

        let count = urls.len();
        let outcome = StrategyOutcome::run(
            json!({ "urls": urls, "wordlist": "common", "max_depth": 2 }),
            format!("discovering content on {} web services", count),
        );
        if count > WIDE_CONTENT_URLS {
            outcome.with_priority(TaskType::ContentDiscovery.default_priority().saturating_add(1))
        } else {
            outcome
        }
    }
}

pub struct VulnerabilityScanStrategy;

impl VulnerabilityScanStrategy {
    /// Template tags derived from detected technology names.
    fn tags(context: &SharedContext) -> BTreeSet<String> {
        context
            .query(Category::Technology)
            .iter()
            .filter_map(|f| f.str_field("name"))
            .map(|name| name.trim().to_ascii_lowercase().replace(' ', "-"))
            .filter(|tag| !tag.is_empty())
            .collect()
    }
}

impl ParameterStrategy for VulnerabilityScanStrategy {
    fn task_type(&self) -> TaskType {
        TaskType::VulnerabilityScan
    }

    fn empty_policy(&self) -> EmptyPolicy {
        EmptyPolicy::Skip
    }

    fn build(&self, context: &SharedContext, _target: &Target) -> StrategyOutcome {
        let urls = context.keys(Category::Web);
        if urls.is_empty() {
            return on_empty(self.empty_policy(), "web", unreachable_degrade);
        }
        let tags = Self::tags(context);
        let reasoning = if tags.is_empty() {
            format!("generic templates against {} web services", urls.len())
        } else {
            format!(
                "templates tagged {} against {} web services",
                tags.iter().cloned().collect::<Vec<_>>().join(","),
                urls.len()
            )
        };
        StrategyOutcome::run(
            json!({ "urls": urls, "tags": tags, "severity_floor": "low" }),
            reasoning,
        )
    }
}

/// Skip-policy strategies never degrade; reaching this means the policy
/// and the strategy disagree.
fn unreachable_degrade() -> StrategyOutcome {
    StrategyOutcome::skip("strategy has no degraded form")
}
