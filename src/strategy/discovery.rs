use std::collections::BTreeSet;

use serde_json::json;

use super::{on_empty, EmptyPolicy, ParameterStrategy, StrategyOutcome};
use crate::core::{Category, SharedContext, Target, TaskType};

/// Scans above this many hosts are deprioritized.
const LARGE_SCAN_HOSTS: usize = 50;

const DEFAULT_RECORD_TYPES: [&str; 3] = ["A", "AAAA", "CNAME"];

pub struct SubdomainDiscoveryStrategy;

impl ParameterStrategy for SubdomainDiscoveryStrategy {
    fn task_type(&self) -> TaskType {
        TaskType::SubdomainDiscovery
    }

    fn empty_policy(&self) -> EmptyPolicy {
        EmptyPolicy::NotApplicable
    }

    fn build(&self, _context: &SharedContext, target: &Target) -> StrategyOutcome {
        if target.is_domain() {
            StrategyOutcome::run(
                json!({ "domain": target.host(), "mode": "passive", "recursive": false }),
                format!("passive enumeration of {}", target.host()),
            )
        } else {
            // Addresses still seed the graph with a single host.
            StrategyOutcome::run(
                json!({ "domain": target.host(), "mode": "seed", "recursive": false }),
                format!("{} is not a domain; seeding it as the only host", target.host()),
            )
        }
    }
}

pub struct DnsResolutionStrategy;

impl ParameterStrategy for DnsResolutionStrategy {
    fn task_type(&self) -> TaskType {
        TaskType::DnsResolution
    }

    fn empty_policy(&self) -> EmptyPolicy {
        EmptyPolicy::Degrade
    }

    fn build(&self, context: &SharedContext, target: &Target) -> StrategyOutcome {
        let hosts = context.keys(Category::Host);
        if hosts.is_empty() {
            return on_empty(self.empty_policy(), "host", || {
                StrategyOutcome::run(
                    json!({ "hosts": [target.host()], "record_types": DEFAULT_RECORD_TYPES }),
                    format!("no hosts discovered; resolving {} directly", target.host()),
                )
            });
        }
        let reasoning = format!("resolving {} discovered hosts", hosts.len());
        StrategyOutcome::run(
            json!({ "hosts": hosts, "record_types": DEFAULT_RECORD_TYPES }),
            reasoning,
        )
    }
}

pub struct PortScanStrategy;

impl PortScanStrategy {
    fn ports_for(target: &Target) -> serde_json::Value {
        match target.port() {
            Some(port) => json!({ "profile": "top-1000", "extra": [port] }),
            None => json!({ "profile": "top-1000", "extra": [] }),
        }
    }
}

impl ParameterStrategy for PortScanStrategy {
    fn task_type(&self) -> TaskType {
        TaskType::PortScan
    }

    fn empty_policy(&self) -> EmptyPolicy {
        EmptyPolicy::Degrade
    }

    fn build(&self, context: &SharedContext, target: &Target) -> StrategyOutcome {
        let hosts: BTreeSet<String> = context.keys(Category::Host).into_iter().collect();
        if hosts.is_empty() {
            return on_empty(self.empty_policy(), "host", || {
                StrategyOutcome::run(
                    json!({ "hosts": [target.host()], "ports": Self::ports_for(target) }),
                    format!("no hosts discovered; scanning {} directly", target.host()),
                )
            });
        }

        let count = hosts.len();
        let outcome = StrategyOutcome::run(
            json!({ "hosts": hosts, "ports": Self::ports_for(target) }),
            format!("scanning {} discovered hosts", count),
        );
        if count > LARGE_SCAN_HOSTS {
            outcome.with_priority(TaskType::PortScan.default_priority().saturating_add(2))
        } else {
            outcome
        }
    }
}
