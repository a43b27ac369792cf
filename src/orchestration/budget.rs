//! Spend ledger for decision-provider calls.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Add, AddAssign};

/// Micro-units per currency unit.
const MICROS: f64 = 1_000_000.0;

/// A cost in integer micro-units, so ceiling checks are exact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cost(pub u64);

impl Cost {
    pub const ZERO: Cost = Cost(0);

    pub fn from_micros(micros: u64) -> Self {
        Cost(micros)
    }

    /// Round a currency amount to micro-units. Negative and NaN become zero.
    pub fn from_units(units: f64) -> Self {
        if !units.is_finite() || units <= 0.0 {
            return Cost::ZERO;
        }
        Cost((units * MICROS).round() as u64)
    }

    pub fn micros(&self) -> u64 {
        self.0
    }

    pub fn as_units(&self) -> f64 {
        self.0 as f64 / MICROS
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn saturating_sub(self, other: Cost) -> Cost {
        Cost(self.0.saturating_sub(other.0))
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        Cost(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, rhs: Cost) {
        *self = *self + rhs;
    }
}

impl std::fmt::Display for Cost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.6}", self.as_units())
    }
}

/// Cost/capability level of a decision provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Lightweight,
    Deep,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Lightweight => "lightweight",
            Tier::Deep => "deep",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-workflow spend ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub limit: Cost,
    pub spent: BTreeMap<Tier, Cost>,
    pub calls: BTreeMap<Tier, u32>,
    pub total: Cost,
}

impl Budget {
    pub fn new(limit: Cost) -> Self {
        Self {
            limit,
            spent: BTreeMap::new(),
            calls: BTreeMap::new(),
            total: Cost::ZERO,
        }
    }

    /// Record one provider call. Returns whether this call exhausted the
    /// budget (it was not exhausted before).
    pub fn record(&mut self, tier: Tier, cost: Cost) -> bool {
        let was_exhausted = self.is_exhausted();
        *self.spent.entry(tier).or_default() += cost;
        *self.calls.entry(tier).or_default() += 1;
        self.total += cost;
        !was_exhausted && self.is_exhausted()
    }

    pub fn is_exhausted(&self) -> bool {
        self.total >= self.limit
    }

    pub fn remaining(&self) -> Cost {
        self.limit.saturating_sub(self.total)
    }

    pub fn spent_on(&self, tier: Tier) -> Cost {
        self.spent.get(&tier).copied().unwrap_or_default()
    }

    pub fn calls_on(&self, tier: Tier) -> u32 {
        self.calls.get(&tier).copied().unwrap_or_default()
    }

    /// Clear spend, keeping the limit.
    pub fn reset(&mut self) {
        *self = Budget::new(self.limit);
    }
}
