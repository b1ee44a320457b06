//! Load-balancing strategies.
//!
//! A [`Selector`] picks one connection out of a snapshot of the registry. The
//! hub takes the snapshot; selectors only look at it, so they can run
//! concurrently without coordinating with registration.

use crate::connection::Connection;
use crate::error::NoPeerAvailable;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Chooses which peer serves the next call.
pub trait Selector: Send + Sync {
    fn select<'a>(
        &self,
        candidates: &'a [Arc<Connection>],
    ) -> Result<&'a Arc<Connection>, NoPeerAvailable>;

    /// Strategy name, for logs and metrics.
    fn name(&self) -> &'static str;
}

/// Rotate through candidates.
///
/// The counter is shared across snapshots, so when membership changes the
/// rotation shifts. Fairness is approximate.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Selector for RoundRobin {
    fn select<'a>(
        &self,
        candidates: &'a [Arc<Connection>],
    ) -> Result<&'a Arc<Connection>, NoPeerAvailable> {
        if candidates.is_empty() {
            return Err(NoPeerAvailable);
        }
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        Ok(&candidates[n % candidates.len()])
    }

    fn name(&self) -> &'static str {
        "round-robin"
    }
}

/// Pick the peer with the fewest calls in flight; ties go to the earlier one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastActiveCalls;

impl Selector for LeastActiveCalls {
    fn select<'a>(
        &self,
        candidates: &'a [Arc<Connection>],
    ) -> Result<&'a Arc<Connection>, NoPeerAvailable> {
        candidates
            .iter()
            .min_by_key(|conn| conn.active_calls())
            .ok_or(NoPeerAvailable)
    }

    fn name(&self) -> &'static str {
        "least-active"
    }
}

/// Random pick proportional to per-peer weights.
///
/// Weights are keyed by connection name. Unlisted peers weigh 1, and a zero
/// weight counts as 1 so every live peer stays reachable.
#[derive(Debug, Default, Clone)]
pub struct WeightedRandom {
    weights: HashMap<String, u32>,
}

impl WeightedRandom {
    pub fn new(weights: HashMap<String, u32>) -> Self {
        Self { weights }
    }

    fn weight_of(&self, conn: &Connection) -> u64 {
        u64::from(self.weights.get(conn.name()).copied().unwrap_or(1).max(1))
    }
}

impl Selector for WeightedRandom {
    fn select<'a>(
        &self,
        candidates: &'a [Arc<Connection>],
    ) -> Result<&'a Arc<Connection>, NoPeerAvailable> {
        let total: u64 = candidates.iter().map(|c| self.weight_of(c)).sum();
        if total == 0 {
            return Err(NoPeerAvailable);
        }

        let mut remaining = rand::rng().random_range(0..total);
        for conn in candidates {
            let weight = self.weight_of(conn);
            if remaining < weight {
                return Ok(conn);
            }
            remaining -= weight;
        }
        // Unreachable while `total` is the sum of the weights walked above.
        candidates.last().ok_or(NoPeerAvailable)
    }

    fn name(&self) -> &'static str {
        "weighted-random"
    }
}

/// Uniform random pick.
#[derive(Debug, Default, Clone, Copy)]
pub struct UniformRandom;

impl Selector for UniformRandom {
    fn select<'a>(
        &self,
        candidates: &'a [Arc<Connection>],
    ) -> Result<&'a Arc<Connection>, NoPeerAvailable> {
        if candidates.is_empty() {
            return Err(NoPeerAvailable);
        }
        Ok(&candidates[rand::rng().random_range(0..candidates.len())])
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Strategy choice as written in config or on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorKind {
    #[default]
    RoundRobin,
    LeastActive,
    WeightedRandom,
    Random,
}

impl SelectorKind {
    /// Build the strategy. `weights` only matters for [`SelectorKind::WeightedRandom`].
    pub fn build(self, weights: HashMap<String, u32>) -> Box<dyn Selector> {
        match self {
            SelectorKind::RoundRobin => Box::new(RoundRobin::new()),
            SelectorKind::LeastActive => Box::new(LeastActiveCalls),
            SelectorKind::WeightedRandom => Box::new(WeightedRandom::new(weights)),
            SelectorKind::Random => Box::new(UniformRandom),
        }
    }
}

impl fmt::Display for SelectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectorKind::RoundRobin => "round-robin",
            SelectorKind::LeastActive => "least-active",
            SelectorKind::WeightedRandom => "weighted-random",
            SelectorKind::Random => "random",
        };
        f.write_str(s)
    }
}
