use std::fmt;

use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use super::worker::Worker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    ResourceBased,
    Random,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastConnections => "least_connections",
            SelectionStrategy::WeightedRoundRobin => "weighted_round_robin",
            SelectionStrategy::ResourceBased => "resource_based",
            SelectionStrategy::Random => "random",
        };
        f.write_str(name)
    }
}

/// Mutable state some strategies carry between selections
#[derive(Debug)]
pub struct SelectionState {
    pub round_robin_index: usize,
    pub rng: StdRng,
}

impl SelectionStrategy {
    /// Pick one of the available `candidates`, returning its index
    pub fn select(&self, candidates: &[&Worker], state: &mut SelectionState) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = match self {
            SelectionStrategy::RoundRobin => {
                let index = state.round_robin_index % candidates.len();
                state.round_robin_index = state.round_robin_index.wrapping_add(1);
                index
            }
            SelectionStrategy::LeastConnections => candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, worker)| worker.active_count())
                .map(|(index, _)| index)?,
            SelectionStrategy::WeightedRoundRobin => {
                let total: u64 = candidates.iter().map(|w| u64::from(w.weight)).sum();
                if total == 0 {
                    state.rng.random_range(0..candidates.len())
                } else {
                    let mut draw = state.rng.random_range(0..total);
                    let mut chosen = candidates.len() - 1;
                    for (index, worker) in candidates.iter().enumerate() {
                        let weight = u64::from(worker.weight);
                        if draw < weight {
                            chosen = index;
                            break;
                        }
                        draw -= weight;
                    }
                    chosen
                }
            }
            SelectionStrategy::ResourceBased => candidates
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| a.load_score().total_cmp(&b.load_score()))
                .map(|(index, _)| index)?,
            SelectionStrategy::Random => state.rng.random_range(0..candidates.len()),
        };

        Some(index)
    }
}
