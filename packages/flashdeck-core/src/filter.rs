/// Level filter and visibility computation.
use std::collections::BTreeSet;

use crate::types::{Card, ALL_LEVELS};

/// Positions whose level is accepted, ascending.
pub fn compute_visible(cards: &[Card], accepted: &BTreeSet<i64>) -> Vec<usize> {
    cards
        .iter()
        .enumerate()
        .filter(|(_, card)| accepted.contains(&card.level))
        .map(|(i, _)| i)
        .collect()
}

/// Five independent level toggles. All levels are accepted initially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelFilter {
    accepted: BTreeSet<i64>,
}

impl Default for LevelFilter {
    fn default() -> Self {
        Self {
            accepted: ALL_LEVELS.iter().copied().collect(),
        }
    }
}

impl LevelFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept exactly the given levels.
    pub fn only(levels: impl IntoIterator<Item = i64>) -> Self {
        Self {
            accepted: levels.into_iter().collect(),
        }
    }

    pub fn accepts(&self, level: i64) -> bool {
        self.accepted.contains(&level)
    }

    pub fn accepted(&self) -> &BTreeSet<i64> {
        &self.accepted
    }

    pub fn set(&mut self, level: i64, on: bool) {
        if on {
            self.accepted.insert(level);
        } else {
            self.accepted.remove(&level);
        }
    }

    /// Flip one toggle; returns the new state.
    pub fn toggle(&mut self, level: i64) -> bool {
        let on = !self.accepts(level);
        self.set(level, on);
        on
    }

    pub fn set_all(&mut self, levels: impl IntoIterator<Item = i64>) {
        self.accepted = levels.into_iter().collect();
    }

    pub fn visible(&self, cards: &[Card]) -> Vec<usize> {
        compute_visible(cards, &self.accepted)
    }
}
