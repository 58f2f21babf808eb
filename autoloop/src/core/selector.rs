//! Model pool selection.
//!
//! [`ModelSelector`] owns the primary and fallback pools, the rotation state
//! for the configured [`SelectionStrategy`], and per-model retry counters.
//! Only the driver loop mutates it.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::core::types::{ModelConfig, SelectionStrategy};

#[derive(Debug)]
pub struct ModelSelector {
    strategy: SelectionStrategy,
    primary: Vec<ModelConfig>,
    fallback: Vec<ModelConfig>,
    using_fallback: bool,
    /// Next position for round-robin and priority.
    cursor: usize,
    /// Models already handed out in the current cost-aware rotation.
    tried: Vec<bool>,
    retry_counts: HashMap<String, u32>,
    rng: StdRng,
}

impl ModelSelector {
    pub fn new(
        strategy: SelectionStrategy,
        primary: Vec<ModelConfig>,
        fallback: Vec<ModelConfig>,
    ) -> Self {
        Self::with_rng(strategy, primary, fallback, StdRng::from_entropy())
    }

    /// Deterministic variant for the random strategy.
    pub fn with_seed(
        strategy: SelectionStrategy,
        primary: Vec<ModelConfig>,
        fallback: Vec<ModelConfig>,
        seed: u64,
    ) -> Self {
        Self::with_rng(strategy, primary, fallback, StdRng::seed_from_u64(seed))
    }

    fn with_rng(
        strategy: SelectionStrategy,
        primary: Vec<ModelConfig>,
        fallback: Vec<ModelConfig>,
        rng: StdRng,
    ) -> Self {
        let tried = vec![false; primary.len()];
        Self {
            strategy,
            primary,
            fallback,
            using_fallback: false,
            cursor: 0,
            tried,
            retry_counts: HashMap::new(),
            rng,
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn primary(&self) -> &[ModelConfig] {
        &self.primary
    }

    pub fn fallback(&self) -> &[ModelConfig] {
        &self.fallback
    }

    /// The pool selection currently draws from.
    pub fn active_pool(&self) -> &[ModelConfig] {
        if self.using_fallback {
            &self.fallback
        } else {
            &self.primary
        }
    }

    pub fn is_using_fallback(&self) -> bool {
        self.using_fallback
    }

    /// Hard cap on attempt slots per `execute()` call.
    pub fn total_model_count(&self) -> usize {
        self.primary.len() + self.fallback.len()
    }

    /// Pick the next model from the active pool.
    ///
    /// Returns `None` when the active pool is empty, or when the priority
    /// strategy has walked past its last model.
    pub fn next_model(&mut self) -> Option<ModelConfig> {
        let len = self.active_pool().len();
        if len == 0 {
            return None;
        }
        let index = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let index = self.cursor % len;
                self.cursor = (index + 1) % len;
                index
            }
            SelectionStrategy::Priority => {
                if self.cursor >= len {
                    debug!(cursor = self.cursor, "priority pool exhausted");
                    return None;
                }
                let index = self.cursor;
                self.cursor += 1;
                index
            }
            SelectionStrategy::CostAware => self.next_cheapest(),
            SelectionStrategy::Random => self.rng.gen_range(0..len),
        };
        let model = self.active_pool()[index].clone();
        debug!(
            strategy = %self.strategy,
            index,
            model = %model.name,
            fallback = self.using_fallback,
            "selected model"
        );
        Some(model)
    }

    fn next_cheapest(&mut self) -> usize {
        if self.tried.iter().all(|tried| *tried) {
            self.tried.iter_mut().for_each(|tried| *tried = false);
        }
        let pool = if self.using_fallback {
            &self.fallback
        } else {
            &self.primary
        };
        // `min_by` keeps the first of equal elements, so ties go to list order.
        let index = (0..pool.len())
            .filter(|index| !self.tried[*index])
            .min_by(|a, b| pool[*a].cost().total_cmp(&pool[*b].cost()))
            .unwrap_or(0);
        self.tried[index] = true;
        index
    }

    /// Move selection to the fallback pool, starting from its beginning.
    ///
    /// Idempotent. Returns false (and stays on primary) when the fallback pool
    /// is empty.
    pub fn switch_to_fallback(&mut self) -> bool {
        if self.using_fallback {
            return true;
        }
        if self.fallback.is_empty() {
            warn!("no fallback models configured, staying on primary pool");
            return false;
        }
        info!(models = self.fallback.len(), "switching to fallback pool");
        self.using_fallback = true;
        self.reset_rotation();
        true
    }

    /// Return to the primary pool, starting from its beginning.
    pub fn reset_fallback(&mut self) {
        if self.using_fallback {
            info!("returning to primary pool");
        }
        self.using_fallback = false;
        self.reset_rotation();
    }

    /// Start a new task: priority walks its pool from the top again and
    /// cost-aware forgets which models it tried. Round-robin keeps its cursor
    /// so load keeps spreading across tasks. The active pool and retry counts
    /// are untouched.
    pub fn restart_rotation(&mut self) {
        match self.strategy {
            SelectionStrategy::Priority | SelectionStrategy::CostAware => self.reset_rotation(),
            SelectionStrategy::RoundRobin | SelectionStrategy::Random => {}
        }
    }

    fn reset_rotation(&mut self) {
        self.cursor = 0;
        self.tried = vec![false; self.active_pool().len()];
    }

    /// Record one more same-model retry and return the new count.
    pub fn track_retry(&mut self, name: &str) -> u32 {
        let count = self.retry_counts.entry(name.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn retry_count(&self, name: &str) -> u32 {
        self.retry_counts.get(name).copied().unwrap_or(0)
    }
}
