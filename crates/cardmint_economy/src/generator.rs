//! # Card Generator
//!
//! **Weighted rarity draws from an explicit random source**
//!
//! Each card is drawn on its own: a pack of N cards is N independent draws, so
//! the rarity odds do not depend on pack size.
//!
//! ## Algorithm
//!
//! ```text
//! weights  = [70, 20, 8, 2]          total = 100
//! roll     = uniform in [0, total)
//! walk:      running total 70 > roll? -> common
//!                          90 > roll? -> rare
//!                          98 > roll? -> epic
//!                         100 > roll? -> legendary
//! fallback:  last entry
//! ```
//!
//! The random source is injected. Production uses `ChaCha8Rng::from_entropy`,
//! tests seed it with a fixed value and get the same cards every run.

use std::collections::HashMap;
use std::sync::Arc;

use rand::{Rng, RngCore};

use crate::card::CardDraft;
use crate::catalog::{Catalog, Rarity};

/// Picks an entry by weight.
///
/// `roll` must be in `[0, total weight)`. Walks the entries accumulating weight
/// and returns the first one whose running total exceeds `roll`. A roll at or
/// beyond the total falls back to the last entry. Returns `None` only for an
/// empty slice.
#[must_use]
pub fn pick_weighted<T: Copy>(entries: &[(T, u64)], roll: u64) -> Option<T> {
    let mut cumulative = 0u64;
    for &(item, weight) in entries {
        cumulative = cumulative.saturating_add(weight);
        if roll < cumulative {
            return Some(item);
        }
    }
    entries.last().map(|&(item, _)| item)
}

/// Draws cards according to a catalog.
pub struct CardGenerator<R> {
    /// Rarity weights and incomes.
    catalog: Arc<Catalog>,
    /// Pre-flattened `(rarity, weight)` table.
    weights: [(Rarity, u64); Rarity::COUNT],
    /// Random source.
    rng: R,
}

impl<R: RngCore> CardGenerator<R> {
    /// Creates a generator over a catalog and random source.
    #[must_use]
    pub fn new(catalog: Arc<Catalog>, rng: R) -> Self {
        let tiers = *catalog.tiers();
        let weights = tiers.map(|tier| (tier.rarity, u64::from(tier.weight)));
        Self {
            catalog,
            weights,
            rng,
        }
    }

    /// The catalog this generator draws from.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Draws one rarity.
    pub fn draw_rarity(&mut self) -> Rarity {
        let total = self.catalog.total_weight();
        let roll = self.rng.gen_range(0..total);
        pick_weighted(&self.weights, roll).unwrap_or(Rarity::Common)
    }

    /// Draws one card.
    pub fn generate_card(&mut self) -> CardDraft {
        let rarity = self.draw_rarity();
        CardDraft {
            rarity,
            income_per_hour: self.catalog.income_per_hour(rarity),
        }
    }

    /// Draws `count` cards, each independently.
    pub fn generate_pack(&mut self, count: u32) -> Vec<CardDraft> {
        (0..count).map(|_| self.generate_card()).collect()
    }

    /// Draws `samples` rarities and tallies them.
    ///
    /// Used to check that observed frequencies match the configured weights.
    pub fn sample(&mut self, samples: u32) -> RarityHistogram {
        let mut histogram = RarityHistogram::default();
        for _ in 0..samples {
            histogram.record(self.draw_rarity());
        }
        histogram
    }
}

impl<R> std::fmt::Debug for CardGenerator<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardGenerator")
            .field("weights", &self.weights)
            .finish_non_exhaustive()
    }
}

/// Counts of drawn rarities.
#[derive(Clone, Debug, Default)]
pub struct RarityHistogram {
    /// Total draws.
    pub total: u64,
    /// Draws per rarity.
    pub counts: HashMap<Rarity, u64>,
}

impl RarityHistogram {
    /// Records one draw.
    pub fn record(&mut self, rarity: Rarity) {
        self.total += 1;
        *self.counts.entry(rarity).or_insert(0) += 1;
    }

    /// Number of draws of one rarity.
    #[must_use]
    pub fn count(&self, rarity: Rarity) -> u64 {
        self.counts.get(&rarity).copied().unwrap_or(0)
    }

    /// Observed share of one rarity, as a percentage.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent(&self, rarity: Rarity) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.count(rarity) as f64 / self.total as f64) * 100.0
        }
    }
}
