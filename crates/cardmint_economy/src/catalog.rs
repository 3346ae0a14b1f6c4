//! # Rarity and Pack Catalog
//!
//! Static balance data: what each rarity earns per hour, how often it is drawn,
//! and what each pack contains and costs.
//!
//! The catalog is an immutable value. It is built once (from defaults or a TOML
//! file) and handed to the generator and the engine, so tests can swap in any
//! other valid catalog.
//!
//! ## Example
//!
//! ```toml
//! [[rarities]]
//! rarity = "common"
//! income_per_hour = 1
//! weight = 70
//!
//! [[packs]]
//! id = "free"
//! card_count = 3
//! cost = 0
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EconomyError, EconomyResult};

/// Rarity tier of a card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Rarity {
    /// The bulk of every pack.
    Common = 0,
    /// Roughly one card in five.
    Rare = 1,
    /// Uncommon pulls.
    Epic = 2,
    /// The chase cards.
    Legendary = 3,
}

impl Rarity {
    /// Number of rarity tiers.
    pub const COUNT: usize = 4;

    /// All tiers, lowest first.
    pub const ALL: [Self; Self::COUNT] = [Self::Common, Self::Rare, Self::Epic, Self::Legendary];

    /// Lowercase name used in config files and by adapters.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::Rare => "rare",
            Self::Epic => "epic",
            Self::Legendary => "legendary",
        }
    }

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifier of a pack kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackId {
    /// The zero-cost pack granted on a cooldown.
    Free,
    /// Entry-level paid pack.
    Small,
    /// Mid-tier paid pack.
    Medium,
    /// Largest paid pack.
    Large,
}

impl PackId {
    /// All pack identifiers.
    pub const ALL: [Self; 4] = [Self::Free, Self::Small, Self::Medium, Self::Large];

    /// Lowercase name used in config files and by adapters.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PackId {
    type Err = EconomyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| EconomyError::UnknownPack(s.to_string()))
    }
}

/// Income and draw weight of one rarity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RarityTier {
    /// The rarity this entry describes.
    pub rarity: Rarity,
    /// Coins earned per hour by each card of this rarity.
    pub income_per_hour: u64,
    /// Relative draw weight (higher = more common).
    pub weight: u32,
}

/// Contents and price of one pack kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackSpec {
    /// Pack identifier.
    pub id: PackId,
    /// Number of cards generated per opening.
    pub card_count: u32,
    /// Price in coins (0 for the free pack).
    pub cost: u64,
}

/// Catalog as written in config files, before validation.
#[derive(Clone, Debug, Deserialize)]
struct RawCatalog {
    rarities: Vec<RarityTier>,
    packs: Vec<PackSpec>,
}

/// The validated, read-only rarity and pack catalog.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCatalog")]
pub struct Catalog {
    /// Tiers indexed by `Rarity as usize`.
    rarities: [RarityTier; Rarity::COUNT],
    /// Packs in declaration order.
    packs: Vec<PackSpec>,
    /// Sum of all rarity weights (pre-calculated).
    #[serde(skip)]
    total_weight: u64,
}

impl TryFrom<RawCatalog> for Catalog {
    type Error = EconomyError;

    fn try_from(raw: RawCatalog) -> Result<Self, Self::Error> {
        Self::new(raw.rarities, raw.packs)
    }
}

impl Catalog {
    /// Builds a catalog, validating every balance rule.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] if a rarity is missing or listed
    /// twice, incomes are not strictly increasing from common to legendary, all
    /// weights are zero, a pack is listed twice or has no cards, the free pack is
    /// missing or not free, fewer than two paid packs exist, or paid packs do not
    /// grow in both card count and cost.
    pub fn new(tiers: Vec<RarityTier>, packs: Vec<PackSpec>) -> EconomyResult<Self> {
        let mut slots: [Option<RarityTier>; Rarity::COUNT] = [None; Rarity::COUNT];
        for tier in tiers {
            let slot = &mut slots[tier.rarity.index()];
            if slot.is_some() {
                return Err(invalid(format!("rarity {} listed twice", tier.rarity)));
            }
            *slot = Some(tier);
        }

        let mut rarities = [RarityTier {
            rarity: Rarity::Common,
            income_per_hour: 0,
            weight: 0,
        }; Rarity::COUNT];
        for (rarity, slot) in Rarity::ALL.into_iter().zip(slots) {
            rarities[rarity.index()] =
                slot.ok_or_else(|| invalid(format!("rarity {rarity} missing")))?;
        }

        for pair in rarities.windows(2) {
            if pair[1].income_per_hour <= pair[0].income_per_hour {
                return Err(invalid(format!(
                    "income of {} ({}) must exceed income of {} ({})",
                    pair[1].rarity, pair[1].income_per_hour, pair[0].rarity, pair[0].income_per_hour
                )));
            }
        }

        let total_weight: u64 = rarities.iter().map(|t| u64::from(t.weight)).sum();
        if total_weight == 0 {
            return Err(invalid("rarity weights sum to zero".to_string()));
        }

        Self::validate_packs(&packs)?;

        Ok(Self {
            rarities,
            packs,
            total_weight,
        })
    }

    fn validate_packs(packs: &[PackSpec]) -> EconomyResult<()> {
        for (i, pack) in packs.iter().enumerate() {
            if packs[..i].iter().any(|p| p.id == pack.id) {
                return Err(invalid(format!("pack {} listed twice", pack.id)));
            }
            if pack.card_count == 0 {
                return Err(invalid(format!("pack {} has no cards", pack.id)));
            }
        }

        match packs.iter().find(|p| p.id == PackId::Free) {
            Some(free) if free.cost == 0 => {}
            Some(free) => {
                return Err(invalid(format!("free pack costs {} coins", free.cost)));
            }
            None => return Err(invalid("free pack missing".to_string())),
        }

        let paid: Vec<&PackSpec> = packs.iter().filter(|p| p.id != PackId::Free).collect();
        if paid.len() < 2 {
            return Err(invalid("at least two paid packs are required".to_string()));
        }
        for pair in paid.windows(2) {
            if pair[1].card_count <= pair[0].card_count || pair[1].cost <= pair[0].cost {
                return Err(invalid(format!(
                    "pack {} must hold more cards and cost more than pack {}",
                    pair[1].id, pair[0].id
                )));
            }
        }
        if paid[0].cost == 0 {
            return Err(invalid(format!("paid pack {} is free", paid[0].id)));
        }

        Ok(())
    }

    /// Parses and validates a catalog from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] on syntax or validation errors.
    pub fn from_toml_str(text: &str) -> EconomyResult<Self> {
        toml::from_str(text).map_err(|e| invalid(format!("catalog: {e}")))
    }

    /// Income and weight of a rarity.
    #[inline]
    #[must_use]
    pub const fn tier(&self, rarity: Rarity) -> &RarityTier {
        &self.rarities[rarity.index()]
    }

    /// Coins per hour earned by a card of this rarity.
    #[inline]
    #[must_use]
    pub const fn income_per_hour(&self, rarity: Rarity) -> u64 {
        self.tier(rarity).income_per_hour
    }

    /// All tiers, lowest rarity first.
    #[must_use]
    pub const fn tiers(&self) -> &[RarityTier; Rarity::COUNT] {
        &self.rarities
    }

    /// Sum of all draw weights.
    #[must_use]
    pub const fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// All packs in declaration order.
    #[must_use]
    pub fn packs(&self) -> &[PackSpec] {
        &self.packs
    }

    /// Looks up any pack, free or paid.
    #[must_use]
    pub fn pack(&self, id: PackId) -> Option<&PackSpec> {
        self.packs.iter().find(|p| p.id == id)
    }

    /// The zero-cost cooldown pack.
    ///
    /// # Errors
    ///
    /// Never fails for a validated catalog; kept fallible so a hand-edited
    /// catalog cannot panic the engine.
    pub fn free_pack(&self) -> EconomyResult<&PackSpec> {
        self.pack(PackId::Free)
            .ok_or_else(|| EconomyError::UnknownPack(PackId::Free.to_string()))
    }

    /// Resolves a pack that can be bought with coins.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownPack`] if the pack is absent from this
    /// catalog or is the free pack.
    pub fn paid_pack(&self, id: PackId) -> EconomyResult<&PackSpec> {
        self.pack(id)
            .filter(|p| p.cost > 0)
            .ok_or_else(|| EconomyError::UnknownPack(id.to_string()))
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            rarities: [
                RarityTier { rarity: Rarity::Common, income_per_hour: 1, weight: 70 },
                RarityTier { rarity: Rarity::Rare, income_per_hour: 3, weight: 20 },
                RarityTier { rarity: Rarity::Epic, income_per_hour: 8, weight: 8 },
                RarityTier { rarity: Rarity::Legendary, income_per_hour: 20, weight: 2 },
            ],
            packs: vec![
                PackSpec { id: PackId::Free, card_count: 3, cost: 0 },
                PackSpec { id: PackId::Small, card_count: 3, cost: 50 },
                PackSpec { id: PackId::Medium, card_count: 5, cost: 120 },
                PackSpec { id: PackId::Large, card_count: 10, cost: 250 },
            ],
            total_weight: 100,
        }
    }
}

fn invalid(msg: String) -> EconomyError {
    EconomyError::InvalidConfig(msg)
}
