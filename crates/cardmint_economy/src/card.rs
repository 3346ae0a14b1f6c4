//! # Cards and Users
//!
//! Identity and value types shared by the generator, the ledger and the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::Rarity;

/// Externally supplied account id (e.g. a chat platform user id).
pub type UserId = i64;

/// Store-assigned card id. Monotonic, never reused.
pub type CardId = u64;

/// The "never happened" timestamp used for fresh users.
#[must_use]
pub const fn never() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// A freshly drawn card that has no identity or owner yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardDraft {
    /// Drawn rarity.
    pub rarity: Rarity,
    /// Income frozen from the catalog at draw time.
    pub income_per_hour: u64,
}

/// A persisted card.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Unique id.
    pub id: CardId,
    /// Current owner; the only field that ever changes.
    pub owner_id: UserId,
    /// Rarity tier.
    pub rarity: Rarity,
    /// Coins per hour, fixed when the card was created.
    pub income_per_hour: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Card {
    /// Gives a draft its identity and first owner.
    #[must_use]
    pub const fn mint(id: CardId, owner_id: UserId, draft: CardDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id,
            rarity: draft.rarity,
            income_per_hour: draft.income_per_hour,
            created_at,
        }
    }

    /// The rarity and income part of the card.
    #[must_use]
    pub const fn draft(&self) -> CardDraft {
        CardDraft {
            rarity: self.rarity,
            income_per_hour: self.income_per_hour,
        }
    }
}

/// Ledger view of one user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    /// Account id.
    pub id: UserId,
    /// Coin balance.
    pub coins: u64,
    /// Last successful free pack, or [`never`].
    pub last_pack_time: DateTime<Utc>,
    /// Last successful lazy claim, or [`never`].
    pub last_claim_time: DateTime<Utc>,
}

impl UserAccount {
    /// A brand-new account.
    #[must_use]
    pub const fn new(id: UserId, coins: u64) -> Self {
        Self {
            id,
            coins,
            last_pack_time: never(),
            last_claim_time: never(),
        }
    }
}

/// Everything a user owns, for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventorySummary {
    /// Owned cards in ascending id order.
    pub cards: Vec<Card>,
    /// Sum of `income_per_hour` over owned cards.
    pub total_income_per_hour: u64,
    /// Current coin balance.
    pub balance: u64,
}

/// Sums income over a set of cards.
///
/// Returns `None` on overflow.
#[must_use]
pub fn total_income<'a>(cards: impl IntoIterator<Item = &'a Card>) -> Option<u64> {
    cards
        .into_iter()
        .try_fold(0u64, |acc, card| acc.checked_add(card.income_per_hour))
}
