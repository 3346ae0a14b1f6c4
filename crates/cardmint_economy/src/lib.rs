//! # CARDMINT Economy Engine
//!
//! Collectible-card economy: users open free packs on a cooldown or buy paid
//! packs with coins, receive randomly drawn cards whose rarity sets a fixed
//! hourly income, collect that income, and trade cards with each other.
//!
//! ## Design Principles
//!
//! 1. **Integer coins** - Balances and incomes are `u64`; accrual uses widened integer math
//! 2. **Row-level locking** - Concurrent callers serialize per user and per card only
//! 3. **Transactional operations** - Every multi-step change commits as one unit or not at all
//! 4. **External configuration** - Rarities, packs and cooldowns come from TOML
//!
//! ## Thread Safety
//!
//! [`EconomyEngine`] takes `&self` everywhere and is meant to be shared behind an
//! `Arc` by every adapter thread. The engine never reads the clock; callers pass
//! `now` explicitly.
//!
//! ## Example
//!
//! ```rust,ignore
//! use cardmint_economy::{CardmintConfig, EconomyEngine, PackId};
//!
//! let config = CardmintConfig::load("cardmint.toml")?;
//! let engine = EconomyEngine::open(&config)?;
//!
//! let now = chrono::Utc::now();
//! let opening = engine.open_free_pack(user_id, now)?;
//! let bought = engine.buy_pack(user_id, "small".parse::<PackId>()?, now)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod card;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod ledger;

pub use card::{Card, CardDraft, CardId, InventorySummary, UserAccount, UserId};
pub use catalog::{Catalog, PackId, PackSpec, Rarity, RarityTier};
pub use config::{CardmintConfig, EconomyConfig, LedgerConfig};
pub use engine::{ClaimOutcome, EconomyEngine, PackOpening, TransferReceipt};
pub use error::{EconomyError, EconomyResult};
pub use generator::{CardGenerator, RarityHistogram};
pub use ledger::{BatchCredit, Ledger, LedgerTotals, LedgerTxn, LockScope};
