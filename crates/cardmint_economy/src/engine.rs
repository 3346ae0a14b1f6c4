//! # Economy Engine
//!
//! The operations adapters call: packs, inventory, income and transfers.
//!
//! ## Operation Pipeline
//!
//! ```text
//! adapter call -> ensure_user() -> Ledger::transaction(scope) ->
//!   1. Lock the user row (or card row)
//!   2. Check cooldown / funds / ownership
//!   3. Draw cards (only after every check passed)
//!   4. Stage balance, timestamp and card writes
//!   5. Commit through the write-ahead log, or roll back on any error
//! ```
//!
//! Timestamps are passed in by the caller, so the engine never reads the clock.
//!
//! ## Income
//!
//! Cards pay their holder through two independent channels:
//!
//! - **Lazy claims** (`claim_lazy`): coins accrued since the user's last claim,
//!   `floor(income_per_hour * elapsed_secs / 3600)`.
//! - **Batch income** (`distribute_batch_income`): one hour of income credited
//!   to every holder, typically on an hourly schedule.
//!
//! The two channels do not offset each other; a user collects from both.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use crate::card::{total_income, Card, CardId, InventorySummary, UserAccount, UserId};
use crate::catalog::{Catalog, PackId, PackSpec};
use crate::config::{CardmintConfig, EconomyConfig};
use crate::error::{EconomyError, EconomyResult};
use crate::generator::CardGenerator;
use crate::ledger::{BatchCredit, Ledger, LedgerTotals, LedgerTxn, LockScope};

const SECS_PER_HOUR: u128 = 3_600;

/// Cards granted by one pack opening.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackOpening {
    /// Pack that was opened.
    pub pack: PackId,
    /// New cards, ascending by id.
    pub cards: Vec<Card>,
    /// Balance after the opening.
    pub balance: u64,
}

/// Result of a lazy income claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Coins were added and the claim clock moved to the call time.
    Credited {
        /// Coins added.
        amount: u64,
        /// Balance after the credit.
        balance: u64,
    },
    /// Nothing accrued yet; the claim clock did not move.
    NothingToClaim,
}

/// A completed card transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferReceipt {
    /// The card, as now owned by `to`.
    pub card: Card,
    /// Previous owner.
    pub from: UserId,
    /// New owner.
    pub to: UserId,
}

/// The economy engine.
///
/// Cheap to share behind an [`Arc`]; every operation takes `&self` and may be
/// called from many threads at once.
pub struct EconomyEngine<R = ChaCha8Rng> {
    /// Rarities and packs.
    catalog: Arc<Catalog>,
    /// Free pack cooldown.
    cooldown: Duration,
    /// Coins for newly created users.
    starting_coins: u64,
    /// Balances, timestamps and cards.
    ledger: Arc<Ledger>,
    /// Card source; locked only while drawing.
    generator: Mutex<CardGenerator<R>>,
}

impl EconomyEngine<ChaCha8Rng> {
    /// Opens the ledger described by `config` and seeds the generator from
    /// system entropy.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] for invalid settings and
    /// [`EconomyError::StoreUnavailable`] if the ledger cannot be opened.
    pub fn open(config: &CardmintConfig) -> EconomyResult<Self> {
        let ledger = Arc::new(Ledger::open(&config.ledger)?);
        Self::new(config.economy.clone(), ledger, ChaCha8Rng::from_entropy())
    }

    /// An engine with a reproducible card sequence.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] for invalid settings.
    pub fn with_seed(config: EconomyConfig, ledger: Arc<Ledger>, seed: u64) -> EconomyResult<Self> {
        Self::new(config, ledger, ChaCha8Rng::seed_from_u64(seed))
    }
}

impl<R: RngCore> EconomyEngine<R> {
    /// Creates an engine over an existing ledger and random source.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InvalidConfig`] for invalid settings.
    pub fn new(config: EconomyConfig, ledger: Arc<Ledger>, rng: R) -> EconomyResult<Self> {
        let cooldown = config.free_pack_cooldown()?;
        let catalog = Arc::new(config.catalog);
        let generator = CardGenerator::new(Arc::clone(&catalog), rng);

        Ok(Self {
            catalog,
            cooldown,
            starting_coins: config.starting_coins,
            ledger,
            generator: Mutex::new(generator),
        })
    }

    /// The catalog in use.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The underlying ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Creates the user if needed. Safe to call any number of times.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on store failure.
    pub fn ensure_user(&self, user_id: UserId) -> EconomyResult<()> {
        self.ledger.ensure_user(user_id, self.starting_coins)?;
        Ok(())
    }

    /// Opens the free pack if the cooldown has passed.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CooldownActive`] with the remaining wait if the
    /// last free pack was opened less than one cooldown ago; nothing is written
    /// in that case.
    pub fn open_free_pack(&self, user_id: UserId, now: DateTime<Utc>) -> EconomyResult<PackOpening> {
        self.ensure_user(user_id)?;
        let pack = *self.catalog.free_pack()?;

        let opening = self.ledger.transaction(LockScope::user(user_id), |txn| {
            let ready_at = txn
                .last_pack_time(user_id)?
                .checked_add_signed(self.cooldown)
                .ok_or(EconomyError::ArithmeticOverflow)?;
            if now < ready_at {
                return Err(EconomyError::CooldownActive {
                    remaining: ready_at - now,
                });
            }

            let cards = self.mint_pack(txn, user_id, &pack, now)?;
            txn.set_last_pack_time(user_id, now)?;
            Ok(PackOpening {
                pack: pack.id,
                cards,
                balance: txn.balance(user_id)?,
            })
        })?;

        debug!(user_id, cards = opening.cards.len(), "free pack opened");
        Ok(opening)
    }

    /// Buys a paid pack.
    ///
    /// The balance check and the deduction happen under the user's row lock,
    /// so concurrent purchases by one user serialize and can never overdraw.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownPack`] if `pack_id` is not a paid pack and
    /// [`EconomyError::InsufficientFunds`] if the balance is below the cost.
    pub fn buy_pack(
        &self,
        user_id: UserId,
        pack_id: PackId,
        now: DateTime<Utc>,
    ) -> EconomyResult<PackOpening> {
        let pack = *self.catalog.paid_pack(pack_id)?;
        self.ensure_user(user_id)?;
        let cost = i64::try_from(pack.cost).map_err(|_| EconomyError::ArithmeticOverflow)?;

        let opening = self.ledger.transaction(LockScope::user(user_id), |txn| {
            let balance = txn.balance(user_id)?;
            if balance < pack.cost {
                return Err(EconomyError::InsufficientFunds {
                    balance,
                    cost: pack.cost,
                });
            }

            let balance = txn.delta_balance(user_id, -cost)?;
            let cards = self.mint_pack(txn, user_id, &pack, now)?;
            Ok(PackOpening {
                pack: pack.id,
                cards,
                balance,
            })
        })?;

        debug!(
            user_id,
            pack = %pack.id,
            cost = pack.cost,
            balance = opening.balance,
            "pack bought"
        );
        Ok(opening)
    }

    fn mint_pack(
        &self,
        txn: &mut LedgerTxn<'_>,
        owner: UserId,
        pack: &PackSpec,
        now: DateTime<Utc>,
    ) -> EconomyResult<Vec<Card>> {
        let drafts = self.generator.lock().generate_pack(pack.card_count);
        txn.insert_cards(owner, &drafts, now)
    }

    /// Everything the user owns.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on store failure.
    pub fn list_inventory(&self, user_id: UserId) -> EconomyResult<InventorySummary> {
        self.ensure_user(user_id)?;
        self.ledger.transaction(LockScope::user(user_id), |txn| {
            let cards = txn.select_inventory(user_id)?;
            let total_income_per_hour =
                total_income(&cards).ok_or(EconomyError::ArithmeticOverflow)?;
            Ok(InventorySummary {
                cards,
                total_income_per_hour,
                balance: txn.balance(user_id)?,
            })
        })
    }

    /// Collects income accrued since the user's last claim.
    ///
    /// Fractions of a coin are not carried: the claim clock only moves when at
    /// least one coin is paid out, so they keep accruing until then.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on store failure and
    /// [`EconomyError::ArithmeticOverflow`] if the credit cannot be represented.
    pub fn claim_lazy(&self, user_id: UserId, now: DateTime<Utc>) -> EconomyResult<ClaimOutcome> {
        self.ensure_user(user_id)?;

        let outcome = self.ledger.transaction(LockScope::user(user_id), |txn| {
            let elapsed = (now - txn.last_claim_time(user_id)?).num_seconds();
            let Ok(elapsed) = u64::try_from(elapsed) else {
                return Ok(ClaimOutcome::NothingToClaim);
            };
            if elapsed == 0 {
                return Ok(ClaimOutcome::NothingToClaim);
            }

            let cards = txn.select_inventory(user_id)?;
            let income = total_income(&cards).ok_or(EconomyError::ArithmeticOverflow)?;
            let accrued = u128::from(income) * u128::from(elapsed) / SECS_PER_HOUR;
            if accrued == 0 {
                return Ok(ClaimOutcome::NothingToClaim);
            }

            let amount = u64::try_from(accrued).map_err(|_| EconomyError::ArithmeticOverflow)?;
            let delta = i64::try_from(amount).map_err(|_| EconomyError::ArithmeticOverflow)?;
            let balance = txn.delta_balance(user_id, delta)?;
            txn.set_last_claim_time(user_id, now)?;
            Ok(ClaimOutcome::Credited { amount, balance })
        })?;

        if let ClaimOutcome::Credited { amount, balance } = outcome {
            debug!(user_id, amount, balance, "income claimed");
        }
        Ok(outcome)
    }

    /// Credits every card holder with one hour of income.
    ///
    /// Runs as one atomic pass that no per-user transaction can interleave with.
    /// Claim clocks are not touched.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on store failure; no user is
    /// credited in that case.
    pub fn distribute_batch_income(&self) -> EconomyResult<BatchCredit> {
        let report = self.ledger.credit_income_to_holders()?;
        info!(
            users_credited = report.users_credited,
            total_credited = report.total_credited,
            "batch income distributed"
        );
        Ok(report)
    }

    /// Moves a card from one user to another.
    ///
    /// The recipient is created first. The card row stays locked from the
    /// ownership check until the new owner is committed.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CardNotFound`] if the card does not exist and
    /// [`EconomyError::NotOwner`] if `from` does not own it. The owner is
    /// unchanged on every error.
    pub fn transfer_card(
        &self,
        from: UserId,
        to: UserId,
        card_id: CardId,
    ) -> EconomyResult<TransferReceipt> {
        self.ensure_user(to)?;

        let card = self.ledger.transaction(LockScope::card(card_id), |txn| {
            let card = txn.lock_and_read_card(card_id)?;
            if card.owner_id != from {
                return Err(EconomyError::NotOwner {
                    card_id,
                    owner: card.owner_id,
                    claimed: from,
                });
            }
            txn.reassign_card_owner(card_id, to)?;
            txn.lock_and_read_card(card_id)
        })?;

        debug!(card_id, from, to, "card transferred");
        Ok(TransferReceipt { card, from, to })
    }

    /// Credits coins to a user, creating the user if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::ArithmeticOverflow`] if the balance would
    /// overflow and [`EconomyError::StoreUnavailable`] on store failure.
    pub fn grant_coins(&self, user_id: UserId, amount: u64) -> EconomyResult<u64> {
        self.ensure_user(user_id)?;
        let delta = i64::try_from(amount).map_err(|_| EconomyError::ArithmeticOverflow)?;
        let balance = self
            .ledger
            .transaction(LockScope::user(user_id), |txn| txn.delta_balance(user_id, delta))?;
        debug!(user_id, amount, balance, "coins granted");
        Ok(balance)
    }

    /// Balance and timestamps of one user.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the user was never created.
    pub fn user(&self, user_id: UserId) -> EconomyResult<UserAccount> {
        self.ledger.account(user_id)
    }

    /// One card.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CardNotFound`] if the card does not exist.
    pub fn card(&self, card_id: CardId) -> EconomyResult<Card> {
        self.ledger.card(card_id)
    }

    /// Time left until the free pack can be opened; zero when it is ready.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on store failure.
    pub fn free_pack_ready_in(&self, user_id: UserId, now: DateTime<Utc>) -> EconomyResult<Duration> {
        let last = match self.ledger.account(user_id) {
            Ok(account) => account.last_pack_time,
            Err(EconomyError::UnknownUser(_)) => return Ok(Duration::zero()),
            Err(e) => return Err(e),
        };
        let ready_at = last
            .checked_add_signed(self.cooldown)
            .ok_or(EconomyError::ArithmeticOverflow)?;
        Ok((ready_at - now).max(Duration::zero()))
    }

    /// All packs, free and paid.
    #[must_use]
    pub fn packs(&self) -> &[PackSpec] {
        self.catalog.packs()
    }

    /// Total coins, cards and users.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on store failure.
    pub fn ledger_totals(&self) -> EconomyResult<LedgerTotals> {
        self.ledger.totals()
    }
}

impl<R> std::fmt::Debug for EconomyEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EconomyEngine")
            .field("cooldown_secs", &self.cooldown.num_seconds())
            .field("starting_coins", &self.starting_coins)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::never;
    use crate::catalog::Rarity;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn temp_wal_path() -> std::path::PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_engine_{id}.wal"))
    }

    fn engine() -> EconomyEngine {
        EconomyEngine::with_seed(EconomyConfig::default(), Arc::new(Ledger::in_memory()), 42).unwrap()
    }

    #[test]
    fn test_free_pack_then_cooldown() {
        let engine = engine();
        let t0 = at(1_700_000_000);

        let opening = engine.open_free_pack(1, t0).unwrap();
        assert_eq!(opening.pack, PackId::Free);
        assert_eq!(opening.cards.len(), 3);
        assert_eq!(engine.user(1).unwrap().last_pack_time, t0);

        let err = engine.open_free_pack(1, t0 + Duration::minutes(10)).unwrap_err();
        assert_eq!(
            err,
            EconomyError::CooldownActive {
                remaining: Duration::minutes(20)
            }
        );
        assert_eq!(engine.user(1).unwrap().last_pack_time, t0);
        assert_eq!(engine.list_inventory(1).unwrap().cards.len(), 3);

        let again = engine.open_free_pack(1, t0 + Duration::minutes(30)).unwrap();
        assert_eq!(again.cards.len(), 3);
        assert!(again.cards[0].id > opening.cards[2].id);
    }

    #[test]
    fn test_free_pack_ready_in() {
        let engine = engine();
        let t0 = at(1_700_000_000);
        assert_eq!(engine.free_pack_ready_in(1, t0).unwrap(), Duration::zero());

        engine.open_free_pack(1, t0).unwrap();
        assert_eq!(
            engine.free_pack_ready_in(1, t0 + Duration::minutes(5)).unwrap(),
            Duration::minutes(25)
        );
        assert_eq!(
            engine.free_pack_ready_in(1, t0 + Duration::hours(2)).unwrap(),
            Duration::zero()
        );
    }

    #[test]
    fn test_buy_pack_requires_funds() {
        let engine = engine();
        let err = engine.buy_pack(1, PackId::Small, at(0)).unwrap_err();
        assert_eq!(err, EconomyError::InsufficientFunds { balance: 0, cost: 50 });
        assert_eq!(engine.user(1).unwrap().coins, 0);
        assert!(engine.list_inventory(1).unwrap().cards.is_empty());
    }

    #[test]
    fn test_free_pack_is_not_for_sale() {
        let engine = engine();
        engine.grant_coins(1, 1_000).unwrap();
        assert_eq!(
            engine.buy_pack(1, PackId::Free, at(0)),
            Err(EconomyError::UnknownPack("free".to_string()))
        );
        assert_eq!(engine.user(1).unwrap().coins, 1_000);
    }

    #[test]
    fn test_buy_large_pack() {
        let engine = engine();
        engine.grant_coins(7, 250).unwrap();

        let opening = engine.buy_pack(7, PackId::Large, at(100)).unwrap();
        assert_eq!(opening.balance, 0);
        assert_eq!(opening.cards.len(), 10);
        for card in &opening.cards {
            assert_eq!(card.owner_id, 7);
            assert_eq!(card.created_at, at(100));
            assert_eq!(card.income_per_hour, engine.catalog().income_per_hour(card.rarity));
        }
        assert_eq!(engine.user(7).unwrap().coins, 0);
    }

    #[test]
    fn test_inventory_round_trip() {
        let engine = engine();
        let opened = engine.open_free_pack(3, at(0)).unwrap().cards;
        let inventory = engine.list_inventory(3).unwrap();
        assert_eq!(inventory.cards, opened);
        assert_eq!(
            inventory.total_income_per_hour,
            opened.iter().map(|c| c.income_per_hour).sum::<u64>()
        );
    }

    #[test]
    fn test_claim_lazy_rules() {
        let engine = engine();
        engine.ensure_user(1).unwrap();

        // No cards: nothing accrues and the clock stays put.
        assert_eq!(engine.claim_lazy(1, at(10_000)).unwrap(), ClaimOutcome::NothingToClaim);
        assert_eq!(engine.user(1).unwrap().last_claim_time, never());

        let common = crate::card::CardDraft {
            rarity: Rarity::Common,
            income_per_hour: 1,
        };
        engine
            .ledger()
            .transaction(LockScope::user(1), |txn| {
                txn.set_last_claim_time(1, at(0))?;
                txn.insert_cards(1, &[common], at(0))
            })
            .unwrap();

        // Less than one coin accrued after 30 minutes at 1/h.
        assert_eq!(engine.claim_lazy(1, at(1_800)).unwrap(), ClaimOutcome::NothingToClaim);
        assert_eq!(engine.user(1).unwrap().last_claim_time, at(0));

        // Fractions keep accruing: 1.5 hours pays 1 coin.
        assert_eq!(
            engine.claim_lazy(1, at(5_400)).unwrap(),
            ClaimOutcome::Credited { amount: 1, balance: 1 }
        );
        assert_eq!(engine.user(1).unwrap().last_claim_time, at(5_400));

        // A clock that went backwards yields nothing.
        assert_eq!(engine.claim_lazy(1, at(100)).unwrap(), ClaimOutcome::NothingToClaim);
        assert_eq!(engine.user(1).unwrap().last_claim_time, at(5_400));
    }

    #[test]
    fn test_transfer_card() {
        let engine = engine();
        let card = engine.open_free_pack(1, at(0)).unwrap().cards[0];

        let err = engine.transfer_card(2, 3, card.id).unwrap_err();
        assert_eq!(
            err,
            EconomyError::NotOwner {
                card_id: card.id,
                owner: 1,
                claimed: 2
            }
        );
        assert_eq!(engine.card(card.id).unwrap().owner_id, 1);

        let receipt = engine.transfer_card(1, 2, card.id).unwrap();
        assert_eq!(receipt.card.owner_id, 2);
        assert_eq!(engine.card(card.id).unwrap().owner_id, 2);
        assert_eq!(engine.list_inventory(2).unwrap().cards, vec![receipt.card]);

        assert_eq!(
            engine.transfer_card(1, 2, 9_999),
            Err(EconomyError::CardNotFound(9_999))
        );
    }

    #[test]
    fn test_starting_coins_apply_once() {
        let config = EconomyConfig {
            starting_coins: 100,
            ..EconomyConfig::default()
        };
        let engine = EconomyEngine::with_seed(config, Arc::new(Ledger::in_memory()), 1).unwrap();
        engine.ensure_user(5).unwrap();
        engine.ensure_user(5).unwrap();
        assert_eq!(engine.user(5).unwrap().coins, 100);
        assert_eq!(engine.ledger_totals().unwrap().coins, 100);
    }

    #[test]
    fn test_log_failure_rolls_back_purchase() {
        let path = temp_wal_path();
        let config = crate::config::LedgerConfig::durable(&path);
        {
            let ledger = Arc::new(Ledger::open(&config).unwrap());
            let engine = EconomyEngine::with_seed(EconomyConfig::default(), ledger, 5).unwrap();
            engine.grant_coins(1, 100).unwrap();
            let wal = engine.ledger().wal().unwrap();
            let logged = wal.size_bytes();

            wal.set_fail_appends(true);
            let err = engine.buy_pack(1, PackId::Small, at(0)).unwrap_err();
            assert!(matches!(err, EconomyError::StoreUnavailable(_)));
            assert!(err.is_transient());
            assert_eq!(wal.size_bytes(), logged);
            assert_eq!(std::fs::metadata(&path).unwrap().len(), logged);

            let inventory = engine.list_inventory(1).unwrap();
            assert_eq!(inventory.balance, 100);
            assert!(inventory.cards.is_empty());
            assert_eq!(engine.ledger_totals().unwrap().cards, 0);

            wal.set_fail_appends(false);
            let opening = engine.buy_pack(1, PackId::Small, at(0)).unwrap();
            assert_eq!(opening.balance, 50);
        }
        {
            let ledger = Arc::new(Ledger::open(&config).unwrap());
            let engine = EconomyEngine::with_seed(EconomyConfig::default(), ledger, 6).unwrap();
            let inventory = engine.list_inventory(1).unwrap();
            assert_eq!(inventory.balance, 50);
            assert_eq!(inventory.cards.len(), 3);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_same_seed_same_packs() {
        let first = engine().open_free_pack(1, at(0)).unwrap();
        let second = engine().open_free_pack(1, at(0)).unwrap();
        assert_eq!(first, second);
    }
}
