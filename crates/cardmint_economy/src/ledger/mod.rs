//! # Ledger Store
//!
//! **Row-locked balances, timestamps and card ownership**
//!
//! Every user and every card is a row behind its own lock. Read-modify-write
//! sequences run inside a scoped transaction ([`Ledger::transaction`]) that
//! locks exactly the rows it names, stages its writes, and commits them through
//! the write-ahead log before making them visible.
//!
//! ## Locking
//!
//! ```text
//! statement lock (RwLock)     shared by row transactions, exclusive for set-based passes
//!   └─ user rows              ascending user id
//!        └─ card rows         ascending card id
//! ```
//!
//! Locks are always taken in this order, so two transactions can never wait on
//! each other in a cycle. The tables themselves (user map, card map, owner
//! index) are only held for lookups and inserts, never while waiting on a row.
//! Every wait is bounded by the configured lock timeout; a timeout fails the
//! operation with [`EconomyError::StoreUnavailable`] and nothing is written.

pub mod txn;
pub mod wal;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::card::{Card, CardId, UserAccount, UserId};
use crate::config::LedgerConfig;
use crate::error::{EconomyError, EconomyResult};

pub use txn::{LedgerTxn, LockScope};
pub use wal::{LedgerOp, Recovered, WriteAheadLog};

type UserRow = Arc<Mutex<UserAccount>>;
type CardRow = Arc<Mutex<Card>>;
type OwnerIndex = HashMap<UserId, BTreeSet<CardId>>;

/// Outcome of a set-based income pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchCredit {
    /// Users whose balance changed.
    pub users_credited: usize,
    /// Coins added across all users.
    pub total_credited: u64,
}

/// Population-wide sums, read under the exclusive statement lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LedgerTotals {
    /// Number of users.
    pub users: usize,
    /// Number of cards.
    pub cards: usize,
    /// Sum of every balance.
    pub coins: u128,
}

/// The ledger store.
pub struct Ledger {
    /// Shared by row transactions, exclusive for population-wide passes.
    statement: RwLock<()>,
    /// User rows by id.
    users: RwLock<HashMap<UserId, UserRow>>,
    /// Card rows by id (ordered, so scans return ascending ids).
    cards: RwLock<BTreeMap<CardId, CardRow>>,
    /// Card ids per owner; follows every committed insert and reassignment.
    owners: RwLock<OwnerIndex>,
    /// Next card id to hand out.
    next_card_id: AtomicU64,
    /// Bound on every lock wait.
    lock_timeout: Duration,
    /// Durable log; `None` for an in-memory ledger.
    wal: Option<WriteAheadLog>,
}

impl Ledger {
    fn empty(lock_timeout: Duration, wal: Option<WriteAheadLog>) -> Self {
        Self {
            statement: RwLock::new(()),
            users: RwLock::new(HashMap::new()),
            cards: RwLock::new(BTreeMap::new()),
            owners: RwLock::new(HashMap::new()),
            next_card_id: AtomicU64::new(1),
            lock_timeout,
            wal,
        }
    }

    /// An in-memory ledger with default settings.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::empty(LedgerConfig::in_memory().lock_timeout(), None)
    }

    /// Opens a ledger, replaying its write-ahead log if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] if the log cannot be read and
    /// [`EconomyError::InvalidConfig`] if it is not a ledger log.
    pub fn open(config: &LedgerConfig) -> EconomyResult<Self> {
        let Some(path) = &config.wal_path else {
            return Ok(Self::empty(config.lock_timeout(), None));
        };

        let (wal, recovered) = WriteAheadLog::open(path, config.sync_on_commit)?;
        let mut ledger = Self::empty(config.lock_timeout(), Some(wal));
        ledger.replay(recovered.ops);
        Ok(ledger)
    }

    fn replay(&mut self, ops: Vec<LedgerOp>) {
        let users = self.users.get_mut();
        let cards = self.cards.get_mut();
        let owners = self.owners.get_mut();
        for op in ops {
            match op {
                LedgerOp::PutUser(account) => {
                    users.insert(account.id, Arc::new(Mutex::new(account)));
                }
                LedgerOp::PutCard(card) => {
                    let previous = cards.insert(card.id, Arc::new(Mutex::new(card)));
                    if let Some(previous) = previous {
                        unindex_card(owners, previous.lock().owner_id, card.id);
                    }
                    index_card(owners, card.owner_id, card.id);
                }
            }
        }
        let next = cards.keys().next_back().map_or(1, |max| max + 1);
        *self.next_card_id.get_mut() = next;
        debug!(users = users.len(), cards = cards.len(), next_card_id = next, "ledger replayed");
    }

    /// Bound on every lock wait.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Creates a user row if it does not exist yet.
    ///
    /// Returns `true` if the row was created, `false` if it already existed.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on lock timeout or log failure;
    /// the row is not created in that case.
    pub fn ensure_user(&self, user_id: UserId, starting_coins: u64) -> EconomyResult<bool> {
        let _statement = self
            .statement
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| timed_out("statement lock"))?;

        {
            let users = self
                .users
                .try_read_for(self.lock_timeout)
                .ok_or_else(|| timed_out("user table"))?;
            if users.contains_key(&user_id) {
                return Ok(false);
            }
        }

        let mut users = self
            .users
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| timed_out("user table"))?;
        if users.contains_key(&user_id) {
            return Ok(false);
        }

        let account = UserAccount::new(user_id, starting_coins);
        self.log(&[LedgerOp::PutUser(account)])?;
        users.insert(user_id, Arc::new(Mutex::new(account)));
        debug!(user_id, starting_coins, "user created");
        Ok(true)
    }

    /// Runs `body` as one atomic transaction over the rows named in `scope`.
    ///
    /// The rows are locked before `body` runs and stay locked until the
    /// transaction ends. Writes made through the [`LedgerTxn`] are staged; if
    /// `body` returns `Ok` they are logged and applied together, if it returns
    /// `Err` (or the log append fails) they are discarded. Locks are released on
    /// every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] / [`EconomyError::CardNotFound`] for
    /// rows that do not exist, [`EconomyError::StoreUnavailable`] on lock
    /// timeout or log failure, and any error returned by `body`.
    pub fn transaction<T, F>(&self, scope: LockScope, body: F) -> EconomyResult<T>
    where
        F: FnOnce(&mut LedgerTxn<'_>) -> EconomyResult<T>,
    {
        let scope = scope.normalized();

        let _statement = self
            .statement
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| timed_out("statement lock"))?;

        let user_rows = scope
            .users()
            .iter()
            .map(|&id| self.user_row(id).map(|row| (id, row)))
            .collect::<EconomyResult<Vec<_>>>()?;
        let card_rows = scope
            .cards()
            .iter()
            .map(|&id| self.card_row(id).map(|row| (id, row)))
            .collect::<EconomyResult<Vec<_>>>()?;

        let mut txn = LedgerTxn::begin(self, &user_rows, &card_rows)?;

        let value = match body(&mut txn) {
            Ok(value) => value,
            Err(e) => {
                debug!(error = %e, "transaction rolled back");
                return Err(e);
            }
        };

        if let Err(e) = txn.commit() {
            warn!(error = %e, "transaction rolled back at commit");
            return Err(e);
        }
        Ok(value)
    }

    /// Credits every card holder with their total income per hour.
    ///
    /// One set-based pass: it holds the statement lock exclusively, so it sees
    /// every row at the same instant and no row transaction can interleave with
    /// it. All credits are logged as one transaction; either every holder is
    /// credited or none is. Users without income are not touched.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on lock timeout or log failure
    /// and [`EconomyError::ArithmeticOverflow`] if a balance would overflow.
    pub fn credit_income_to_holders(&self) -> EconomyResult<BatchCredit> {
        let _statement = self
            .statement
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| timed_out("statement lock (exclusive)"))?;

        let mut income: BTreeMap<UserId, u64> = BTreeMap::new();
        for (id, row) in self.card_rows_snapshot()? {
            let card = *self.lock_row(&row, CardLabel(id))?;
            let total = income.entry(card.owner_id).or_insert(0);
            *total = total
                .checked_add(card.income_per_hour)
                .ok_or(EconomyError::ArithmeticOverflow)?;
        }

        let mut updates = Vec::with_capacity(income.len());
        let mut total_credited = 0u64;
        for (user_id, amount) in income {
            if amount == 0 {
                continue;
            }
            let row = self.user_row(user_id)?;
            let account = *self.lock_row(&row, UserLabel(user_id))?;
            let coins = account
                .coins
                .checked_add(amount)
                .ok_or(EconomyError::ArithmeticOverflow)?;
            total_credited = total_credited
                .checked_add(amount)
                .ok_or(EconomyError::ArithmeticOverflow)?;
            updates.push((row, UserAccount { coins, ..account }));
        }

        if !updates.is_empty() {
            let ops: Vec<LedgerOp> = updates
                .iter()
                .map(|(_, account)| LedgerOp::PutUser(*account))
                .collect();
            self.log(&ops)?;
            for (row, account) in &updates {
                *row.lock() = *account;
            }
        }

        Ok(BatchCredit {
            users_credited: updates.len(),
            total_credited,
        })
    }

    /// Reads one user row.
    ///
    /// Waits out a running set-based pass, so a batch credit is seen whole or
    /// not at all.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the user was never created and
    /// [`EconomyError::StoreUnavailable`] on lock timeout.
    pub fn account(&self, user_id: UserId) -> EconomyResult<UserAccount> {
        let _statement = self.shared_statement()?;
        let row = self.user_row(user_id)?;
        let account = *self.lock_row(&row, UserLabel(user_id))?;
        Ok(account)
    }

    /// Reads one card row.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CardNotFound`] if no such card exists and
    /// [`EconomyError::StoreUnavailable`] on lock timeout.
    pub fn card(&self, card_id: CardId) -> EconomyResult<Card> {
        let _statement = self.shared_statement()?;
        let row = self.card_row(card_id)?;
        let card = *self.lock_row(&row, CardLabel(card_id))?;
        Ok(card)
    }

    /// All cards currently owned by `owner`, ascending by id.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on lock timeout.
    pub fn cards_owned_by(&self, owner: UserId) -> EconomyResult<Vec<Card>> {
        let _statement = self.shared_statement()?;
        self.owned_cards(owner, &[])
    }

    /// Population-wide sums at a single instant.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on lock timeout.
    pub fn totals(&self) -> EconomyResult<LedgerTotals> {
        let _statement = self
            .statement
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| timed_out("statement lock (exclusive)"))?;

        let users = self.user_rows_snapshot()?;
        let cards = self.card_rows_snapshot()?;
        let coins = users
            .iter()
            .map(|(_, row)| u128::from(row.lock().coins))
            .sum();

        Ok(LedgerTotals {
            users: users.len(),
            cards: cards.len(),
            coins,
        })
    }

    /// Rewrites the log as one snapshot of the current state.
    ///
    /// A no-op for in-memory ledgers.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on lock timeout or I/O
    /// failure; the previous log stays valid.
    pub fn checkpoint(&self) -> EconomyResult<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };

        let _statement = self
            .statement
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| timed_out("statement lock (exclusive)"))?;

        let mut users = self.user_rows_snapshot()?;
        users.sort_by_key(|(id, _)| *id);

        let mut ops: Vec<LedgerOp> = users
            .iter()
            .map(|(_, row)| LedgerOp::PutUser(*row.lock()))
            .collect();
        ops.extend(
            self.card_rows_snapshot()?
                .iter()
                .map(|(_, row)| LedgerOp::PutCard(*row.lock())),
        );

        let before = wal.size_bytes();
        wal.rewrite(&ops)?;
        info!(
            rows = ops.len(),
            bytes_before = before,
            bytes_after = wal.size_bytes(),
            "ledger checkpoint written"
        );
        Ok(())
    }

    /// The write-ahead log, if this ledger is durable.
    #[must_use]
    pub const fn wal(&self) -> Option<&WriteAheadLog> {
        self.wal.as_ref()
    }

    fn log(&self, ops: &[LedgerOp]) -> EconomyResult<()> {
        if let Some(wal) = &self.wal {
            wal.append(ops)?;
        }
        Ok(())
    }

    fn user_row(&self, user_id: UserId) -> EconomyResult<UserRow> {
        self.users
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| timed_out("user table"))?
            .get(&user_id)
            .cloned()
            .ok_or(EconomyError::UnknownUser(user_id))
    }

    fn card_row(&self, card_id: CardId) -> EconomyResult<CardRow> {
        self.cards
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| timed_out("card table"))?
            .get(&card_id)
            .cloned()
            .ok_or(EconomyError::CardNotFound(card_id))
    }

    fn user_rows_snapshot(&self) -> EconomyResult<Vec<(UserId, UserRow)>> {
        let users = self
            .users
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| timed_out("user table"))?;
        Ok(users.iter().map(|(id, row)| (*id, Arc::clone(row))).collect())
    }

    fn card_rows_snapshot(&self) -> EconomyResult<Vec<(CardId, CardRow)>> {
        let cards = self
            .cards
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| timed_out("card table"))?;
        Ok(cards.iter().map(|(id, row)| (*id, Arc::clone(row))).collect())
    }

    fn lock_row<'r, T>(
        &self,
        row: &'r Mutex<T>,
        label: impl Display,
    ) -> EconomyResult<parking_lot::MutexGuard<'r, T>> {
        row.try_lock_for(self.lock_timeout)
            .ok_or_else(|| timed_out(label))
    }

    fn shared_statement(&self) -> EconomyResult<RwLockReadGuard<'_, ()>> {
        self.statement
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| timed_out("statement lock"))
    }

    /// Committed cards owned by `owner`, ascending by id, skipping ids the
    /// caller already holds locked.
    ///
    /// Only the rows the owner index names are locked, each just while it is
    /// read. A card moved away between the index lookup and the row lock is
    /// dropped by the owner re-check.
    fn owned_cards(&self, owner: UserId, skip: &[CardId]) -> EconomyResult<Vec<Card>> {
        let ids: Vec<CardId> = self
            .owners
            .try_read_for(self.lock_timeout)
            .ok_or_else(|| timed_out("owner index"))?
            .get(&owner)
            .map(|ids| ids.iter().copied().filter(|id| !skip.contains(id)).collect())
            .unwrap_or_default();

        let mut owned = Vec::with_capacity(ids.len());
        for id in ids {
            let row = self.card_row(id)?;
            let card = *self.lock_row(&row, CardLabel(id))?;
            if card.owner_id == owner {
                owned.push(card);
            }
        }
        Ok(owned)
    }

    fn allocate_card_ids(&self, count: u64) -> EconomyResult<CardId> {
        self.next_card_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| next.checked_add(count))
            .map_err(|_| EconomyError::ArithmeticOverflow)
    }

    fn write_cards(&self) -> EconomyResult<RwLockWriteGuard<'_, BTreeMap<CardId, CardRow>>> {
        self.cards
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| timed_out("card table"))
    }

    fn write_owners(&self) -> EconomyResult<RwLockWriteGuard<'_, OwnerIndex>> {
        self.owners
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| timed_out("owner index"))
    }
}

fn index_card(owners: &mut OwnerIndex, owner: UserId, card_id: CardId) {
    owners.entry(owner).or_default().insert(card_id);
}

fn unindex_card(owners: &mut OwnerIndex, owner: UserId, card_id: CardId) {
    if let Some(ids) = owners.get_mut(&owner) {
        ids.remove(&card_id);
        if ids.is_empty() {
            owners.remove(&owner);
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("next_card_id", &self.next_card_id.load(Ordering::Relaxed))
            .field("lock_timeout", &self.lock_timeout)
            .field("wal", &self.wal)
            .finish_non_exhaustive()
    }
}

struct UserLabel(UserId);

impl Display for UserLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user row {}", self.0)
    }
}

struct CardLabel(CardId);

impl Display for CardLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "card row {}", self.0)
    }
}

fn timed_out(what: impl Display) -> EconomyError {
    EconomyError::StoreUnavailable(format!("timed out waiting for {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::CardDraft;
    use crate::catalog::Rarity;
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;
    use std::thread;

    fn temp_wal_path() -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_ledger_{id}.wal"))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn draft(rarity: Rarity, income_per_hour: u64) -> CardDraft {
        CardDraft {
            rarity,
            income_per_hour,
        }
    }

    fn give_cards(ledger: &Ledger, owner: UserId, incomes: &[u64]) -> Vec<Card> {
        let drafts: Vec<CardDraft> = incomes.iter().map(|&i| draft(Rarity::Common, i)).collect();
        ledger
            .transaction(LockScope::user(owner), |txn| txn.insert_cards(owner, &drafts, at(0)))
            .unwrap()
    }

    #[test]
    fn test_ensure_user_is_idempotent() {
        let ledger = Ledger::in_memory();
        assert!(ledger.ensure_user(1, 100).unwrap());
        assert!(!ledger.ensure_user(1, 5_000).unwrap());
        assert_eq!(ledger.account(1).unwrap(), UserAccount::new(1, 100));
    }

    #[test]
    fn test_unknown_rows() {
        let ledger = Ledger::in_memory();
        assert_eq!(ledger.account(9), Err(EconomyError::UnknownUser(9)));
        assert_eq!(ledger.card(9), Err(EconomyError::CardNotFound(9)));
        let result = ledger.transaction(LockScope::user(9), |_| Ok(()));
        assert_eq!(result, Err(EconomyError::UnknownUser(9)));
    }

    #[test]
    fn test_card_ids_are_monotonic() {
        let ledger = Ledger::in_memory();
        ledger.ensure_user(1, 0).unwrap();
        let first = give_cards(&ledger, 1, &[1, 1]);
        let second = give_cards(&ledger, 1, &[3]);
        assert_eq!(
            first.iter().chain(&second).map(|c| c.id).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(ledger.cards_owned_by(1).unwrap().len(), 3);
    }

    #[test]
    fn test_failed_body_rolls_back_everything() {
        let ledger = Ledger::in_memory();
        ledger.ensure_user(1, 100).unwrap();

        let result: EconomyResult<()> = ledger.transaction(LockScope::user(1), |txn| {
            txn.delta_balance(1, -60)?;
            txn.insert_cards(1, &[draft(Rarity::Rare, 3)], at(10))?;
            txn.set_last_pack_time(1, at(10))?;
            Err(EconomyError::StoreUnavailable("injected".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(ledger.account(1).unwrap(), UserAccount::new(1, 100));
        assert!(ledger.cards_owned_by(1).unwrap().is_empty());
    }

    #[test]
    fn test_lock_timeout_fails_cleanly() {
        let ledger = Arc::new(Ledger::empty(Duration::from_millis(50), None));
        ledger.ensure_user(1, 10).unwrap();

        let holder = Arc::clone(&ledger);
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            holder
                .transaction(LockScope::user(1), |txn| {
                    txn.delta_balance(1, 5)?;
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        });

        locked_rx.recv().unwrap();
        let blocked = ledger.transaction(LockScope::user(1), |txn| txn.delta_balance(1, -10));
        assert!(matches!(blocked, Err(EconomyError::StoreUnavailable(_))));

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert_eq!(ledger.account(1).unwrap().coins, 15);
    }

    #[test]
    fn test_inventory_ignores_other_users_locked_cards() {
        let ledger = Arc::new(Ledger::empty(Duration::from_millis(50), None));
        ledger.ensure_user(1, 0).unwrap();
        ledger.ensure_user(2, 0).unwrap();
        let mine = give_cards(&ledger, 1, &[1, 3]);
        let theirs = give_cards(&ledger, 2, &[8]);

        let holder = Arc::clone(&ledger);
        let busy_card = theirs[0].id;
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            holder
                .transaction(LockScope::card(busy_card), |txn| {
                    txn.reassign_card_owner(busy_card, 3)?;
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    Ok(())
                })
                .unwrap();
        });

        locked_rx.recv().unwrap();
        assert_eq!(ledger.cards_owned_by(1).unwrap(), mine);
        let seen = ledger
            .transaction(LockScope::user(1), |txn| txn.select_inventory(1))
            .unwrap();
        assert_eq!(seen, mine);

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert!(ledger.cards_owned_by(2).unwrap().is_empty());
        assert_eq!(ledger.cards_owned_by(3).unwrap()[0].id, busy_card);
    }

    #[test]
    fn test_failed_log_append_creates_nothing() {
        let path = temp_wal_path();
        let ledger = Ledger::open(&LedgerConfig::durable(&path)).unwrap();
        ledger.ensure_user(1, 5).unwrap();

        ledger.wal().unwrap().set_fail_appends(true);
        assert!(matches!(ledger.ensure_user(2, 5), Err(EconomyError::StoreUnavailable(_))));
        let result = ledger.transaction(LockScope::user(1), |txn| {
            txn.delta_balance(1, 10)?;
            txn.insert_cards(1, &[draft(Rarity::Legendary, 20)], at(0))
        });
        assert!(matches!(result, Err(EconomyError::StoreUnavailable(_))));

        assert_eq!(ledger.account(2), Err(EconomyError::UnknownUser(2)));
        assert_eq!(ledger.account(1).unwrap().coins, 5);
        assert!(ledger.cards_owned_by(1).unwrap().is_empty());
        assert_eq!(ledger.totals().unwrap().cards, 0);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_busy_card_table_fails_before_logging() {
        let path = temp_wal_path();
        let config = LedgerConfig {
            lock_timeout_ms: 50,
            ..LedgerConfig::durable(&path)
        };
        let ledger = Ledger::open(&config).unwrap();
        ledger.ensure_user(1, 5).unwrap();
        let logged = ledger.wal().unwrap().size_bytes();

        let table = ledger.cards.read();
        let result = ledger.transaction(LockScope::user(1), |txn| {
            txn.delta_balance(1, 10)?;
            txn.insert_cards(1, &[draft(Rarity::Rare, 3)], at(0))
        });
        assert!(matches!(result, Err(EconomyError::StoreUnavailable(_))));
        drop(table);

        assert_eq!(ledger.wal().unwrap().size_bytes(), logged);
        assert_eq!(ledger.account(1).unwrap().coins, 5);
        assert!(ledger.cards_owned_by(1).unwrap().is_empty());

        let cards = give_cards(&ledger, 1, &[3]);
        drop(ledger);
        let reopened = Ledger::open(&config).unwrap();
        assert_eq!(reopened.cards_owned_by(1).unwrap(), cards);
        assert_eq!(reopened.account(1).unwrap().coins, 5);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_reads_wait_for_batch_pass() {
        let ledger = Arc::new(Ledger::empty(Duration::from_millis(50), None));
        ledger.ensure_user(1, 0).unwrap();
        give_cards(&ledger, 1, &[3]);

        let statement = ledger.statement.write();
        assert!(matches!(ledger.account(1), Err(EconomyError::StoreUnavailable(_))));
        assert!(matches!(ledger.card(1), Err(EconomyError::StoreUnavailable(_))));
        assert!(matches!(ledger.cards_owned_by(1), Err(EconomyError::StoreUnavailable(_))));
        drop(statement);

        assert_eq!(ledger.account(1).unwrap().coins, 0);
    }

    #[test]
    fn test_credit_income_to_holders() {
        let ledger = Ledger::in_memory();
        for user in 1..=4 {
            ledger.ensure_user(user, 10).unwrap();
        }
        give_cards(&ledger, 1, &[1]);
        give_cards(&ledger, 3, &[1, 1, 3]);
        give_cards(&ledger, 4, &[0]);

        let report = ledger.credit_income_to_holders().unwrap();
        assert_eq!(
            report,
            BatchCredit {
                users_credited: 2,
                total_credited: 6
            }
        );
        assert_eq!(ledger.account(1).unwrap().coins, 11);
        assert_eq!(ledger.account(2).unwrap().coins, 10);
        assert_eq!(ledger.account(3).unwrap().coins, 15);
        assert_eq!(ledger.account(4).unwrap().coins, 10);
        assert_eq!(ledger.account(3).unwrap().last_claim_time, crate::card::never());
    }

    #[test]
    fn test_totals() {
        let ledger = Ledger::in_memory();
        ledger.ensure_user(1, 40).unwrap();
        ledger.ensure_user(2, 2).unwrap();
        give_cards(&ledger, 2, &[1, 3]);
        assert_eq!(
            ledger.totals().unwrap(),
            LedgerTotals {
                users: 2,
                cards: 2,
                coins: 42
            }
        );
    }

    #[test]
    fn test_durable_ledger_survives_reopen() {
        let path = temp_wal_path();
        let config = LedgerConfig::durable(&path);
        let cards;
        {
            let ledger = Ledger::open(&config).unwrap();
            ledger.ensure_user(1, 300).unwrap();
            ledger.ensure_user(2, 0).unwrap();
            cards = ledger
                .transaction(LockScope::user(1), |txn| {
                    txn.delta_balance(1, -250)?;
                    txn.insert_cards(1, &[draft(Rarity::Epic, 8), draft(Rarity::Common, 1)], at(5))
                })
                .unwrap();
            ledger
                .transaction(LockScope::card(cards[0].id), |txn| {
                    txn.reassign_card_owner(cards[0].id, 2)
                })
                .unwrap();
        }
        {
            let ledger = Ledger::open(&config).unwrap();
            assert_eq!(ledger.account(1).unwrap().coins, 50);
            assert_eq!(ledger.card(cards[0].id).unwrap().owner_id, 2);
            assert_eq!(ledger.cards_owned_by(1).unwrap(), vec![cards[1]]);

            // Ids continue after the highest replayed card.
            ledger.ensure_user(3, 0).unwrap();
            let more = give_cards(&ledger, 3, &[1]);
            assert_eq!(more[0].id, cards[1].id + 1);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_checkpoint_preserves_state() {
        let path = temp_wal_path();
        let config = LedgerConfig {
            sync_on_commit: false,
            ..LedgerConfig::durable(&path)
        };
        {
            let ledger = Ledger::open(&config).unwrap();
            ledger.ensure_user(1, 0).unwrap();
            for _ in 0..20 {
                ledger
                    .transaction(LockScope::user(1), |txn| txn.delta_balance(1, 5))
                    .unwrap();
            }
            give_cards(&ledger, 1, &[3, 8]);
            let before = ledger.wal().unwrap().size_bytes();
            ledger.checkpoint().unwrap();
            assert!(ledger.wal().unwrap().size_bytes() < before);
            ledger
                .transaction(LockScope::user(1), |txn| txn.delta_balance(1, 1))
                .unwrap();
        }
        {
            let ledger = Ledger::open(&config).unwrap();
            assert_eq!(ledger.account(1).unwrap().coins, 101);
            assert_eq!(ledger.cards_owned_by(1).unwrap().len(), 2);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_in_memory_checkpoint_is_noop() {
        let ledger = Ledger::in_memory();
        assert!(ledger.wal().is_none());
        ledger.checkpoint().unwrap();
    }
}
