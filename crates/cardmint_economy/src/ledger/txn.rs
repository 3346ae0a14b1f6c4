//! Scoped row transactions.
//!
//! A [`LedgerTxn`] holds the row locks named by its [`LockScope`] and a staged
//! copy of each locked row. Primitives read and write the staged copies; the
//! ledger commits them only if the transaction body succeeds.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tracing::debug;

use super::{CardRow, Ledger, LedgerOp, UserRow};
use crate::card::{Card, CardDraft, CardId, UserAccount, UserId};
use crate::error::{EconomyError, EconomyResult};

/// The rows a transaction locks up front.
///
/// Ids are sorted and deduplicated before locking, so any two scopes lock
/// their common rows in the same order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockScope {
    users: Vec<UserId>,
    cards: Vec<CardId>,
}

impl LockScope {
    /// An empty scope.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            users: Vec::new(),
            cards: Vec::new(),
        }
    }

    /// A scope over one user row.
    #[must_use]
    pub fn user(user_id: UserId) -> Self {
        Self::new().with_user(user_id)
    }

    /// A scope over one card row.
    #[must_use]
    pub fn card(card_id: CardId) -> Self {
        Self::new().with_card(card_id)
    }

    /// Adds a user row.
    #[must_use]
    pub fn with_user(mut self, user_id: UserId) -> Self {
        self.users.push(user_id);
        self
    }

    /// Adds a card row.
    #[must_use]
    pub fn with_card(mut self, card_id: CardId) -> Self {
        self.cards.push(card_id);
        self
    }

    /// User ids in lock order.
    #[must_use]
    pub fn users(&self) -> &[UserId] {
        &self.users
    }

    /// Card ids in lock order.
    #[must_use]
    pub fn cards(&self) -> &[CardId] {
        &self.cards
    }

    pub(super) fn normalized(mut self) -> Self {
        self.users.sort_unstable();
        self.users.dedup();
        self.cards.sort_unstable();
        self.cards.dedup();
        self
    }
}

struct Slot<'a, T> {
    guard: MutexGuard<'a, T>,
    staged: T,
}

/// An open transaction over a fixed set of locked rows.
///
/// Created by [`Ledger::transaction`]. Nothing written through it is visible
/// to other callers until the transaction commits.
pub struct LedgerTxn<'a> {
    ledger: &'a Ledger,
    users: Vec<(UserId, Slot<'a, UserAccount>)>,
    cards: Vec<(CardId, Slot<'a, Card>)>,
    new_cards: Vec<Card>,
}

impl<'a> LedgerTxn<'a> {
    pub(super) fn begin(
        ledger: &'a Ledger,
        user_rows: &'a [(UserId, UserRow)],
        card_rows: &'a [(CardId, CardRow)],
    ) -> EconomyResult<Self> {
        let mut users = Vec::with_capacity(user_rows.len());
        for (id, row) in user_rows {
            let guard = ledger.lock_row(row, super::UserLabel(*id))?;
            let staged = *guard;
            users.push((*id, Slot { guard, staged }));
        }

        let mut cards = Vec::with_capacity(card_rows.len());
        for (id, row) in card_rows {
            let guard = ledger.lock_row(row, super::CardLabel(*id))?;
            let staged = *guard;
            cards.push((*id, Slot { guard, staged }));
        }

        Ok(Self {
            ledger,
            users,
            cards,
            new_cards: Vec::new(),
        })
    }

    fn user(&self, user_id: UserId) -> EconomyResult<&UserAccount> {
        self.users
            .iter()
            .find(|(id, _)| *id == user_id)
            .map(|(_, slot)| &slot.staged)
            .ok_or(EconomyError::UnknownUser(user_id))
    }

    fn user_mut(&mut self, user_id: UserId) -> EconomyResult<&mut UserAccount> {
        self.users
            .iter_mut()
            .find(|(id, _)| *id == user_id)
            .map(|(_, slot)| &mut slot.staged)
            .ok_or(EconomyError::UnknownUser(user_id))
    }

    fn card_mut(&mut self, card_id: CardId) -> EconomyResult<&mut Card> {
        self.cards
            .iter_mut()
            .find(|(id, _)| *id == card_id)
            .map(|(_, slot)| &mut slot.staged)
            .ok_or(EconomyError::CardNotFound(card_id))
    }

    /// The staged account of a locked user.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the user is not in scope.
    pub fn account(&self, user_id: UserId) -> EconomyResult<UserAccount> {
        self.user(user_id).copied()
    }

    /// Current balance of a locked user.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the user is not in scope.
    pub fn balance(&self, user_id: UserId) -> EconomyResult<u64> {
        self.user(user_id).map(|account| account.coins)
    }

    /// Adds a signed amount to a locked user's balance and returns the new
    /// balance.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::InsufficientFunds`] if the balance would go
    /// negative, [`EconomyError::ArithmeticOverflow`] if it would overflow and
    /// [`EconomyError::UnknownUser`] if the user is not in scope.
    pub fn delta_balance(&mut self, user_id: UserId, amount: i64) -> EconomyResult<u64> {
        let account = self.user_mut(user_id)?;
        let magnitude = amount.unsigned_abs();
        let coins = if amount >= 0 {
            account
                .coins
                .checked_add(magnitude)
                .ok_or(EconomyError::ArithmeticOverflow)?
        } else {
            account
                .coins
                .checked_sub(magnitude)
                .ok_or(EconomyError::InsufficientFunds {
                    balance: account.coins,
                    cost: magnitude,
                })?
        };
        account.coins = coins;
        Ok(coins)
    }

    /// Last free pack time of a locked user.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the user is not in scope.
    pub fn last_pack_time(&self, user_id: UserId) -> EconomyResult<DateTime<Utc>> {
        self.user(user_id).map(|account| account.last_pack_time)
    }

    /// Records a free pack opening.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the user is not in scope.
    pub fn set_last_pack_time(&mut self, user_id: UserId, at: DateTime<Utc>) -> EconomyResult<()> {
        self.user_mut(user_id)?.last_pack_time = at;
        Ok(())
    }

    /// Last lazy claim time of a locked user.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the user is not in scope.
    pub fn last_claim_time(&self, user_id: UserId) -> EconomyResult<DateTime<Utc>> {
        self.user(user_id).map(|account| account.last_claim_time)
    }

    /// Records a lazy claim.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the user is not in scope.
    pub fn set_last_claim_time(&mut self, user_id: UserId, at: DateTime<Utc>) -> EconomyResult<()> {
        self.user_mut(user_id)?.last_claim_time = at;
        Ok(())
    }

    /// Creates cards for a locked owner and returns them with their new ids.
    ///
    /// Ids are reserved immediately; if the transaction rolls back they are
    /// skipped, never reused.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::UnknownUser`] if the owner is not in scope and
    /// [`EconomyError::ArithmeticOverflow`] if the id space is exhausted.
    pub fn insert_cards(
        &mut self,
        owner: UserId,
        drafts: &[CardDraft],
        created_at: DateTime<Utc>,
    ) -> EconomyResult<Vec<Card>> {
        self.user(owner)?;
        if drafts.is_empty() {
            return Ok(Vec::new());
        }

        let count = u64::try_from(drafts.len()).map_err(|_| EconomyError::ArithmeticOverflow)?;
        let first = self.ledger.allocate_card_ids(count)?;
        let minted: Vec<Card> = drafts
            .iter()
            .zip(first..)
            .map(|(draft, id)| Card::mint(id, owner, *draft, created_at))
            .collect();
        self.new_cards.extend_from_slice(&minted);
        Ok(minted)
    }

    /// Every card `owner` holds as seen by this transaction, ascending by id.
    ///
    /// Includes committed cards, staged changes to locked cards and cards
    /// inserted earlier in this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::StoreUnavailable`] on lock timeout.
    pub fn select_inventory(&self, owner: UserId) -> EconomyResult<Vec<Card>> {
        let locked: Vec<CardId> = self.cards.iter().map(|(id, _)| *id).collect();
        let mut owned = self.ledger.owned_cards(owner, &locked)?;
        owned.extend(
            self.cards
                .iter()
                .map(|(_, slot)| slot.staged)
                .chain(self.new_cards.iter().copied())
                .filter(|card| card.owner_id == owner),
        );
        owned.sort_unstable_by_key(|card| card.id);
        Ok(owned)
    }

    /// Reads a locked card.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CardNotFound`] if the card is not in scope.
    pub fn lock_and_read_card(&self, card_id: CardId) -> EconomyResult<Card> {
        self.cards
            .iter()
            .find(|(id, _)| *id == card_id)
            .map(|(_, slot)| slot.staged)
            .ok_or(EconomyError::CardNotFound(card_id))
    }

    /// Moves a locked card to a new owner.
    ///
    /// # Errors
    ///
    /// Returns [`EconomyError::CardNotFound`] if the card is not in scope.
    pub fn reassign_card_owner(&mut self, card_id: CardId, new_owner: UserId) -> EconomyResult<()> {
        self.card_mut(card_id)?.owner_id = new_owner;
        Ok(())
    }

    /// Logs and applies the staged writes. Consumes the transaction; the row
    /// locks are released when it drops.
    ///
    /// The card table and owner index are locked before anything is logged, so
    /// a timeout there still leaves the log and memory untouched.
    pub(super) fn commit(mut self) -> EconomyResult<()> {
        let mut ops = Vec::new();
        ops.extend(
            self.users
                .iter()
                .filter(|(_, slot)| slot.staged != *slot.guard)
                .map(|(_, slot)| LedgerOp::PutUser(slot.staged)),
        );
        ops.extend(
            self.cards
                .iter()
                .filter(|(_, slot)| slot.staged != *slot.guard)
                .map(|(_, slot)| LedgerOp::PutCard(slot.staged)),
        );
        ops.extend(self.new_cards.iter().copied().map(LedgerOp::PutCard));

        if ops.is_empty() {
            return Ok(());
        }

        let moved: Vec<(CardId, UserId, UserId)> = self
            .cards
            .iter()
            .filter(|(_, slot)| slot.staged.owner_id != slot.guard.owner_id)
            .map(|(id, slot)| (*id, slot.guard.owner_id, slot.staged.owner_id))
            .collect();

        let mut card_table = if self.new_cards.is_empty() {
            None
        } else {
            Some(self.ledger.write_cards()?)
        };
        let mut owners = if self.new_cards.is_empty() && moved.is_empty() {
            None
        } else {
            Some(self.ledger.write_owners()?)
        };

        self.ledger.log(&ops)?;

        for (_, slot) in &mut self.users {
            *slot.guard = slot.staged;
        }
        for (_, slot) in &mut self.cards {
            *slot.guard = slot.staged;
        }
        if let Some(table) = card_table.as_mut() {
            for card in &self.new_cards {
                table.insert(card.id, Arc::new(Mutex::new(*card)));
            }
        }
        if let Some(index) = owners.as_mut() {
            for &(card_id, from, to) in &moved {
                super::unindex_card(index, from, card_id);
                super::index_card(index, to, card_id);
            }
            for card in &self.new_cards {
                super::index_card(index, card.owner_id, card.id);
            }
        }

        debug!(ops = ops.len(), "transaction committed");
        Ok(())
    }
}

impl std::fmt::Debug for LedgerTxn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerTxn")
            .field("users", &self.users.iter().map(|(id, _)| *id).collect::<Vec<_>>())
            .field("cards", &self.cards.iter().map(|(id, _)| *id).collect::<Vec<_>>())
            .field("new_cards", &self.new_cards.len())
            .finish_non_exhaustive()
    }
}
